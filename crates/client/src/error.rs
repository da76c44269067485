//! Upload error types.

use chunkferry_protocol::constants::{WS_ERR_CODE_INTERNAL, WS_ERR_CODE_UNPROCESSABLE};

use crate::session::SessionState;
use crate::ws_client::WsError;

/// Errors produced while uploading a file.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("file is empty")]
    EmptyFile,

    #[error("source error: {0}")]
    Source(#[from] chunkferry_transfer::TransferError),

    #[error("fingerprint failed: {0}")]
    HashFailure(String),

    #[error("verify failed: {0}")]
    VerifyFailure(String),

    #[error("chunk {chunk} failed after {attempts} attempt(s): {reason}")]
    ChunkTransferFailure {
        chunk: String,
        attempts: u32,
        reason: String,
    },

    #[error("chunk {0} transfer cancelled")]
    ChunkTransferCanceled(String),

    #[error("merge failed: {0}")]
    MergeFailure(String),

    #[error("server rejected request ({code}): {message}")]
    Rejected { code: i32, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing {0} payload in response")]
    MissingPayload(&'static str),

    #[error("invalid session transition {from:?} -> {to:?}")]
    InvalidTransition { from: SessionState, to: SessionState },

    #[error("session has no fingerprint")]
    NotFingerprinted,

    #[error("upload cancelled")]
    Cancelled,
}

impl UploadError {
    /// Whether repeating the same request may succeed.
    ///
    /// Timeouts, checksum/size rejections (the bytes are re-read) and
    /// server-side write failures are retryable; everything else is final.
    pub fn is_retryable(&self) -> bool {
        match self {
            UploadError::Timeout => true,
            UploadError::Rejected { code, .. } => {
                *code == WS_ERR_CODE_UNPROCESSABLE || *code >= WS_ERR_CODE_INTERNAL
            }
            _ => false,
        }
    }

    /// Whether this error is a deliberate cancellation rather than a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            UploadError::ChunkTransferCanceled(_) | UploadError::Cancelled
        )
    }
}

impl From<WsError> for UploadError {
    fn from(e: WsError) -> Self {
        match e {
            WsError::Timeout => UploadError::Timeout,
            WsError::Server { code, message } => UploadError::Rejected { code, message },
            WsError::Json(e) => UploadError::Json(e),
            WsError::Ws(e) => UploadError::Transport(e.to_string()),
            WsError::Closed => UploadError::Transport("connection closed".into()),
        }
    }
}

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default chunk size used to split files: 2 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 2 * 1024 * 1024;

/// How often the server pings a connected client.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(5);

/// Time to wait for any incoming frame before declaring the peer dead.
///
/// Chunk writes on a slow disk can delay replies, so this stays well above
/// the ping period.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// Maximum WebSocket message size in bytes (64 MiB).
pub const WS_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Binary chunk frames larger than this are written as continuation
/// fragments of this size, with upload progress reported after each one.
pub const WS_CHUNK_FRAGMENT_SIZE: usize = 256 * 1024;

/// Timeout for text request/response operations.
pub const WS_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for binary chunk uploads.
pub const WS_BINARY_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// WebSocket message type identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Requests from client to server
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "verify")]
    Verify,
    #[serde(rename = "upload_chunk")]
    UploadChunk,
    #[serde(rename = "merge")]
    Merge,

    // Responses from server to client
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "verify_response")]
    VerifyResponse,
    #[serde(rename = "upload_chunk_response")]
    UploadChunkResponse,
    #[serde(rename = "merge_response")]
    MergeResponse,
    #[serde(rename = "error")]
    Error,

    /// Forward compatibility: unknown message types deserialize here.
    #[serde(other)]
    Unknown,
}

/// Malformed request, invalid identifier, hash or filename.
pub const WS_ERR_CODE_BAD_REQUEST: i32 = 400;
/// No chunk namespace exists for the requested file hash.
pub const WS_ERR_CODE_NOT_FOUND: i32 = 404;
/// Incomplete chunk set, merge conflict or write to a merged hash.
pub const WS_ERR_CODE_CONFLICT: i32 = 409;
/// Chunk checksum or chunk size mismatch.
pub const WS_ERR_CODE_UNPROCESSABLE: i32 = 422;
pub const WS_ERR_CODE_INTERNAL: i32 = 500;
pub const WS_ERR_CODE_NOT_IMPLEMENTED: i32 = 501;

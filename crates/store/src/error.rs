//! Store error types.

use thiserror::Error;

/// Errors produced by the chunk store and merge coordinator.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid request: {0}")]
    Invalid(#[from] chunkferry_transfer::TransferError),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("chunk {chunk} does not belong to file {file_hash}")]
    ForeignChunk { file_hash: String, chunk: String },

    #[error("chunk {chunk} is {size} bytes, limit is {max}")]
    ChunkTooLarge { chunk: String, size: u64, max: u64 },

    #[error("checksum mismatch for {chunk}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        chunk: String,
        expected: String,
        actual: String,
    },

    #[error("chunk {index} is {actual} bytes, expected {expected}")]
    ChunkSizeMismatch {
        index: usize,
        expected: u64,
        actual: u64,
    },

    #[error("assembled size {actual} does not match declared size {expected}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("no chunk namespace for {0}")]
    NamespaceNotFound(String),

    #[error("incomplete chunk set for {file_hash}: missing {missing:?}")]
    IncompleteChunkSet {
        file_hash: String,
        missing: Vec<usize>,
    },

    #[error("file {0} has already been merged")]
    AlreadyMerged(String),

    #[error("store write failure: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Wire error code reported to clients.
    pub fn code(&self) -> i32 {
        match self {
            StoreError::Invalid(_) | StoreError::InvalidKey(_) | StoreError::ForeignChunk { .. } => {
                400
            }
            StoreError::NamespaceNotFound(_) => 404,
            StoreError::IncompleteChunkSet { .. } | StoreError::AlreadyMerged(_) => 409,
            StoreError::ChunkTooLarge { .. }
            | StoreError::ChecksumMismatch { .. }
            | StoreError::ChunkSizeMismatch { .. }
            | StoreError::SizeMismatch { .. } => 422,
            StoreError::Io(_) => 500,
        }
    }
}

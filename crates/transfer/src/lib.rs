//! Client-side building blocks of a chunked transfer: splitting a file into
//! chunk descriptors, reading chunk bytes, fingerprinting the whole file and
//! accounting byte-weighted progress.

mod chunked;
mod fingerprint;
mod progress;
mod validation;

pub use chunked::{
    ChunkDescriptor, ChunkId, ChunkSource, FileSource, ReadFuture, checksum_bytes,
    split_into_chunks,
};
pub use fingerprint::{FingerprintEvent, Fingerprinter, fingerprint_bytes};
pub use progress::{ProgressBoard, percent_of};
pub use validation::{FINGERPRINT_HEX_LEN, validate_file_hash, validate_file_name};

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,

    #[error("invalid chunk identifier: {0}")]
    InvalidChunkId(String),

    #[error("invalid file name: {0}")]
    InvalidName(String),

    #[error("invalid file hash: {0}")]
    InvalidHash(String),

    #[error("chunk {index} out of range: source holds {len} bytes")]
    OutOfRange { index: usize, len: u64 },

    #[error("fingerprint failed: {0}")]
    Fingerprint(String),

    #[error("cancelled")]
    Cancelled,
}

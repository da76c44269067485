//! Server-side persistence for chunked transfers.
//!
//! Layout under the storage root:
//!
//! - `chunks/{fileHash}/{index}`: one file per uploaded chunk (the namespace)
//! - `files/{fileHash}`: merged artifacts, addressed by content
//! - `index/{filename}`: the fileHash a filename currently refers to

pub mod backend;
pub mod chunk_store;
pub mod error;
pub mod locks;
pub mod merge;

pub use backend::{FsStorage, StorageBackend, StoreFuture};
pub use chunk_store::{ChunkStore, VerifyOutcome, sort_chunk_entries};
pub use error::StoreError;
pub use locks::NamespaceLocks;
pub use merge::{MergeCoordinator, MergeOutcome};

/// Directory holding one namespace per in-progress fileHash.
pub const CHUNKS_DIR: &str = "chunks";
/// Directory holding merged artifacts.
pub const FILES_DIR: &str = "files";
/// Directory holding the filename index.
pub const INDEX_DIR: &str = "index";

/// Largest chunk accepted unless configured otherwise (64 MiB).
pub const DEFAULT_MAX_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

pub(crate) fn namespace_key(file_hash: &str) -> String {
    format!("{CHUNKS_DIR}/{file_hash}")
}

pub(crate) fn chunk_key(file_hash: &str, index: usize) -> String {
    format!("{CHUNKS_DIR}/{file_hash}/{index}")
}

pub(crate) fn artifact_key(file_hash: &str) -> String {
    format!("{FILES_DIR}/{file_hash}")
}

pub(crate) fn index_key(filename: &str) -> String {
    format!("{INDEX_DIR}/{filename}")
}

/// Suffix inserted between a final name and a random id for in-flight writes.
pub(crate) const TEMP_MARKER: &str = ".tmp.";

pub(crate) fn temp_key(key: &str) -> String {
    format!("{key}{TEMP_MARKER}{}", uuid::Uuid::new_v4())
}

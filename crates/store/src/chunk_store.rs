//! Chunk persistence and upload-state queries.

use std::sync::Arc;

use chunkferry_transfer::{ChunkId, checksum_bytes, validate_file_hash, validate_file_name};
use tracing::{debug, warn};

use crate::backend::StorageBackend;
use crate::error::StoreError;
use crate::locks::NamespaceLocks;
use crate::{
    DEFAULT_MAX_CHUNK_SIZE, INDEX_DIR, artifact_key, chunk_key, index_key, namespace_key,
};

/// Result of [`ChunkStore::verify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyOutcome {
    /// A merged artifact for the hash already exists.
    pub exists: bool,
    /// Chunk identifiers durably stored for the hash, ordered by index.
    /// Always empty when `exists` is set.
    pub uploaded: Vec<String>,
}

/// Parses namespace entry names into chunk indices, sorted numerically.
///
/// Entries that are not a plain decimal index (in-flight temporary files,
/// stray names) are skipped.
pub fn sort_chunk_entries<S: AsRef<str>>(names: &[S]) -> Vec<usize> {
    let mut indices: Vec<usize> = names
        .iter()
        .map(AsRef::as_ref)
        .filter(|name| !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit()))
        .filter_map(|name| name.parse().ok())
        .collect();
    indices.sort_unstable();
    indices.dedup();
    indices
}

/// Points `index/{filename}` at `file_hash`, skipping the write when it
/// already does.
pub(crate) async fn write_index(
    backend: &dyn StorageBackend,
    filename: &str,
    file_hash: &str,
) -> Result<(), StoreError> {
    let key = index_key(filename);
    if backend.exists(&key).await? && backend.read(&key).await?.trim_ascii() == file_hash.as_bytes()
    {
        return Ok(());
    }
    backend.ensure_dir(INDEX_DIR).await?;
    backend
        .write_atomically(&key, file_hash.as_bytes().to_vec())
        .await
}

/// Stores chunks under per-fileHash namespaces.
#[derive(Clone)]
pub struct ChunkStore {
    pub(crate) backend: Arc<dyn StorageBackend>,
    pub(crate) locks: Arc<NamespaceLocks>,
    max_chunk_size: u64,
}

impl ChunkStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            locks: Arc::new(NamespaceLocks::new()),
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
        }
    }

    /// Sets the largest chunk `put_chunk` accepts.
    pub fn with_max_chunk_size(mut self, max: u64) -> Self {
        self.max_chunk_size = max;
        self
    }

    pub fn max_chunk_size(&self) -> u64 {
        self.max_chunk_size
    }

    /// Reports whether `file_hash` is already merged, and otherwise which
    /// of its chunks are stored.
    pub async fn verify(&self, file_hash: &str) -> Result<VerifyOutcome, StoreError> {
        validate_file_hash(file_hash)?;

        if self.backend.exists(&artifact_key(file_hash)).await? {
            return Ok(VerifyOutcome {
                exists: true,
                uploaded: Vec::new(),
            });
        }

        let names = self.backend.list_entries(&namespace_key(file_hash)).await?;
        let uploaded = sort_chunk_entries(&names)
            .into_iter()
            .map(|index| ChunkId::new(file_hash, index).to_string())
            .collect();
        Ok(VerifyOutcome {
            exists: false,
            uploaded,
        })
    }

    /// Makes an already merged `file_hash` addressable as `filename`.
    ///
    /// Used on a dedup hit, when the same content arrives under a new name.
    pub async fn index_filename(&self, filename: &str, file_hash: &str) -> Result<(), StoreError> {
        validate_file_name(filename)?;
        validate_file_hash(file_hash)?;
        if !self.backend.exists(&artifact_key(file_hash)).await? {
            return Err(StoreError::NamespaceNotFound(file_hash.to_string()));
        }
        write_index(&*self.backend, filename, file_hash).await?;
        debug!(file_hash, filename, "filename indexed");
        Ok(())
    }

    /// Stores `bytes` as chunk `chunk_hash` of `file_hash`, replacing any
    /// previous copy.
    ///
    /// When `checksum` is non-empty it must equal the SHA-256 hex of `bytes`.
    pub async fn put_chunk(
        &self,
        file_hash: &str,
        chunk_hash: &str,
        bytes: Vec<u8>,
        checksum: Option<&str>,
    ) -> Result<ChunkId, StoreError> {
        validate_file_hash(file_hash)?;
        let id: ChunkId = chunk_hash.parse()?;
        if id.file_hash() != file_hash {
            return Err(StoreError::ForeignChunk {
                file_hash: file_hash.to_string(),
                chunk: chunk_hash.to_string(),
            });
        }

        let size = bytes.len() as u64;
        if size > self.max_chunk_size {
            return Err(StoreError::ChunkTooLarge {
                chunk: chunk_hash.to_string(),
                size,
                max: self.max_chunk_size,
            });
        }

        if let Some(expected) = checksum.filter(|c| !c.is_empty()) {
            let actual = checksum_bytes(&bytes);
            if !actual.eq_ignore_ascii_case(expected) {
                warn!(chunk = %id, "chunk checksum mismatch");
                return Err(StoreError::ChecksumMismatch {
                    chunk: chunk_hash.to_string(),
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        let _guard = self.locks.write_chunk(file_hash).await;

        if self.backend.exists(&artifact_key(file_hash)).await? {
            warn!(chunk = %id, "chunk for already merged file rejected");
            return Err(StoreError::AlreadyMerged(file_hash.to_string()));
        }

        self.backend.ensure_dir(&namespace_key(file_hash)).await?;
        self.backend
            .write_atomically(&chunk_key(file_hash, id.index()), bytes)
            .await?;

        debug!(file_hash, chunk = id.index(), size, "chunk stored");
        Ok(id)
    }

    /// Looks up the fileHash a merged filename refers to.
    pub async fn resolve_filename(&self, filename: &str) -> Result<Option<String>, StoreError> {
        validate_file_name(filename)?;
        let key = index_key(filename);
        if !self.backend.exists(&key).await? {
            return Ok(None);
        }
        let raw = self.backend.read(&key).await?;
        Ok(Some(String::from_utf8_lossy(&raw).trim().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FsStorage;
    use tempfile::TempDir;

    const HASH: &str = "0123456789abcdef0123456789abcdef";

    async fn store() -> (TempDir, ChunkStore) {
        let dir = TempDir::new().unwrap();
        let backend = FsStorage::new(dir.path()).await.unwrap();
        (dir, ChunkStore::new(Arc::new(backend)))
    }

    fn id(index: usize) -> String {
        format!("{HASH}-{index}")
    }

    #[test]
    fn entries_sort_numerically() {
        let names = ["9", "1", "0", "10", "2"];
        assert_eq!(sort_chunk_entries(&names), vec![0, 1, 2, 9, 10]);
    }

    #[test]
    fn entries_skip_temporaries() {
        let names = ["3", "3.tmp.0f6c", ".tmp.x", "", "abc", "1"];
        assert_eq!(sort_chunk_entries(&names), vec![1, 3]);
    }

    #[tokio::test]
    async fn verify_unknown_hash_is_empty() {
        let (_dir, store) = store().await;
        let outcome = store.verify(HASH).await.unwrap();
        assert!(!outcome.exists);
        assert!(outcome.uploaded.is_empty());
    }

    #[tokio::test]
    async fn verify_reports_stored_chunks_in_index_order() {
        let (_dir, store) = store().await;
        for index in [2, 0, 10, 1] {
            store.put_chunk(HASH, &id(index), vec![index as u8], None).await.unwrap();
        }
        let outcome = store.verify(HASH).await.unwrap();
        assert_eq!(outcome.uploaded, vec![id(0), id(1), id(2), id(10)]);
    }

    #[tokio::test]
    async fn duplicate_upload_is_idempotent() {
        let (dir, store) = store().await;
        store.put_chunk(HASH, &id(0), b"abc".to_vec(), None).await.unwrap();
        let once = store.verify(HASH).await.unwrap();

        store.put_chunk(HASH, &id(0), b"abc".to_vec(), None).await.unwrap();
        let twice = store.verify(HASH).await.unwrap();

        assert_eq!(once, twice);
        let stored = std::fs::read(dir.path().join("chunks").join(HASH).join("0")).unwrap();
        assert_eq!(stored, b"abc");
    }

    #[tokio::test]
    async fn concurrent_puts_to_one_namespace() {
        let (_dir, store) = store().await;
        let mut tasks = tokio::task::JoinSet::new();
        for index in 0..16 {
            let store = store.clone();
            tasks.spawn(async move { store.put_chunk(HASH, &id(index), vec![0; 64], None).await });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap().unwrap();
        }
        assert_eq!(store.verify(HASH).await.unwrap().uploaded.len(), 16);
    }

    #[tokio::test]
    async fn checksum_is_verified() {
        let (_dir, store) = store().await;
        let good = checksum_bytes(b"data");
        store
            .put_chunk(HASH, &id(0), b"data".to_vec(), Some(&good))
            .await
            .unwrap();

        let err = store
            .put_chunk(HASH, &id(1), b"data".to_vec(), Some("deadbeef"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ChecksumMismatch { .. }));
        assert_eq!(err.code(), 422);
        assert_eq!(store.verify(HASH).await.unwrap().uploaded, vec![id(0)]);
    }

    #[tokio::test]
    async fn rejects_malformed_requests() {
        let (_dir, store) = store().await;
        assert!(store.put_chunk("nothex", "nothex-0", vec![1], None).await.is_err());
        assert!(matches!(
            store.put_chunk(HASH, "garbage", vec![1], None).await,
            Err(StoreError::Invalid(_))
        ));
        let other = "ffffffffffffffffffffffffffffffff-0";
        assert!(matches!(
            store.put_chunk(HASH, other, vec![1], None).await,
            Err(StoreError::ForeignChunk { .. })
        ));
        assert!(store.verify("../etc").await.is_err());
    }

    #[tokio::test]
    async fn oversized_chunk_is_rejected() {
        let (_dir, store) = store().await;
        let store = store.with_max_chunk_size(4);
        let err = store.put_chunk(HASH, &id(0), vec![0; 5], None).await.unwrap_err();
        assert!(matches!(err, StoreError::ChunkTooLarge { size: 5, max: 4, .. }));
    }

    #[tokio::test]
    async fn merged_content_can_be_indexed_under_another_name() {
        let (dir, store) = store().await;
        store.put_chunk(HASH, &id(0), b"data".to_vec(), None).await.unwrap();
        crate::merge::MergeCoordinator::new(&store)
            .merge(HASH, "a.bin", 4, Some(4))
            .await
            .unwrap();

        store.index_filename("b.bin", HASH).await.unwrap();
        assert_eq!(store.resolve_filename("b.bin").await.unwrap().as_deref(), Some(HASH));
        assert_eq!(store.resolve_filename("a.bin").await.unwrap().as_deref(), Some(HASH));
        // Indexing again is a no-op.
        store.index_filename("b.bin", HASH).await.unwrap();

        let other = "ffffffffffffffffffffffffffffffff";
        assert!(matches!(
            store.index_filename("c.bin", other).await,
            Err(StoreError::NamespaceNotFound(_))
        ));
        assert!(!dir.path().join("index").join("c.bin").exists());
        assert!(store.index_filename("../c.bin", HASH).await.is_err());
    }

    #[tokio::test]
    async fn unknown_filename_resolves_to_none() {
        let (_dir, store) = store().await;
        assert_eq!(store.resolve_filename("movie.mp4").await.unwrap(), None);
        assert!(store.resolve_filename("../x").await.is_err());
    }
}

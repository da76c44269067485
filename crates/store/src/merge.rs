//! Reassembly of a completed chunk namespace into its final artifact.

use std::sync::Arc;

use chunkferry_transfer::{validate_file_hash, validate_file_name};
use tracing::{debug, info, warn};

use crate::backend::StorageBackend;
use crate::chunk_store::{ChunkStore, sort_chunk_entries, write_index};
use crate::error::StoreError;
use crate::locks::NamespaceLocks;
use crate::{FILES_DIR, artifact_key, chunk_key, namespace_key, temp_key};

/// Result of a successful merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub file_hash: String,
    pub filename: String,
    /// Byte length of the assembled artifact.
    pub size: u64,
    pub chunks: usize,
}

/// Concatenates a namespace's chunks, in index order, into `files/{fileHash}`.
pub struct MergeCoordinator {
    backend: Arc<dyn StorageBackend>,
    locks: Arc<NamespaceLocks>,
}

impl MergeCoordinator {
    /// Creates a coordinator sharing `store`'s backend and namespace locks.
    pub fn new(store: &ChunkStore) -> Self {
        Self {
            backend: Arc::clone(&store.backend),
            locks: Arc::clone(&store.locks),
        }
    }

    /// Merges the chunks stored for `file_hash` and indexes the result
    /// under `filename`.
    ///
    /// Every chunk but the last must be exactly `chunk_size` bytes. When
    /// `size` is known the chunk count and the assembled length must match
    /// it. On any failure the namespace is left untouched so the merge can
    /// be retried.
    pub async fn merge(
        &self,
        file_hash: &str,
        filename: &str,
        chunk_size: u64,
        size: Option<u64>,
    ) -> Result<MergeOutcome, StoreError> {
        validate_file_hash(file_hash)?;
        validate_file_name(filename)?;
        if chunk_size == 0 {
            return Err(chunkferry_transfer::TransferError::InvalidChunkSize.into());
        }

        let _guard = self.locks.merge(file_hash).await;

        let namespace = namespace_key(file_hash);
        if !self.backend.exists(&namespace).await? {
            return Err(StoreError::NamespaceNotFound(file_hash.to_string()));
        }
        if self.backend.exists(&artifact_key(file_hash)).await? {
            return self.finish_interrupted(file_hash, filename, size).await;
        }

        let names = self.backend.list_entries(&namespace).await?;
        let indices = sort_chunk_entries(&names);
        self.check_complete(file_hash, &indices, chunk_size, size)?;
        self.check_sizes(file_hash, &indices, chunk_size).await?;

        let temp = temp_key(&artifact_key(file_hash));
        self.backend.ensure_dir(FILES_DIR).await?;
        let assembled = match self.assemble(file_hash, &indices, &temp).await {
            Ok(assembled) => assembled,
            Err(e) => {
                let _ = self.backend.remove_file(&temp).await;
                return Err(e);
            }
        };

        if let Some(expected) = size.filter(|&expected| expected != assembled) {
            let _ = self.backend.remove_file(&temp).await;
            return Err(StoreError::SizeMismatch {
                expected,
                actual: assembled,
            });
        }

        if let Err(e) = self.backend.rename(&temp, &artifact_key(file_hash)).await {
            let _ = self.backend.remove_file(&temp).await;
            return Err(e);
        }

        write_index(&*self.backend, filename, file_hash).await?;
        self.retire_namespace(file_hash).await;

        info!(
            file_hash,
            filename,
            chunks = indices.len(),
            bytes = assembled,
            "merge complete"
        );

        Ok(MergeOutcome {
            file_hash: file_hash.to_string(),
            filename: filename.to_string(),
            size: assembled,
            chunks: indices.len(),
        })
    }

    /// Completes a merge that renamed its artifact but stopped before the
    /// filename was indexed or the namespace was retired.
    async fn finish_interrupted(
        &self,
        file_hash: &str,
        filename: &str,
        size: Option<u64>,
    ) -> Result<MergeOutcome, StoreError> {
        let artifact = self.backend.file_len(&artifact_key(file_hash)).await?;
        if let Some(expected) = size.filter(|&expected| expected != artifact) {
            return Err(StoreError::SizeMismatch {
                expected,
                actual: artifact,
            });
        }
        let chunks = sort_chunk_entries(
            &self
                .backend
                .list_entries(&namespace_key(file_hash))
                .await?,
        )
        .len();

        write_index(&*self.backend, filename, file_hash).await?;
        self.retire_namespace(file_hash).await;
        info!(file_hash, filename, "interrupted merge completed");

        Ok(MergeOutcome {
            file_hash: file_hash.to_string(),
            filename: filename.to_string(),
            size: artifact,
            chunks,
        })
    }

    // The artifact is final by now; a leftover namespace is only wasted
    // space and verify already reports the hash as present.
    async fn retire_namespace(&self, file_hash: &str) {
        if let Err(e) = self.backend.remove_tree(&namespace_key(file_hash)).await {
            warn!(file_hash, error = %e, "failed to remove chunk namespace after merge");
        }
    }

    fn check_complete(
        &self,
        file_hash: &str,
        indices: &[usize],
        chunk_size: u64,
        size: Option<u64>,
    ) -> Result<(), StoreError> {
        let expected = match size {
            Some(size) => size.div_ceil(chunk_size) as usize,
            None => indices.last().map_or(1, |last| last + 1),
        };
        let missing: Vec<usize> = (0..expected)
            .filter(|index| indices.binary_search(index).is_err())
            .collect();
        if !missing.is_empty() {
            warn!(file_hash, ?missing, "merge refused: incomplete chunk set");
            return Err(StoreError::IncompleteChunkSet {
                file_hash: file_hash.to_string(),
                missing,
            });
        }
        Ok(())
    }

    async fn check_sizes(
        &self,
        file_hash: &str,
        indices: &[usize],
        chunk_size: u64,
    ) -> Result<(), StoreError> {
        let last = indices.len().saturating_sub(1);
        for (pos, &index) in indices.iter().enumerate() {
            let actual = self.backend.file_len(&chunk_key(file_hash, index)).await?;
            let ok = if pos == last {
                actual > 0 && actual <= chunk_size
            } else {
                actual == chunk_size
            };
            if !ok {
                return Err(StoreError::ChunkSizeMismatch {
                    index,
                    expected: chunk_size,
                    actual,
                });
            }
        }
        Ok(())
    }

    async fn assemble(
        &self,
        file_hash: &str,
        indices: &[usize],
        dest: &str,
    ) -> Result<u64, StoreError> {
        let mut total = 0;
        for &index in indices {
            total += self
                .backend
                .stream_append(dest, &chunk_key(file_hash, index))
                .await?;
            debug!(file_hash, chunk = index, total, "chunk appended");
        }
        self.backend.sync(dest).await?;
        Ok(total)
    }
}

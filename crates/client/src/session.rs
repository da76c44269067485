//! Per-file upload session: state machine and chunk bookkeeping.

use std::collections::HashSet;
use std::sync::Arc;

use chunkferry_transfer::{
    ChunkDescriptor, ChunkId, ChunkSource, ProgressBoard, split_into_chunks, validate_file_name,
};

use crate::error::UploadError;

/// Lifecycle of a [`TransferSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Hashing,
    AwaitingVerify,
    Transferring,
    Paused,
    Merging,
    Done,
    Failed,
}

impl SessionState {
    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Done, _) => false,
            (_, Failed) => true,
            (Idle, Hashing)
            | (Hashing, AwaitingVerify)
            | (AwaitingVerify, Transferring)
            | (AwaitingVerify, Done)
            | (Transferring, Paused)
            | (Transferring, Merging)
            | (Paused, AwaitingVerify)
            | (Paused, Transferring)
            | (Paused, Idle)
            | (Merging, Done)
            | (Failed, AwaitingVerify) => true,
            _ => false,
        }
    }

    /// Whether the session has reached an end state.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Done | SessionState::Failed)
    }
}

/// Everything known about one file being uploaded.
///
/// Owned by the caller and passed by `&mut` to the uploader; progress
/// lives here rather than in shared counters.
pub struct TransferSession {
    source: Arc<dyn ChunkSource>,
    filename: String,
    chunk_size: u64,
    chunks: Vec<ChunkDescriptor>,
    fingerprint: Option<String>,
    progress: ProgressBoard,
    state: SessionState,
}

impl TransferSession {
    /// Splits `source` into `chunk_size` chunks.
    ///
    /// Rejects empty sources and file names that are not a single path
    /// component.
    pub fn new(
        source: Arc<dyn ChunkSource>,
        filename: impl Into<String>,
        chunk_size: u64,
    ) -> Result<Self, UploadError> {
        let filename = filename.into();
        validate_file_name(&filename)?;
        if source.byte_len() == 0 {
            return Err(UploadError::EmptyFile);
        }
        let chunks = split_into_chunks(source.byte_len(), chunk_size)?;
        let progress = ProgressBoard::new(&chunks);
        Ok(Self {
            source,
            filename,
            chunk_size,
            chunks,
            fingerprint: None,
            progress,
            state: SessionState::Idle,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn file_size(&self) -> u64 {
        self.source.byte_len()
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn chunks(&self) -> &[ChunkDescriptor] {
        &self.chunks
    }

    pub fn source(&self) -> Arc<dyn ChunkSource> {
        Arc::clone(&self.source)
    }

    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }

    pub(crate) fn set_fingerprint(&mut self, hash: String) {
        self.fingerprint = Some(hash);
    }

    /// Moves to `next`, rejecting transitions the state machine forbids.
    pub fn transition(&mut self, next: SessionState) -> Result<(), UploadError> {
        if !self.state.can_transition_to(next) {
            return Err(UploadError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::debug!(filename = %self.filename, from = ?self.state, to = ?next, "session transition");
        self.state = next;
        Ok(())
    }

    /// Identifier of chunk `index` under the session fingerprint.
    pub fn chunk_id(&self, index: usize) -> Result<ChunkId, UploadError> {
        let hash = self.fingerprint.as_deref().ok_or(UploadError::NotFingerprinted)?;
        Ok(ChunkId::new(hash, index))
    }

    /// Marks the chunks named in `uploaded` complete and every other chunk
    /// at zero.
    ///
    /// Identifiers that do not parse or belong to another hash are ignored.
    pub fn apply_uploaded(&mut self, uploaded: &[String]) -> Result<usize, UploadError> {
        let hash = self.fingerprint.as_deref().ok_or(UploadError::NotFingerprinted)?;
        let present: HashSet<usize> = uploaded
            .iter()
            .filter_map(|s| s.parse::<ChunkId>().ok())
            .filter(|id| id.file_hash() == hash)
            .map(|id| id.index())
            .collect();

        self.progress.clear();
        let mut matched = 0;
        for chunk in &self.chunks {
            if present.contains(&chunk.index) {
                self.progress.set(chunk.index, 100.0);
                matched += 1;
            }
        }
        Ok(matched)
    }

    /// Chunks not yet acknowledged, in index order.
    pub fn remaining(&self) -> Vec<ChunkDescriptor> {
        self.progress
            .incomplete()
            .filter_map(|i| self.chunks.get(i).cloned())
            .collect()
    }

    pub fn progress(&self) -> &ProgressBoard {
        &self.progress
    }

    pub(crate) fn progress_mut(&mut self) -> &mut ProgressBoard {
        &mut self.progress
    }

    /// Byte-weighted percentage across every chunk.
    pub fn total_percent(&self) -> f64 {
        self.progress.total_percent()
    }

    /// Clears progress; the fingerprint is kept so a new run can reuse it.
    pub(crate) fn reset_progress(&mut self) {
        self.progress.clear();
    }
}

//! Whole-file fingerprinting on a background task.
//!
//! The fingerprint is the MD5 digest of the chunk bytes fed strictly in index
//! order. The caller talks to the task only through [`FingerprintEvent`]s;
//! dropping the [`Fingerprinter`] tears the task down without exposing a
//! partial digest.

use std::sync::Arc;

use md5::{Digest, Md5};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::TransferError;
use crate::chunked::{ChunkDescriptor, ChunkSource};

/// Event emitted by the fingerprinting task.
#[derive(Debug, Clone, PartialEq)]
pub enum FingerprintEvent {
    /// One more chunk has been accumulated.
    Progress { percent: f64 },
    /// All chunks accumulated; always the last event of a successful run.
    Complete { hash: String },
    /// A chunk could not be read; no digest is produced.
    Failed { reason: String },
}

impl FingerprintEvent {
    /// Progress percentage carried by this event (`Complete` reports 100).
    pub fn percent(&self) -> Option<f64> {
        match self {
            FingerprintEvent::Progress { percent } => Some(*percent),
            FingerprintEvent::Complete { .. } => Some(100.0),
            FingerprintEvent::Failed { .. } => None,
        }
    }
}

/// Handle to a running fingerprint computation.
pub struct Fingerprinter {
    events: mpsc::Receiver<FingerprintEvent>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Fingerprinter {
    /// Starts hashing `chunks` of `source` on a background task.
    pub fn spawn(source: Arc<dyn ChunkSource>, chunks: Vec<ChunkDescriptor>) -> Self {
        let (tx, events) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(source, chunks, tx, cancel.clone()));
        Self {
            events,
            cancel,
            task,
        }
    }

    /// Waits for the next event. Returns `None` once the task has finished.
    pub async fn next_event(&mut self) -> Option<FingerprintEvent> {
        self.events.recv().await
    }

    /// Tears the computation down. Any pending result is discarded.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// Drives the computation to the end, forwarding progress to `on_progress`.
    pub async fn finish(
        mut self,
        mut on_progress: impl FnMut(f64),
    ) -> Result<String, TransferError> {
        while let Some(event) = self.next_event().await {
            match event {
                FingerprintEvent::Progress { percent } => on_progress(percent),
                FingerprintEvent::Complete { hash } => {
                    on_progress(100.0);
                    return Ok(hash);
                }
                FingerprintEvent::Failed { reason } => {
                    return Err(TransferError::Fingerprint(reason));
                }
            }
        }
        Err(TransferError::Cancelled)
    }
}

impl Drop for Fingerprinter {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

async fn run(
    source: Arc<dyn ChunkSource>,
    chunks: Vec<ChunkDescriptor>,
    tx: mpsc::Sender<FingerprintEvent>,
    cancel: CancellationToken,
) {
    let total = chunks.len();
    let mut hasher = Md5::new();

    for (done, chunk) in chunks.iter().enumerate() {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            read = source.read_chunk(chunk) => read,
        };

        let bytes = match read {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = tx
                    .send(FingerprintEvent::Failed {
                        reason: format!("chunk {}: {e}", chunk.index),
                    })
                    .await;
                return;
            }
        };

        // Digest on the blocking pool so large chunks never stall the runtime.
        hasher = match tokio::task::spawn_blocking(move || {
            hasher.update(&bytes);
            hasher
        })
        .await
        {
            Ok(h) => h,
            Err(e) => {
                let _ = tx
                    .send(FingerprintEvent::Failed {
                        reason: format!("hash task failed: {e}"),
                    })
                    .await;
                return;
            }
        };

        if done + 1 < total {
            let percent = (done + 1) as f64 * 100.0 / total as f64;
            if tx.send(FingerprintEvent::Progress { percent }).await.is_err() {
                return;
            }
        }
    }

    if cancel.is_cancelled() {
        return;
    }

    let hash = hex::encode(hasher.finalize());
    debug!(chunks = total, %hash, "fingerprint complete");
    let _ = tx.send(FingerprintEvent::Complete { hash }).await;
}

/// Fingerprint of an in-memory buffer; equal to what [`Fingerprinter`] yields
/// for the same bytes under any chunk size.
pub fn fingerprint_bytes(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

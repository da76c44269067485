//! Bounded-concurrency chunk transfer with pause support.
//!
//! The scheduler builds one cancellation handle per queued chunk before any
//! worker starts. Workers pull from a shared queue and report back over a
//! channel; only the loop in [`TransferScheduler::run`] touches the
//! session, so progress has a single owner.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chunkferry_transfer::{ChunkDescriptor, ChunkId, ChunkSource, checksum_bytes};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::UploadError;
use crate::session::TransferSession;
use crate::transport::{ChunkTransport, ChunkUpload, ProgressFn};
use crate::types::{DEFAULT_CONCURRENCY, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BACKOFF, UploadEvent};

/// Worker pool and retry policy.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound on simultaneous transfers (at least 1).
    pub concurrency: usize,
    /// Retries per chunk after the first attempt.
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

#[derive(Default)]
struct PauseState {
    paused: bool,
    handles: Vec<CancellationToken>,
}

/// Pauses a running transfer from outside the scheduler.
///
/// Cloneable. Pausing cancels every handle of the current run and stays in
/// effect until [`reset`](Self::reset).
#[derive(Clone, Default)]
pub struct PauseHandle {
    inner: Arc<Mutex<PauseState>>,
}

impl PauseHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels every in-flight and queued chunk of the current run.
    pub fn pause(&self) {
        let mut state = self.inner.lock().unwrap();
        state.paused = true;
        let cancelled = state.handles.len();
        for handle in state.handles.drain(..) {
            handle.cancel();
        }
        debug!(cancelled, "pause requested");
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().unwrap().paused
    }

    /// Clears the paused flag so the next run can start.
    pub fn reset(&self) {
        let mut state = self.inner.lock().unwrap();
        state.paused = false;
        state.handles.clear();
    }

    /// Hands the handles of a new run over. Returns `false` if already
    /// paused, in which case the run must not start.
    fn arm(&self, handles: &[CancellationToken]) -> bool {
        let mut state = self.inner.lock().unwrap();
        if state.paused {
            return false;
        }
        state.handles = handles.to_vec();
        true
    }

    fn disarm(&self) {
        self.inner.lock().unwrap().handles.clear();
    }
}

/// How a scheduler run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// Every remaining chunk was acknowledged.
    Completed,
    /// Paused with `remaining` chunks unacknowledged.
    Paused { remaining: usize },
}

struct Job {
    chunk: ChunkDescriptor,
    id: ChunkId,
    cancel: CancellationToken,
}

enum WorkerReport {
    Progress { index: usize, bytes: u64 },
    Acked { index: usize },
    Canceled { index: usize },
    Failed { index: usize, error: UploadError },
}

/// Drives the chunk uploads of one session.
pub struct TransferScheduler {
    transport: Arc<dyn ChunkTransport>,
    config: SchedulerConfig,
    pause: PauseHandle,
    events: mpsc::Sender<UploadEvent>,
}

impl TransferScheduler {
    pub fn new(
        transport: Arc<dyn ChunkTransport>,
        config: SchedulerConfig,
        pause: PauseHandle,
        events: mpsc::Sender<UploadEvent>,
    ) -> Self {
        Self {
            transport,
            config,
            pause,
            events,
        }
    }

    /// Uploads every chunk of `session` not yet marked complete.
    ///
    /// Chunks may finish in any order. The first chunk to exhaust its
    /// retries cancels the rest and fails the run.
    pub async fn run(&self, session: &mut TransferSession) -> Result<ScheduleOutcome, UploadError> {
        let hash = session
            .fingerprint()
            .ok_or(UploadError::NotFingerprinted)?
            .to_string();

        let jobs: Vec<Job> = session
            .remaining()
            .into_iter()
            .map(|chunk| Job {
                id: ChunkId::new(hash.clone(), chunk.index),
                chunk,
                cancel: CancellationToken::new(),
            })
            .collect();
        if jobs.is_empty() {
            return Ok(ScheduleOutcome::Completed);
        }

        let handles: Vec<CancellationToken> = jobs.iter().map(|j| j.cancel.clone()).collect();
        if !self.pause.arm(&handles) {
            return Ok(ScheduleOutcome::Paused {
                remaining: jobs.len(),
            });
        }

        let total = jobs.len();
        let workers = self.config.concurrency.max(1).min(total);
        info!(file_hash = %hash, chunks = total, workers, "transfer started");

        let queue = Arc::new(Mutex::new(VecDeque::from(jobs)));
        let (report_tx, mut report_rx) = mpsc::channel::<WorkerReport>(256);
        let mut pool = JoinSet::new();
        for _ in 0..workers {
            pool.spawn(worker(
                Arc::clone(&queue),
                Arc::clone(&self.transport),
                session.source(),
                self.config.clone(),
                report_tx.clone(),
            ));
        }
        drop(report_tx);

        let mut acked = 0usize;
        let mut failure: Option<UploadError> = None;
        while let Some(report) = report_rx.recv().await {
            match report {
                WorkerReport::Progress { index, bytes } => {
                    // Bytes on the wire are not an acknowledgment.
                    let size = session.chunks().get(index).map_or(0, ChunkDescriptor::size);
                    let pct = chunkferry_transfer::percent_of(bytes, size).min(99.0);
                    self.update_chunk(session, &hash, index, pct);
                }
                WorkerReport::Acked { index } => {
                    acked += 1;
                    self.update_chunk(session, &hash, index, 100.0);
                }
                WorkerReport::Canceled { index } => {
                    self.update_chunk(session, &hash, index, 0.0);
                }
                WorkerReport::Failed { index, error } => {
                    self.update_chunk(session, &hash, index, 0.0);
                    if failure.is_none() {
                        warn!(file_hash = %hash, chunk = index, "chunk failed, stopping transfer: {error}");
                        for handle in &handles {
                            handle.cancel();
                        }
                        failure = Some(error);
                    }
                }
            }
        }
        while pool.join_next().await.is_some() {}
        self.pause.disarm();

        if let Some(err) = failure {
            return Err(err);
        }
        if acked == total {
            info!(file_hash = %hash, chunks = total, "all chunks acknowledged");
            return Ok(ScheduleOutcome::Completed);
        }
        let remaining = session.remaining().len();
        info!(file_hash = %hash, remaining, "transfer paused");
        Ok(ScheduleOutcome::Paused { remaining })
    }

    fn update_chunk(&self, session: &mut TransferSession, hash: &str, index: usize, percent: f64) {
        if !session.progress_mut().set(index, percent) {
            return;
        }
        emit(
            &self.events,
            UploadEvent::ChunkProgress {
                chunk_id: ChunkId::new(hash, index).to_string(),
                percent,
            },
        );
        emit(
            &self.events,
            UploadEvent::TotalProgress {
                percent: session.total_percent(),
            },
        );
    }
}

/// Slots of the event channel that progress events never fill, so a
/// terminal event always has room even when the reader lags.
pub(crate) const TERMINAL_EVENT_RESERVE: usize = 8;

/// Sends a progress event without waiting.
///
/// Progress is dropped once the reader falls behind far enough to reach
/// [`TERMINAL_EVENT_RESERVE`].
pub(crate) fn emit(events: &mpsc::Sender<UploadEvent>, event: UploadEvent) {
    if events.capacity() > TERMINAL_EVENT_RESERVE {
        let _ = events.try_send(event);
    }
}

async fn worker(
    queue: Arc<Mutex<VecDeque<Job>>>,
    transport: Arc<dyn ChunkTransport>,
    source: Arc<dyn ChunkSource>,
    config: SchedulerConfig,
    reports: mpsc::Sender<WorkerReport>,
) {
    loop {
        let Some(job) = next_job(&queue) else {
            break;
        };
        let index = job.chunk.index;

        if job.cancel.is_cancelled() {
            let _ = reports.send(WorkerReport::Canceled { index }).await;
            continue;
        }

        let progress_tx = reports.clone();
        let progress: ProgressFn = Arc::new(move |bytes: u64| {
            let _ = progress_tx.try_send(WorkerReport::Progress { index, bytes });
        });

        let report = match transfer_chunk(&*transport, &*source, &job, &config, progress).await {
            Ok(()) => WorkerReport::Acked { index },
            Err(e) if e.is_cancellation() => WorkerReport::Canceled { index },
            Err(error) => WorkerReport::Failed { index, error },
        };
        if reports.send(report).await.is_err() {
            break;
        }
    }
}

fn next_job(queue: &Mutex<VecDeque<Job>>) -> Option<Job> {
    queue.lock().unwrap().pop_front()
}

/// Sends one chunk, retrying retryable failures with linear back-off.
///
/// Cancellation wins over every other outcome and is never retried.
async fn transfer_chunk(
    transport: &dyn ChunkTransport,
    source: &dyn ChunkSource,
    job: &Job,
    config: &SchedulerConfig,
    progress: ProgressFn,
) -> Result<(), UploadError> {
    let canceled = || UploadError::ChunkTransferCanceled(job.id.to_string());
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let result = tokio::select! {
            biased;
            _ = job.cancel.cancelled() => return Err(canceled()),
            r = send_once(transport, source, job, progress.clone()) => r,
        };

        match result {
            Ok(()) => {
                debug!(chunk = %job.id, attempt, "chunk acknowledged");
                return Ok(());
            }
            Err(e) if e.is_cancellation() => return Err(e),
            Err(e) if e.is_retryable() && attempt <= config.max_retries => {
                warn!(chunk = %job.id, attempt, "chunk upload failed, retrying: {e}");
                tokio::select! {
                    biased;
                    _ = job.cancel.cancelled() => return Err(canceled()),
                    _ = tokio::time::sleep(config.retry_backoff * attempt) => {}
                }
            }
            Err(e) => {
                return Err(UploadError::ChunkTransferFailure {
                    chunk: job.id.to_string(),
                    attempts: attempt,
                    reason: e.to_string(),
                });
            }
        }
    }
}

async fn send_once(
    transport: &dyn ChunkTransport,
    source: &dyn ChunkSource,
    job: &Job,
    progress: ProgressFn,
) -> Result<(), UploadError> {
    let data = source.read_chunk(&job.chunk).await?;
    let checksum = checksum_bytes(&data);
    transport
        .upload_chunk(
            ChunkUpload {
                chunk_id: job.id.clone(),
                data,
                checksum,
            },
            progress,
        )
        .await
}

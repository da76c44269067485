//! Upload orchestration: fingerprint, verify, transfer, merge.
//!
//! The [`Uploader`] owns the transport and the pause handle; the
//! [`TransferSession`] is owned by the caller and threaded through each
//! step by `&mut`, so a paused or failed session can simply be passed back
//! in to resume.

use std::sync::Arc;

use chunkferry_protocol::{MergeRequest, VerifyRequest, VerifyResponse};
use chunkferry_transfer::{ChunkSource, Fingerprinter};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::UploadError;
use crate::scheduler::{PauseHandle, ScheduleOutcome, SchedulerConfig, TransferScheduler, emit};
use crate::session::{SessionState, TransferSession};
use crate::transport::ChunkTransport;
use crate::types::{UploadEvent, UploadOutcome, UploaderConfig};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Drives [`TransferSession`]s against one server.
pub struct Uploader {
    transport: Arc<dyn ChunkTransport>,
    config: UploaderConfig,
    pause: PauseHandle,
    events_tx: mpsc::Sender<UploadEvent>,
    events_rx: Option<mpsc::Receiver<UploadEvent>>,
}

impl Uploader {
    pub fn new(transport: Arc<dyn ChunkTransport>, config: UploaderConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            transport,
            config,
            pause: PauseHandle::new(),
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    /// Takes the event receiver. Can only be called once.
    ///
    /// Progress events are dropped when the receiver lags. `Done`, `Failed`
    /// and `Paused` are always delivered.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<UploadEvent>> {
        self.events_rx.take()
    }

    pub fn config(&self) -> &UploaderConfig {
        &self.config
    }

    /// Handle that pauses the running transfer from another task.
    pub fn pause_handle(&self) -> PauseHandle {
        self.pause.clone()
    }

    pub fn pause(&self) {
        self.pause.pause();
    }

    /// Creates a session for `source` using the configured chunk size.
    pub fn open(
        &self,
        source: Arc<dyn ChunkSource>,
        filename: impl Into<String>,
    ) -> Result<TransferSession, UploadError> {
        TransferSession::new(source, filename, self.config.chunk_size)
    }

    /// Fingerprints the session (`Idle -> Hashing -> AwaitingVerify`).
    pub async fn prepare(&self, session: &mut TransferSession) -> Result<String, UploadError> {
        session.transition(SessionState::Hashing)?;

        let hasher = Fingerprinter::spawn(session.source(), session.chunks().to_vec());
        let events = &self.events_tx;
        let result = hasher
            .finish(|percent| emit(events, UploadEvent::HashProgress { percent }))
            .await;

        let hash = match result {
            Ok(hash) => hash,
            Err(e) => {
                let err = UploadError::HashFailure(e.to_string());
                self.fail(session, &err).await;
                return Err(err);
            }
        };
        info!(filename = %session.filename(), file_hash = %hash, "fingerprint ready");
        session.set_fingerprint(hash.clone());
        session.transition(SessionState::AwaitingVerify)?;
        Ok(hash)
    }

    /// Runs the session to completion, a pause or a failure.
    ///
    /// Accepts sessions that are idle, fingerprinted, paused or failed. A
    /// paused or failed session re-derives its remaining work from the
    /// server before sending anything.
    pub async fn run(&self, session: &mut TransferSession) -> Result<UploadOutcome, UploadError> {
        match session.state() {
            SessionState::Idle => {
                self.prepare(session).await?;
            }
            SessionState::Paused | SessionState::Failed => {
                session.transition(SessionState::AwaitingVerify)?;
            }
            SessionState::AwaitingVerify => {}
            other => {
                return Err(UploadError::InvalidTransition {
                    from: other,
                    to: SessionState::AwaitingVerify,
                });
            }
        }

        match self.drive(session).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.fail(session, &e).await;
                Err(e)
            }
        }
    }

    /// Clears a pause and runs the session again.
    pub async fn resume(&self, session: &mut TransferSession) -> Result<UploadOutcome, UploadError> {
        self.pause.reset();
        self.run(session).await
    }

    /// Abandons a paused session (`Paused -> Idle`) and clears its progress.
    ///
    /// Chunks already on the server stay there and are picked up by the
    /// next verify.
    pub fn cancel(&self, session: &mut TransferSession) -> Result<(), UploadError> {
        session.transition(SessionState::Idle)?;
        session.reset_progress();
        self.pause.reset();
        info!(filename = %session.filename(), "session cancelled");
        Ok(())
    }

    async fn drive(&self, session: &mut TransferSession) -> Result<UploadOutcome, UploadError> {
        let file_hash = session
            .fingerprint()
            .ok_or(UploadError::NotFingerprinted)?
            .to_string();

        let verify = self
            .verify_with_retry(VerifyRequest {
                filename: session.filename().to_string(),
                file_hash: file_hash.clone(),
            })
            .await?;

        if !verify.should_upload {
            session.transition(SessionState::Done)?;
            info!(%file_hash, "server already has this file");
            self.emit_terminal(UploadEvent::Done {
                url: None,
                instant: true,
            })
            .await;
            return Ok(UploadOutcome::Instant {
                message: verify.message,
            });
        }

        let present = session.apply_uploaded(&verify.uploaded_list)?;
        info!(%file_hash, present, total = session.chunks().len(), "verify complete");
        emit(
            &self.events_tx,
            UploadEvent::TotalProgress {
                percent: session.total_percent(),
            },
        );
        session.transition(SessionState::Transferring)?;

        let scheduler = TransferScheduler::new(
            Arc::clone(&self.transport),
            SchedulerConfig {
                concurrency: self.config.concurrency,
                max_retries: self.config.max_retries,
                retry_backoff: self.config.retry_backoff,
            },
            self.pause.clone(),
            self.events_tx.clone(),
        );

        match scheduler.run(session).await? {
            ScheduleOutcome::Paused { remaining } => {
                session.transition(SessionState::Paused)?;
                self.emit_terminal(UploadEvent::Paused).await;
                Ok(UploadOutcome::Paused { remaining })
            }
            ScheduleOutcome::Completed => {
                session.transition(SessionState::Merging)?;
                let resp = self
                    .transport
                    .merge(MergeRequest {
                        file_hash: file_hash.clone(),
                        filename: session.filename().to_string(),
                        chunk_size: session.chunk_size(),
                        size: Some(session.file_size()),
                    })
                    .await
                    .map_err(|e| UploadError::MergeFailure(e.to_string()))?;

                session.transition(SessionState::Done)?;
                info!(%file_hash, url = %resp.url, "upload complete");
                self.emit_terminal(UploadEvent::Done {
                    url: Some(resp.url.clone()),
                    instant: false,
                })
                .await;
                Ok(UploadOutcome::Merged {
                    url: resp.url,
                    message: resp.message,
                })
            }
        }
    }

    async fn verify_with_retry(&self, req: VerifyRequest) -> Result<VerifyResponse, UploadError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.transport.verify(req.clone()).await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_retryable() && attempt <= self.config.max_retries => {
                    warn!(file_hash = %req.file_hash, attempt, "verify failed, retrying: {e}");
                    tokio::time::sleep(self.config.retry_backoff * attempt).await;
                }
                Err(e) => return Err(UploadError::VerifyFailure(e.to_string())),
            }
        }
    }

    async fn fail(&self, session: &mut TransferSession, err: &UploadError) {
        if session.transition(SessionState::Failed).is_ok() {
            warn!(filename = %session.filename(), "upload failed: {err}");
            self.emit_terminal(UploadEvent::Failed {
                reason: err.to_string(),
            })
            .await;
        }
    }

    /// Delivers an event that ends a run, waiting for room if the reader
    /// lags. Before the receiver is taken nobody reads, so it is not awaited.
    async fn emit_terminal(&self, event: UploadEvent) {
        if self.events_rx.is_some() {
            emit(&self.events_tx, event);
            return;
        }
        let _ = self.events_tx.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeSet, HashMap};
    use std::sync::Mutex;
    use std::time::Duration;

    use chunkferry_protocol::{MergeResponse, VerifyResponse};
    use chunkferry_transfer::{ChunkDescriptor, ChunkId, ReadFuture, TransferError};

    use crate::transport::{ChunkUpload, ProgressFn, TransportFuture};

    /// In-memory server: tracks stored chunks and merged hashes.
    #[derive(Default)]
    struct MockTransport {
        stored: Mutex<HashMap<String, BTreeSet<usize>>>,
        merged: Mutex<BTreeSet<String>>,
        uploads: Mutex<Vec<usize>>,
        verify_failures: Mutex<u32>,
        pause_after: Mutex<Option<(usize, PauseHandle)>>,
    }

    impl MockTransport {
        fn uploads(&self) -> Vec<usize> {
            let mut v = self.uploads.lock().unwrap().clone();
            v.sort_unstable();
            v
        }
    }

    impl ChunkTransport for MockTransport {
        fn verify(&self, req: VerifyRequest) -> TransportFuture<'_, VerifyResponse> {
            Box::pin(async move {
                {
                    let mut failures = self.verify_failures.lock().unwrap();
                    if *failures > 0 {
                        *failures -= 1;
                        return Err(UploadError::Timeout);
                    }
                }
                if self.merged.lock().unwrap().contains(&req.file_hash) {
                    return Ok(VerifyResponse::already_exists("exists"));
                }
                let list = self
                    .stored
                    .lock()
                    .unwrap()
                    .get(&req.file_hash)
                    .map(|set| {
                        set.iter()
                            .map(|i| ChunkId::new(&req.file_hash, *i).to_string())
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(VerifyResponse::partial(list))
            })
        }

        fn upload_chunk(&self, chunk: ChunkUpload, progress: ProgressFn) -> TransportFuture<'_, ()> {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(2)).await;
                progress(chunk.data.len() as u64);
                let index = chunk.chunk_id.index();
                self.stored
                    .lock()
                    .unwrap()
                    .entry(chunk.chunk_id.file_hash().to_string())
                    .or_default()
                    .insert(index);
                let count = {
                    let mut uploads = self.uploads.lock().unwrap();
                    uploads.push(index);
                    uploads.len()
                };
                if let Some((after, handle)) = self.pause_after.lock().unwrap().as_ref() {
                    if count == *after {
                        handle.pause();
                    }
                }
                Ok(())
            })
        }

        fn merge(&self, req: MergeRequest) -> TransportFuture<'_, MergeResponse> {
            Box::pin(async move {
                let chunks = self
                    .stored
                    .lock()
                    .unwrap()
                    .remove(&req.file_hash)
                    .ok_or(UploadError::Rejected {
                        code: 404,
                        message: "no namespace".into(),
                    })?;
                let expected = req.size.unwrap_or(0).div_ceil(req.chunk_size) as usize;
                if chunks.len() != expected {
                    return Err(UploadError::Rejected {
                        code: 409,
                        message: "incomplete chunk set".into(),
                    });
                }
                self.merged.lock().unwrap().insert(req.file_hash);
                Ok(MergeResponse {
                    message: "merged".into(),
                    url: format!("http://localhost:3000/files/{}", req.filename),
                })
            })
        }
    }

    fn config(concurrency: usize) -> UploaderConfig {
        UploaderConfig {
            chunk_size: 4,
            concurrency,
            max_retries: 2,
            retry_backoff: Duration::from_millis(1),
        }
    }

    fn data(len: usize) -> Arc<dyn ChunkSource> {
        Arc::new((0..len).map(|i| i as u8).collect::<Vec<u8>>())
    }

    fn drain(rx: &mut mpsc::Receiver<UploadEvent>) -> Vec<UploadEvent> {
        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        events
    }

    #[tokio::test]
    async fn uploads_and_merges() {
        let transport = Arc::new(MockTransport::default());
        let mut uploader = Uploader::new(transport.clone(), config(3));
        let mut rx = uploader.take_events().unwrap();
        let mut session = uploader.open(data(18), "f.bin").unwrap();

        let outcome = uploader.run(&mut session).await.unwrap();
        assert_eq!(
            outcome,
            UploadOutcome::Merged {
                url: "http://localhost:3000/files/f.bin".into(),
                message: "merged".into()
            }
        );
        assert_eq!(session.state(), SessionState::Done);
        assert_eq!(transport.uploads(), vec![0, 1, 2, 3, 4]);

        let events = drain(&mut rx);
        assert!(matches!(events.first(), Some(UploadEvent::HashProgress { .. })));
        assert_eq!(
            events.last(),
            Some(&UploadEvent::Done {
                url: Some("http://localhost:3000/files/f.bin".into()),
                instant: false
            })
        );
        let hash_pcts: Vec<f64> = events
            .iter()
            .filter_map(|e| match e {
                UploadEvent::HashProgress { percent } => Some(*percent),
                _ => None,
            })
            .collect();
        assert!(hash_pcts.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn done_survives_a_lagging_reader() {
        let transport = Arc::new(MockTransport::default());
        let mut uploader = Uploader::new(transport.clone(), config(8));
        let mut rx = uploader.take_events().unwrap();
        // Far more progress than the channel holds, read only at the end.
        let mut session = uploader.open(data(600 * 4), "many.bin").unwrap();

        uploader.run(&mut session).await.unwrap();
        assert_eq!(transport.uploads().len(), 600);

        let events = drain(&mut rx);
        assert!(events.len() <= EVENT_CHANNEL_CAPACITY);
        assert_eq!(
            events.last(),
            Some(&UploadEvent::Done {
                url: Some("http://localhost:3000/files/many.bin".into()),
                instant: false
            })
        );
        let terminal = events
            .iter()
            .filter(|e| matches!(e, UploadEvent::Done { .. }))
            .count();
        assert_eq!(terminal, 1);
    }

    #[tokio::test]
    async fn failure_survives_a_lagging_reader() {
        let transport = Arc::new(MockTransport::default());
        let mut uploader = Uploader::new(transport.clone(), config(8));
        let mut rx = uploader.take_events().unwrap();

        // Hash progress alone overflows the channel.
        let mut session = uploader.open(data(1500 * 4), "many.bin").unwrap();
        uploader.prepare(&mut session).await.unwrap();
        *transport.verify_failures.lock().unwrap() = 10;

        let err = uploader.run(&mut session).await.unwrap_err();
        assert!(matches!(err, UploadError::VerifyFailure(_)));
        assert!(matches!(
            drain(&mut rx).last(),
            Some(UploadEvent::Failed { .. })
        ));
    }

    #[tokio::test]
    async fn second_upload_of_same_content_is_instant() {
        let transport = Arc::new(MockTransport::default());
        let mut uploader = Uploader::new(transport.clone(), config(2));
        let mut rx = uploader.take_events().unwrap();

        let mut first = uploader.open(data(9), "a.bin").unwrap();
        uploader.run(&mut first).await.unwrap();
        let uploads_before = transport.uploads().len();
        drain(&mut rx);

        let mut second = uploader.open(data(9), "b.bin").unwrap();
        let outcome = uploader.run(&mut second).await.unwrap();
        assert!(matches!(outcome, UploadOutcome::Instant { .. }));
        assert_eq!(second.state(), SessionState::Done);
        assert_eq!(transport.uploads().len(), uploads_before);
        assert!(drain(&mut rx).contains(&UploadEvent::Done {
            url: None,
            instant: true
        }));
    }

    #[tokio::test]
    async fn pause_then_resume_sends_only_missing_chunks() {
        let transport = Arc::new(MockTransport::default());
        let uploader = Uploader::new(transport.clone(), config(1));
        *transport.pause_after.lock().unwrap() = Some((3, uploader.pause_handle()));

        let mut session = uploader.open(data(20), "f.bin").unwrap();
        let outcome = uploader.run(&mut session).await.unwrap();
        assert_eq!(outcome, UploadOutcome::Paused { remaining: 2 });
        assert_eq!(session.state(), SessionState::Paused);
        assert_eq!(transport.uploads(), vec![0, 1, 2]);

        *transport.pause_after.lock().unwrap() = None;
        transport.uploads.lock().unwrap().clear();
        let outcome = uploader.resume(&mut session).await.unwrap();
        assert!(matches!(outcome, UploadOutcome::Merged { .. }));
        assert_eq!(transport.uploads(), vec![3, 4]);
    }

    #[tokio::test]
    async fn transient_verify_failures_are_retried() {
        let transport = Arc::new(MockTransport::default());
        *transport.verify_failures.lock().unwrap() = 2;
        let uploader = Uploader::new(transport.clone(), config(2));

        let mut session = uploader.open(data(8), "f.bin").unwrap();
        assert!(uploader.run(&mut session).await.is_ok());
    }

    #[tokio::test]
    async fn verify_failure_fails_session() {
        let transport = Arc::new(MockTransport::default());
        *transport.verify_failures.lock().unwrap() = 10;
        let mut uploader = Uploader::new(transport.clone(), config(2));
        let mut rx = uploader.take_events().unwrap();

        let mut session = uploader.open(data(8), "f.bin").unwrap();
        let err = uploader.run(&mut session).await.unwrap_err();
        assert!(matches!(err, UploadError::VerifyFailure(_)));
        assert_eq!(session.state(), SessionState::Failed);
        assert!(matches!(
            drain(&mut rx).last(),
            Some(UploadEvent::Failed { .. })
        ));

        // A failed session keeps its fingerprint and can be retried.
        *transport.verify_failures.lock().unwrap() = 0;
        assert!(uploader.run(&mut session).await.is_ok());
        assert_eq!(session.state(), SessionState::Done);
    }

    struct BrokenSource;

    impl ChunkSource for BrokenSource {
        fn byte_len(&self) -> u64 {
            8
        }

        fn read_chunk(&self, _chunk: &ChunkDescriptor) -> ReadFuture<'_> {
            Box::pin(async {
                Err(TransferError::Io(std::io::Error::other("disk gone")))
            })
        }
    }

    #[tokio::test]
    async fn unreadable_source_is_a_hash_failure() {
        let uploader = Uploader::new(Arc::new(MockTransport::default()), config(2));
        let mut session = uploader.open(Arc::new(BrokenSource), "f.bin").unwrap();

        let err = uploader.run(&mut session).await.unwrap_err();
        assert!(matches!(err, UploadError::HashFailure(_)));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn empty_file_is_rejected_before_hashing() {
        let uploader = Uploader::new(Arc::new(MockTransport::default()), config(2));
        let err = uploader.open(data(0), "f.bin").err().unwrap();
        assert!(matches!(err, UploadError::EmptyFile));
    }

    #[tokio::test]
    async fn cancel_returns_paused_session_to_idle() {
        let transport = Arc::new(MockTransport::default());
        let uploader = Uploader::new(transport.clone(), config(1));
        *transport.pause_after.lock().unwrap() = Some((1, uploader.pause_handle()));

        let mut session = uploader.open(data(12), "f.bin").unwrap();
        uploader.run(&mut session).await.unwrap();
        assert_eq!(session.state(), SessionState::Paused);

        uploader.cancel(&mut session).unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.total_percent(), 0.0);
        assert!(!uploader.pause_handle().is_paused());

        // Cancelling is only valid from Paused.
        assert!(uploader.cancel(&mut session).is_err());
    }
}

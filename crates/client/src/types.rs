//! Data types for the upload flow.

use std::time::Duration;

use chunkferry_protocol::DEFAULT_CHUNK_SIZE;

/// Default number of chunks in flight at once.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default retries per chunk after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default back-off unit; attempt `n` waits `n` times this.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Tuning for an [`Uploader`](crate::Uploader).
#[derive(Debug, Clone)]
pub struct UploaderConfig {
    pub chunk_size: u64,
    pub concurrency: usize,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

/// Progress and lifecycle event emitted during an upload.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    /// Fingerprinting progress.
    HashProgress { percent: f64 },
    /// Progress of one chunk, by identifier.
    ChunkProgress { chunk_id: String, percent: f64 },
    /// Byte-weighted progress across the whole file.
    TotalProgress { percent: f64 },
    /// In-flight transfers were cancelled; the session can be resumed.
    Paused,
    /// The upload finished. `instant` marks a dedup hit.
    Done { url: Option<String>, instant: bool },
    /// The session failed; `reason` is the dominant cause.
    Failed { reason: String },
}

/// How a call to [`Uploader::run`](crate::Uploader::run) ended.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadOutcome {
    /// The server already held the file.
    Instant { message: Option<String> },
    /// Every chunk was sent and the server merged them.
    Merged { url: String, message: String },
    /// Paused before completion; `remaining` chunks are still missing.
    Paused { remaining: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = UploaderConfig::default();
        assert_eq!(config.chunk_size, 2 * 1024 * 1024);
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.max_retries, 3);
    }
}

//! Resumable chunked upload client.
//!
//! Provides the WebSocket client, the [`ChunkTransport`] seam, the
//! per-file [`TransferSession`] state machine, the bounded-concurrency
//! [`TransferScheduler`] and the [`Uploader`] that ties them together.

pub mod error;
pub(crate) mod pumps;
pub mod scheduler;
pub mod session;
pub mod transport;
pub mod types;
pub mod uploader;
pub mod ws_client;

pub use error::UploadError;
pub use scheduler::{PauseHandle, ScheduleOutcome, SchedulerConfig, TransferScheduler};
pub use session::{SessionState, TransferSession};
pub use transport::{ChunkTransport, ChunkUpload, ProgressFn, TransportFuture, WsTransport};
pub use types::{UploadEvent, UploadOutcome, UploaderConfig};
pub use uploader::Uploader;
pub use ws_client::{WsClient, WsError};

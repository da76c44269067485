//! WebSocket server for chunkferry.
//!
//! Accepts client connections over WebSocket, dispatches JSON requests and
//! binary chunk frames to a [`Handler`], and manages each connection's
//! lifecycle (ping/pong, graceful shutdown). [`StoreHandler`] is the handler
//! that backs the protocol with a chunk store.

mod connection;
mod handler;
mod server;
mod store_handler;

pub use connection::{ClientConnection, SendError, Sender};
pub use handler::{Handler, HandlerFuture};
pub use server::{ChunkServer, ServerConfig};
pub use store_handler::StoreHandler;

/// Send buffer capacity per connection.
pub const SEND_BUFFER_SIZE: usize = 1024;

/// Errors produced by the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("server already running")]
    AlreadyRunning,
}

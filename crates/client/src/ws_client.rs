//! WebSocket client for talking to a chunkferry server.
//!
//! Implements request-response with UUID correlation and ping/pong
//! keepalive. Binary chunk frames are correlated through the `id` field of
//! their header.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;

use chunkferry_protocol::constants::{
    WS_BINARY_REQUEST_TIMEOUT, WS_MAX_MESSAGE_SIZE, WS_REQUEST_TIMEOUT,
};
use chunkferry_protocol::{ChunkFrameHeader, Message, MessageType, encode_chunk_frame};

/// Errors from the WebSocket client.
#[derive(Debug, thiserror::Error)]
pub enum WsError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("request timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("server error {code}: {message}")]
    Server { code: i32, message: String },
}

/// Requests waiting for a reply, keyed by request id.
pub(crate) type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Message>>>>;

/// Receives the cumulative number of frame bytes written to the socket.
pub(crate) type WriteProgress = Box<dyn Fn(usize) + Send>;

/// A frame queued for the write pump.
pub(crate) struct Outbound {
    pub frame: tungstenite::Message,
    /// Called after each fragment of `frame` is written. Binary frames with a
    /// progress callback are fragmented.
    pub progress: Option<WriteProgress>,
}

impl Outbound {
    pub(crate) fn plain(frame: tungstenite::Message) -> Self {
        Self {
            frame,
            progress: None,
        }
    }
}

/// WebSocket client connected to one server.
pub struct WsClient {
    write_tx: mpsc::Sender<Outbound>,
    pending: PendingMap,
    read_handle: tokio::task::JoinHandle<()>,
    write_handle: tokio::task::JoinHandle<()>,
    ping_handle: tokio::task::JoinHandle<()>,
    cancel: CancellationToken,
}

impl WsClient {
    /// Connects to the server at `url` (e.g. `ws://localhost:3000`).
    pub async fn connect(url: &str) -> Result<Self, WsError> {
        let mut ws_config = tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let (ws_stream, _) =
            tokio_tungstenite::connect_async_with_config(url, Some(ws_config), false).await?;
        let (write, read) = ws_stream.split();

        let (write_tx, write_rx) = mpsc::channel::<Outbound>(256);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();

        let write_handle = tokio::spawn(crate::pumps::write::write_pump(
            write,
            write_rx,
            cancel.clone(),
        ));
        let read_handle = tokio::spawn(crate::pumps::read::read_pump(
            read,
            pending.clone(),
            write_tx.clone(),
            cancel.clone(),
        ));
        let ping_handle = tokio::spawn(crate::pumps::ping::ping_pump(
            write_tx.clone(),
            cancel.clone(),
        ));

        tracing::debug!(%url, "connected");
        Ok(Self {
            write_tx,
            pending,
            read_handle,
            write_handle,
            ping_handle,
            cancel,
        })
    }

    /// Sends a request and waits for the response.
    pub async fn send_request<T: serde::Serialize>(
        &self,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Message, WsError> {
        let id = uuid::Uuid::new_v4().to_string();
        let msg = Message::new(&id, msg_type, payload)?;
        let json = serde_json::to_string(&msg)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        if self
            .write_tx
            .send(Outbound::plain(tungstenite::Message::Text(json.into())))
            .await
            .is_err()
        {
            self.pending.lock().await.remove(&id);
            return Err(WsError::Closed);
        }

        let result = tokio::time::timeout(WS_REQUEST_TIMEOUT, rx).await;
        self.pending.lock().await.remove(&id);
        into_reply(result)
    }

    /// Sends a binary chunk frame and waits for the text acknowledgment.
    ///
    /// A fresh request id is written into `header.id`. `on_progress`
    /// receives the cumulative count of `data` bytes written so far, once
    /// per fragment.
    pub async fn send_chunk(
        &self,
        mut header: ChunkFrameHeader,
        data: &[u8],
        on_progress: impl Fn(u64) + Send + 'static,
    ) -> Result<Message, WsError> {
        let id = uuid::Uuid::new_v4().to_string();
        header.id = id.clone();
        let frame = encode_chunk_frame(&header, data)?;
        let prefix = frame.len() - data.len();

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        let outbound = Outbound {
            frame: tungstenite::Message::Binary(frame.into()),
            progress: Some(Box::new(move |written: usize| {
                on_progress(written.saturating_sub(prefix) as u64)
            })),
        };
        if self.write_tx.send(outbound).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(WsError::Closed);
        }

        // Binary transfers get the longer timeout.
        let result = tokio::time::timeout(WS_BINARY_REQUEST_TIMEOUT, rx).await;
        self.pending.lock().await.remove(&id);
        into_reply(result)
    }

    /// Returns `true` while the connection pumps are running.
    pub fn is_connected(&self) -> bool {
        !self.cancel.is_cancelled() && !self.write_tx.is_closed()
    }

    /// Gracefully closes the connection.
    pub async fn close(&self) {
        self.cancel.cancel();
    }
}

fn into_reply(
    result: Result<Result<Message, oneshot::error::RecvError>, tokio::time::error::Elapsed>,
) -> Result<Message, WsError> {
    match result {
        Ok(Ok(resp)) => {
            if let Some(err) = &resp.error {
                return Err(WsError::Server {
                    code: err.code,
                    message: err.message.clone(),
                });
            }
            Ok(resp)
        }
        Ok(Err(_)) => Err(WsError::Closed),
        Err(_) => Err(WsError::Timeout),
    }
}

impl Drop for WsClient {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.read_handle.abort();
        self.write_handle.abort();
        self.ping_handle.abort();
    }
}

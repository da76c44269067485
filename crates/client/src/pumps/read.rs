//! Routes inbound replies to their waiting requests.

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use chunkferry_protocol::Message;
use chunkferry_protocol::constants::{WS_MAX_MESSAGE_SIZE, WS_PONG_WAIT};

use crate::ws_client::{Outbound, PendingMap};

/// Reads frames until the stream ends, the pong deadline passes or the
/// connection is cancelled.
///
/// Any inbound frame pushes the deadline out by [`WS_PONG_WAIT`]. On exit
/// every pending request is dropped so its waiter sees a closed channel.
pub(crate) async fn read_pump<S>(
    mut read: S,
    pending: PendingMap,
    write_tx: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let pong_deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(pong_deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            () = &mut pong_deadline => {
                warn!("pong timeout, closing connection");
                break;
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        pong_deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);
                        match msg {
                            tungstenite::Message::Text(text) => {
                                route_reply(text.as_str(), &pending).await;
                            }
                            tungstenite::Message::Ping(data) => {
                                let pong = Outbound::plain(tungstenite::Message::Pong(data));
                                let _ = write_tx.send(pong).await;
                            }
                            tungstenite::Message::Close(_) => {
                                debug!("received close frame");
                                break;
                            }
                            _ => {}
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {e}");
                        break;
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    cancel.cancel();
    let abandoned = {
        let mut map = pending.lock().await;
        let n = map.len();
        map.clear();
        n
    };
    if abandoned > 0 {
        debug!(abandoned, "connection closed with requests in flight");
    }
}

async fn route_reply(text: &str, pending: &PendingMap) {
    if text.len() > WS_MAX_MESSAGE_SIZE {
        warn!("message too large ({} bytes), dropping", text.len());
        return;
    }

    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!("failed to parse message: {e}");
            return;
        }
    };

    trace!(msg_type = ?msg.msg_type, id = %msg.id, "received message");
    match pending.lock().await.remove(&msg.id) {
        Some(tx) => {
            let _ = tx.send(msg);
        }
        None => debug!(id = %msg.id, "reply for unknown or expired request"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use chunkferry_protocol::MessageType;
    use futures_util::stream;
    use tokio::sync::{Mutex, oneshot};

    fn pending_map() -> PendingMap {
        Arc::new(Mutex::new(HashMap::new()))
    }

    #[tokio::test]
    async fn routes_reply_by_id() {
        let pending = pending_map();
        let (tx, rx) = oneshot::channel();
        pending.lock().await.insert("req-1".into(), tx);

        let msg = Message::new::<()>("req-1", MessageType::MergeResponse, None).unwrap();
        route_reply(&serde_json::to_string(&msg).unwrap(), &pending).await;

        assert_eq!(rx.await.unwrap().msg_type, MessageType::MergeResponse);
        assert!(pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn ignores_malformed_and_unknown_replies() {
        let pending = pending_map();
        let (tx, _rx) = oneshot::channel();
        pending.lock().await.insert("req-1".into(), tx);

        route_reply("not json {{", &pending).await;
        let stray = Message::new::<()>("other", MessageType::Pong, None).unwrap();
        route_reply(&serde_json::to_string(&stray).unwrap(), &pending).await;

        assert_eq!(pending.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn stream_end_fails_pending_requests() {
        let pending = pending_map();
        let (tx, rx) = oneshot::channel();
        pending.lock().await.insert("req-1".into(), tx);

        let (write_tx, _write_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let empty = stream::empty::<Result<tungstenite::Message, tungstenite::Error>>();
        read_pump(empty, pending.clone(), write_tx, cancel.clone()).await;

        assert!(rx.await.is_err());
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn silence_trips_pong_deadline() {
        tokio::time::pause();
        let (write_tx, _write_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let silent = stream::pending::<Result<tungstenite::Message, tungstenite::Error>>();
        read_pump(silent, pending_map(), write_tx, cancel.clone()).await;
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn answers_server_pings() {
        let (write_tx, mut write_rx) = mpsc::channel(4);
        let frames = stream::iter(vec![Ok(tungstenite::Message::Ping(vec![7].into()))]);
        read_pump(frames, pending_map(), write_tx, CancellationToken::new()).await;

        let out = write_rx.recv().await.unwrap();
        assert!(matches!(out.frame, tungstenite::Message::Pong(_)));
    }
}

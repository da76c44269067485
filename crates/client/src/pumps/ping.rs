//! Keepalive pings.

use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;

use chunkferry_protocol::constants::WS_PING_PERIOD;

use crate::ws_client::Outbound;

/// Queues a ping every [`WS_PING_PERIOD`] until cancelled or the write
/// pump is gone.
pub(crate) async fn ping_pump(write_tx: mpsc::Sender<Outbound>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(WS_PING_PERIOD);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let ping = Outbound::plain(tungstenite::Message::Ping(Vec::new().into()));
                if write_tx.send(ping).await.is_err() {
                    break;
                }
            }
        }
    }
}

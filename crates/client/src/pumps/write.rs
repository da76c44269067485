//! Serialises outbound frames onto the socket.

use chunkferry_protocol::constants::WS_CHUNK_FRAGMENT_SIZE;
use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::frame::Frame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::{Data, OpCode};
use tokio_util::sync::CancellationToken;

use crate::ws_client::Outbound;

/// Writes queued frames in order, reporting progress after each fragment.
pub(crate) async fn write_pump<S>(
    mut write: S,
    mut write_rx: mpsc::Receiver<Outbound>,
    cancel: CancellationToken,
) where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            out = write_rx.recv() => {
                let Some(out) = out else { break };
                if let Err(e) = send_outbound(&mut write, out).await {
                    tracing::error!("WebSocket write error: {e}");
                    break;
                }
            }
        }
    }

    cancel.cancel();
    let _ = write.send(tungstenite::Message::Close(None)).await;
}

/// Sends one queued frame.
///
/// A binary frame with a progress callback that exceeds
/// [`WS_CHUNK_FRAGMENT_SIZE`] goes out as a binary fragment followed by
/// continuation fragments; the peer reassembles them into one message.
async fn send_outbound<S>(write: &mut S, out: Outbound) -> Result<(), tungstenite::Error>
where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    match (out.frame, out.progress) {
        (tungstenite::Message::Binary(data), Some(progress))
            if data.len() > WS_CHUNK_FRAGMENT_SIZE =>
        {
            let total = data.len();
            let mut written = 0;
            while written < total {
                let end = (written + WS_CHUNK_FRAGMENT_SIZE).min(total);
                let opcode = if written == 0 {
                    OpCode::Data(Data::Binary)
                } else {
                    OpCode::Data(Data::Continue)
                };
                let fragment = Frame::message(data.slice(written..end), opcode, end == total);
                write.send(tungstenite::Message::Frame(fragment)).await?;
                written = end;
                progress(written);
            }
            Ok(())
        }
        (frame, progress) => {
            let len = frame.len();
            write.send(frame).await?;
            if let Some(progress) = progress {
                progress(len);
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use futures_util::sink;

    fn capture_sink(
        tx: mpsc::Sender<tungstenite::Message>,
    ) -> impl SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin {
        Box::pin(sink::unfold(tx, |tx, msg: tungstenite::Message| async move {
            let _ = tx.send(msg).await;
            Ok::<_, tungstenite::Error>(tx)
        }))
    }

    fn recorder() -> (Arc<Mutex<Vec<usize>>>, crate::ws_client::WriteProgress) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = seen.clone();
        (seen, Box::new(move |n: usize| record.lock().unwrap().push(n)))
    }

    #[tokio::test]
    async fn small_frame_is_sent_whole() {
        let (sink_tx, mut sink_rx) = mpsc::channel(16);
        let (write_tx, write_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(write_pump(capture_sink(sink_tx), write_rx, cancel.clone()));

        let (seen, progress) = recorder();
        write_tx
            .send(Outbound {
                frame: tungstenite::Message::Binary(vec![1, 2, 3].into()),
                progress: Some(progress),
            })
            .await
            .unwrap();

        assert!(matches!(
            sink_rx.recv().await,
            Some(tungstenite::Message::Binary(_))
        ));

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![3]);
        assert!(matches!(
            sink_rx.recv().await,
            Some(tungstenite::Message::Close(_))
        ));
    }

    #[tokio::test]
    async fn large_chunk_frame_is_fragmented_with_progress() {
        let (sink_tx, mut sink_rx) = mpsc::channel(16);
        let total = 2 * WS_CHUNK_FRAGMENT_SIZE + 10;
        let data: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();

        let (seen, progress) = recorder();
        let mut sink = capture_sink(sink_tx);
        send_outbound(
            &mut sink,
            Outbound {
                frame: tungstenite::Message::Binary(data.clone().into()),
                progress: Some(progress),
            },
        )
        .await
        .unwrap();
        drop(sink);

        let mut frames = Vec::new();
        while let Some(msg) = sink_rx.recv().await {
            match msg {
                tungstenite::Message::Frame(f) => frames.push(f),
                other => panic!("expected raw fragment, got {other:?}"),
            }
        }
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].header().opcode, OpCode::Data(Data::Binary));
        assert_eq!(frames[1].header().opcode, OpCode::Data(Data::Continue));
        assert_eq!(frames[2].header().opcode, OpCode::Data(Data::Continue));
        assert!(!frames[0].header().is_final);
        assert!(frames[2].header().is_final);

        let joined: Vec<u8> = frames.iter().flat_map(|f| f.payload().to_vec()).collect();
        assert!(joined == data);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![WS_CHUNK_FRAGMENT_SIZE, 2 * WS_CHUNK_FRAGMENT_SIZE, total]
        );
    }

    #[tokio::test]
    async fn text_frames_are_never_fragmented() {
        let (sink_tx, mut sink_rx) = mpsc::channel(16);
        let text = "x".repeat(WS_CHUNK_FRAGMENT_SIZE + 1);
        let mut sink = capture_sink(sink_tx);
        send_outbound(
            &mut sink,
            Outbound::plain(tungstenite::Message::Text(text.into())),
        )
        .await
        .unwrap();
        assert!(matches!(
            sink_rx.recv().await,
            Some(tungstenite::Message::Text(_))
        ));
    }

    #[tokio::test]
    async fn dropping_queue_cancels_connection() {
        let (sink_tx, _sink_rx) = mpsc::channel(16);
        let (write_tx, write_rx) = mpsc::channel::<Outbound>(16);
        let cancel = CancellationToken::new();
        drop(write_tx);
        write_pump(capture_sink(sink_tx), write_rx, cancel.clone()).await;
        assert!(cancel.is_cancelled());
    }
}

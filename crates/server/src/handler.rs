//! Handler trait for processing client requests.
//!
//! Implementors provide the upload semantics while the server framework
//! handles connection management, routing and the binary frame codec.

use std::future::Future;
use std::pin::Pin;

use chunkferry_protocol::constants::WS_ERR_CODE_NOT_IMPLEMENTED;
use chunkferry_protocol::{ChunkFrameHeader, Message, MessageType};

use crate::connection::Sender;

/// A boxed future returned by handler methods.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Trait for handling messages from a client.
///
/// Each method receives a `sender` to reply on and the parsed request.
/// Default implementations reply "not implemented".
pub trait Handler: Send + Sync + 'static {
    /// Called for `verify`.
    fn on_verify(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_error(&msg, WS_ERR_CODE_NOT_IMPLEMENTED, "not implemented");
        })
    }

    /// Called for `merge`.
    fn on_merge(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_error(&msg, WS_ERR_CODE_NOT_IMPLEMENTED, "not implemented");
        })
    }

    /// Called for `ping`.
    fn on_ping(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            if let Ok(reply) = msg.reply(MessageType::Pong, Option::<&()>::None) {
                let _ = sender.send_msg(reply);
            }
        })
    }

    /// Called for a binary `upload_chunk` frame. Replies carry `header.id`.
    fn on_binary_chunk(
        &self,
        sender: Sender,
        header: ChunkFrameHeader,
        data: Vec<u8>,
    ) -> HandlerFuture<'_> {
        let _ = data;
        Box::pin(async move {
            let _ = sender.send_msg(Message::error(
                header.id,
                WS_ERR_CODE_NOT_IMPLEMENTED,
                "not implemented",
            ));
        })
    }

    /// Called when the client disconnects.
    fn on_disconnected(&self) -> HandlerFuture<'_> {
        Box::pin(async {})
    }
}

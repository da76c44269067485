//! [`Handler`] backed by a [`ChunkStore`] and [`MergeCoordinator`].

use chunkferry_protocol::constants::WS_ERR_CODE_BAD_REQUEST;
use chunkferry_protocol::{
    ChunkFrameHeader, MergeRequest, MergeResponse, Message, MessageType, UploadChunkResponse,
    VerifyRequest, VerifyResponse,
};
use chunkferry_store::{ChunkStore, MergeCoordinator, StoreError};
use serde_json::Value;

use crate::connection::Sender;
use crate::handler::{Handler, HandlerFuture};

const ALREADY_EXISTS: &str = "file already exists, upload skipped";

/// Serves `verify`, `upload_chunk` and `merge` from a chunk store.
pub struct StoreHandler {
    store: ChunkStore,
    merger: MergeCoordinator,
    public_base_url: String,
}

impl StoreHandler {
    /// Creates a handler; merged files are advertised under `public_base_url`.
    pub fn new(store: ChunkStore, public_base_url: impl Into<String>) -> Self {
        let merger = MergeCoordinator::new(&store);
        Self {
            store,
            merger,
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn file_url(&self, filename: &str) -> String {
        format!("{}/{filename}", self.public_base_url)
    }
}

/// Parses a required request payload, answering 400 on failure.
fn require_payload<T: serde::de::DeserializeOwned>(sender: &Sender, msg: &Message) -> Option<T> {
    match msg.parse_payload::<T>() {
        Ok(Some(req)) => Some(req),
        Ok(None) => {
            let _ = sender.send_error(msg, WS_ERR_CODE_BAD_REQUEST, "missing payload");
            None
        }
        Err(e) => {
            let _ = sender.send_error(
                msg,
                WS_ERR_CODE_BAD_REQUEST,
                &format!("invalid payload: {e}"),
            );
            None
        }
    }
}

fn send_reply<T: serde::Serialize>(sender: &Sender, msg: &Message, msg_type: MessageType, payload: &T) {
    match msg.reply(msg_type, Some(payload)) {
        Ok(reply) => {
            let _ = sender.send_msg(reply);
        }
        Err(e) => tracing::error!("failed to build reply: {e}"),
    }
}

fn send_store_error(sender: &Sender, msg: &Message, err: &StoreError) {
    if err.code() >= 500 {
        tracing::error!(id = %msg.id, "store failure: {err}");
    } else {
        tracing::warn!(id = %msg.id, "request rejected: {err}");
    }
    let _ = sender.send_error(msg, err.code(), &err.to_string());
}

impl Handler for StoreHandler {
    fn on_verify(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let Some(req) = require_payload::<VerifyRequest>(&sender, &msg) else {
                return;
            };

            match self.store.verify(&req.file_hash).await {
                Ok(outcome) if outcome.exists => {
                    tracing::info!(file_hash = %req.file_hash, filename = %req.filename, "dedup hit");
                    // The new name must resolve to the existing artifact.
                    if let Err(e) = self.store.index_filename(&req.filename, &req.file_hash).await {
                        send_store_error(&sender, &msg, &e);
                        return;
                    }
                    let resp = VerifyResponse::already_exists(ALREADY_EXISTS);
                    send_reply(&sender, &msg, MessageType::VerifyResponse, &resp);
                }
                Ok(outcome) => {
                    tracing::debug!(
                        file_hash = %req.file_hash,
                        uploaded = outcome.uploaded.len(),
                        "verify"
                    );
                    let resp = VerifyResponse::partial(outcome.uploaded);
                    send_reply(&sender, &msg, MessageType::VerifyResponse, &resp);
                }
                Err(e) => send_store_error(&sender, &msg, &e),
            }
        })
    }

    fn on_binary_chunk(
        &self,
        sender: Sender,
        header: ChunkFrameHeader,
        data: Vec<u8>,
    ) -> HandlerFuture<'_> {
        Box::pin(async move {
            let req = match Message::new(
                header.id.clone(),
                MessageType::UploadChunk,
                Option::<&Value>::None,
            ) {
                Ok(req) => req,
                Err(e) => {
                    tracing::error!("failed to build request envelope: {e}");
                    return;
                }
            };
            let checksum = Some(header.checksum.as_str()).filter(|c| !c.is_empty());

            match self
                .store
                .put_chunk(&header.file_hash, &header.chunk_hash, data, checksum)
                .await
            {
                Ok(_) => {
                    let resp = UploadChunkResponse {
                        chunk_hash: header.chunk_hash,
                    };
                    send_reply(&sender, &req, MessageType::UploadChunkResponse, &resp);
                }
                Err(e) => send_store_error(&sender, &req, &e),
            }
        })
    }

    fn on_merge(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let Some(req) = require_payload::<MergeRequest>(&sender, &msg) else {
                return;
            };

            match self
                .merger
                .merge(&req.file_hash, &req.filename, req.chunk_size, req.size)
                .await
            {
                Ok(outcome) => {
                    let resp = MergeResponse {
                        message: format!("merged {} chunks ({} bytes)", outcome.chunks, outcome.size),
                        url: self.file_url(&outcome.filename),
                    };
                    send_reply(&sender, &msg, MessageType::MergeResponse, &resp);
                }
                Err(e) => send_store_error(&sender, &msg, &e),
            }
        })
    }
}

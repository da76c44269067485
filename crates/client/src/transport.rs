//! The seam between the upload logic and the network.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chunkferry_protocol::{
    ChunkFrameHeader, MergeRequest, MergeResponse, MessageType, UploadChunkResponse,
    VerifyRequest, VerifyResponse,
};
use chunkferry_transfer::ChunkId;
use serde::de::DeserializeOwned;

use crate::error::UploadError;
use crate::ws_client::WsClient;

/// Boxed future returned by [`ChunkTransport`] methods.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, UploadError>> + Send + 'a>>;

/// Receives the cumulative number of bytes of a chunk that have left the
/// client. Called several times per chunk for large chunks.
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

/// One chunk ready to send.
#[derive(Debug, Clone)]
pub struct ChunkUpload {
    pub chunk_id: ChunkId,
    pub data: Vec<u8>,
    /// SHA-256 hex of `data`; empty to skip server-side verification.
    pub checksum: String,
}

/// Operations the uploader needs from a server.
pub trait ChunkTransport: Send + Sync {
    /// Asks which chunks of `file_hash` the server already holds.
    fn verify(&self, req: VerifyRequest) -> TransportFuture<'_, VerifyResponse>;

    /// Sends one chunk and waits for the server to acknowledge it.
    fn upload_chunk(&self, chunk: ChunkUpload, progress: ProgressFn) -> TransportFuture<'_, ()>;

    /// Asks the server to assemble the stored chunks.
    fn merge(&self, req: MergeRequest) -> TransportFuture<'_, MergeResponse>;
}

/// [`ChunkTransport`] over a [`WsClient`] connection.
pub struct WsTransport {
    client: WsClient,
}

impl WsTransport {
    /// Connects to `url` (e.g. `ws://localhost:3000`).
    pub async fn connect(url: &str) -> Result<Self, UploadError> {
        let client = WsClient::connect(url).await?;
        Ok(Self { client })
    }

    pub fn new(client: WsClient) -> Self {
        Self { client }
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    pub async fn close(&self) {
        self.client.close().await;
    }
}

fn expect_payload<T: DeserializeOwned>(
    resp: chunkferry_protocol::Message,
    what: &'static str,
) -> Result<T, UploadError> {
    resp.parse_payload::<T>()?
        .ok_or(UploadError::MissingPayload(what))
}

impl ChunkTransport for WsTransport {
    fn verify(&self, req: VerifyRequest) -> TransportFuture<'_, VerifyResponse> {
        Box::pin(async move {
            let resp = self
                .client
                .send_request(MessageType::Verify, Some(&req))
                .await?;
            expect_payload(resp, "verify")
        })
    }

    fn upload_chunk(&self, chunk: ChunkUpload, progress: ProgressFn) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let header = ChunkFrameHeader {
                id: String::new(),
                file_hash: chunk.chunk_id.file_hash().to_string(),
                chunk_hash: chunk.chunk_id.to_string(),
                checksum: chunk.checksum,
            };
            let resp = self
                .client
                .send_chunk(header, &chunk.data, move |bytes| progress(bytes))
                .await?;
            let ack: UploadChunkResponse = expect_payload(resp, "upload_chunk")?;
            if ack.chunk_hash != chunk.chunk_id.to_string() {
                return Err(UploadError::Rejected {
                    code: chunkferry_protocol::constants::WS_ERR_CODE_INTERNAL,
                    message: format!(
                        "acknowledged {} instead of {}",
                        ack.chunk_hash, chunk.chunk_id
                    ),
                });
            }
            Ok(())
        })
    }

    fn merge(&self, req: MergeRequest) -> TransportFuture<'_, MergeResponse> {
        Box::pin(async move {
            let resp = self
                .client
                .send_request(MessageType::Merge, Some(&req))
                .await?;
            expect_payload(resp, "merge")
        })
    }
}

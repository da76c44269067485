//! Wire protocol shared by the chunkferry client and server.

pub mod binary;
pub mod constants;
pub mod envelope;
pub mod messages;

// Re-export primary types for convenience.
pub use binary::{ChunkFrameHeader, ParseError, encode_chunk_frame, parse_chunk_frame};
pub use constants::{DEFAULT_CHUNK_SIZE, MessageType};
pub use envelope::{Message, WsError};
pub use messages::{
    MergeRequest, MergeResponse, UploadChunkResponse, VerifyRequest, VerifyResponse,
};

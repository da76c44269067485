use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// Asks whether a file still needs uploading and which chunks the server has.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    pub filename: String,
    pub file_hash: String,
}

/// Asks the server to reassemble the stored chunks of a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequest {
    pub file_hash: String,
    pub filename: String,
    pub chunk_size: u64,
    /// Total file length; lets the server detect a missing trailing chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

// ---------------------------------------------------------------------------
// Response payloads
// ---------------------------------------------------------------------------

/// Reply to [`VerifyRequest`].
///
/// `should_upload == false` is a dedup hit: the artifact for this hash
/// already exists and nothing needs to be sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub should_upload: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub uploaded_list: Vec<String>,
}

impl VerifyResponse {
    /// Dedup hit.
    pub fn already_exists(message: impl Into<String>) -> Self {
        Self {
            should_upload: false,
            message: Some(message.into()),
            uploaded_list: Vec::new(),
        }
    }

    /// Upload needed; `uploaded_list` holds the chunk identifiers already stored.
    pub fn partial(uploaded_list: Vec<String>) -> Self {
        Self {
            should_upload: true,
            message: None,
            uploaded_list,
        }
    }
}

/// Acknowledges a stored chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadChunkResponse {
    pub chunk_hash: String,
}

/// Reply to [`MergeRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeResponse {
    pub message: String,
    pub url: String,
}

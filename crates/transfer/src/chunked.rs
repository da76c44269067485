use std::fmt;
use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::str::FromStr;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::TransferError;

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Chunk descriptors
// ---------------------------------------------------------------------------

/// A contiguous byte range `[start, end)` of the source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDescriptor {
    /// 0-based ordinal position; indices are contiguous.
    pub index: usize,
    pub start: u64,
    pub end: u64,
}

impl ChunkDescriptor {
    /// Size of this chunk in bytes.
    pub fn size(&self) -> u64 {
        self.end - self.start
    }
}

/// Splits `file_size` bytes into fixed-size chunks; the last one may be shorter.
///
/// An empty file yields no chunks.
pub fn split_into_chunks(
    file_size: u64,
    chunk_size: u64,
) -> Result<Vec<ChunkDescriptor>, TransferError> {
    if chunk_size == 0 {
        return Err(TransferError::InvalidChunkSize);
    }

    let mut chunks = Vec::with_capacity(file_size.div_ceil(chunk_size) as usize);
    let mut start = 0;
    while start < file_size {
        let end = (start + chunk_size).min(file_size);
        chunks.push(ChunkDescriptor {
            index: chunks.len(),
            start,
            end,
        });
        start = end;
    }
    Ok(chunks)
}

// ---------------------------------------------------------------------------
// Chunk identifiers
// ---------------------------------------------------------------------------

/// Stable key of one chunk: `{fileHash}-{index}`.
///
/// The same file split with the same chunk size always yields the same
/// identifiers, which is what makes re-uploads detectable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkId {
    file_hash: String,
    index: usize,
}

impl ChunkId {
    pub fn new(file_hash: impl Into<String>, index: usize) -> Self {
        Self {
            file_hash: file_hash.into(),
            index,
        }
    }

    pub fn file_hash(&self) -> &str {
        &self.file_hash
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.file_hash, self.index)
    }
}

impl FromStr for ChunkId {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hash, index) = s
            .rsplit_once('-')
            .ok_or_else(|| TransferError::InvalidChunkId(s.to_string()))?;
        if hash.is_empty() || index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TransferError::InvalidChunkId(s.to_string()));
        }
        let index = index
            .parse()
            .map_err(|_| TransferError::InvalidChunkId(s.to_string()))?;
        Ok(Self::new(hash, index))
    }
}

// ---------------------------------------------------------------------------
// Chunk sources
// ---------------------------------------------------------------------------

/// Boxed future returned by [`ChunkSource::read_chunk`].
pub type ReadFuture<'a> = Pin<Box<dyn Future<Output = Result<Vec<u8>, TransferError>> + Send + 'a>>;

/// Random access to the bytes of the file being transferred.
///
/// Reads may run concurrently; each call returns exactly `chunk.size()`
/// bytes or an error.
pub trait ChunkSource: Send + Sync {
    /// Total length of the source in bytes.
    fn byte_len(&self) -> u64;

    /// Reads the bytes covered by `chunk`.
    fn read_chunk(&self, chunk: &ChunkDescriptor) -> ReadFuture<'_>;
}

/// A file on disk, opened per read so concurrent reads never share a cursor.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    len: u64,
}

impl FileSource {
    /// Captures the file's current length; the file must not change afterwards.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, TransferError> {
        let path = path.as_ref().to_path_buf();
        let len = tokio::fs::metadata(&path).await?.len();
        Ok(Self { path, len })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ChunkSource for FileSource {
    fn byte_len(&self) -> u64 {
        self.len
    }

    fn read_chunk(&self, chunk: &ChunkDescriptor) -> ReadFuture<'_> {
        let chunk = *chunk;
        Box::pin(async move {
            if chunk.end > self.len {
                return Err(TransferError::OutOfRange {
                    index: chunk.index,
                    len: self.len,
                });
            }
            let mut file = tokio::fs::File::open(&self.path).await?;
            file.seek(SeekFrom::Start(chunk.start)).await?;
            let mut buf = vec![0u8; chunk.size() as usize];
            file.read_exact(&mut buf).await?;
            Ok(buf)
        })
    }
}

impl ChunkSource for Vec<u8> {
    fn byte_len(&self) -> u64 {
        self.len() as u64
    }

    fn read_chunk(&self, chunk: &ChunkDescriptor) -> ReadFuture<'_> {
        let chunk = *chunk;
        Box::pin(async move {
            self.get(chunk.start as usize..chunk.end as usize)
                .map(<[u8]>::to_vec)
                .ok_or(TransferError::OutOfRange {
                    index: chunk.index,
                    len: self.len() as u64,
                })
        })
    }
}

//! Chunk transfer wire format.
//!
//! A transfer runs over one raw bidirectional stream. Every message is a
//! 4-byte little-endian length followed by that many bytes of JSON. The
//! first frame the consumer sends is the protocol id, which names the file
//! the producer should serve on this stream:
//!
//! ```text
//! consumer -> producer   "orcanet-fileshare/1.0/<fileHash>"
//! consumer -> producer   ChunkRequest  { fileHash, chunkIndex, jobId }
//! producer -> consumer   ChunkResponse { fileHash, chunkIndex, maxChunkCount, data }
//! ...repeat until chunkIndex == maxChunkCount - 1
//! ```
//!
//! `data` is base64 inside the JSON.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Namespace prefix for every market key in the DHT.
pub const MARKET_PREFIX: &str = "market/";

/// Prefix of the per-file stream protocol id.
pub const PROTOCOL_PREFIX: &str = "orcanet-fileshare/1.0/";

/// Largest frame either side will read. A 16 MiB chunk grows by a third
/// under base64, plus the JSON envelope.
pub const MAX_FRAME_LEN: usize = 24 * 1024 * 1024;

/// Bound on one request/response round trip and on DHT calls.
pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on receiving the rest of a frame once its first byte has arrived.
/// Expiry ends the stream.
pub const FRAME_STALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Consecutive round-trip timeouts after which a job is terminated.
pub const MAX_CONSECUTIVE_TIMEOUTS: u32 = 3;

/// DHT key for a file's holder record.
pub fn market_key(file_hash: &str) -> String {
    format!("{MARKET_PREFIX}{file_hash}")
}

/// Stream protocol id for a file.
pub fn protocol_id(file_hash: &str) -> String {
    format!("{PROTOCOL_PREFIX}{file_hash}")
}

/// Inverse of [`protocol_id`]. `None` for foreign protocol strings.
pub fn file_hash_from_protocol(id: &str) -> Option<&str> {
    id.strip_prefix(PROTOCOL_PREFIX).filter(|h| !h.is_empty())
}

// ── Messages ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRequest {
    pub file_hash: String,
    pub chunk_index: u64,
    pub job_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkResponse {
    pub file_hash: String,
    pub chunk_index: u64,
    pub max_chunk_count: u64,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl ChunkResponse {
    /// True when this response carries the file's final chunk.
    pub fn is_last(&self) -> bool {
        self.chunk_index + 1 >= self.max_chunk_count
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

// ── Framing ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {0} bytes exceeds limit")]
    TooLarge(usize),

    #[error("stream closed")]
    Closed,

    #[error("frame I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Write one length-prefixed frame and flush.
pub async fn write_frame<W>(w: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(payload.len()));
    }
    w.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    w.write_all(payload).await?;
    w.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame. A clean EOF before the prefix is [`FrameError::Closed`].
pub async fn read_frame<R>(r: &mut R) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let first = read_frame_start(r).await?;
    read_frame_rest(r, first).await
}

/// Wait for the first byte of the next frame.
///
/// Cancel safe: dropping the future before it resolves consumes nothing, so
/// a caller may put a deadline on how long the peer takes to start answering.
pub async fn read_frame_start<R>(r: &mut R) -> Result<u8, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut first = [0u8; 1];
    match r.read(&mut first).await? {
        0 => Err(FrameError::Closed),
        _ => Ok(first[0]),
    }
}

/// Finish a frame whose first prefix byte came from [`read_frame_start`].
///
/// Not cancel safe. Once started it must run to completion or the stream
/// is out of sync.
pub async fn read_frame_rest<R>(r: &mut R, first: u8) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [first, 0, 0, 0];
    r.read_exact(&mut len_buf[1..]).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Serialize `msg` as JSON and frame it.
pub async fn write_json<W, T>(w: &mut W, msg: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(msg)?;
    write_frame(w, &payload).await
}

/// Read a frame and parse it as JSON.
pub async fn read_json<R, T>(r: &mut R) -> Result<T, FrameError>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let payload = read_frame(r).await?;
    Ok(serde_json::from_slice(&payload)?)
}

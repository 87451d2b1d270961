//! Wire codec for the agent ↔ gateway stream.
//!
//! Length-prefixed frames carrying JSON messages:
//!
//! ```text
//! [u32 LE length] [payload: length bytes, UTF-8 JSON]
//! ```
//!
//! The payload is a serialized [`ClientFrame`](super::ClientFrame) or
//! [`ServerFrame`](super::ServerFrame) depending on direction. The codec is
//! transport-agnostic: anything that yields ordered bytes works.

use anyhow::{anyhow, bail, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Maximum single-message size on the wire (4 MiB).
pub const MAX_FRAME_SIZE: u32 = 4 * 1024 * 1024;

/// Encode a message into a wire-format byte vector.
///
/// Returns `[u32 LE length][JSON payload]`.
///
/// # Errors
///
/// Returns an error if the serialized payload exceeds [`MAX_FRAME_SIZE`].
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(msg)?;
    if payload.len() > MAX_FRAME_SIZE as usize {
        bail!(
            "frame too large: {} bytes (max {})",
            payload.len(),
            MAX_FRAME_SIZE
        );
    }
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Write one framed message to an async stream and flush it.
///
/// # Errors
///
/// Returns an error on serialization failure or I/O failure.
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let buf = encode(msg)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message from an async stream.
///
/// Returns `Ok(None)` on a clean EOF at a frame boundary.
///
/// # Errors
///
/// Returns an error on a malformed length, an oversized frame, a mid-frame
/// EOF, or a payload that does not deserialize to `T`.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncReadExt + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let length = u32::from_le_bytes(len_buf);
    if length == 0 {
        bail!("invalid frame: zero length");
    }
    if length > MAX_FRAME_SIZE {
        bail!("frame too large: {length} bytes (max {MAX_FRAME_SIZE})");
    }
    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload).await?;
    let msg = serde_json::from_slice(&payload)
        .map_err(|e| anyhow!("invalid frame payload: {e}"))?;
    Ok(Some(msg))
}

/// Incremental frame decoder that handles partial reads.
///
/// Feed bytes via [`FrameDecoder::feed`] and extract complete payloads.
/// Handles TCP-style byte stream reassembly for callers that manage their
/// own reads instead of using [`read_frame`].
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create a new decoder with an empty buffer.
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Feed bytes into the decoder and extract all complete frame payloads.
    ///
    /// Incomplete data is buffered for the next call.
    ///
    /// # Errors
    ///
    /// Returns an error if a frame is zero-length or exceeds the size limit.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.buf.extend_from_slice(bytes);
        let mut payloads = Vec::new();

        loop {
            if self.buf.len() < 4 {
                break;
            }

            let length = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
            if length == 0 {
                bail!("invalid frame: zero length");
            }
            if length > MAX_FRAME_SIZE {
                bail!("frame too large: {length} bytes (max {MAX_FRAME_SIZE})");
            }

            let total = 4 + length as usize;
            if self.buf.len() < total {
                break; // incomplete frame, wait for more data
            }

            payloads.push(self.buf[4..total].to_vec());
            self.buf.drain(..total);
        }

        Ok(payloads)
    }

    /// Returns true if the decoder has buffered partial data.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

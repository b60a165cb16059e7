//! Wire frame model, protobuf codec, and length-prefixed framing for peer links.
//!
//! This crate owns the byte-level representation shared by every peer
//! session. A frame is a named event carrying one string payload; the
//! payload grammar belongs to the protocol layer above and is never
//! inspected here.
//!
//! FRAMING
//! =======
//! Each frame travels as a 4-byte big-endian length followed by the
//! protobuf-encoded `WireFrame`. Readers enforce an upper bound so a
//! corrupt or hostile length prefix cannot force a huge allocation.

use std::io;
use std::time::{SystemTime, UNIX_EPOCH};

use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{trace, warn};

/// Default upper bound for a single encoded frame (1 MiB).
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Error returned by [`decode_frame`].
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The raw bytes could not be decoded as a protobuf `WireFrame`.
    #[error("failed to decode protobuf frame: {0}")]
    Decode(#[from] prost::DecodeError),
    /// The frame decoded but names no event.
    #[error("frame has an empty event name")]
    MissingEvent,
}

/// Error returned by [`read_frame`] and [`write_frame`].
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("frame length {len} exceeds max {max}")]
    TooLarge { len: usize, max: usize },
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// A single message on a peer link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Unique identifier for this frame, chosen by the sender.
    pub id: String,
    /// Milliseconds since the Unix epoch when the frame was created.
    pub ts: i64,
    /// Event name, e.g. `"PATH_UPDATE"`.
    pub event: String,
    /// Event payload. Opaque at this layer.
    pub payload: String,
}

impl Frame {
    /// Build a frame stamped with the current time.
    pub fn new(id: impl Into<String>, event: impl Into<String>, payload: impl Into<String>) -> Self {
        Self { id: id.into(), ts: now_ms(), event: event.into(), payload: payload.into() }
    }
}

/// Current time as milliseconds since Unix epoch.
fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

// =============================================================================
// CODEC
// =============================================================================

/// Encode a frame into protobuf bytes.
#[must_use]
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let wire = WireFrame {
        id: frame.id.clone(),
        ts: frame.ts,
        event: frame.event.clone(),
        payload: frame.payload.clone(),
    };
    // Encoding into a growable Vec cannot run out of buffer.
    wire.encode_to_vec()
}

/// Decode protobuf bytes into a frame.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] for malformed bytes and
/// [`CodecError::MissingEvent`] when the event name is empty.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, CodecError> {
    let wire = WireFrame::decode(bytes)?;
    if wire.event.is_empty() {
        return Err(CodecError::MissingEvent);
    }
    Ok(Frame { id: wire.id, ts: wire.ts, event: wire.event, payload: wire.payload })
}

#[derive(Clone, PartialEq, Message)]
struct WireFrame {
    #[prost(string, tag = "1")]
    id: String,
    #[prost(int64, tag = "2")]
    ts: i64,
    #[prost(string, tag = "3")]
    event: String,
    #[prost(string, tag = "4")]
    payload: String,
}

// =============================================================================
// FRAMING
// =============================================================================

/// Encode and write one length-prefixed frame, then flush.
///
/// # Errors
///
/// Returns [`FramingError::TooLarge`] if the encoded frame does not fit a
/// `u32` length, or [`FramingError::Io`] if the writer fails.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_frame(frame);
    let len = u32::try_from(bytes.len()).map_err(|_| FramingError::TooLarge { len: bytes.len(), max: u32::MAX as usize })?;

    trace!(event = %frame.event, len, "writing frame");
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame, enforcing `max_frame_bytes`.
///
/// Returns `Ok(None)` when the stream ends cleanly before a length prefix.
///
/// # Errors
///
/// Returns [`FramingError::Io`] on a truncated stream,
/// [`FramingError::TooLarge`] when the prefix exceeds the bound, and
/// [`FramingError::Codec`] when the body is not a valid frame.
pub async fn read_frame<R>(reader: &mut R, max_frame_bytes: usize) -> Result<Option<Frame>, FramingError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];

    // A zero-byte first read is a clean close between frames.
    let n = reader.read(&mut len_buf).await?;
    if n == 0 {
        return Ok(None);
    }
    if n < len_buf.len() {
        if let Err(e) = reader.read_exact(&mut len_buf[n..]).await {
            warn!(error = %e, read = n, "unexpected eof reading frame length");
            return Err(e.into());
        }
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_frame_bytes {
        return Err(FramingError::TooLarge { len, max: max_frame_bytes });
    }

    let mut body = vec![0u8; len];
    if let Err(e) = reader.read_exact(&mut body).await {
        warn!(error = %e, expected = len, "unexpected eof reading frame body");
        return Err(e.into());
    }

    let frame = decode_frame(&body)?;
    trace!(event = %frame.event, len, "read frame");
    Ok(Some(frame))
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;

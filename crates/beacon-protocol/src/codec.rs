//! Server-sent-events framing for envelopes.
//!
//! Every envelope is written as a single frame:
//!
//! ```text
//! data: <compact JSON envelope>\n\n
//! ```
//!
//! Compact JSON never contains a raw newline, so one `data:` line per frame
//! is always enough.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::envelope::Envelope;

/// Maximum frame size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Field prefix of a data line.
const DATA_PREFIX: &[u8] = b"data:";

/// Frame terminator.
const FRAME_END: &[u8] = b"\n\n";

/// Largest encoded frame: framing around a maximum-size payload.
const MAX_ENCODED_FRAME: usize = DATA_PREFIX.len() + 1 + MAX_FRAME_SIZE + FRAME_END.len();

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid frame data.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

/// Encode an envelope to one event-stream frame.
///
/// # Errors
///
/// Returns an error if the envelope is too large or serialization fails.
pub fn encode(envelope: &Envelope) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(envelope, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode an envelope into an existing buffer.
///
/// # Errors
///
/// Returns an error if the envelope is too large or serialization fails.
pub fn encode_into(envelope: &Envelope, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = serde_json::to_vec(envelope)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    buf.reserve(DATA_PREFIX.len() + 1 + payload.len() + FRAME_END.len());
    buf.put_slice(DATA_PREFIX);
    buf.put_u8(b' ');
    buf.put_slice(&payload);
    buf.put_slice(FRAME_END);

    Ok(())
}

/// Try to decode an envelope from a buffer, advancing it past the frame.
///
/// Frames without a `data:` line (comments, bare `retry:` hints) are consumed
/// and skipped. Returns `Ok(None)` if more data is needed.
///
/// # Errors
///
/// Returns an error if a frame is too large or its data is not an envelope.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Envelope>, ProtocolError> {
    loop {
        let Some(end) = find_frame_end(buf) else {
            if buf.len() > MAX_ENCODED_FRAME {
                return Err(ProtocolError::FrameTooLarge(buf.len()));
            }
            return Ok(None);
        };

        let frame = buf.split_to(end);
        buf.advance(FRAME_END.len());

        let mut data = Vec::new();
        for line in frame[..].split(|b| *b == b'\n') {
            if let Some(rest) = line.strip_prefix(DATA_PREFIX) {
                if !data.is_empty() {
                    data.push(b'\n');
                }
                data.extend_from_slice(rest.strip_prefix(b" ").unwrap_or(rest));
            }
        }

        if data.is_empty() {
            continue;
        }

        let envelope = serde_json::from_slice(&data)?;
        return Ok(Some(envelope));
    }
}

fn find_frame_end(buf: &[u8]) -> Option<usize> {
    buf.windows(FRAME_END.len()).position(|w| w == FRAME_END)
}

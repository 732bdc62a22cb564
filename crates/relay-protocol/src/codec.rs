//! Codec for encoding outbound frames and decoding client frames.
//!
//! Frames travel as JSON text. An outbound frame is encoded once and the
//! resulting bytes are shared across every recipient of a broadcast.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frames::OutboundFrame;
use crate::inbound::ClientFrame;

/// Default maximum inbound frame size (512 bytes).
pub const MAX_FRAME_SIZE: usize = 512;

/// Separator between frames coalesced into a single write.
pub const BATCH_SEPARATOR: u8 = b'\n';

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Frame is not valid JSON or lacks a type tag.
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// JSON encoding/decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Event type string is not `<level>.<action>`.
    #[error("Invalid event type: {0}")]
    InvalidEventType(String),

    /// A field required by the event type is absent.
    #[error("Event {event_type} is missing {field}")]
    MissingField {
        event_type: String,
        field: &'static str,
    },
}

/// Encode an outbound frame to JSON bytes.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(frame: &OutboundFrame) -> Result<Bytes, ProtocolError> {
    let json = serde_json::to_vec(frame)?;
    Ok(Bytes::from(json))
}

/// Join already-encoded frames into one newline-separated text payload.
///
/// This is the coalesced write format: one network write carrying several
/// frames, in queue order.
#[must_use]
pub fn encode_batch(frames: &[Bytes]) -> Bytes {
    let total = frames.iter().map(Bytes::len).sum::<usize>() + frames.len().saturating_sub(1);
    let mut buf = BytesMut::with_capacity(total);
    for (i, frame) in frames.iter().enumerate() {
        if i > 0 {
            buf.put_u8(BATCH_SEPARATOR);
        }
        buf.extend_from_slice(frame);
    }
    buf.freeze()
}

/// Decode a client frame, enforcing a size limit.
///
/// # Errors
///
/// Returns `FrameTooLarge` if `data` exceeds `max_size`, or `Malformed` if it
/// is not a JSON object with a string `type`.
pub fn decode_client(data: &[u8], max_size: usize) -> Result<ClientFrame, ProtocolError> {
    if data.len() > max_size {
        return Err(ProtocolError::FrameTooLarge {
            size: data.len(),
            max: max_size,
        });
    }
    ClientFrame::from_slice(data).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

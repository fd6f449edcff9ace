//! Serialization for presence frames and events.
//!
//! Frames travel as postcard-encoded WebSocket binary messages. Decoding
//! refuses inputs larger than [`MAX_FRAME_SIZE`] before touching them.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::presence::{PresenceEvent, PresenceFrame};

/// Largest accepted encoded frame (256 KB): enough for a 3000-id subscription.
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Frame exceeds [`MAX_FRAME_SIZE`].
    #[error("frame too large: {size} bytes (max {max})")]
    TooLarge {
        /// Actual size in bytes.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(value).map_err(|e| CodecError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(CodecError::TooLarge {
            size: bytes.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    postcard::from_bytes(bytes).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Encodes a client frame.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the frame cannot be serialized.
pub fn encode_frame(frame: &PresenceFrame) -> Result<Vec<u8>, CodecError> {
    encode(frame)
}

/// Decodes a client frame.
///
/// # Errors
///
/// Returns [`CodecError`] if the bytes are oversized or malformed.
pub fn decode_frame(bytes: &[u8]) -> Result<PresenceFrame, CodecError> {
    decode(bytes)
}

/// Encodes a server event.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the event cannot be serialized.
pub fn encode_event(event: &PresenceEvent) -> Result<Vec<u8>, CodecError> {
    encode(event)
}

/// Decodes a server event.
///
/// # Errors
///
/// Returns [`CodecError`] if the bytes are oversized or malformed.
pub fn decode_event(bytes: &[u8]) -> Result<PresenceEvent, CodecError> {
    decode(bytes)
}

//! Deterministic binary codec for [`SigningMessage`] frames.
//!
//! bincode with its default little-endian, fixed-order layout: the same
//! envelope always encodes to the same bytes, and
//! `decode(encode(msg)) == msg` for every valid envelope. Decoding
//! arbitrary bytes returns a typed error, never panics.

use thiserror::Error;

use crate::message::SigningMessage;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("empty frame")]
    Empty,

    #[error("frame decode failed: {0}")]
    Decode(String),

    #[error("frame encode failed: {0}")]
    Encode(String),
}

/// Encode an envelope to its canonical byte representation.
pub fn encode(msg: &SigningMessage) -> Result<Vec<u8>, CodecError> {
    bincode::serialize(msg).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Decode an envelope from bytes produced by [`encode`].
pub fn decode(bytes: &[u8]) -> Result<SigningMessage, CodecError> {
    if bytes.is_empty() {
        return Err(CodecError::Empty);
    }
    bincode::deserialize(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}

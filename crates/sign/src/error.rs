//! Error kinds of the signing layer.
//!
//! Timeouts and single-child transport failures are recovered locally by
//! exception accounting and never surface through these variants; what
//! does surface is fatal for the affected round (or, for `ChangingView`
//! and `Config`, for the operation that was attempted).

use std::time::Duration;

use thiserror::Error;

use cosi_common::suite::CryptoError;
use cosi_net::NetError;
use cosi_proto::CodecError;

#[derive(Debug, Error)]
pub enum SignError {
    /// A neighbour channel is permanently down; current and future rounds
    /// over it fail.
    #[error("transport closed")]
    TransportClosed,

    /// A phase deadline or the outer signing envelope elapsed.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// A message carried a round number other than the one in flight.
    #[error("round number mismatch: expected {expected}, got {got}")]
    RoundMismatch { expected: u64, got: u64 },

    /// A Merkle proof or the aggregate Schnorr identity did not verify.
    #[error("verification failed: {0}")]
    VerificationFailed(String),

    /// Operation refused while a view change is in progress.
    #[error("in the process of changing view")]
    ChangingView,

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("transport error: {0}")]
    Transport(String),
}

impl From<NetError> for SignError {
    fn from(err: NetError) -> Self {
        match err {
            NetError::Closed => SignError::TransportClosed,
            NetError::Timeout(after) => SignError::Timeout(after),
            other => SignError::Transport(other.to_string()),
        }
    }
}

//! The conn abstraction: a named, full-duplex, ordered frame channel
//! between two tree neighbours.
//!
//! Implementations deliver each frame at most once, in FIFO order, and
//! never interpret payloads. `put` observes the conn's configured
//! deadline; `get` blocks until a frame arrives or the conn closes.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Raw 32-byte public-key encoding exchanged during the handshake.
///
/// The transport treats it as opaque bytes; only the signing layer
/// decodes it into a group element.
pub type PeerKeyBytes = [u8; 32];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetError {
    /// The peer end is shut; current and future operations fail.
    #[error("connection closed")]
    Closed,

    /// No progress within the configured deadline.
    #[error("network timeout after {0:?}")]
    Timeout(Duration),

    #[error("i/o error: {0}")]
    Io(String),

    #[error("handshake failed: {0}")]
    Handshake(String),
}

/// A full-duplex ordered channel to one named peer.
#[async_trait]
pub trait Conn: Send + Sync {
    /// Name of the remote peer.
    fn remote(&self) -> &str;

    /// Send one frame. Fails `Closed` once the peer end is shut,
    /// `Timeout` if the peer does not drain within the deadline.
    async fn put(&self, frame: Vec<u8>) -> Result<(), NetError>;

    /// Receive the next frame, blocking until one arrives or the conn
    /// closes.
    async fn get(&self) -> Result<Vec<u8>, NetError>;

    /// Record the peer's long-term public key (advisory; set by the host
    /// during the handshake).
    fn set_peer_public_key(&self, key: PeerKeyBytes);

    /// The recorded peer key, if the handshake has completed.
    fn peer_public_key(&self) -> Option<PeerKeyBytes>;

    /// Deadline applied to `put`.
    fn set_timeout(&self, timeout: Duration);

    fn timeout(&self) -> Duration;

    /// Shut the local end. Subsequent operations fail `Closed`.
    fn close(&self);
}

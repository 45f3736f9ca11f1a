//! Length-prefixed framed TCP conn for networked deployments.
//!
//! Wire format per frame:
//!
//! ```text
//! ┌──────────────┬───────────────┬──────────────────────┐
//! │ 4 bytes magic│ 4 bytes (BE)  │ payload (<= 64 KiB)  │
//! │              │ payload len   │                      │
//! └──────────────┴───────────────┴──────────────────────┘
//! ```
//!
//! The magic bytes let a receiver reject non-protocol connections before
//! parsing anything. Frame payloads stay opaque here, the same as every
//! other conn.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::channel::DEFAULT_TIMEOUT;
use crate::conn::{Conn, NetError, PeerKeyBytes};

/// Magic bytes identifying a signing-tree connection.
const FRAME_MAGIC: [u8; 4] = [0xC0, 0x51, 0x67, 0x01];

/// Maximum frame payload. A commitment for a wide tree is well under 4 KiB.
const MAX_FRAME_PAYLOAD: usize = 64 * 1024;

/// A framed TCP conn to one named peer.
pub struct TcpConn {
    remote: String,
    reader: tokio::sync::Mutex<OwnedReadHalf>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    peer_key: RwLock<Option<PeerKeyBytes>>,
    timeout: RwLock<Duration>,
    closed: AtomicBool,
}

impl TcpConn {
    /// Wrap an established stream (accept side).
    #[must_use]
    pub fn from_stream(stream: TcpStream, remote: impl Into<String>) -> Self {
        let (reader, writer) = stream.into_split();
        TcpConn {
            remote: remote.into(),
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
            peer_key: RwLock::new(None),
            timeout: RwLock::new(DEFAULT_TIMEOUT),
            closed: AtomicBool::new(false),
        }
    }

    /// Connect to a peer (initiator side).
    pub async fn connect(addr: &str, remote: impl Into<String>) -> Result<Self, NetError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| NetError::Io(format!("tcp connect {addr}: {e}")))?;
        Ok(Self::from_stream(stream, remote))
    }

    fn map_io(err: std::io::Error) -> NetError {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => NetError::Closed,
            _ => NetError::Io(err.to_string()),
        }
    }
}

#[async_trait]
impl Conn for TcpConn {
    fn remote(&self) -> &str {
        &self.remote
    }

    async fn put(&self, frame: Vec<u8>) -> Result<(), NetError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetError::Closed);
        }
        if frame.len() > MAX_FRAME_PAYLOAD {
            return Err(NetError::Io(format!(
                "frame too large: {} bytes (max {MAX_FRAME_PAYLOAD})",
                frame.len()
            )));
        }
        let deadline = self.timeout();
        let write = async {
            let mut writer = self.writer.lock().await;
            writer.write_all(&FRAME_MAGIC).await.map_err(Self::map_io)?;
            let len = (frame.len() as u32).to_be_bytes();
            writer.write_all(&len).await.map_err(Self::map_io)?;
            writer.write_all(&frame).await.map_err(Self::map_io)?;
            writer.flush().await.map_err(Self::map_io)
        };
        match tokio::time::timeout(deadline, write).await {
            Ok(result) => result,
            Err(_) => Err(NetError::Timeout(deadline)),
        }
    }

    async fn get(&self) -> Result<Vec<u8>, NetError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetError::Closed);
        }
        let mut reader = self.reader.lock().await;

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic).await.map_err(Self::map_io)?;
        if magic != FRAME_MAGIC {
            return Err(NetError::Handshake(format!(
                "invalid magic bytes: expected {FRAME_MAGIC:02x?}, got {magic:02x?}"
            )));
        }

        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await.map_err(Self::map_io)?;
        let payload_len = u32::from_be_bytes(len_buf) as usize;
        if payload_len > MAX_FRAME_PAYLOAD {
            return Err(NetError::Io(format!(
                "frame too large: {payload_len} bytes (max {MAX_FRAME_PAYLOAD})"
            )));
        }

        let mut payload = vec![0u8; payload_len];
        reader.read_exact(&mut payload).await.map_err(Self::map_io)?;
        Ok(payload)
    }

    fn set_peer_public_key(&self, key: PeerKeyBytes) {
        *self.peer_key.write() = Some(key);
    }

    fn peer_public_key(&self) -> Option<PeerKeyBytes> {
        *self.peer_key.read()
    }

    fn set_timeout(&self, timeout: Duration) {
        *self.timeout.write() = timeout;
    }

    fn timeout(&self) -> Duration {
        *self.timeout.read()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let conn = TcpConn::from_stream(stream, "initiator");
            let frame = conn.get().await.unwrap();
            conn.put(frame).await.unwrap();
        });

        let conn = TcpConn::connect(&addr.to_string(), "acceptor").await.unwrap();
        conn.put(b"echo me".to_vec()).await.unwrap();
        assert_eq!(conn.get().await.unwrap(), b"echo me");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_magic_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(&[0xFF, 0xFF, 0xFF, 0xFF]).await.unwrap();
            stream.write_all(&4u32.to_be_bytes()).await.unwrap();
            stream.write_all(b"junk").await.unwrap();
        });

        let conn = TcpConn::connect(&addr.to_string(), "garbage-peer").await.unwrap();
        assert!(matches!(conn.get().await, Err(NetError::Handshake(_))));
    }

    #[tokio::test]
    async fn test_peer_disconnect_is_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let conn = TcpConn::connect(&addr.to_string(), "gone").await.unwrap();
        assert_eq!(conn.get().await, Err(NetError::Closed));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let conn = TcpConn::connect(&addr.to_string(), "peer").await.unwrap();
        let huge = vec![0u8; MAX_FRAME_PAYLOAD + 1];
        assert!(matches!(conn.put(huge).await, Err(NetError::Io(_))));
    }
}

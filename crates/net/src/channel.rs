//! In-process transport: paired tokio mpsc endpoints handed out by a
//! shared [`Directory`].
//!
//! All hosts of a single-process deployment (tests, benchmarks, the
//! launcher's default mode) share one directory. The edge between `a`
//! and `b` is two bounded queues, one per direction; each side claims
//! its receiving half exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use crate::conn::{Conn, NetError, PeerKeyBytes};

/// Default per-operation deadline, matching the protocol's base timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

/// Frames buffered per direction before `put` starts waiting.
const CHANNEL_CAPACITY: usize = 64;

struct Halves {
    tx: mpsc::Sender<Vec<u8>>,
    rx: Option<mpsc::Receiver<Vec<u8>>>,
}

/// Registry of in-process edges, keyed by `(from, to)` host names.
#[derive(Default)]
pub struct Directory {
    edges: Mutex<HashMap<(String, String), Halves>>,
}

impl Directory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, from: &str, to: &str) -> mpsc::Sender<Vec<u8>> {
        let mut edges = self.edges.lock();
        let halves = edges
            .entry((from.to_string(), to.to_string()))
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
                Halves { tx, rx: Some(rx) }
            });
        halves.tx.clone()
    }

    fn receiver_for(&self, from: &str, to: &str) -> Option<mpsc::Receiver<Vec<u8>>> {
        let mut edges = self.edges.lock();
        let halves = edges
            .entry((from.to_string(), to.to_string()))
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
                Halves { tx, rx: Some(rx) }
            });
        halves.rx.take()
    }

    /// Open `local`'s end of the edge to `remote`.
    ///
    /// Fails if `local` already claimed this end (the receiving half is
    /// handed out exactly once).
    pub fn conn(&self, local: &str, remote: &str) -> Result<ChannelConn, NetError> {
        let tx = self.sender_for(local, remote);
        let rx = self
            .receiver_for(remote, local)
            .ok_or_else(|| NetError::Io(format!("edge {remote} -> {local} already claimed")))?;
        Ok(ChannelConn {
            remote: remote.to_string(),
            tx: RwLock::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            peer_key: RwLock::new(None),
            timeout: RwLock::new(DEFAULT_TIMEOUT),
            closed: AtomicBool::new(false),
        })
    }
}

/// One side of an in-process edge.
pub struct ChannelConn {
    remote: String,
    tx: RwLock<Option<mpsc::Sender<Vec<u8>>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    peer_key: RwLock<Option<PeerKeyBytes>>,
    timeout: RwLock<Duration>,
    closed: AtomicBool,
}

#[async_trait]
impl Conn for ChannelConn {
    fn remote(&self) -> &str {
        &self.remote
    }

    async fn put(&self, frame: Vec<u8>) -> Result<(), NetError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetError::Closed);
        }
        let tx = self.tx.read().clone().ok_or(NetError::Closed)?;
        let deadline = self.timeout();
        match tokio::time::timeout(deadline, tx.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(NetError::Closed),
            Err(_) => Err(NetError::Timeout(deadline)),
        }
    }

    async fn get(&self) -> Result<Vec<u8>, NetError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetError::Closed);
        }
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(NetError::Closed)
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
        // Drop the outbound sender so the peer's blocking get observes
        // the close, and stop accepting inbound frames so the peer's put
        // fails Closed rather than filling the buffer.
        self.tx.write().take();
        if let Ok(mut rx) = self.rx.try_lock() {
            rx.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let dir = Directory::new();
        let a = dir.conn("a", "b").unwrap();
        let b = dir.conn("b", "a").unwrap();

        a.put(b"ping".to_vec()).await.unwrap();
        assert_eq!(b.get().await.unwrap(), b"ping");

        b.put(b"pong".to_vec()).await.unwrap();
        assert_eq!(a.get().await.unwrap(), b"pong");
    }

    #[tokio::test]
    async fn test_fifo_per_conn() {
        let dir = Directory::new();
        let a = dir.conn("a", "b").unwrap();
        let b = dir.conn("b", "a").unwrap();

        for i in 0u8..10 {
            a.put(vec![i]).await.unwrap();
        }
        for i in 0u8..10 {
            assert_eq!(b.get().await.unwrap(), vec![i]);
        }
    }

    #[tokio::test]
    async fn test_get_fails_closed_when_peer_drops() {
        let dir = Directory::new();
        let a = dir.conn("a", "b").unwrap();
        let b = dir.conn("b", "a").unwrap();

        drop(a);
        assert_eq!(b.get().await, Err(NetError::Closed));
    }

    #[tokio::test]
    async fn test_put_fails_closed_after_peer_close() {
        let dir = Directory::new();
        let a = dir.conn("a", "b").unwrap();
        let b = dir.conn("b", "a").unwrap();

        b.close();
        assert_eq!(a.put(b"late".to_vec()).await, Err(NetError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_times_out_when_peer_stalls() {
        let dir = Directory::new();
        let a = dir.conn("a", "b").unwrap();
        let _b = dir.conn("b", "a").unwrap();
        a.set_timeout(Duration::from_millis(50));

        // Fill the buffer; the peer never drains.
        for _ in 0..CHANNEL_CAPACITY {
            a.put(vec![0]).await.unwrap();
        }
        assert_eq!(
            a.put(vec![1]).await,
            Err(NetError::Timeout(Duration::from_millis(50)))
        );
    }

    #[tokio::test]
    async fn test_edge_claimed_once() {
        let dir = Directory::new();
        let _a = dir.conn("a", "b").unwrap();
        assert!(dir.conn("a", "b").is_err());
    }

    #[test]
    fn test_peer_key_is_advisory() {
        let dir = Directory::new();
        let a = dir.conn("a", "b").unwrap();
        assert_eq!(a.peer_public_key(), None);
        a.set_peer_public_key([7u8; 32]);
        assert_eq!(a.peer_public_key(), Some([7u8; 32]));
    }
}

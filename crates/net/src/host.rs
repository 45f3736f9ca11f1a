//! The tree host: one node's view of the spanning tree.
//!
//! A host knows its own name, its parent (none iff root), its ordered
//! children, and a conn per known peer. `listen` performs the key
//! handshake — each side sends its long-term public key as the first
//! frame — and spawns one receive task per child; a conn counts as
//! *ready* only once the peer key is recorded. Child frames are
//! multiplexed into a single stream tagged with the sender name, so the
//! signing layer can tell which children have contributed.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::channel::{Directory, DEFAULT_TIMEOUT};
use crate::conn::{Conn, NetError, PeerKeyBytes};

/// Buffered frames across all children before readers back-pressure.
const DOWN_STREAM_CAPACITY: usize = 256;

/// How often a receive waits re-check readiness during the handshake.
const READY_POLL: Duration = Duration::from_millis(50);

/// One node's endpoint in the tree.
pub struct TreeHost {
    name: String,
    directory: Arc<Directory>,
    parent_name: RwLock<Option<String>>,
    children: RwLock<Vec<String>>,
    conns: RwLock<HashMap<String, Arc<dyn Conn>>>,
    ready: RwLock<HashSet<String>>,
    public_key: RwLock<Option<PeerKeyBytes>>,
    timeout: RwLock<Duration>,
    down_tx: RwLock<Option<mpsc::Sender<(Vec<u8>, String)>>>,
    down_rx: tokio::sync::Mutex<mpsc::Receiver<(Vec<u8>, String)>>,
    closed: AtomicBool,
}

impl TreeHost {
    #[must_use]
    pub fn new(name: impl Into<String>, directory: Arc<Directory>) -> Arc<Self> {
        let (down_tx, down_rx) = mpsc::channel(DOWN_STREAM_CAPACITY);
        Arc::new(TreeHost {
            name: name.into(),
            directory,
            parent_name: RwLock::new(None),
            children: RwLock::new(Vec::new()),
            conns: RwLock::new(HashMap::new()),
            ready: RwLock::new(HashSet::new()),
            public_key: RwLock::new(None),
            timeout: RwLock::new(DEFAULT_TIMEOUT),
            down_tx: RwLock::new(Some(down_tx)),
            down_rx: tokio::sync::Mutex::new(down_rx),
            closed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True iff this host has no parent.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent_name.read().is_none()
    }

    pub fn set_public_key(&self, key: PeerKeyBytes) {
        *self.public_key.write() = Some(key);
    }

    #[must_use]
    pub fn public_key(&self) -> Option<PeerKeyBytes> {
        *self.public_key.read()
    }

    /// The handshake-recorded key of a peer, once its conn is ready.
    #[must_use]
    pub fn peer_public_key(&self, name: &str) -> Option<PeerKeyBytes> {
        self.conns.read().get(name).and_then(|c| c.peer_public_key())
    }

    #[must_use]
    pub fn children(&self) -> Vec<String> {
        self.children.read().clone()
    }

    #[must_use]
    pub fn n_children(&self) -> usize {
        self.children.read().len()
    }

    #[must_use]
    pub fn parent(&self) -> Option<String> {
        self.parent_name.read().clone()
    }

    #[must_use]
    pub fn is_ready(&self, name: &str) -> bool {
        self.ready.read().contains(name)
    }

    /// Per-operation deadline, pushed down to every conn.
    pub fn set_timeout(&self, timeout: Duration) {
        *self.timeout.write() = timeout;
        for conn in self.conns.read().values() {
            conn.set_timeout(timeout);
        }
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        *self.timeout.read()
    }

    fn ensure_conn(&self, peer: &str) -> Result<Arc<dyn Conn>, NetError> {
        if let Some(conn) = self.conns.read().get(peer) {
            return Ok(Arc::clone(conn));
        }
        let conn: Arc<dyn Conn> = Arc::new(self.directory.conn(&self.name, peer)?);
        conn.set_timeout(self.timeout());
        self.conns.write().insert(peer.to_string(), Arc::clone(&conn));
        Ok(conn)
    }

    /// Install a pre-established conn (networked deployments: TCP conns
    /// are dialed by the launcher, then handed to the host by peer name).
    pub fn insert_conn(&self, peer: &str, conn: Arc<dyn Conn>) {
        conn.set_timeout(self.timeout());
        self.conns.write().insert(peer.to_string(), conn);
    }

    pub fn add_parent(&self, name: &str) -> Result<(), NetError> {
        self.ensure_conn(name)?;
        *self.parent_name.write() = Some(name.to_string());
        Ok(())
    }

    /// Register children in tree order. Duplicates are ignored.
    pub fn add_children(&self, names: &[&str]) -> Result<(), NetError> {
        for name in names {
            self.ensure_conn(name)?;
            let mut children = self.children.write();
            if !children.iter().any(|c| c == name) {
                children.push((*name).to_string());
            }
        }
        Ok(())
    }

    /// Register non-neighbour peers (conn only, no tree edge).
    pub fn add_peers(&self, names: &[&str]) -> Result<(), NetError> {
        for name in names {
            self.ensure_conn(name)?;
        }
        Ok(())
    }

    /// Start the handshake and the per-child receive tasks.
    ///
    /// The own public key must be set first; it is the first frame sent on
    /// every conn. Returns once local sends are queued — readiness of each
    /// conn is reached asynchronously when the peer key arrives.
    pub async fn listen(self: &Arc<Self>) -> Result<(), NetError> {
        let own_key = self
            .public_key()
            .ok_or_else(|| NetError::Handshake("own public key not set before listen".into()))?;

        if let Some(parent) = self.parent() {
            let conn = self.ensure_conn(&parent)?;
            conn.put(own_key.to_vec()).await?;
            let host = Arc::clone(self);
            tokio::spawn(async move {
                host.handshake(&parent, conn.as_ref()).await;
            });
        }

        for child in self.children() {
            let conn = self.ensure_conn(&child)?;
            conn.put(own_key.to_vec()).await?;
            let host = Arc::clone(self);
            tokio::spawn(async move {
                if !host.handshake(&child, conn.as_ref()).await {
                    return;
                }
                host.child_loop(&child, conn.as_ref()).await;
            });
        }

        Ok(())
    }

    /// Read the peer's key frame and mark the conn ready.
    async fn handshake(&self, peer: &str, conn: &dyn Conn) -> bool {
        match conn.get().await {
            Ok(frame) => {
                let Ok(key) = <PeerKeyBytes>::try_from(frame.as_slice()) else {
                    warn!(host = %self.name, %peer, len = frame.len(),
                          "handshake frame has wrong length, dropping conn");
                    conn.close();
                    return false;
                };
                conn.set_peer_public_key(key);
                self.ready.write().insert(peer.to_string());
                debug!(host = %self.name, %peer, "conn ready");
                true
            }
            Err(err) => {
                debug!(host = %self.name, %peer, %err, "handshake aborted");
                false
            }
        }
    }

    /// Forward every frame from one child into the multiplexed stream.
    async fn child_loop(&self, child: &str, conn: &dyn Conn) {
        loop {
            let frame = match conn.get().await {
                Ok(frame) => frame,
                Err(err) => {
                    debug!(host = %self.name, %child, %err, "child conn ended");
                    return;
                }
            };
            let tx = self.down_tx.read().clone();
            let Some(tx) = tx else { return };
            if tx.send((frame, child.to_string())).await.is_err() {
                return;
            }
        }
    }

    async fn wait_ready(&self, peer: &str) {
        while !self.is_ready(peer) {
            tokio::time::sleep(READY_POLL).await;
        }
    }

    /// Send one frame to the parent.
    ///
    /// # Panics
    ///
    /// Calling this on the root is a programming error.
    pub async fn put_up(&self, frame: Vec<u8>) -> Result<(), NetError> {
        let parent = self.parent().expect("put_up called on the root node");
        let conn = self.ensure_conn(&parent)?;
        conn.put(frame).await
    }

    /// Receive the next frame from the parent, once the conn is ready.
    ///
    /// # Panics
    ///
    /// Calling this on the root is a programming error.
    pub async fn get_up(&self) -> Result<Vec<u8>, NetError> {
        let parent = self.parent().expect("get_up called on the root node");
        self.wait_ready(&parent).await;
        let conn = self.ensure_conn(&parent)?;
        conn.get().await
    }

    /// Send one frame per child, in child order.
    ///
    /// # Panics
    ///
    /// `frames.len()` must equal the number of children; a mismatch is a
    /// programming error and fails fast.
    pub async fn put_down(&self, frames: Vec<Vec<u8>>) -> Result<(), NetError> {
        let children = self.children();
        assert_eq!(
            frames.len(),
            children.len(),
            "number of messages passed down != number of children"
        );
        // Attempt every child even after a failure; report the last error.
        let mut result = Ok(());
        for (child, frame) in children.iter().zip(frames) {
            let conn = self.ensure_conn(child)?;
            if let Err(err) = conn.put(frame).await {
                warn!(host = %self.name, %child, %err, "put_down failed");
                result = Err(err);
            }
        }
        result
    }

    /// Send a personalised frame to a single child.
    pub async fn put_down_to(&self, child: &str, frame: Vec<u8>) -> Result<(), NetError> {
        if !self.children.read().iter().any(|c| c == child) {
            return Err(NetError::Io(format!("'{child}' is not a child of '{}'", self.name)));
        }
        let conn = self.ensure_conn(child)?;
        conn.put(frame).await
    }

    /// Next frame from any child, tagged with the sender name.
    pub async fn get_down(&self) -> Result<(Vec<u8>, String), NetError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetError::Closed);
        }
        let mut rx = self.down_rx.lock().await;
        rx.recv().await.ok_or(NetError::Closed)
    }

    /// Shut every conn; pending and future operations fail `Closed`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.down_tx.write().take();
        for conn in self.conns.read().values() {
            conn.close();
        }
    }
}

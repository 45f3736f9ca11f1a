//! The signing node: the four-phase protocol state machine.
//!
//! ## Message flow
//!
//! ```text
//!          Announce ↓                    ↑ Commit
//!   root ───────────────▶ internal ───────────────▶ root
//!          Challenge ↓                  ↑ Response
//!   root ───────────────▶ internal ───────────────▶ root
//! ```
//!
//! Each node runs two receive loops: an up-loop for parent traffic
//! (Announcement, Challenge, view commits) and a down-loop that
//! multiplexes the children (Commitment, Response, view proposals).
//! Messages are routed by round number into that round's channels; a
//! phase task per round aggregates child contributions under a deadline
//! and moves absentees into the round's exception bags.
//!
//! No lock is held across an await: phase tasks collect messages first,
//! then take the round map write lock once to aggregate.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use curve25519_dalek::ristretto::RistrettoPoint;
use parking_lot::{Mutex, RwLock};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use cosi_common::suite::{
    decode_point, decode_scalar, encode_point, encode_scalar, random_scalar, Keypair,
};
use cosi_common::{check_proof, HashId, Proof};
use cosi_net::{NetError, TreeHost};
use cosi_proto::{
    decode, encode, AnnouncementPayload, ChallengePayload, CommitmentPayload, ErrorPayload,
    MessageBody, ResponsePayload, SigningMessage, ViewAcceptedPayload, ViewChangePayload,
};

use crate::accountability::AccountabilityLog;
use crate::error::SignError;
use crate::failure::FailureSim;
use crate::round::{ExceptionBag, Round, RoundState, LOCAL_PROOF};
use crate::signature::{compute_challenge, CollectiveSignature};
use crate::view::{quorum, root_for, ViewState};

/// Outer envelope for a whole signing round at the root.
pub const MAX_WILLING_TO_WAIT: Duration = Duration::from_secs(50);

/// Base per-phase deadline; scaled by tree height via `timeout(h) =
/// (h + 1) * default`.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

/// Rounds kept in memory behind the newest one.
const ROUND_WINDOW: u64 = 2;

/// Verification behaviour carried on the node's configuration.
///
/// Debug deployments panic on a failed proof or signature check so tests
/// fail loudly; production logs and continues.
#[derive(Debug, Clone, Copy, Default)]
pub struct VerifyPolicy {
    pub debug: bool,
}

/// Returns this node's local Merkle root over pending client requests.
pub type CommitFn = Box<dyn Fn() -> HashId + Send + Sync>;

/// Invoked at challenge time with the round's inclusion proof.
pub type DoneFn = Box<dyn Fn(DoneEvent) + Send + Sync>;

/// What the done-callback observes: the signed global root, this node's
/// local root, and the proof chaining the latter to the former.
#[derive(Debug, Clone)]
pub struct DoneEvent {
    pub round: u64,
    pub global_root: HashId,
    pub local_root: HashId,
    pub proof: Proof,
}

struct RoundChannels {
    commit_tx: mpsc::Sender<(CommitmentPayload, String)>,
    commit_rx: Option<mpsc::Receiver<(CommitmentPayload, String)>>,
    response_tx: mpsc::Sender<(ResponsePayload, String)>,
    response_rx: Option<mpsc::Receiver<(ResponsePayload, String)>>,
}

impl RoundChannels {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (commit_tx, commit_rx) = mpsc::channel(capacity);
        let (response_tx, response_rx) = mpsc::channel(capacity);
        RoundChannels {
            commit_tx,
            commit_rx: Some(commit_rx),
            response_tx,
            response_rx: Some(response_rx),
        }
    }
}

/// One participant of the signing tree.
pub struct Node {
    host: Arc<TreeHost>,
    keypair: Keypair,
    policy: VerifyPolicy,

    height: AtomicU32,
    default_timeout: RwLock<Duration>,
    timeout: RwLock<Duration>,

    host_list: RwLock<Vec<String>>,
    tree: RwLock<HashMap<String, Vec<String>>>,
    peer_keys: RwLock<HashMap<String, RistrettoPoint>>,

    rounds: RwLock<HashMap<u64, Round>>,
    channels: Mutex<HashMap<u64, RoundChannels>>,
    last_seen_round: AtomicU64,
    signatures: Mutex<HashMap<u64, CollectiveSignature>>,
    acc_log: Mutex<AccountabilityLog>,

    nonce_rng: Mutex<ChaCha8Rng>,
    commit_fn: RwLock<Option<CommitFn>>,
    done_fn: RwLock<Option<DoneFn>>,

    commits_done_tx: mpsc::Sender<u64>,
    commits_done_rx: tokio::sync::Mutex<mpsc::Receiver<u64>>,
    done_tx: mpsc::Sender<u64>,
    done_rx: tokio::sync::Mutex<mpsc::Receiver<u64>>,
    closed_tx: mpsc::Sender<SignError>,
    closed_rx: tokio::sync::Mutex<mpsc::Receiver<SignError>>,

    view: ViewState,
    failure: Mutex<Option<FailureSim>>,
    fail_as_root_every: AtomicU64,
    fail_as_follower_every: AtomicU64,
}

impl Node {
    /// Build a node over a host, with a fresh or injected keypair.
    ///
    /// The public key is installed on the host so the handshake announces
    /// it to every neighbour.
    pub fn new(host: Arc<TreeHost>, keypair: Keypair, policy: VerifyPolicy) -> Arc<Self> {
        host.set_public_key(encode_point(&keypair.public));
        let mut peer_keys = HashMap::new();
        peer_keys.insert(host.name().to_string(), keypair.public);

        let (commits_done_tx, commits_done_rx) = mpsc::channel(16);
        let (done_tx, done_rx) = mpsc::channel(16);
        let (closed_tx, closed_rx) = mpsc::channel(16);

        Arc::new(Node {
            host,
            keypair,
            policy,
            height: AtomicU32::new(0),
            default_timeout: RwLock::new(DEFAULT_TIMEOUT),
            timeout: RwLock::new(DEFAULT_TIMEOUT),
            host_list: RwLock::new(Vec::new()),
            tree: RwLock::new(HashMap::new()),
            peer_keys: RwLock::new(peer_keys),
            rounds: RwLock::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            last_seen_round: AtomicU64::new(0),
            signatures: Mutex::new(HashMap::new()),
            acc_log: Mutex::new(AccountabilityLog::new()),
            nonce_rng: Mutex::new(ChaCha8Rng::from_entropy()),
            commit_fn: RwLock::new(None),
            done_fn: RwLock::new(None),
            commits_done_tx,
            commits_done_rx: tokio::sync::Mutex::new(commits_done_rx),
            done_tx,
            done_rx: tokio::sync::Mutex::new(done_rx),
            closed_tx,
            closed_rx: tokio::sync::Mutex::new(closed_rx),
            view: ViewState::new(),
            failure: Mutex::new(None),
            fail_as_root_every: AtomicU64::new(0),
            fail_as_follower_every: AtomicU64::new(0),
        })
    }

    // ── Configuration ───────────────────────────────────────────────────

    #[must_use]
    pub fn name(&self) -> &str {
        self.host.name()
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.host.is_root()
    }

    #[must_use]
    pub fn public_key(&self) -> RistrettoPoint {
        self.keypair.public
    }

    /// Tree height above this node; drives the phase deadline.
    pub fn set_height(&self, height: u32) {
        self.height.store(height, Ordering::Release);
        self.update_timeout();
    }

    pub fn set_default_timeout(&self, timeout: Duration) {
        *self.default_timeout.write() = timeout;
        self.update_timeout();
    }

    fn update_timeout(&self) {
        let height = self.height.load(Ordering::Acquire);
        let timeout = *self.default_timeout.read() * (height + 1);
        *self.timeout.write() = timeout;
        self.host.set_timeout(timeout);
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        *self.timeout.read()
    }

    /// Hosts in leader-rotation order.
    pub fn set_host_list(&self, hosts: Vec<String>) {
        *self.host_list.write() = hosts;
    }

    /// The full tree (parent name → children), from the shared config.
    /// Needed to name the members of a failed subtree.
    pub fn set_tree(&self, tree: HashMap<String, Vec<String>>) {
        *self.tree.write() = tree;
    }

    /// Record a peer's long-term public key.
    pub fn add_peer(&self, name: &str, key: RistrettoPoint) {
        self.peer_keys.write().insert(name.to_string(), key);
    }

    pub fn register_commit_fn(&self, f: CommitFn) {
        *self.commit_fn.write() = Some(f);
    }

    pub fn register_done_fn(&self, f: DoneFn) {
        *self.done_fn.write() = Some(f);
    }

    /// Install the failure-injection hook (tests only).
    pub fn set_failure_sim(&self, sim: FailureSim) {
        *self.failure.lock() = Some(sim);
    }

    /// Simulate the root crashing every `n`th round (0 disables).
    pub fn set_fail_as_root_every(&self, n: u64) {
        self.fail_as_root_every.store(n, Ordering::Release);
    }

    /// Simulate a follower ignoring every `n`th round (0 disables).
    pub fn set_fail_as_follower_every(&self, n: u64) {
        self.fail_as_follower_every.store(n, Ordering::Release);
    }

    /// Make nonce generation reproducible (tests only).
    pub fn seed_nonces(&self, seed: u64) {
        *self.nonce_rng.lock() = ChaCha8Rng::seed_from_u64(seed);
    }

    #[must_use]
    pub fn last_round(&self) -> u64 {
        self.last_seen_round.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn current_view(&self) -> u64 {
        self.view.current()
    }

    /// The completed signature for a round, if this node was its root.
    #[must_use]
    pub fn signature(&self, round: u64) -> Option<CollectiveSignature> {
        self.signatures.lock().get(&round).cloned()
    }

    /// Run `f` over the root's accountability chain.
    pub fn with_acc_log<T>(&self, f: impl FnOnce(&AccountabilityLog) -> T) -> T {
        f(&self.acc_log.lock())
    }

    /// The participant keys for the whole deployment, in host-list order.
    fn participant_keys(&self) -> Vec<RistrettoPoint> {
        let keys = self.peer_keys.read();
        self.host_list
            .read()
            .iter()
            .filter_map(|name| keys.get(name).copied())
            .collect()
    }

    /// Long-term keys of every member of `child`'s subtree, sorted by
    /// name. Falls back to the child alone when no tree was configured.
    fn subtree_keys(&self, child: &str) -> Vec<RistrettoPoint> {
        let tree = self.tree.read();
        let mut names = Vec::new();
        let mut stack = vec![child.to_string()];
        while let Some(current) = stack.pop() {
            if let Some(children) = tree.get(&current) {
                stack.extend(children.iter().cloned());
            }
            names.push(current);
        }
        drop(tree);
        names.sort();

        let keys = self.peer_keys.read();
        names
            .iter()
            .filter_map(|name| {
                let key = keys.get(name).copied();
                if key.is_none() {
                    warn!(node = %self.name(), peer = %name, "no key for subtree member");
                }
                key
            })
            .collect()
    }

    fn should_fail(&self, phase: &str) -> bool {
        self.failure
            .lock()
            .as_mut()
            .map_or(false, |sim| sim.should_drop(phase))
    }

    async fn fail_closed(&self, err: SignError) {
        let _ = self.closed_tx.send(err).await;
    }

    // ── Listening ───────────────────────────────────────────────────────

    /// Start the host handshake and this node's receive loops.
    pub async fn listen(self: &Arc<Self>) -> Result<(), SignError> {
        self.host.listen().await?;

        if !self.is_root() {
            let node = Arc::clone(self);
            tokio::spawn(async move { node.up_loop().await });
        }
        if self.host.n_children() > 0 {
            let node = Arc::clone(self);
            tokio::spawn(async move { node.down_loop().await });
        }
        Ok(())
    }

    async fn up_loop(self: Arc<Self>) {
        loop {
            let frame = match self.host.get_up().await {
                Ok(frame) => frame,
                Err(err) => {
                    debug!(node = %self.name(), %err, "parent conn ended");
                    self.fail_closed(err.into()).await;
                    return;
                }
            };
            let msg = match decode(&frame) {
                Ok(msg) => msg,
                Err(err) => {
                    warn!(node = %self.name(), %err, "undecodable frame from parent");
                    continue;
                }
            };
            self.dispatch_up(msg).await;
        }
    }

    async fn dispatch_up(self: &Arc<Self>, msg: SigningMessage) {
        match msg.body {
            MessageBody::Announcement(payload) => {
                let last = self.last_round();
                if msg.round <= last {
                    warn!(node = %self.name(), round = msg.round, last,
                          "dropping out-of-window announcement");
                    return;
                }
                let every = self.fail_as_follower_every.load(Ordering::Acquire);
                if every > 0 && msg.round % every == 0 {
                    warn!(node = %self.name(), round = msg.round,
                          "simulating follower failure, ignoring round");
                    return;
                }
                let node = Arc::clone(self);
                let (view, round) = (msg.view, msg.round);
                tokio::spawn(async move {
                    if let Err(err) = node.announce(view, round, payload.log).await {
                        warn!(node = %node.name(), round, %err, "round failed");
                    }
                });
            }
            MessageBody::Challenge(payload) => {
                let node = Arc::clone(self);
                let (view, round) = (msg.view, msg.round);
                tokio::spawn(async move {
                    if let Err(err) = node.process_challenge(view, round, payload).await {
                        warn!(node = %node.name(), round, %err, "challenge failed");
                        if matches!(err, SignError::RoundMismatch { .. }) {
                            node.surface_error(view, round, err.to_string()).await;
                        }
                    }
                });
            }
            MessageBody::ViewChange(payload) => self.handle_view_change(payload).await,
            MessageBody::ViewAccepted(payload) => self.handle_view_accepted(payload).await,
            MessageBody::Error(payload) => {
                warn!(node = %self.name(), round = msg.round, msg = %payload.message,
                      "error from parent");
            }
            other => {
                warn!(node = %self.name(), phase = other_phase(&other), "unexpected message from parent");
            }
        }
    }

    async fn down_loop(self: Arc<Self>) {
        loop {
            let (frame, from) = match self.host.get_down().await {
                Ok(pair) => pair,
                Err(err) => {
                    debug!(node = %self.name(), %err, "child stream ended");
                    self.fail_closed(err.into()).await;
                    return;
                }
            };
            let msg = match decode(&frame) {
                Ok(msg) => msg,
                Err(err) => {
                    warn!(node = %self.name(), %from, %err, "undecodable frame from child");
                    continue;
                }
            };
            self.dispatch_down(msg, from).await;
        }
    }

    async fn dispatch_down(self: &Arc<Self>, msg: SigningMessage, from: String) {
        match msg.body {
            MessageBody::Commitment(payload) => {
                let tx = self.channels.lock().get(&msg.round).map(|ch| ch.commit_tx.clone());
                match tx {
                    Some(tx) => {
                        let _ = tx.send((payload, from)).await;
                    }
                    None => warn!(node = %self.name(), round = msg.round, %from,
                                  "dropping out-of-window commitment"),
                }
            }
            MessageBody::Response(payload) => {
                let tx = self.channels.lock().get(&msg.round).map(|ch| ch.response_tx.clone());
                match tx {
                    Some(tx) => {
                        let _ = tx.send((payload, from)).await;
                    }
                    None => warn!(node = %self.name(), round = msg.round, %from,
                                  "dropping out-of-window response"),
                }
            }
            MessageBody::ViewChange(payload) => self.handle_view_change(payload).await,
            MessageBody::ViewAccepted(payload) => self.handle_view_accepted(payload).await,
            MessageBody::Error(payload) => {
                if self.is_root() {
                    error!(node = %self.name(), round = msg.round, %from, msg = %payload.message,
                           "round-level error surfaced");
                } else {
                    let forward = SigningMessage::new(
                        msg.view,
                        msg.round,
                        MessageBody::Error(payload),
                    );
                    if let Ok(frame) = encode(&forward) {
                        let _ = self.host.put_up(frame).await;
                    }
                }
            }
            other => {
                warn!(node = %self.name(), %from, phase = other_phase(&other),
                      "unexpected message from child");
            }
        }
    }

    // ── Round entry points ──────────────────────────────────────────────

    /// Root only: run one full signing round over `log` and return the
    /// final signature.
    pub async fn start_signing_round(
        self: &Arc<Self>,
        log: Vec<u8>,
    ) -> Result<CollectiveSignature, SignError> {
        if self.view.is_changing() {
            info!(node = %self.name(), "start signing round refused: changing view");
            return Err(SignError::ChangingView);
        }

        let view = self.view.current();
        let round = self.last_round() + 1;

        let every = self.fail_as_root_every.load(Ordering::Acquire);
        if every > 0 && round % every == 0 {
            warn!(node = %self.name(), round, "simulating root failure");
            return Err(SignError::Timeout(MAX_WILLING_TO_WAIT));
        }

        info!(node = %self.name(), round, view, "root starting signing round");

        let announcer = Arc::clone(self);
        let announce_log = log;
        tokio::spawn(async move {
            if let Err(err) = announcer.announce(view, round, announce_log).await {
                warn!(node = %announcer.name(), round, %err, "announce failed");
                announcer.fail_closed(err).await;
            }
        });

        // First phase: the aggregate commit reaches the root.
        let deadline = tokio::time::sleep(MAX_WILLING_TO_WAIT);
        tokio::pin!(deadline);

        {
            let mut commits_done = self.commits_done_rx.lock().await;
            let mut closed = self.closed_rx.lock().await;
            tokio::select! {
                got = commits_done.recv() => {
                    let got = got.ok_or(SignError::TransportClosed)?;
                    if got != round {
                        error!(node = %self.name(), expected = round, got, "1st phase round number mix up");
                        return Err(SignError::RoundMismatch { expected: round, got });
                    }
                }
                err = closed.recv() => {
                    return Err(err.unwrap_or(SignError::TransportClosed));
                }
                () = &mut deadline => {
                    return Err(SignError::Timeout(MAX_WILLING_TO_WAIT));
                }
            }
        }

        // Second phase: the aggregate response closes the round.
        {
            let mut done = self.done_rx.lock().await;
            let mut closed = self.closed_rx.lock().await;
            tokio::select! {
                got = done.recv() => {
                    let got = got.ok_or(SignError::TransportClosed)?;
                    if got != round {
                        error!(node = %self.name(), expected = round, got, "2nd phase round number mix up");
                        return Err(SignError::RoundMismatch { expected: round, got });
                    }
                }
                err = closed.recv() => {
                    return Err(err.unwrap_or(SignError::TransportClosed));
                }
                () = &mut deadline => {
                    return Err(SignError::Timeout(MAX_WILLING_TO_WAIT));
                }
            }
        }

        let signature = self
            .signature(round)
            .ok_or_else(|| SignError::VerificationFailed("round closed without signature".into()))?;

        self.evict_rounds_before(round);
        Ok(signature)
    }

    /// Create round `round`, forward the announcement, and run the commit
    /// phase. Entry point for the root (from `start_signing_round`) and
    /// for every other node (on receiving the announcement).
    async fn announce(self: &Arc<Self>, view: u64, round: u64, log: Vec<u8>) -> Result<(), SignError> {
        self.create_round(view, round, log)?;
        self.last_seen_round.fetch_max(round, Ordering::AcqRel);

        if self.is_root() {
            self.set_accountable_round(round);
        }

        if self.host.n_children() > 0 {
            if self.should_fail("announce") {
                debug!(node = %self.name(), round, "dropping announcement (failure injection)");
            } else {
                let msg = {
                    let rounds = self.rounds.read();
                    let record = rounds.get(&round).expect("round just created");
                    SigningMessage::new(
                        view,
                        round,
                        MessageBody::Announcement(AnnouncementPayload {
                            log: record.log.clone(),
                        }),
                    )
                };
                let frame = encode(&msg)?;
                let frames = vec![frame; self.host.n_children()];
                if let Err(err) = self.host.put_down(frames).await {
                    warn!(node = %self.name(), round, %err, "announcement put_down failed");
                }
            }
        }

        self.commit_phase(view, round).await
    }

    fn create_round(&self, view: u64, round: u64, log: Vec<u8>) -> Result<(), SignError> {
        let mut rounds = self.rounds.write();
        if rounds.contains_key(&round) {
            return Err(SignError::RoundMismatch {
                expected: self.last_round() + 1,
                got: round,
            });
        }
        rounds.insert(round, Round::new(view, round, log));
        drop(rounds);

        self.channels
            .lock()
            .insert(round, RoundChannels::new(self.host.n_children()));

        // Old rounds fall out of the window once a new one opens.
        self.evict_rounds_before(round.saturating_sub(ROUND_WINDOW));
        Ok(())
    }

    /// Drop round records and channels older than `round`.
    pub fn evict_rounds_before(&self, round: u64) {
        self.rounds.write().retain(|r, _| *r >= round);
        self.channels.lock().retain(|r, _| *r >= round);
    }

    /// Root only: chain this round to the previous global root.
    fn set_accountable_round(&self, round: u64) {
        let acc_log = self.acc_log.lock();
        let back_link = acc_log.back_link_for(round);
        let acc_round = AccountabilityLog::acc_round_for(round, &back_link);
        drop(acc_log);

        let mut rounds = self.rounds.write();
        if let Some(record) = rounds.get_mut(&round) {
            record.back_link = back_link;
            record.acc_round = acc_round;
        }
    }

    // ── Commit phase ────────────────────────────────────────────────────

    async fn commit_phase(self: &Arc<Self>, view: u64, round: u64) -> Result<(), SignError> {
        let children = self.host.children();
        let collected = self
            .collect_commits(round, children.len())
            .await;

        let (commit_msg, is_root, mt_root, v_hat) = {
            let mut rounds = self.rounds.write();
            let Some(record) = rounds.get_mut(&round) else {
                return Ok(()); // evicted meanwhile
            };

            let mut seen = HashSet::new();
            for (payload, from) in collected {
                if !children.contains(&from) || !seen.insert(from.clone()) {
                    continue;
                }
                match self.absorb_child_commit(record, &payload, &from) {
                    Ok(()) => {}
                    Err(err) => {
                        warn!(node = %self.name(), round, child = %from, %err,
                              "rejecting malformed commit");
                    }
                }
            }

            // Children that never committed are permanent absentees for
            // the round: their subtree keys are reported, nothing else.
            for child in &children {
                if !record.children_committed.contains(child) {
                    warn!(node = %self.name(), round, %child, "child absent in commit");
                    let keys = self.subtree_keys(child);
                    record.commit_exceptions.keys.extend(keys);
                }
            }

            // Own contribution.
            let v = random_scalar(&mut *self.nonce_rng.lock());
            let commit_v = RistrettoPoint::mul_base(&v);
            let mut v_hat = commit_v;
            let mut x_hat = self.keypair.public;
            for child in &record.children_committed {
                v_hat += record.child_v_hat[child];
                x_hat += record.child_x_hat[child];
            }
            record.v = Some(v);
            record.commit_v = Some(commit_v);
            record.commit_v_hat = Some(v_hat);
            record.x_hat = Some(x_hat);

            // Local Merkle material.
            record.local_mt_root = self
                .commit_fn
                .read()
                .as_ref()
                .map_or(HashId::ZERO, |f| f());
            record.compute_combined_root();
            record.state = RoundState::Committed;

            let mt_root = record.mt_root.expect("combined root just computed");
            let commit_msg = SigningMessage::new(
                view,
                round,
                MessageBody::Commitment(CommitmentPayload {
                    v: encode_point(&commit_v),
                    v_hat: encode_point(&v_hat),
                    x_hat: encode_point(&x_hat),
                    mt_root,
                    exceptions: record.commit_exceptions.to_wire(),
                }),
            );
            (commit_msg, self.is_root(), mt_root, v_hat)
        };

        if is_root {
            let _ = self.commits_done_tx.send(round).await;
            let challenge = ChallengePayload {
                c: encode_scalar(&compute_challenge(&mt_root, &v_hat)),
                mt_root,
                proof: Proof::new(),
            };
            self.process_challenge(view, round, challenge).await
        } else {
            if self.should_fail("commit") {
                debug!(node = %self.name(), round, "dropping commit (failure injection)");
                return Ok(());
            }
            let frame = encode(&commit_msg)?;
            match self.host.put_up(frame).await {
                Ok(()) => Ok(()),
                Err(NetError::Closed) => {
                    self.fail_closed(SignError::TransportClosed).await;
                    Err(SignError::TransportClosed)
                }
                Err(err) => {
                    warn!(node = %self.name(), round, %err, "commit put_up failed");
                    Ok(())
                }
            }
        }
    }

    async fn collect_commits(
        &self,
        round: u64,
        expected: usize,
    ) -> Vec<(CommitmentPayload, String)> {
        let Some(mut rx) = self.channels.lock().get_mut(&round).and_then(|ch| ch.commit_rx.take())
        else {
            return Vec::new();
        };
        self.collect_phase(&mut rx, expected).await
    }

    async fn collect_responses(
        &self,
        round: u64,
        expected: usize,
    ) -> Vec<(ResponsePayload, String)> {
        let Some(mut rx) =
            self.channels.lock().get_mut(&round).and_then(|ch| ch.response_rx.take())
        else {
            return Vec::new();
        };
        self.collect_phase(&mut rx, expected).await
    }

    /// Drain one phase's channel until `expected` contributions arrived
    /// or the height-scaled deadline elapsed.
    async fn collect_phase<T>(
        &self,
        rx: &mut mpsc::Receiver<(T, String)>,
        expected: usize,
    ) -> Vec<(T, String)> {
        let mut collected = Vec::with_capacity(expected);
        if expected == 0 {
            return collected;
        }
        let deadline = tokio::time::Instant::now() + self.timeout();
        while collected.len() < expected {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(item)) => collected.push(item),
                Ok(None) => break,
                Err(_) => break, // deadline: absentees become exceptions
            }
        }
        collected
    }

    fn absorb_child_commit(
        &self,
        record: &mut Round,
        payload: &CommitmentPayload,
        from: &str,
    ) -> Result<(), SignError> {
        let v_hat = decode_point(&payload.v_hat)?;
        let x_hat = decode_point(&payload.x_hat)?;
        let exceptions = ExceptionBag::from_wire(&payload.exceptions)?;

        record.children_committed.push(from.to_string());
        record.child_v_hat.insert(from.to_string(), v_hat);
        record.child_x_hat.insert(from.to_string(), x_hat);
        record.leaves.push(payload.mt_root);
        record.leaves_from.push(from.to_string());
        record.commit_exceptions.merge(&exceptions);
        Ok(())
    }

    // ── Challenge phase ─────────────────────────────────────────────────

    /// Handle a challenge for `round`: record it, hand the local client
    /// its proof, forward personalised challenges, then respond.
    async fn process_challenge(
        self: &Arc<Self>,
        view: u64,
        round: u64,
        payload: ChallengePayload,
    ) -> Result<(), SignError> {
        let c = decode_scalar(&payload.c)?;

        let (per_child, done_event) = {
            let mut rounds = self.rounds.write();
            let Some(record) = rounds.get_mut(&round) else {
                warn!(node = %self.name(), round, "challenge for unknown round");
                return Err(SignError::RoundMismatch {
                    expected: self.last_round(),
                    got: round,
                });
            };
            if record.state != RoundState::Committed {
                warn!(node = %self.name(), round, state = ?record.state,
                      "challenge before commit, refusing");
                return Err(SignError::VerificationFailed(
                    "challenge received before commit was emitted".into(),
                ));
            }
            record.challenge_c = Some(c);

            let mt_root = record.mt_root.expect("committed round has a root");
            self.verify_challenge_proofs(record, &payload, &mt_root);

            // Proof for the local client: local root -> our root -> global.
            let mut client_proof = record.proofs[LOCAL_PROOF].clone();
            client_proof.extend_from_slice(&payload.proof);
            let done_event = DoneEvent {
                round,
                global_root: payload.mt_root,
                local_root: record.local_mt_root,
                proof: client_proof,
            };

            // Personalised proof per committed child: the child's partial
            // proof up to our root, then the inherited proof above us.
            let per_child: Vec<(String, SigningMessage)> = record
                .children_committed
                .iter()
                .map(|child| {
                    let mut proof = record.proofs[child].clone();
                    proof.extend_from_slice(&payload.proof);
                    let msg = SigningMessage::new(
                        view,
                        round,
                        MessageBody::Challenge(ChallengePayload {
                            c: payload.c,
                            mt_root: payload.mt_root,
                            proof,
                        }),
                    );
                    (child.clone(), msg)
                })
                .collect();
            (per_child, done_event)
        };

        if let Some(done) = self.done_fn.read().as_ref() {
            done(done_event);
        }

        for (child, msg) in per_child {
            // Consulted per message: a rate-configured sim drops
            // individual challenges, a dead phase drops them all.
            if self.should_fail("challenge") {
                debug!(node = %self.name(), round, %child, "dropping challenge (failure injection)");
                continue;
            }
            let frame = encode(&msg)?;
            if let Err(err) = self.host.put_down_to(&child, frame).await {
                warn!(node = %self.name(), round, %child, %err, "challenge put_down failed");
            }
        }

        self.respond_phase(view, round).await
    }

    /// Debug-policy proof checks; log-and-continue in production.
    fn verify_challenge_proofs(&self, record: &Round, payload: &ChallengePayload, mt_root: &HashId) {
        let local_ok = check_proof(
            mt_root,
            &record.local_mt_root,
            &record.proofs[LOCAL_PROOF],
        );
        let up_ok = check_proof(&payload.mt_root, mt_root, &payload.proof);
        if local_ok && up_ok {
            return;
        }
        let what = format!(
            "merkle proof verification failed at {} (local={local_ok}, up={up_ok})",
            self.name()
        );
        if self.policy.debug {
            panic!("{what}");
        }
        error!(node = %self.name(), round = record.round, %what, "continuing despite failed proof");
    }

    // ── Response phase ──────────────────────────────────────────────────

    async fn respond_phase(self: &Arc<Self>, view: u64, round: u64) -> Result<(), SignError> {
        let responders: Vec<String> = {
            let rounds = self.rounds.read();
            match rounds.get(&round) {
                Some(record) => record.children_committed.clone(),
                None => return Ok(()),
            }
        };
        let collected = self.collect_responses(round, responders.len()).await;

        let (response_msg, is_root, root_result) = {
            let mut rounds = self.rounds.write();
            let Some(record) = rounds.get_mut(&round) else {
                return Ok(());
            };
            let c = record.challenge_c.expect("challenge recorded before respond");

            let mut responded = HashSet::new();
            let mut r_agg = record.v.expect("nonce picked at commit") - c * self.keypair.secret;
            for (payload, from) in collected {
                if !responders.contains(&from) || !responded.insert(from.clone()) {
                    continue;
                }
                match (decode_scalar(&payload.r), ExceptionBag::from_wire(&payload.exceptions)) {
                    (Ok(r_child), Ok(exceptions)) => {
                        r_agg += r_child;
                        record.response_exceptions.merge(&exceptions);
                    }
                    (r, e) => {
                        let err = r
                            .err()
                            .map(|e| e.to_string())
                            .or_else(|| e.err().map(|e| e.to_string()))
                            .unwrap_or_default();
                        warn!(node = %self.name(), round, child = %from, err = %err,
                              "rejecting malformed response");
                        responded.remove(&from);
                    }
                }
            }

            // Children that committed but never responded: back their
            // aggregates out and name their subtree members.
            for child in &responders {
                if responded.contains(child) {
                    continue;
                }
                warn!(node = %self.name(), round, %child, "child absent in response");
                record.response_exceptions.v += record.child_v_hat[child];
                record.response_exceptions.x += record.child_x_hat[child];
                let keys = self.subtree_keys(child);
                record.response_exceptions.keys.extend(keys);
            }

            record.response_r = Some(r_agg);
            record.state = RoundState::Responded;
            let merged = record.merged_exceptions();

            if self.is_root() {
                let signature = CollectiveSignature {
                    view,
                    round,
                    mt_root: record.mt_root.expect("root committed"),
                    c,
                    r: r_agg,
                    exception_v: merged.v,
                    exception_x: merged.x,
                    exception_keys: merged.keys.clone(),
                };
                let acc = (record.back_link, record.acc_round);
                (None, true, Some((signature, acc)))
            } else {
                let msg = SigningMessage::new(
                    view,
                    round,
                    MessageBody::Response(ResponsePayload {
                        r: encode_scalar(&r_agg),
                        exceptions: merged.to_wire(),
                    }),
                );
                (Some(msg), false, None)
            }
        };

        if is_root {
            let (signature, (back_link, acc_round)) = root_result.expect("root result set");
            self.finalize_round(signature, back_link, acc_round).await;
            return Ok(());
        }

        if self.should_fail("response") {
            debug!(node = %self.name(), round, "dropping response (failure injection)");
            return Ok(());
        }
        let msg = response_msg.expect("non-root response built");
        let frame = encode(&msg)?;
        match self.host.put_up(frame).await {
            Ok(()) => Ok(()),
            Err(NetError::Closed) => {
                self.fail_closed(SignError::TransportClosed).await;
                Err(SignError::TransportClosed)
            }
            Err(err) => {
                warn!(node = %self.name(), round = msg.round, %err, "response put_up failed");
                Ok(())
            }
        }
    }

    /// Root only: check the aggregate identity, retain the signature and
    /// the accountability record, and signal completion.
    async fn finalize_round(&self, signature: CollectiveSignature, back_link: HashId, acc_round: HashId) {
        let keys = self.participant_keys();
        if !signature.verify(&keys) {
            let what = format!("aggregate signature failed to verify for round {}", signature.round);
            if self.policy.debug {
                panic!("{what}");
            }
            error!(node = %self.name(), round = signature.round, "{what}");
        }

        let round = signature.round;
        self.acc_log
            .lock()
            .append(round, signature.mt_root, back_link, acc_round);
        self.signatures.lock().insert(round, signature);

        info!(node = %self.name(), round, "round complete");
        let _ = self.done_tx.send(round).await;
    }

    // ── View change ─────────────────────────────────────────────────────

    /// Propose rotating the leader after the current root stalled.
    pub async fn propose_view_change(self: &Arc<Self>) -> Result<(), SignError> {
        let proposed = self.view.current() + 1;
        if !self.view.start_change(proposed) {
            return Ok(());
        }
        info!(node = %self.name(), proposed, "proposing view change");
        self.drain_rounds();

        let next_root = {
            let hosts = self.host_list.read();
            if hosts.is_empty() {
                return Err(SignError::Config("host list not configured".into()));
            }
            root_for(&hosts, proposed).to_string()
        };
        self.view.set_am_next_root(next_root == self.name());

        // Proposal first, so peers know the view before acks arrive.
        let msg = SigningMessage::new(
            proposed,
            self.last_round(),
            MessageBody::ViewChange(ViewChangePayload {
                proposed_view: proposed,
                proposer: self.name().to_string(),
            }),
        );
        self.flood(msg).await;
        self.ack_view(proposed).await;
        Ok(())
    }

    async fn handle_view_change(self: &Arc<Self>, payload: ViewChangePayload) {
        if !self.view.start_change(payload.proposed_view) {
            return;
        }
        info!(node = %self.name(), proposed = payload.proposed_view, proposer = %payload.proposer,
              "joining view change");
        self.drain_rounds();

        let next_root = {
            let hosts = self.host_list.read();
            if hosts.is_empty() {
                return;
            }
            root_for(&hosts, payload.proposed_view).to_string()
        };
        self.view.set_am_next_root(next_root == self.name());

        // Re-flood the proposal, then acknowledge it.
        let msg = SigningMessage::new(
            payload.proposed_view,
            self.last_round(),
            MessageBody::ViewChange(payload.clone()),
        );
        self.flood(msg).await;
        self.ack_view(payload.proposed_view).await;
    }

    async fn handle_view_accepted(self: &Arc<Self>, payload: ViewAcceptedPayload) {
        let Some(count) = self.view.record_ack(payload.view, &payload.accepter) else {
            return;
        };
        // New ack: re-flood so every node converges on the same count.
        let msg = SigningMessage::new(
            payload.view,
            self.last_round(),
            MessageBody::ViewAccepted(payload.clone()),
        );
        self.flood(msg).await;

        let hosts = self.host_list.read().len();
        if hosts > 0 && count >= quorum(hosts) {
            self.commit_view(payload.view);
        }
    }

    /// Record our own acceptance and flood it.
    async fn ack_view(self: &Arc<Self>, view: u64) {
        if let Some(count) = self.view.record_ack(view, self.name()) {
            let hosts = self.host_list.read().len();
            if hosts > 0 && count >= quorum(hosts) {
                self.commit_view(view);
            }
        }
        let msg = SigningMessage::new(
            view,
            self.last_round(),
            MessageBody::ViewAccepted(ViewAcceptedPayload {
                view,
                accepter: self.name().to_string(),
            }),
        );
        self.flood(msg).await;
    }

    fn commit_view(&self, view: u64) {
        self.view.commit(view);
        let role = if self.view.am_next_root() { "root" } else { "regular" };
        info!(node = %self.name(), view, role, "view committed");
    }

    /// Abort in-flight rounds before installing a new view.
    fn drain_rounds(&self) {
        let mut rounds = self.rounds.write();
        for record in rounds.values_mut() {
            if record.state != RoundState::Responded {
                record.state = RoundState::Failed;
            }
        }
        drop(rounds);
        self.channels.lock().clear();
    }

    /// Send a message to every tree neighbour.
    async fn flood(&self, msg: SigningMessage) {
        let Ok(frame) = encode(&msg) else { return };
        if !self.is_root() {
            let _ = self.host.put_up(frame.clone()).await;
        }
        for child in self.host.children() {
            let _ = self.host.put_down_to(&child, frame.clone()).await;
        }
    }

    /// Surface a fatal round error toward the root.
    async fn surface_error(&self, view: u64, round: u64, message: String) {
        let msg = SigningMessage::new(view, round, MessageBody::Error(ErrorPayload { message }));
        if self.is_root() {
            error!(node = %self.name(), round, "round-level error at root");
        } else if let Ok(frame) = encode(&msg) {
            let _ = self.host.put_up(frame).await;
        }
    }

    /// Shut the node down; neighbours observe closed conns.
    pub fn close(&self) {
        self.host.close();
    }
}

fn other_phase(body: &MessageBody) -> &'static str {
    match body {
        MessageBody::Announcement(_) => "announce",
        MessageBody::Commitment(_) => "commit",
        MessageBody::Challenge(_) => "challenge",
        MessageBody::Response(_) => "response",
        MessageBody::ViewChange(_) => "view_change",
        MessageBody::ViewAccepted(_) => "view_accepted",
        MessageBody::Error(_) => "error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cosi_net::Directory;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn make_node(name: &str) -> Arc<Node> {
        let dir = Arc::new(Directory::new());
        let host = TreeHost::new(name, dir);
        let keypair = Keypair::generate(&mut ChaCha8Rng::seed_from_u64(42));
        Node::new(host, keypair, VerifyPolicy::default())
    }

    #[test]
    fn test_timeout_scales_with_height() {
        let node = make_node("host0");
        assert_eq!(node.timeout(), DEFAULT_TIMEOUT);

        node.set_height(2);
        assert_eq!(node.timeout(), DEFAULT_TIMEOUT * 3);

        node.set_default_timeout(Duration::from_millis(100));
        assert_eq!(node.timeout(), Duration::from_millis(300));
    }

    #[test]
    fn test_own_key_registered_as_peer() {
        let node = make_node("host0");
        assert_eq!(node.participant_keys().len(), 0); // no host list yet

        node.set_host_list(vec!["host0".to_string()]);
        assert_eq!(node.participant_keys(), vec![node.public_key()]);
    }

    #[test]
    fn test_subtree_keys_fall_back_to_child() {
        let node = make_node("host0");
        let child_key = Keypair::generate(&mut ChaCha8Rng::seed_from_u64(7)).public;
        node.add_peer("host1", child_key);

        // No tree configured: the child alone is named.
        assert_eq!(node.subtree_keys("host1"), vec![child_key]);
    }

    #[test]
    fn test_round_records_are_unique() {
        let node = make_node("host0");
        node.create_round(0, 1, b"log".to_vec()).unwrap();
        assert!(matches!(
            node.create_round(0, 1, b"log".to_vec()),
            Err(SignError::RoundMismatch { .. })
        ));
    }

    #[test]
    fn test_round_window_eviction() {
        let node = make_node("host0");
        for round in 1..=5 {
            node.create_round(0, round, b"log".to_vec()).unwrap();
        }
        let rounds = node.rounds.read();
        assert!(!rounds.contains_key(&1));
        assert!(!rounds.contains_key(&2));
        assert!(rounds.contains_key(&3));
        assert!(rounds.contains_key(&5));
    }
}

//! Message envelopes for the collective-signing protocol.
//!
//! Every frame on the tree is a [`SigningMessage`]: the view and round it
//! belongs to plus a phase-specific body. Receivers route by round number
//! first, then dispatch on the body discriminant, so late or out-of-window
//! traffic can be dropped before any payload is inspected.

use serde::{Deserialize, Serialize};

use cosi_common::{HashId, Proof};

/// A 32-byte canonical group-element encoding.
pub type PointBytes = [u8; 32];

/// A 32-byte canonical scalar encoding.
pub type ScalarBytes = [u8; 32];

/// Aggregated bookkeeping for subtrees that failed during a round.
///
/// `v` and `x` are the summed commitments and public keys of failed
/// subtrees that had already committed; `keys` names every failed node
/// individually so the final signature can be checked against the honest
/// aggregate key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionSet {
    pub v: PointBytes,
    pub x: PointBytes,
    pub keys: Vec<PointBytes>,
}

impl ExceptionSet {
    /// An empty exception set (identity points, no keys).
    ///
    /// The identity encodes as all-zero bytes in this suite, so the empty
    /// set is also the all-zero wire value.
    #[must_use]
    pub fn empty() -> Self {
        ExceptionSet {
            v: [0u8; 32],
            x: [0u8; 32],
            keys: Vec::new(),
        }
    }
}

/// Root → leaves: opens round `round` over the given statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnouncementPayload {
    /// The statement under signature, propagated verbatim.
    pub log: Vec<u8>,
}

/// Leaves → root: a subtree's aggregate commitment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitmentPayload {
    /// This node's own nonce commitment v·G.
    pub v: PointBytes,
    /// Aggregate nonce commitment of the whole subtree.
    pub v_hat: PointBytes,
    /// Aggregate public key of the whole subtree (failures excluded).
    pub x_hat: PointBytes,
    /// Subtree Merkle root over this node's leaves and statement hash.
    pub mt_root: HashId,
    /// Failures already observed below this node.
    pub exceptions: ExceptionSet,
}

/// Root → leaves: the Schnorr challenge plus a personalised proof from
/// the receiver's subtree root up to the global root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengePayload {
    pub c: ScalarBytes,
    /// The global Merkle root the challenge commits to.
    pub mt_root: HashId,
    /// Siblings from the receiver's subtree root toward the global root.
    pub proof: Proof,
}

/// Leaves → root: a subtree's aggregate Schnorr response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub r: ScalarBytes,
    /// Commit-phase and response-phase failures, merged.
    pub exceptions: ExceptionSet,
}

/// Any node → peers: proposal to advance to `proposed_view`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewChangePayload {
    pub proposed_view: u64,
    pub proposer: String,
}

/// Ack for a proposed view, flooded once the new root commits it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewAcceptedPayload {
    pub view: u64,
    pub accepter: String,
}

/// Fatal round-level error surfaced toward the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// Phase-specific payloads, discriminated by variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    Announcement(AnnouncementPayload),
    Commitment(CommitmentPayload),
    Challenge(ChallengePayload),
    Response(ResponsePayload),
    ViewChange(ViewChangePayload),
    ViewAccepted(ViewAcceptedPayload),
    Error(ErrorPayload),
}

/// The envelope every tree frame carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningMessage {
    pub view: u64,
    pub round: u64,
    pub body: MessageBody,
}

impl SigningMessage {
    #[must_use]
    pub fn new(view: u64, round: u64, body: MessageBody) -> Self {
        SigningMessage { view, round, body }
    }

    /// Stable phase name, used for logging and the failure-injection hook.
    #[must_use]
    pub const fn phase(&self) -> &'static str {
        match self.body {
            MessageBody::Announcement(_) => "announce",
            MessageBody::Commitment(_) => "commit",
            MessageBody::Challenge(_) => "challenge",
            MessageBody::Response(_) => "response",
            MessageBody::ViewChange(_) => "view_change",
            MessageBody::ViewAccepted(_) => "view_accepted",
            MessageBody::Error(_) => "error",
        }
    }
}

//! # cosi-sign
//!
//! The collective-signing node: a tree of these jointly produces one
//! Schnorr signature over a root-chosen statement while timestamping
//! client digests through a two-level Merkle construction.
//!
//! ## Modules
//!
//! - [`node`]: the four-phase state machine (Announce → Commit →
//!   Challenge → Response), aggregation, proof distribution, timeouts
//! - [`round`]: per-round scratchpad and exception bookkeeping
//! - [`signature`]: the final signature and its verification
//! - [`accountability`]: the root's back-link chain over global roots
//! - [`view`]: leader-rotation state
//! - [`failure`]: deterministic drop injection for tests
//! - [`error`]: the signing layer's error kinds
//!
//! ## Protocol shape
//!
//! ```text
//!                     root
//!            Announce ↓  ↑ Commit
//!                  internal nodes
//!           Challenge ↓  ↑ Response
//!                    leaves
//! ```
//!
//! Crash and omission failures are recovered locally: an absent subtree
//! lands in the round's exception set and the final signature verifies
//! against the aggregate key with those members excluded.

pub mod accountability;
pub mod error;
pub mod failure;
pub mod node;
pub mod round;
pub mod signature;
pub mod view;

pub use accountability::{AccRecord, AccountabilityLog};
pub use error::SignError;
pub use failure::FailureSim;
pub use node::{
    CommitFn, DoneEvent, DoneFn, Node, VerifyPolicy, DEFAULT_TIMEOUT, MAX_WILLING_TO_WAIT,
};
pub use round::{ExceptionBag, Round, RoundState, LOCAL_PROOF};
pub use signature::{compute_challenge, CollectiveSignature, CHALLENGE_DOMAIN};
pub use view::{quorum, root_for, ViewState};

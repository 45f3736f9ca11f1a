//! Per-round scratchpad.
//!
//! Every node keeps one [`Round`] record per active round number. The
//! record accumulates the subtree's commitments and Merkle material on
//! the way up, the challenge on the way down, and the response on the
//! way up again; it is evicted only after the round has closed out.
//!
//! Commit-phase and response-phase absentees are tracked in two disjoint
//! [`ExceptionBag`]s. They are merged only when the Response is emitted:
//! a child absent in Commit never contributed aggregates (its subtree
//! keys alone are reported), while a child that committed but missed
//! Response has its aggregates backed out via `v`/`x`.

use std::collections::HashMap;

use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::Identity;

use cosi_common::merkle::{merkle_node, proof_tree};
use cosi_common::{HashId, Proof};
use cosi_proto::ExceptionSet;

use crate::error::SignError;

/// Proof-map key for this node's own local Merkle root.
pub const LOCAL_PROOF: &str = "local";

/// Where a round currently stands at this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundState {
    /// Announcement received (or generated at the root).
    Announced,
    /// Commit emitted upward; waiting for the challenge.
    Committed,
    /// Response emitted upward; waiting for eviction.
    Responded,
    /// Timed out or hit a fatal transport error.
    Failed,
}

/// Aggregated bookkeeping for one class of subtree failures.
#[derive(Debug, Clone)]
pub struct ExceptionBag {
    pub v: RistrettoPoint,
    pub x: RistrettoPoint,
    pub keys: Vec<RistrettoPoint>,
}

impl Default for ExceptionBag {
    fn default() -> Self {
        ExceptionBag {
            v: RistrettoPoint::identity(),
            x: RistrettoPoint::identity(),
            keys: Vec::new(),
        }
    }
}

impl ExceptionBag {
    /// Fold another bag into this one.
    pub fn merge(&mut self, other: &ExceptionBag) {
        self.v += other.v;
        self.x += other.x;
        self.keys.extend_from_slice(&other.keys);
    }

    /// Wire representation.
    #[must_use]
    pub fn to_wire(&self) -> ExceptionSet {
        ExceptionSet {
            v: cosi_common::encode_point(&self.v),
            x: cosi_common::encode_point(&self.x),
            keys: self.keys.iter().map(cosi_common::encode_point).collect(),
        }
    }

    /// Decode a wire exception set, rejecting invalid encodings.
    pub fn from_wire(wire: &ExceptionSet) -> Result<Self, SignError> {
        Ok(ExceptionBag {
            v: cosi_common::decode_point(&wire.v)?,
            x: cosi_common::decode_point(&wire.x)?,
            keys: wire
                .keys
                .iter()
                .map(cosi_common::decode_point)
                .collect::<Result<_, _>>()?,
        })
    }
}

/// One round's state at one node.
pub struct Round {
    pub round: u64,
    pub view: u64,
    pub state: RoundState,

    /// The statement under signature, propagated verbatim from the root.
    pub log: Vec<u8>,
    /// Hash of `log`; the right sibling of the combined Merkle root.
    pub hashed_log: HashId,

    /// Per-round secret nonce; kept until the response is computed.
    pub v: Option<Scalar>,
    /// Own nonce commitment v·G.
    pub commit_v: Option<RistrettoPoint>,
    /// Aggregate nonce commitment of the whole subtree.
    pub commit_v_hat: Option<RistrettoPoint>,
    /// Aggregate public key of the subtree (commit absentees excluded).
    pub x_hat: Option<RistrettoPoint>,

    /// Children that contributed a commit this round, in arrival order.
    pub children_committed: Vec<String>,
    /// Each committed child's subtree aggregates, kept so a later
    /// response failure can back them out.
    pub child_v_hat: HashMap<String, RistrettoPoint>,
    pub child_x_hat: HashMap<String, RistrettoPoint>,

    /// Child Merkle roots received this round, paired with sender names.
    pub leaves: Vec<HashId>,
    pub leaves_from: Vec<String>,
    /// This node's own root over pending client requests.
    pub local_mt_root: HashId,
    /// Combined subtree root: node(left subtree over leaves, hashed_log).
    pub mt_root: Option<HashId>,
    /// Partial proofs from each child root (and `LOCAL_PROOF`) to `mt_root`.
    pub proofs: HashMap<String, Proof>,

    pub challenge_c: Option<Scalar>,
    pub response_r: Option<Scalar>,

    pub commit_exceptions: ExceptionBag,
    pub response_exceptions: ExceptionBag,

    /// Root-only accountability fields.
    pub back_link: HashId,
    pub acc_round: HashId,
}

impl Round {
    #[must_use]
    pub fn new(view: u64, round: u64, log: Vec<u8>) -> Self {
        let hashed_log = HashId::hash(&log);
        Round {
            round,
            view,
            state: RoundState::Announced,
            log,
            hashed_log,
            v: None,
            commit_v: None,
            commit_v_hat: None,
            x_hat: None,
            children_committed: Vec::new(),
            child_v_hat: HashMap::new(),
            child_x_hat: HashMap::new(),
            leaves: Vec::new(),
            leaves_from: Vec::new(),
            local_mt_root: HashId::ZERO,
            mt_root: None,
            proofs: HashMap::new(),
            challenge_c: None,
            response_r: None,
            commit_exceptions: ExceptionBag::default(),
            response_exceptions: ExceptionBag::default(),
            back_link: HashId::ZERO,
            acc_round: HashId::ZERO,
        }
    }

    /// Build the combined subtree root and the per-leaf partial proofs.
    ///
    /// The leaf set is every committed child's root plus the local root.
    /// Leaves are sorted before hashing so the result does not depend on
    /// arrival order; names travel with their leaf through the sort, which
    /// gives duplicate leaves distinct proofs by position. Each proof gets
    /// `hashed_log` appended as its final sibling, the step from the left
    /// subtree up to `mt_root`.
    pub fn compute_combined_root(&mut self) {
        let mut entries: Vec<(HashId, String)> = self
            .leaves
            .iter()
            .zip(&self.leaves_from)
            .map(|(leaf, from)| (*leaf, from.clone()))
            .collect();
        entries.push((self.local_mt_root, LOCAL_PROOF.to_string()));
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let sorted: Vec<HashId> = entries.iter().map(|(leaf, _)| *leaf).collect();
        let (left_root, proofs) = proof_tree(&sorted);
        let mt_root = merkle_node(&left_root, &self.hashed_log);

        self.proofs.clear();
        for ((_, name), mut proof) in entries.into_iter().zip(proofs) {
            proof.push(self.hashed_log);
            self.proofs.insert(name, proof);
        }
        self.mt_root = Some(mt_root);
    }

    /// The merged exception set reported upward with the Response.
    #[must_use]
    pub fn merged_exceptions(&self) -> ExceptionBag {
        let mut merged = self.commit_exceptions.clone();
        merged.merge(&self.response_exceptions);
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cosi_common::check_proof;

    fn filled_round(leaf_count: usize) -> Round {
        let mut round = Round::new(0, 1, b"statement".to_vec());
        for i in 0..leaf_count {
            round.leaves.push(HashId::hash(&[i as u8]));
            round.leaves_from.push(format!("child{i}"));
        }
        round.local_mt_root = HashId::hash(b"local-requests");
        round
    }

    #[test]
    fn test_combined_root_covers_all_leaves() {
        let mut round = filled_round(3);
        round.compute_combined_root();
        let mt_root = round.mt_root.unwrap();

        for (leaf, from) in round.leaves.iter().zip(&round.leaves_from) {
            let proof = &round.proofs[from];
            assert!(check_proof(&mt_root, leaf, proof), "{from} proof failed");
        }
        let local = &round.proofs[LOCAL_PROOF];
        assert!(check_proof(&mt_root, &round.local_mt_root, local));
    }

    #[test]
    fn test_combined_root_independent_of_arrival_order() {
        let mut forward = filled_round(4);
        forward.compute_combined_root();

        let mut reversed = Round::new(0, 1, b"statement".to_vec());
        for i in (0..4).rev() {
            reversed.leaves.push(HashId::hash(&[i as u8]));
            reversed.leaves_from.push(format!("child{i}"));
        }
        reversed.local_mt_root = HashId::hash(b"local-requests");
        reversed.compute_combined_root();

        assert_eq!(forward.mt_root, reversed.mt_root);
    }

    #[test]
    fn test_leaf_only_round_roots_on_local_and_log() {
        // No children: the left subtree is just the local root.
        let mut round = filled_round(0);
        round.compute_combined_root();
        let mt_root = round.mt_root.unwrap();

        let expected = merkle_node(&round.local_mt_root, &round.hashed_log);
        assert_eq!(mt_root, expected);
        assert!(check_proof(&mt_root, &round.local_mt_root, &round.proofs[LOCAL_PROOF]));
    }

    #[test]
    fn test_duplicate_child_roots_get_distinct_proofs() {
        let mut round = Round::new(0, 1, b"statement".to_vec());
        let dup = HashId::hash(b"same-subtree");
        for name in ["child-a", "child-b"] {
            round.leaves.push(dup);
            round.leaves_from.push(name.to_string());
        }
        round.local_mt_root = HashId::hash(b"local");
        round.compute_combined_root();

        let mt_root = round.mt_root.unwrap();
        assert!(check_proof(&mt_root, &dup, &round.proofs["child-a"]));
        assert!(check_proof(&mt_root, &dup, &round.proofs["child-b"]));
    }

    #[test]
    fn test_exception_bags_stay_disjoint_until_merge() {
        let mut round = filled_round(2);
        let key = RistrettoPoint::mul_base(&Scalar::from(7u64));
        round.commit_exceptions.keys.push(key);

        let v_hat = RistrettoPoint::mul_base(&Scalar::from(11u64));
        round.response_exceptions.v += v_hat;
        round.response_exceptions.keys.push(key);

        assert_eq!(round.commit_exceptions.keys.len(), 1);
        assert_eq!(round.commit_exceptions.v, RistrettoPoint::identity());

        let merged = round.merged_exceptions();
        assert_eq!(merged.keys.len(), 2);
        assert_eq!(merged.v, v_hat);
    }

    #[test]
    fn test_exception_bag_wire_roundtrip() {
        let mut bag = ExceptionBag::default();
        bag.v = RistrettoPoint::mul_base(&Scalar::from(3u64));
        bag.x = RistrettoPoint::mul_base(&Scalar::from(5u64));
        bag.keys.push(RistrettoPoint::mul_base(&Scalar::from(9u64)));

        let wire = bag.to_wire();
        let back = ExceptionBag::from_wire(&wire).unwrap();
        assert_eq!(back.v, bag.v);
        assert_eq!(back.x, bag.x);
        assert_eq!(back.keys, bag.keys);
    }

    #[test]
    fn test_empty_bag_is_identity_on_wire() {
        let wire = ExceptionBag::default().to_wire();
        assert_eq!(wire.v, [0u8; 32]);
        assert_eq!(wire.x, [0u8; 32]);
    }
}

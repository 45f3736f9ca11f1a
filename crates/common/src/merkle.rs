//! Order-independent Merkle trees with per-leaf inclusion proofs.
//!
//! The tree is a full binary tree padded to the next power of two with
//! [`HashId::ZERO`] leaves. Interior nodes hash the *sorted* pair of child
//! hashes, so two verifiers that hold the same leaf set in any order agree
//! on every node. A pair containing the zero id promotes the other member
//! unchanged, which keeps zero padding out of proofs entirely.
//!
//! A [`Proof`] lists sibling hashes from the leaf toward the root. The
//! verifier folds them forward with the same node rule and compares the
//! result against the expected root in constant time.

use subtle::ConstantTimeEq;

use crate::hashid::HashId;

/// Sibling hashes from a leaf toward the root, zero-padding siblings omitted.
pub type Proof = Vec<HashId>;

/// Combine two sibling hashes into their parent.
///
/// The pair is sorted by byte content before hashing, so the result does
/// not depend on which side each sibling sat on. A zero member promotes
/// the other unchanged.
#[must_use]
pub fn merkle_node(a: &HashId, b: &HashId) -> HashId {
    if a.is_zero() {
        return *b;
    }
    if b.is_zero() {
        return *a;
    }
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    HashId::hash_parts(&[lo.as_ref(), hi.as_ref()])
}

/// Build a Merkle tree over `leaves` and emit one proof per leaf.
///
/// Returns the root and the proofs in input-leaf order. Duplicate leaves
/// receive distinct proofs, one per position. Callers that need
/// order-independent roots sort the leaves before calling; this function
/// itself preserves positions so proofs stay addressable.
///
/// Edge cases: no leaves yields `(HashId::ZERO, [])`; a single leaf is its
/// own root with an empty proof.
#[must_use]
pub fn proof_tree(leaves: &[HashId]) -> (HashId, Vec<Proof>) {
    if leaves.is_empty() {
        return (HashId::ZERO, Vec::new());
    }

    let n_input = leaves.len();
    let width = n_input.next_power_of_two();

    let mut padded = leaves.to_vec();
    padded.resize(width, HashId::ZERO);

    // All levels, leaves first. levels[k] has width >> k entries.
    let mut levels: Vec<Vec<HashId>> = vec![padded];
    while levels[levels.len() - 1].len() > 1 {
        let next: Vec<HashId> = {
            let prev = &levels[levels.len() - 1];
            prev.chunks(2).map(|pair| merkle_node(&pair[0], &pair[1])).collect()
        };
        levels.push(next);
    }
    let root = levels[levels.len() - 1][0];

    let mut proofs = Vec::with_capacity(n_input);
    for i in 0..n_input {
        let mut proof = Proof::new();
        let mut idx = i;
        for level in &levels[..levels.len() - 1] {
            let sibling = level[idx ^ 1];
            if !sibling.is_zero() {
                proof.push(sibling);
            }
            idx >>= 1;
        }
        proofs.push(proof);
    }

    (root, proofs)
}

/// Verify an inclusion proof for `leaf` against `root`.
///
/// The final comparison is constant-time.
#[must_use]
pub fn check_proof(root: &HashId, leaf: &HashId, proof: &Proof) -> bool {
    let mut acc = *leaf;
    for sibling in proof {
        acc = merkle_node(&acc, sibling);
    }
    bool::from(acc.as_bytes().ct_eq(root.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: usize) -> Vec<HashId> {
        (0..n).map(|i| HashId::hash(&[i as u8])).collect()
    }

    #[test]
    fn test_empty_leaves() {
        let (root, proofs) = proof_tree(&[]);
        assert_eq!(root, HashId::ZERO);
        assert!(proofs.is_empty());
    }

    #[test]
    fn test_single_leaf_is_root() {
        let leaf = HashId::hash(b"only");
        let (root, proofs) = proof_tree(&[leaf]);
        assert_eq!(root, leaf);
        assert_eq!(proofs.len(), 1);
        assert!(proofs[0].is_empty());
        assert!(check_proof(&root, &leaf, &proofs[0]));
    }

    #[test]
    fn test_all_proofs_verify() {
        for n in [2, 3, 4, 5, 7, 8, 16, 33] {
            let ls = leaves(n);
            let (root, proofs) = proof_tree(&ls);
            assert_eq!(proofs.len(), n);
            for (leaf, proof) in ls.iter().zip(&proofs) {
                assert!(check_proof(&root, leaf, proof), "n={n} leaf failed");
            }
        }
    }

    #[test]
    fn test_node_hash_is_order_independent() {
        let a = HashId::hash(b"a");
        let b = HashId::hash(b"b");
        assert_eq!(merkle_node(&a, &b), merkle_node(&b, &a));
    }

    #[test]
    fn test_sorted_leaves_give_same_root_any_arrival_order() {
        let mut ls = leaves(6);
        let mut sorted = ls.clone();
        sorted.sort();
        let (root_a, _) = proof_tree(&sorted);

        ls.reverse();
        let mut sorted_again = ls;
        sorted_again.sort();
        let (root_b, _) = proof_tree(&sorted_again);

        assert_eq!(root_a, root_b);
    }

    #[test]
    fn test_padding_siblings_are_omitted() {
        // Three leaves pad to four; the padded sibling must not appear.
        let ls = leaves(3);
        let (root, proofs) = proof_tree(&ls);
        // Leaf 2 is paired with padding, so its proof skips that level.
        assert_eq!(proofs[2].len(), 1);
        assert!(check_proof(&root, &ls[2], &proofs[2]));
    }

    #[test]
    fn test_duplicate_leaves_distinct_proofs() {
        let dup = HashId::hash(b"dup");
        let other = HashId::hash(b"other");
        let ls = vec![dup, dup, other];
        let (root, proofs) = proof_tree(&ls);
        assert!(check_proof(&root, &dup, &proofs[0]));
        assert!(check_proof(&root, &dup, &proofs[1]));
        assert!(check_proof(&root, &other, &proofs[2]));
    }

    #[test]
    fn test_zero_leaf_still_provable() {
        // A genuine zero leaf (e.g. a node with no local requests) is
        // promoted away, but its proof still folds to the root.
        let ls = vec![HashId::ZERO, HashId::hash(b"x")];
        let (root, proofs) = proof_tree(&ls);
        assert!(check_proof(&root, &HashId::ZERO, &proofs[0]));
        assert!(check_proof(&root, &ls[1], &proofs[1]));
    }

    #[test]
    fn test_tampered_proof_fails() {
        let ls = leaves(8);
        let (root, proofs) = proof_tree(&ls);
        let mut bad = proofs[3].clone();
        bad[0] = HashId::hash(b"evil");
        assert!(!check_proof(&root, &ls[3], &bad));
        assert!(!check_proof(&root, &ls[4], &proofs[3]));
    }

    #[test]
    fn test_proof_composes_across_trees() {
        // Proof inside a subtree extends with the subtree root's own proof
        // in an enclosing tree, leaf -> subtree root -> outer root.
        let inner = leaves(4);
        let (inner_root, inner_proofs) = proof_tree(&inner);

        let outer_leaves = vec![inner_root, HashId::hash(b"sibling-tree")];
        let (outer_root, outer_proofs) = proof_tree(&outer_leaves);

        let mut combined = inner_proofs[1].clone();
        combined.extend_from_slice(&outer_proofs[0]);
        assert!(check_proof(&outer_root, &inner[1], &combined));
    }
}

//! The final collective signature and its verification.
//!
//! The root closes a round by assembling `(c, r)` together with the
//! round's exception accounting. An external verifier needs only the
//! participant key list and the signed global root: it reconstructs the
//! aggregate commitment and recomputes the challenge.

use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::Identity;

use cosi_common::suite::{encode_point, hash_to_scalar};
use cosi_common::HashId;

/// Domain tag for the Schnorr challenge hash.
pub const CHALLENGE_DOMAIN: &str = "cosi-challenge-v1";

/// The Schnorr challenge: a hash binding the global Merkle root and the
/// global aggregate commitment.
#[must_use]
pub fn compute_challenge(mt_root: &HashId, v_hat: &RistrettoPoint) -> Scalar {
    hash_to_scalar(CHALLENGE_DOMAIN, &[mt_root.as_ref(), &encode_point(v_hat)])
}

/// A completed round's signature over its global Merkle root.
#[derive(Debug, Clone)]
pub struct CollectiveSignature {
    pub view: u64,
    pub round: u64,
    /// The global Merkle root the challenge commits to.
    pub mt_root: HashId,
    pub c: Scalar,
    pub r: Scalar,
    /// Summed commitments of subtrees that committed but failed later.
    pub exception_v: RistrettoPoint,
    /// Summed public keys of those same subtrees.
    pub exception_x: RistrettoPoint,
    /// Every failed node's long-term public key, individually.
    pub exception_keys: Vec<RistrettoPoint>,
}

impl CollectiveSignature {
    /// Verify against the full participant key list.
    ///
    /// Nodes named in `exception_keys` are excluded from the aggregate
    /// key; subtrees that committed before failing have their commitment
    /// restored via `exception_v`. The reconstructed global commitment
    /// must hash back to `c`:
    ///
    /// ```text
    /// V̂ = r·G + c·(ΣX − ΣE_keys) + exception_v
    /// c == H(mt_root ‖ V̂)
    /// ```
    #[must_use]
    pub fn verify(&self, participant_keys: &[RistrettoPoint]) -> bool {
        let x_full = participant_keys
            .iter()
            .fold(RistrettoPoint::identity(), |acc, key| acc + key);
        let x_excluded = self
            .exception_keys
            .iter()
            .fold(RistrettoPoint::identity(), |acc, key| acc + key);
        let x_eff = x_full - x_excluded;

        let v_hat = RistrettoPoint::mul_base(&self.r) + x_eff * self.c + self.exception_v;
        compute_challenge(&self.mt_root, &v_hat) == self.c
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cosi_common::suite::{random_scalar, Keypair};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn sign_flat(
        keys: &[Keypair],
        absent: &[usize],
        mt_root: HashId,
    ) -> (CollectiveSignature, Vec<RistrettoPoint>) {
        // A flat one-level collective signature: every present node
        // contributes a nonce at commit and a response share.
        let mut rng = ChaCha8Rng::seed_from_u64(99);
        let nonces: Vec<Scalar> = keys.iter().map(|_| random_scalar(&mut rng)).collect();

        let v_hat = keys
            .iter()
            .enumerate()
            .filter(|(i, _)| !absent.contains(i))
            .fold(RistrettoPoint::identity(), |acc, (i, _)| {
                acc + RistrettoPoint::mul_base(&nonces[i])
            });
        let c = compute_challenge(&mt_root, &v_hat);
        let r: Scalar = keys
            .iter()
            .enumerate()
            .filter(|(i, _)| !absent.contains(i))
            .map(|(i, key)| nonces[i] - c * key.secret)
            .sum();

        let sig = CollectiveSignature {
            view: 0,
            round: 1,
            mt_root,
            c,
            r,
            exception_v: RistrettoPoint::identity(),
            exception_x: RistrettoPoint::identity(),
            exception_keys: absent.iter().map(|&i| keys[i].public).collect(),
        };
        let publics = keys.iter().map(|k| k.public).collect();
        (sig, publics)
    }

    #[test]
    fn test_healthy_signature_verifies() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let keys: Vec<Keypair> = (0..5).map(|_| Keypair::generate(&mut rng)).collect();
        let (sig, publics) = sign_flat(&keys, &[], HashId::hash(b"root"));
        assert!(sig.verify(&publics));
    }

    #[test]
    fn test_commit_absentees_verify_via_key_exclusion() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let keys: Vec<Keypair> = (0..6).map(|_| Keypair::generate(&mut rng)).collect();
        let (sig, publics) = sign_flat(&keys, &[2, 5], HashId::hash(b"root"));
        assert_eq!(sig.exception_keys.len(), 2);
        assert!(sig.verify(&publics));
    }

    #[test]
    fn test_response_absentee_verifies_via_exception_v() {
        // Node 1 committed (its nonce is in V̂) but never responded: its
        // key is excluded and its commitment restored through exception_v.
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let keys: Vec<Keypair> = (0..4).map(|_| Keypair::generate(&mut rng)).collect();
        let nonces: Vec<Scalar> = keys.iter().map(|_| random_scalar(&mut rng)).collect();
        let mt_root = HashId::hash(b"root");

        let v_hat = nonces
            .iter()
            .fold(RistrettoPoint::identity(), |acc, v| acc + RistrettoPoint::mul_base(v));
        let c = compute_challenge(&mt_root, &v_hat);
        let r: Scalar = keys
            .iter()
            .zip(&nonces)
            .enumerate()
            .filter(|(i, _)| *i != 1)
            .map(|(_, (key, v))| v - c * key.secret)
            .sum();

        let sig = CollectiveSignature {
            view: 0,
            round: 1,
            mt_root,
            c,
            r,
            exception_v: RistrettoPoint::mul_base(&nonces[1]),
            exception_x: keys[1].public,
            exception_keys: vec![keys[1].public],
        };
        let publics: Vec<RistrettoPoint> = keys.iter().map(|k| k.public).collect();
        assert!(sig.verify(&publics));
    }

    #[test]
    fn test_wrong_root_fails() {
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let keys: Vec<Keypair> = (0..3).map(|_| Keypair::generate(&mut rng)).collect();
        let (mut sig, publics) = sign_flat(&keys, &[], HashId::hash(b"root"));
        sig.mt_root = HashId::hash(b"forged-root");
        assert!(!sig.verify(&publics));
    }

    #[test]
    fn test_unreported_absentee_fails() {
        // A node silently missing from the aggregate without an exception
        // entry must not verify.
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let keys: Vec<Keypair> = (0..4).map(|_| Keypair::generate(&mut rng)).collect();
        let (mut sig, publics) = sign_flat(&keys, &[3], HashId::hash(b"root"));
        sig.exception_keys.clear();
        assert!(!sig.verify(&publics));
    }

    #[test]
    fn test_deterministic_under_seeded_nonces() {
        let mut rng = ChaCha8Rng::seed_from_u64(6);
        let keys: Vec<Keypair> = (0..3).map(|_| Keypair::generate(&mut rng)).collect();
        let (sig_a, _) = sign_flat(&keys, &[], HashId::hash(b"root"));
        let (sig_b, _) = sign_flat(&keys, &[], HashId::hash(b"root"));
        assert_eq!(sig_a.c, sig_b.c);
        assert_eq!(sig_a.r, sig_b.r);
    }
}

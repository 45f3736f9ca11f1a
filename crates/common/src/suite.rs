//! Crypto suite: the Ristretto group plus SHA3 hashing.
//!
//! The whole stack signs over a single prime-order group. This module
//! wraps the handful of operations the protocol needs — keypairs, the
//! canonical 32-byte point/scalar codecs, and the hash-to-scalar used for
//! Schnorr challenges — so the protocol crates never touch raw encodings.
//!
//! Wire types carry points and scalars as `[u8; 32]`; the codecs here are
//! the only place those bytes are interpreted, and both reject
//! non-canonical encodings.

use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use rand::{CryptoRng, RngCore};
use sha3::{Digest, Sha3_512};
use thiserror::Error;

/// Canonical compressed-point length.
pub const POINT_SIZE: usize = 32;

/// Canonical scalar length.
pub const SCALAR_SIZE: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("invalid group element encoding")]
    InvalidPoint,

    #[error("non-canonical scalar encoding")]
    InvalidScalar,
}

/// A long-term Schnorr keypair over the suite's group.
#[derive(Clone)]
pub struct Keypair {
    pub secret: Scalar,
    pub public: RistrettoPoint,
}

impl Keypair {
    /// Generate a fresh keypair from the given randomness source.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let secret = Scalar::random(rng);
        Self::from_secret(secret)
    }

    /// Derive the keypair for a known secret scalar.
    #[must_use]
    pub fn from_secret(secret: Scalar) -> Self {
        Keypair {
            secret,
            public: RistrettoPoint::mul_base(&secret),
        }
    }
}

/// Canonical compressed encoding of a point.
#[must_use]
pub fn encode_point(point: &RistrettoPoint) -> [u8; POINT_SIZE] {
    point.compress().to_bytes()
}

/// Decode a canonical compressed point, rejecting invalid encodings.
pub fn decode_point(bytes: &[u8; POINT_SIZE]) -> Result<RistrettoPoint, CryptoError> {
    CompressedRistretto(*bytes)
        .decompress()
        .ok_or(CryptoError::InvalidPoint)
}

/// Canonical little-endian encoding of a scalar.
#[must_use]
pub fn encode_scalar(scalar: &Scalar) -> [u8; SCALAR_SIZE] {
    scalar.to_bytes()
}

/// Decode a canonical scalar, rejecting out-of-range encodings.
pub fn decode_scalar(bytes: &[u8; SCALAR_SIZE]) -> Result<Scalar, CryptoError> {
    Option::<Scalar>::from(Scalar::from_canonical_bytes(*bytes)).ok_or(CryptoError::InvalidScalar)
}

/// Hash domain-separated input to a uniformly distributed scalar.
///
/// SHA3-512 output reduced mod the group order keeps the distribution
/// unbiased. The Schnorr challenge is
/// `hash_to_scalar("cosi-challenge", &[mt_root, V])`.
#[must_use]
pub fn hash_to_scalar(domain: &str, parts: &[&[u8]]) -> Scalar {
    let mut hasher = Sha3_512::new();
    hasher.update(domain.as_bytes());
    for part in parts {
        hasher.update(part);
    }
    let wide: [u8; 64] = hasher.finalize().into();
    Scalar::from_bytes_mod_order_wide(&wide)
}

/// Draw a fresh random scalar (per-round nonces).
pub fn random_scalar<R: RngCore + CryptoRng>(rng: &mut R) -> Scalar {
    Scalar::random(rng)
}

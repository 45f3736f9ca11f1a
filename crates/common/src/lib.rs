//! # cosi-common
//!
//! Shared primitives for the collective-signing stack.
//!
//! ## Modules
//! - `hashid`: fixed 32-byte hash identifiers (SHA3-256)
//! - `merkle`: order-independent Merkle trees with per-leaf proofs
//! - `suite`: Ristretto crypto suite (keys, group ops, hash-to-scalar)
//! - `config`: TOML topology and launcher configuration
//!
//! Everything here is deterministic: identical inputs produce identical
//! bytes regardless of platform or insertion order. The protocol crates
//! rely on that for cross-node agreement on Merkle roots and challenges.

pub mod config;
pub mod hashid;
pub mod merkle;
pub mod suite;

pub use config::{Config, ConfigError, HostSpec};
pub use hashid::{HashId, HASH_SIZE};
pub use merkle::{check_proof, proof_tree, Proof};
pub use suite::{
    decode_point, decode_scalar, encode_point, encode_scalar, hash_to_scalar, CryptoError,
    Keypair, POINT_SIZE, SCALAR_SIZE,
};

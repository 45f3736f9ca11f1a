//! Fixed-size hash identifiers.
//!
//! A `HashId` is the 32-byte output of SHA3-256. It is the unit of every
//! Merkle computation in the stack: client digests, per-node local roots,
//! subtree roots, the global root, and the accountability chain all share
//! this type. Ordering is plain byte-lexicographic, which is what the
//! Merkle layer sorts by before hashing.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};

/// Byte length of every hash in the system (SHA3-256).
pub const HASH_SIZE: usize = 32;

/// A 32-byte SHA3-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HashId([u8; HASH_SIZE]);

impl HashId {
    /// The all-zero id. Used as Merkle padding and as the first back link.
    pub const ZERO: HashId = HashId([0u8; HASH_SIZE]);

    #[must_use]
    pub const fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
        HashId(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; HASH_SIZE]
    }

    /// Hash a sequence of byte strings into one id.
    ///
    /// The parts are absorbed in argument order with no separators; callers
    /// that need domain separation prepend a tag as the first part.
    #[must_use]
    pub fn hash_parts(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha3_256::new();
        for part in parts {
            hasher.update(part);
        }
        HashId(hasher.finalize().into())
    }

    /// Hash a single byte string.
    #[must_use]
    pub fn hash(data: &[u8]) -> Self {
        Self::hash_parts(&[data])
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for HashId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short prefix is enough for logs; full value via to_hex().
        write!(f, "{}", &self.to_hex()[..12])
    }
}

impl fmt::Debug for HashId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashId({})", self.to_hex())
    }
}

impl AsRef<[u8]> for HashId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; HASH_SIZE]> for HashId {
    fn from(bytes: [u8; HASH_SIZE]) -> Self {
        HashId(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_is_zero() {
        assert!(HashId::ZERO.is_zero());
        assert!(!HashId::hash(b"x").is_zero());
    }

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(HashId::hash(b"hello"), HashId::hash(b"hello"));
        assert_ne!(HashId::hash(b"hello"), HashId::hash(b"world"));
    }

    #[test]
    fn test_hash_parts_order_matters() {
        let ab = HashId::hash_parts(&[b"a", b"b"]);
        let ba = HashId::hash_parts(&[b"b", b"a"]);
        assert_ne!(ab, ba);
    }

    #[test]
    fn test_ordering_is_lexicographic() {
        let lo = HashId::from_bytes([0x01; HASH_SIZE]);
        let hi = HashId::from_bytes([0x02; HASH_SIZE]);
        assert!(lo < hi);
    }

    #[test]
    fn test_hex_roundtrip() {
        let id = HashId::hash(b"roundtrip");
        let hex = id.to_hex();
        assert_eq!(hex.len(), 64);
        let bytes: [u8; HASH_SIZE] = hex::decode(&hex).unwrap().try_into().unwrap();
        assert_eq!(HashId::from_bytes(bytes), id);
    }

    #[test]
    fn test_hashid_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<HashId>();
    }
}

//! Core chain types and hashing for nocta-node.

pub mod block;
pub mod serialization;

use std::fmt;

use sha2::{Digest, Sha256};

pub use block::{BlockTemplate, PreparedBlock, RawBlock};
pub use serialization::{DecodeError, Decoder, Encoder};

/// Block height. Genesis is height 0.
pub type Height = u64;

pub const HASH_SIZE: usize = 32;

/// A 32-byte identifier: block ids, transaction hashes, PoW hashes.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash(pub [u8; HASH_SIZE]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; HASH_SIZE]);

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn from_hex(s: &str) -> Option<Hash> {
        let raw = hex::decode(s).ok()?;
        let bytes: [u8; HASH_SIZE] = raw.try_into().ok()?;
        Some(Hash(bytes))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; HASH_SIZE]
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps log lines readable.
        write!(f, "{}..", hex::encode(&self.0[..8]))
    }
}

pub fn sha256(data: &[u8]) -> Hash {
    let digest = Sha256::digest(data);
    let mut out = [0u8; HASH_SIZE];
    out.copy_from_slice(&digest);
    Hash(out)
}

pub fn sha256d(data: &[u8]) -> Hash {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; HASH_SIZE];
    out.copy_from_slice(&second);
    Hash(out)
}

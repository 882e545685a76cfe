//! Proof-of-work slow hash.
//!
//! The nocta PoW is a memory-touching hash: a scratchpad is filled from
//! the block blob, mixed with data-dependent reads, then folded into a
//! final digest. Verifying one block costs a few hundred sha256
//! compressions, which is why verification runs on a dedicated worker
//! pool during sync.

use sha2::{Digest, Sha256};

use crate::primitives::{Hash, HASH_SIZE};

const SCRATCHPAD_SIZE: usize = 64 * 1024;
const MIX_ROUNDS: usize = 4096;

/// Reusable PoW state. Allocating the scratchpad once per worker thread
/// keeps verification from thrashing the allocator.
pub struct PowContext {
    scratchpad: Vec<u8>,
}

impl PowContext {
    pub fn new() -> Self {
        Self {
            scratchpad: vec![0u8; SCRATCHPAD_SIZE],
        }
    }

    /// Slow hash of a block's hashing blob.
    pub fn slow_hash(&mut self, data: &[u8]) -> Hash {
        let seed = Sha256::digest(data);

        // Fill the scratchpad by chained hashing from the seed.
        let mut block: [u8; HASH_SIZE] = seed.into();
        for chunk in self.scratchpad.chunks_exact_mut(HASH_SIZE) {
            block = Sha256::digest(block).into();
            chunk.copy_from_slice(&block);
        }

        // Data-dependent mixing passes.
        let mask = SCRATCHPAD_SIZE / HASH_SIZE - 1;
        let mut mix: [u8; HASH_SIZE] = seed.into();
        for _ in 0..MIX_ROUNDS {
            let idx = (u32::from_le_bytes(mix[..4].try_into().unwrap()) as usize & mask)
                * HASH_SIZE;
            let slot = &mut self.scratchpad[idx..idx + HASH_SIZE];
            for (m, s) in mix.iter_mut().zip(slot.iter()) {
                *m ^= *s;
            }
            mix = Sha256::digest(mix).into();
            slot.copy_from_slice(&mix);
        }

        let mut hasher = Sha256::new();
        hasher.update(seed);
        hasher.update(mix);
        Hash(hasher.finalize().into())
    }
}

impl Default for PowContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Target comparison: the hash is a 256-bit little-endian integer and
/// must not exceed the target.
pub fn meets_target(hash: &Hash, target: &Hash) -> bool {
    for i in (0..HASH_SIZE).rev() {
        match hash.0[i].cmp(&target.0[i]) {
            std::cmp::Ordering::Less => return true,
            std::cmp::Ordering::Greater => return false,
            std::cmp::Ordering::Equal => {}
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slow_hash_is_deterministic() {
        let mut a = PowContext::new();
        let mut b = PowContext::new();
        assert_eq!(a.slow_hash(b"blob"), b.slow_hash(b"blob"));
        assert_ne!(a.slow_hash(b"blob"), a.slow_hash(b"blob2"));
    }

    #[test]
    fn context_reuse_matches_fresh_context() {
        let mut reused = PowContext::new();
        reused.slow_hash(b"first");
        let second = reused.slow_hash(b"second");
        assert_eq!(second, PowContext::new().slow_hash(b"second"));
    }

    #[test]
    fn target_comparison() {
        let zero = Hash::ZERO;
        let max = Hash([0xff; HASH_SIZE]);
        assert!(meets_target(&zero, &max));
        assert!(meets_target(&max, &max));
        assert!(!meets_target(&max, &zero));

        let mut just_above = Hash::ZERO;
        just_above.0[HASH_SIZE - 1] = 1;
        assert!(!meets_target(&just_above, &Hash::ZERO));
        assert!(meets_target(&Hash::ZERO, &just_above));
    }
}

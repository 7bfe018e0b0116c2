//! Hash functions for 64-bit keys.
//!
//! The probe sequence of a mapped table must be stable across process
//! restarts, so the default hasher is deterministic: the same key always
//! lands on the same home slot no matter when the file is reopened.
//! Randomly seeded hashers (e.g. `RandomState`) would scatter previously
//! written keys on reopen.

use std::hash::{BuildHasherDefault, Hasher};

/// The default build hasher for [`HashMap`](crate::HashMap).
pub type DefaultHashBuilder = BuildHasherDefault<XxHash64>;

const PRIME64_1: u64 = 0x9e3779b185ebca87;
const PRIME64_2: u64 = 0xc2b2ae3d27d4eb4f;
const PRIME64_3: u64 = 0x165667b19e3779f9;
const PRIME64_4: u64 = 0x85ebca77c2b2ae63;
const PRIME64_5: u64 = 0x27d4eb2f165667c5;

/// An implementation of the xxHash64 round function, specialized for the
/// short fixed-width input this crate hashes (a single `u64` key).
pub struct XxHash64 {
    state: u64,
}

impl Default for XxHash64 {
    #[inline]
    fn default() -> XxHash64 {
        XxHash64 { state: 0 }
    }
}

impl Hasher for XxHash64 {
    #[inline]
    fn finish(&self) -> u64 {
        self.state
    }

    #[inline]
    fn write_u64(&mut self, value: u64) {
        self.state = xxh64_word(value, self.state);
    }

    #[inline]
    fn write(&mut self, bytes: &[u8]) {
        self.state = xxh64_word(load_u64_le(bytes), self.state);
    }
}

// The xxh64 avalanche for an 8-byte input.
#[inline]
fn xxh64_word(value: u64, seed: u64) -> u64 {
    let mut hash = seed.wrapping_add(PRIME64_5).wrapping_add(8);

    let lane = value
        .wrapping_mul(PRIME64_2)
        .rotate_left(31)
        .wrapping_mul(PRIME64_1);
    hash ^= lane;
    hash = hash
        .rotate_left(27)
        .wrapping_mul(PRIME64_1)
        .wrapping_add(PRIME64_4);

    hash ^= hash >> 33;
    hash = hash.wrapping_mul(PRIME64_2);
    hash ^= hash >> 29;
    hash = hash.wrapping_mul(PRIME64_3);
    hash ^= hash >> 32;
    hash
}

#[inline]
fn load_u64_le(bytes: &[u8]) -> u64 {
    let mut word = [0u8; 8];
    let len = bytes.len().min(8);
    word[..len].copy_from_slice(&bytes[..len]);
    u64::from_le_bytes(word)
}

// This is not really a hasher, it just returns the key itself. Useful when
// keys are known to be well distributed, and in tests that need to force
// every key onto the same probe chain.
pub struct IdentityHasher(u64);

impl Default for IdentityHasher {
    #[inline]
    fn default() -> IdentityHasher {
        IdentityHasher(0)
    }
}

impl Hasher for IdentityHasher {
    #[inline]
    fn finish(&self) -> u64 {
        self.0
    }

    #[inline]
    fn write_u64(&mut self, value: u64) {
        self.0 = value;
    }

    #[inline]
    fn write(&mut self, bytes: &[u8]) {
        self.0 = load_u64_le(bytes);
    }
}

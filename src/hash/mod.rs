//! Hashing used for key placement
//!
//! Every node in the cluster must agree on where a key lives, so the hash is
//! a fixed multiplicative byte hash rather than a randomly seeded one.

pub mod consistent_hash;

pub use consistent_hash::ConsistentHash;

const SEED: u32 = 388_650_013;
const SCALE: u32 = 388_650_179;
const HARDENER: u32 = 1_176_845_762;

/// Hash a byte string
pub fn hash(data: &[u8]) -> u32 {
    hash_parts(data, &[])
}

/// Hash the concatenation of two byte strings without allocating
pub fn hash_parts(first: &[u8], second: &[u8]) -> u32 {
    let h = first
        .iter()
        .chain(second)
        .fold(SEED, |h, &byte| h.wrapping_mul(SCALE).wrapping_add(byte as u32));
    h ^ HARDENER
}

/// Hash an integer through its little-endian bytes
pub fn hash_u32(value: u32) -> u32 {
    hash(&value.to_le_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input() {
        assert_eq!(hash(&[]), SEED ^ HARDENER);
    }

    #[test]
    fn test_single_byte() {
        let expected = SEED.wrapping_mul(SCALE).wrapping_add(b'a' as u32) ^ HARDENER;
        assert_eq!(hash(b"a"), expected);
    }

    #[test]
    fn test_parts_equal_concatenation() {
        assert_eq!(hash_parts(b"key-", b"0042"), hash(b"key-0042"));
        assert_eq!(hash_parts(b"", b"abc"), hash(b"abc"));
    }

    #[test]
    fn test_deterministic_and_spread() {
        assert_eq!(hash(b"hello"), hash(b"hello"));
        assert_ne!(hash(b"hello"), hash(b"hellp"));
        assert_ne!(hash_u32(1), hash_u32(2));
    }
}

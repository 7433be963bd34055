//! Consistent hash ring
//!
//! Each item occupies `replicas` positions on a 32-bit ring; a lookup walks
//! clockwise from the key's hash to the first occupied position.

use std::collections::BTreeMap;

use crate::hash::hash_parts;

/// Items that can be placed on a ring
pub trait RingItem: Clone {
    /// Stable byte identity of the item
    fn ring_bytes(&self) -> Vec<u8>;
}

impl RingItem for u32 {
    fn ring_bytes(&self) -> Vec<u8> {
        self.to_le_bytes().to_vec()
    }
}

impl RingItem for usize {
    fn ring_bytes(&self) -> Vec<u8> {
        (*self as u64).to_le_bytes().to_vec()
    }
}

impl RingItem for String {
    fn ring_bytes(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

impl RingItem for std::net::SocketAddrV4 {
    fn ring_bytes(&self) -> Vec<u8> {
        let mut bytes = self.ip().octets().to_vec();
        bytes.extend_from_slice(&self.port().to_be_bytes());
        bytes
    }
}

#[derive(Debug, Clone)]
pub struct ConsistentHash<T> {
    replicas: u32,
    ring: BTreeMap<u32, T>,
}

impl<T: RingItem> Default for ConsistentHash<T> {
    fn default() -> Self {
        Self::new(1)
    }
}

impl<T: RingItem> ConsistentHash<T> {
    /// Create an empty ring with `replicas` positions per item
    pub fn new(replicas: u32) -> Self {
        Self {
            replicas: replicas.max(1),
            ring: BTreeMap::new(),
        }
    }

    pub fn replicas(&self) -> u32 {
        self.replicas
    }

    fn position(item: &T, replica: u32) -> u32 {
        hash_parts(&item.ring_bytes(), &replica.to_le_bytes())
    }

    pub fn add(&mut self, item: T) {
        for replica in 0..self.replicas {
            self.ring.insert(Self::position(&item, replica), item.clone());
        }
    }

    pub fn remove(&mut self, item: &T) {
        for replica in 0..self.replicas {
            self.ring.remove(&Self::position(item, replica));
        }
    }

    /// Item owning a precomputed hash value
    pub fn get_by_hash(&self, hash: u32) -> Option<&T> {
        self.ring
            .range(hash..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, item)| item)
    }

    /// Item owning a key
    pub fn get(&self, key: &[u8]) -> Option<&T> {
        self.get_by_hash(crate::hash::hash(key))
    }

    /// Number of occupied ring positions
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(count: usize) -> Vec<Vec<u8>> {
        (0..count).map(|i| format!("key-{}", i).into_bytes()).collect()
    }

    #[test]
    fn test_empty_ring() {
        let ring: ConsistentHash<u32> = ConsistentHash::default();
        assert!(ring.get(b"anything").is_none());
    }

    #[test]
    fn test_lookup_returns_added_item() {
        let mut ring = ConsistentHash::new(16);
        for item in 0u32..5 {
            ring.add(item);
        }
        assert_eq!(ring.len(), 80);
        for key in keys(200) {
            assert!(*ring.get(&key).unwrap() < 5);
        }
    }

    #[test]
    fn test_wraps_past_highest_position() {
        let mut ring = ConsistentHash::new(1);
        ring.add(7u32);
        assert_eq!(ring.get_by_hash(u32::MAX), Some(&7));
        assert_eq!(ring.get_by_hash(0), Some(&7));
    }

    #[test]
    fn test_remove_moves_only_its_keys() {
        let mut ring = ConsistentHash::new(32);
        for item in 0u32..8 {
            ring.add(item);
        }
        let before: Vec<u32> = keys(1000).iter().map(|k| *ring.get(k).unwrap()).collect();

        ring.remove(&3);
        let after: Vec<u32> = keys(1000).iter().map(|k| *ring.get(k).unwrap()).collect();

        for (old, new) in before.iter().zip(&after) {
            if *old != 3 {
                assert_eq!(old, new);
            } else {
                assert_ne!(*new, 3);
            }
        }
    }

    #[test]
    fn test_replicas_spread_load() {
        let mut ring = ConsistentHash::new(64);
        for item in 0u32..4 {
            ring.add(item);
        }
        let mut counts = [0usize; 4];
        for i in 0u32..4000 {
            counts[*ring.get_by_hash(crate::hash::hash_u32(i)).unwrap() as usize] += 1;
        }
        assert!(counts.iter().all(|&c| c > 0), "{:?}", counts);
    }
}

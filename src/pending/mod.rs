//! Pending request tables
//!
//! Every hop of a request records what it sent in a [`PendingMap`] until the
//! matching response arrives. A map holds at most one entry per
//! `(instance_id, request_id)` pair; the entry's value owns its key (and
//! value) bytes, and erasing it hands that ownership to the caller, so a
//! buffer is released exactly once.

pub mod router;
pub mod storage;
pub mod values;

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::net::SocketAddrV4;

use parking_lot::Mutex;
use tracing::warn;

pub use router::{PendingType, RouterPending};
pub use storage::{StoragePending, StoragePendingType};
pub use values::{
    AckInfo, ChunkRequest, ChunkUpdate, DegradedLockData, DegradedOp, Key, KeyValue, KeyValueUpdate, RemapList,
};

/// Opaque handle of whoever issued a request (a socket, a peer, a test)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Requester(pub u64);

impl From<SocketAddrV4> for Requester {
    /// Requests a router issues on behalf of a storage server
    fn from(addr: SocketAddrV4) -> Self {
        Requester((u64::from(u32::from(*addr.ip())) << 16) | u64::from(addr.port()))
    }
}

/// Identity of one in-flight operation at one hop
///
/// Two identifiers are equal when their `(instance_id, request_id)` pairs
/// are equal; the parent ids, timestamp and requester are payload.
#[derive(Debug, Clone, Copy)]
pub struct PendingIdentifier {
    pub instance_id: u16,
    pub parent_instance_id: u16,
    pub request_id: u32,
    pub parent_request_id: u32,
    pub timestamp: u32,
    pub requester: Option<Requester>,
}

impl PendingIdentifier {
    pub fn new(
        instance_id: u16,
        parent_instance_id: u16,
        request_id: u32,
        parent_request_id: u32,
        requester: Option<Requester>,
    ) -> Self {
        Self {
            instance_id,
            parent_instance_id,
            request_id,
            parent_request_id,
            timestamp: 0,
            requester,
        }
    }

    /// Identifier of a request that is its own parent
    pub fn root(instance_id: u16, request_id: u32, requester: Option<Requester>) -> Self {
        Self::new(instance_id, instance_id, request_id, request_id, requester)
    }

    pub fn with_timestamp(mut self, timestamp: u32) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn id(&self) -> (u16, u32) {
        (self.instance_id, self.request_id)
    }
}

impl PartialEq for PendingIdentifier {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for PendingIdentifier {}

impl Hash for PendingIdentifier {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

/// Values stored in pending maps
pub trait PendingValue: Send {
    /// Key bytes used when a lookup must match on the key instead of the
    /// requester
    fn key_bytes(&self) -> Option<&[u8]> {
        None
    }
}

/// Extra conditions an entry must satisfy to be erased
#[derive(Debug, Clone, Copy, Default)]
pub struct Match<'a> {
    pub requester: Option<Requester>,
    pub key: Option<&'a [u8]>,
}

impl<'a> Match<'a> {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn requester(requester: Requester) -> Self {
        Self {
            requester: Some(requester),
            key: None,
        }
    }

    pub fn key(key: &'a [u8]) -> Self {
        Self {
            requester: None,
            key: Some(key),
        }
    }

    fn accepts<V: PendingValue>(&self, pid: &PendingIdentifier, value: &V) -> bool {
        if let Some(requester) = self.requester {
            if pid.requester != Some(requester) {
                return false;
            }
        }
        match self.key {
            Some(key) => value.key_bytes() == Some(key),
            None => true,
        }
    }
}

/// Mutex-guarded map of in-flight requests of one kind
pub struct PendingMap<V> {
    name: &'static str,
    entries: Mutex<HashMap<(u16, u32), (PendingIdentifier, V)>>,
}

impl<V: PendingValue> PendingMap<V> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Track a request; `false` if the `(instance_id, request_id)` pair is
    /// already tracked, in which case the map is unchanged
    pub fn insert(&self, pid: PendingIdentifier, value: V) -> bool {
        let mut entries = self.entries.lock();
        if entries.contains_key(&pid.id()) {
            warn!(
                table = self.name,
                instance_id = pid.instance_id,
                request_id = pid.request_id,
                "duplicate pending request ignored"
            );
            return false;
        }
        entries.insert(pid.id(), (pid, value));
        true
    }

    /// Remove a request and take ownership of its value
    pub fn erase(&self, instance_id: u16, request_id: u32, condition: Match<'_>) -> Option<(PendingIdentifier, V)> {
        let mut entries = self.entries.lock();
        let accepted = entries
            .get(&(instance_id, request_id))
            .map_or(false, |(pid, value)| condition.accepts(pid, value));
        if accepted {
            entries.remove(&(instance_id, request_id))
        } else {
            None
        }
    }

    /// Identifier of a tracked request
    pub fn find(&self, instance_id: u16, request_id: u32) -> Option<PendingIdentifier> {
        self.entries.lock().get(&(instance_id, request_id)).map(|(pid, _)| *pid)
    }

    /// Run `f` on a tracked request under the table lock
    pub fn with<R>(&self, instance_id: u16, request_id: u32, f: impl FnOnce(&PendingIdentifier, &V) -> R) -> Option<R> {
        self.entries
            .lock()
            .get(&(instance_id, request_id))
            .map(|(pid, value)| f(pid, value))
    }

    /// 1 if the pair is tracked, 0 otherwise
    pub fn count(&self, instance_id: u16, request_id: u32) -> usize {
        usize::from(self.entries.lock().contains_key(&(instance_id, request_id)))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Visit every entry under the table lock
    pub fn scan(&self, mut f: impl FnMut(&PendingIdentifier, &V)) {
        for (pid, value) in self.entries.lock().values() {
            f(pid, value);
        }
    }

    /// Whether any entry satisfies `predicate`
    pub fn any(&self, mut predicate: impl FnMut(&PendingIdentifier, &V) -> bool) -> bool {
        self.entries.lock().values().any(|(pid, value)| predicate(pid, value))
    }

    /// Remove and return every entry for which `predicate` is true
    pub fn extract(&self, mut predicate: impl FnMut(&PendingIdentifier, &V) -> bool) -> Vec<(PendingIdentifier, V)> {
        let mut entries = self.entries.lock();
        let ids: Vec<(u16, u32)> = entries
            .iter()
            .filter(|(_, (pid, value))| predicate(pid, value))
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter().filter_map(|id| entries.remove(&id)).collect()
    }

    /// Keep only the entries for which `predicate` is true
    pub fn retain(&self, mut predicate: impl FnMut(&PendingIdentifier, &V) -> bool) {
        self.entries.lock().retain(|_, (pid, value)| predicate(pid, value));
    }

    /// Remove every entry
    pub fn drain(&self) -> Vec<(PendingIdentifier, V)> {
        self.entries.lock().drain().map(|(_, entry)| entry).collect()
    }
}

impl PendingMap<Key> {
    /// Track a request, copying the borrowed key into an owned buffer
    pub fn insert_dup(&self, pid: PendingIdentifier, key: &[u8]) -> bool {
        self.insert(pid, Key::dup(key, pid.requester))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_identifier_equality_ignores_payload() {
        let a = PendingIdentifier::new(1, 9, 100, 900, Some(Requester(1)));
        let b = PendingIdentifier::new(1, 2, 100, 3, None).with_timestamp(5);
        let c = PendingIdentifier::new(1, 9, 101, 900, Some(Requester(1)));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_insert_rejects_duplicate() {
        let map = PendingMap::new("test");
        let pid = PendingIdentifier::root(3, 7, None);
        assert!(map.insert(pid, Key::dup(b"a", None)));
        assert!(!map.insert(pid, Key::dup(b"b", None)));
        assert_eq!(map.len(), 1);

        let (_, key) = map.erase(3, 7, Match::any()).unwrap();
        assert_eq!(key.as_bytes(), b"a");
    }

    #[test]
    fn test_concurrent_insert_at_most_once() {
        let map = Arc::new(PendingMap::new("test"));
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let map = Arc::clone(&map);
                thread::spawn(move || {
                    let pid = PendingIdentifier::root(1, 42, Some(Requester(i)));
                    map.insert(pid, Key::dup(b"shared", Some(Requester(i))))
                })
            })
            .collect();

        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&inserted| inserted)
            .count();
        assert_eq!(successes, 1);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_erase_conditions() {
        let map = PendingMap::new("test");
        map.insert(PendingIdentifier::root(1, 1, Some(Requester(10))), Key::dup(b"k1", None));

        assert!(map.erase(1, 1, Match::requester(Requester(11))).is_none());
        assert!(map.erase(1, 1, Match::key(b"other")).is_none());
        assert_eq!(map.count(1, 1), 1);

        let (pid, key) = map.erase(1, 1, Match::key(b"k1")).unwrap();
        assert_eq!(pid.requester, Some(Requester(10)));
        assert_eq!(key.as_bytes(), b"k1");
        assert_eq!(map.count(1, 1), 0);

        // A second erase finds nothing
        assert!(map.erase(1, 1, Match::any()).is_none());
    }

    #[test]
    fn test_extract_and_scan() {
        let map = PendingMap::new("test");
        for request_id in 0..6 {
            let pid = PendingIdentifier::new(2, 1, request_id, 100 + request_id, None);
            map.insert(pid, Key::dup(&[request_id as u8], None));
        }

        let removed = map.extract(|pid, _| pid.request_id % 2 == 0);
        assert_eq!(removed.len(), 3);
        assert_eq!(map.len(), 3);

        let mut parents = Vec::new();
        map.scan(|pid, _| parents.push(pid.parent_request_id));
        parents.sort_unstable();
        assert_eq!(parents, vec![101, 103, 105]);
        assert!(map.any(|pid, _| pid.parent_request_id == 103));
        assert_eq!(map.with(2, 3, |_, key| key.as_bytes().to_vec()), Some(vec![3]));

        map.retain(|pid, _| pid.request_id != 1);
        assert_eq!(map.len(), 2);
        assert_eq!(map.drain().len(), 2);
        assert!(map.is_empty());
    }

    #[test]
    fn test_insert_dup_records_requester() {
        let map = PendingMap::new("test");
        let pid = PendingIdentifier::root(1, 5, Some(Requester(8)));
        assert!(map.insert_dup(pid, b"key"));
        let (_, key) = map.erase(1, 5, Match::requester(Requester(8))).unwrap();
        assert_eq!(key.requester, Some(Requester(8)));
    }
}

//! Storage-node pending tables

use std::fmt;

use super::values::{ChunkRequest, ChunkUpdate, DegradedOp};
use super::PendingMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoragePendingType {
    PeerUpdate,
    PeerDel,
    PeerGetChunk,
    PeerSetChunk,
    DegradedOps,
}

impl fmt::Display for StoragePendingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StoragePendingType::PeerUpdate => "peer_update",
            StoragePendingType::PeerDel => "peer_del",
            StoragePendingType::PeerGetChunk => "peer_get_chunk",
            StoragePendingType::PeerSetChunk => "peer_set_chunk",
            StoragePendingType::DegradedOps => "degraded_ops",
        };
        f.write_str(name)
    }
}

/// Requests a storage node sent to its peers
pub struct StoragePending {
    pub peer_update: PendingMap<ChunkUpdate>,
    pub peer_del: PendingMap<ChunkUpdate>,
    pub peer_get_chunk: PendingMap<ChunkRequest>,
    pub peer_set_chunk: PendingMap<ChunkRequest>,
    pub degraded_ops: PendingMap<DegradedOp>,
}

impl Default for StoragePending {
    fn default() -> Self {
        Self::new()
    }
}

impl StoragePending {
    pub fn new() -> Self {
        Self {
            peer_update: PendingMap::new("peer_update"),
            peer_del: PendingMap::new("peer_del"),
            peer_get_chunk: PendingMap::new("peer_get_chunk"),
            peer_set_chunk: PendingMap::new("peer_set_chunk"),
            degraded_ops: PendingMap::new("degraded_ops"),
        }
    }

    pub fn len(&self, ty: StoragePendingType) -> usize {
        match ty {
            StoragePendingType::PeerUpdate => self.peer_update.len(),
            StoragePendingType::PeerDel => self.peer_del.len(),
            StoragePendingType::PeerGetChunk => self.peer_get_chunk.len(),
            StoragePendingType::PeerSetChunk => self.peer_set_chunk.len(),
            StoragePendingType::DegradedOps => self.degraded_ops.len(),
        }
    }

    /// Number of parity updates still unanswered for a given parent request
    pub fn outstanding_updates(&self, instance_id: u16, parent_request_id: u32) -> usize {
        let mut outstanding = 0;
        self.peer_update.scan(|pid, _| {
            if pid.parent_instance_id == instance_id && pid.parent_request_id == parent_request_id {
                outstanding += 1;
            }
        });
        outstanding
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4};

    use super::*;
    use crate::pending::{Key, Match, PendingIdentifier};

    fn update(peer_port: u16) -> ChunkUpdate {
        ChunkUpdate {
            list_id: 0,
            stripe_id: 3,
            chunk_id: 1,
            offset: 16,
            length: 8,
            key: Key::dup(b"k", None),
            peer: SocketAddrV4::new(Ipv4Addr::LOCALHOST, peer_port),
        }
    }

    #[test]
    fn test_outstanding_updates_per_parent() {
        let pending = StoragePending::new();
        pending.peer_update.insert(PendingIdentifier::new(4, 1, 10, 500, None), update(1));
        pending.peer_update.insert(PendingIdentifier::new(4, 1, 11, 500, None), update(2));
        pending.peer_update.insert(PendingIdentifier::new(4, 1, 12, 501, None), update(1));

        assert_eq!(pending.outstanding_updates(1, 500), 2);
        pending.peer_update.erase(4, 10, Match::any()).unwrap();
        assert_eq!(pending.outstanding_updates(1, 500), 1);
        assert_eq!(pending.len(StoragePendingType::PeerUpdate), 2);
        assert_eq!(pending.len(StoragePendingType::DegradedOps), 0);
    }
}

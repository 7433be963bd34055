//! Router-side pending tables

use std::fmt;
use std::net::SocketAddrV4;

use super::values::{AckInfo, DegradedLockData, Key, KeyValue, KeyValueUpdate, RemapList};
use super::{PendingIdentifier, PendingMap};
use crate::{Error, Result};

/// Kind of in-flight request a router tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PendingType {
    CoordinatorDegradedLockData,
    ApplicationGet,
    ApplicationSet,
    ApplicationUpdate,
    ApplicationDel,
    ServerGet,
    ServerSet,
    ServerRemappingSet,
    ServerUpdate,
    ServerDel,
    KeyRemapList,
    AckRevertParity,
}

impl PendingType {
    pub const ALL: [PendingType; 12] = [
        PendingType::CoordinatorDegradedLockData,
        PendingType::ApplicationGet,
        PendingType::ApplicationSet,
        PendingType::ApplicationUpdate,
        PendingType::ApplicationDel,
        PendingType::ServerGet,
        PendingType::ServerSet,
        PendingType::ServerRemappingSet,
        PendingType::ServerUpdate,
        PendingType::ServerDel,
        PendingType::KeyRemapList,
        PendingType::AckRevertParity,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PendingType::CoordinatorDegradedLockData => "coordinator_degraded_lock_data",
            PendingType::ApplicationGet => "application_get",
            PendingType::ApplicationSet => "application_set",
            PendingType::ApplicationUpdate => "application_update",
            PendingType::ApplicationDel => "application_del",
            PendingType::ServerGet => "server_get",
            PendingType::ServerSet => "server_set",
            PendingType::ServerRemappingSet => "server_remapping_set",
            PendingType::ServerUpdate => "server_update",
            PendingType::ServerDel => "server_del",
            PendingType::KeyRemapList => "key_remap_list",
            PendingType::AckRevertParity => "ack_revert_parity",
        }
    }
}

impl fmt::Display for PendingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn mismatch<T>(ty: PendingType, table: &str) -> Result<T> {
    Err(Error::PendingType(format!("{} is not a {} table", ty, table)))
}

/// Every table a router keeps, one per [`PendingType`]
pub struct RouterPending {
    degraded_locks: PendingMap<DegradedLockData>,
    application_get: PendingMap<Key>,
    application_set: PendingMap<KeyValue>,
    application_update: PendingMap<KeyValueUpdate>,
    application_del: PendingMap<Key>,
    server_get: PendingMap<Key>,
    server_set: PendingMap<Key>,
    server_remapping_set: PendingMap<Key>,
    server_update: PendingMap<KeyValueUpdate>,
    server_del: PendingMap<Key>,
    remap_lists: PendingMap<RemapList>,
    acks: PendingMap<AckInfo>,
}

impl Default for RouterPending {
    fn default() -> Self {
        Self::new()
    }
}

impl RouterPending {
    pub fn new() -> Self {
        Self {
            degraded_locks: PendingMap::new(PendingType::CoordinatorDegradedLockData.name()),
            application_get: PendingMap::new(PendingType::ApplicationGet.name()),
            application_set: PendingMap::new(PendingType::ApplicationSet.name()),
            application_update: PendingMap::new(PendingType::ApplicationUpdate.name()),
            application_del: PendingMap::new(PendingType::ApplicationDel.name()),
            server_get: PendingMap::new(PendingType::ServerGet.name()),
            server_set: PendingMap::new(PendingType::ServerSet.name()),
            server_remapping_set: PendingMap::new(PendingType::ServerRemappingSet.name()),
            server_update: PendingMap::new(PendingType::ServerUpdate.name()),
            server_del: PendingMap::new(PendingType::ServerDel.name()),
            remap_lists: PendingMap::new(PendingType::KeyRemapList.name()),
            acks: PendingMap::new(PendingType::AckRevertParity.name()),
        }
    }

    /// Tables holding bare keys
    pub fn keys(&self, ty: PendingType) -> Result<&PendingMap<Key>> {
        match ty {
            PendingType::ApplicationGet => Ok(&self.application_get),
            PendingType::ApplicationDel => Ok(&self.application_del),
            PendingType::ServerGet => Ok(&self.server_get),
            PendingType::ServerSet => Ok(&self.server_set),
            PendingType::ServerRemappingSet => Ok(&self.server_remapping_set),
            PendingType::ServerDel => Ok(&self.server_del),
            _ => mismatch(ty, "key"),
        }
    }

    pub fn key_values(&self, ty: PendingType) -> Result<&PendingMap<KeyValue>> {
        match ty {
            PendingType::ApplicationSet => Ok(&self.application_set),
            _ => mismatch(ty, "key-value"),
        }
    }

    pub fn updates(&self, ty: PendingType) -> Result<&PendingMap<KeyValueUpdate>> {
        match ty {
            PendingType::ApplicationUpdate => Ok(&self.application_update),
            PendingType::ServerUpdate => Ok(&self.server_update),
            _ => mismatch(ty, "key-value update"),
        }
    }

    pub fn degraded_locks(&self, ty: PendingType) -> Result<&PendingMap<DegradedLockData>> {
        match ty {
            PendingType::CoordinatorDegradedLockData => Ok(&self.degraded_locks),
            _ => mismatch(ty, "degraded lock"),
        }
    }

    pub fn remap_lists(&self, ty: PendingType) -> Result<&PendingMap<RemapList>> {
        match ty {
            PendingType::KeyRemapList => Ok(&self.remap_lists),
            _ => mismatch(ty, "remap list"),
        }
    }

    pub fn acks(&self, ty: PendingType) -> Result<&PendingMap<AckInfo>> {
        match ty {
            PendingType::AckRevertParity => Ok(&self.acks),
            _ => mismatch(ty, "ack"),
        }
    }

    /// Track a request whose value is just a key, copying `key`
    pub fn insert_key(&self, ty: PendingType, pid: PendingIdentifier, key: &[u8]) -> Result<bool> {
        Ok(self.keys(ty)?.insert_dup(pid, key))
    }

    /// 1 if the request is tracked in the table of `ty`, 0 otherwise
    pub fn count(&self, ty: PendingType, instance_id: u16, request_id: u32) -> usize {
        match ty {
            PendingType::CoordinatorDegradedLockData => self.degraded_locks.count(instance_id, request_id),
            PendingType::ApplicationSet => self.application_set.count(instance_id, request_id),
            PendingType::ApplicationUpdate => self.application_update.count(instance_id, request_id),
            PendingType::ServerUpdate => self.server_update.count(instance_id, request_id),
            PendingType::KeyRemapList => self.remap_lists.count(instance_id, request_id),
            PendingType::AckRevertParity => self.acks.count(instance_id, request_id),
            _ => self
                .keys(ty)
                .map_or(0, |table| table.count(instance_id, request_id)),
        }
    }

    pub fn len(&self, ty: PendingType) -> usize {
        match ty {
            PendingType::CoordinatorDegradedLockData => self.degraded_locks.len(),
            PendingType::ApplicationSet => self.application_set.len(),
            PendingType::ApplicationUpdate => self.application_update.len(),
            PendingType::ServerUpdate => self.server_update.len(),
            PendingType::KeyRemapList => self.remap_lists.len(),
            PendingType::AckRevertParity => self.acks.len(),
            _ => self.keys(ty).map_or(0, PendingMap::len),
        }
    }

    /// Whether a server-bound request spawned by `parent_request_id` is
    /// still waiting for its reply
    pub fn has_server_request(&self, parent_request_id: u32) -> bool {
        let child = |pid: &PendingIdentifier| pid.parent_request_id == parent_request_id;
        self.server_set.any(|pid, _| child(pid))
            || self.server_update.any(|pid, _| child(pid))
            || self.server_del.any(|pid, _| child(pid))
    }

    /// Record an outstanding parity-backup acknowledgement for `server`
    pub fn insert_ack(&self, pid: PendingIdentifier, server: SocketAddrV4, from_timestamp: u32, to_timestamp: u32) -> bool {
        self.acks.insert(
            pid,
            AckInfo {
                server,
                from_timestamp,
                to_timestamp,
            },
        )
    }

    /// Drop every acknowledgement for `server` covering timestamps up to
    /// `to_timestamp`; returns how many were dropped
    pub fn erase_acks(&self, server: SocketAddrV4, to_timestamp: u32) -> usize {
        self.acks
            .extract(|_, ack| ack.server == server && ack.to_timestamp <= to_timestamp)
            .len()
    }
}

//! Storage node implementation
//!
//! A node keeps its chunks in memory together with a simulated response
//! latency. Parity nodes also keep a backup of every parity delta they
//! applied until the router confirms the originating update, so the delta
//! can be rolled back if the data server is remapped first.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::SocketAddrV4;

use tracing::{debug, trace};

use crate::storage::{ChunkStore, StorageStats};
use crate::{Error, Result};

/// Position of a chunk in the stripe space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId {
    pub list_id: u32,
    pub stripe_id: u32,
    pub chunk_id: u32,
}

impl ChunkId {
    pub fn new(list_id: u32, stripe_id: u32, chunk_id: u32) -> Self {
        Self {
            list_id,
            stripe_id,
            chunk_id,
        }
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.list_id, self.stripe_id, self.chunk_id)
    }
}

/// A chunk and where it belongs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub id: ChunkId,
    pub data: Vec<u8>,
}

/// Health of a storage node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Healthy,
    /// Serving, but slowly
    Overloaded,
    /// Not reachable
    Failed,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Healthy => write!(f, "Healthy"),
            NodeState::Overloaded => write!(f, "Overloaded"),
            NodeState::Failed => write!(f, "Failed"),
        }
    }
}

/// Simulated latency of a healthy node, in milliseconds
pub const HEALTHY_LATENCY_MS: u64 = 1;

#[derive(Debug, Clone)]
struct DeltaBackup {
    chunk: ChunkId,
    delta: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct StorageNode {
    pub addr: SocketAddrV4,
    state: NodeState,
    chunks: HashMap<ChunkId, Vec<u8>>,
    /// Parity deltas applied here, by originating data server and update
    /// timestamp
    backups: BTreeMap<(SocketAddrV4, u32), Vec<DeltaBackup>>,
    stats: StorageStats,
    /// Simulated latency in milliseconds
    pub latency_ms: u64,
}

impl StorageNode {
    pub fn new(addr: SocketAddrV4) -> Self {
        Self {
            addr,
            state: NodeState::Healthy,
            chunks: HashMap::new(),
            backups: BTreeMap::new(),
            stats: StorageStats::new(),
            latency_ms: HEALTHY_LATENCY_MS,
        }
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn is_available(&self) -> bool {
        self.state != NodeState::Failed
    }

    /// Slow the node down to `latency_ms`
    pub fn overload(&mut self, latency_ms: u64) {
        if self.state != NodeState::Failed {
            self.state = NodeState::Overloaded;
            self.latency_ms = latency_ms;
        }
    }

    pub fn fail(&mut self) {
        self.state = NodeState::Failed;
    }

    pub fn recover(&mut self) {
        self.state = NodeState::Healthy;
        self.latency_ms = HEALTHY_LATENCY_MS;
    }

    fn ensure_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(Error::Unavailable(self.addr))
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn bytes_stored(&self) -> usize {
        self.chunks.values().map(Vec::len).sum()
    }

    /// XOR `delta` into a chunk at `offset`, creating a zeroed chunk of
    /// `chunk_size` bytes when missing
    pub fn apply_delta(&mut self, id: ChunkId, offset: usize, delta: &[u8], chunk_size: usize) -> Result<()> {
        self.ensure_available()?;
        let end = offset + delta.len();
        if end > chunk_size {
            return Err(Error::InvalidChunk(format!(
                "delta [{}, {}) outside chunk of {} bytes",
                offset, end, chunk_size
            )));
        }
        let chunk = self.chunks.entry(id).or_insert_with(|| vec![0; chunk_size]);
        for (dst, src) in chunk[offset..end].iter_mut().zip(delta) {
            *dst ^= src;
        }
        self.stats.record_write(delta.len());
        Ok(())
    }

    /// Keep a parity delta until its update is acknowledged
    pub fn backup_delta(&mut self, data_server: SocketAddrV4, timestamp: u32, chunk: ChunkId, delta: Vec<u8>) {
        trace!(node = %self.addr, data_server = %data_server, timestamp, chunk = %chunk, "parity delta backed up");
        self.backups
            .entry((data_server, timestamp))
            .or_default()
            .push(DeltaBackup { chunk, delta });
    }

    /// Undo the backed-up deltas of `data_server` at `timestamps`; returns
    /// how many deltas were rolled back
    pub fn revert_deltas(&mut self, data_server: SocketAddrV4, timestamps: &[u32]) -> usize {
        let mut reverted = 0;
        for &timestamp in timestamps {
            let Some(backups) = self.backups.remove(&(data_server, timestamp)) else {
                continue;
            };
            for backup in backups {
                // XOR is its own inverse
                if let Some(chunk) = self.chunks.get_mut(&backup.chunk) {
                    for (dst, src) in chunk.iter_mut().zip(&backup.delta) {
                        *dst ^= src;
                    }
                    reverted += 1;
                }
            }
        }
        self.stats.record_revert(reverted);
        debug!(node = %self.addr, data_server = %data_server, reverted, "parity deltas reverted");
        reverted
    }

    /// Drop the backups of `data_server` with timestamps in `(from, to]`
    pub fn ack_deltas(&mut self, data_server: SocketAddrV4, from: u32, to: u32) -> usize {
        let before = self.backup_count();
        self.backups
            .retain(|&(server, timestamp), _| server != data_server || timestamp <= from || timestamp > to);
        before - self.backup_count()
    }

    pub fn backup_count(&self) -> usize {
        self.backups.values().map(Vec::len).sum()
    }

    /// Forget every chunk (simulated disk loss)
    pub fn clear_data(&mut self) {
        self.chunks.clear();
        self.backups.clear();
        self.stats = StorageStats::new();
    }
}

impl ChunkStore for StorageNode {
    fn put_chunk(&mut self, chunk: Chunk) -> Result<()> {
        self.ensure_available()?;
        self.stats.record_write(chunk.data.len());
        self.chunks.insert(chunk.id, chunk.data);
        Ok(())
    }

    fn get_chunk(&mut self, id: ChunkId) -> Result<Option<Vec<u8>>> {
        self.ensure_available()?;
        self.stats.record_read();
        Ok(self.chunks.get(&id).cloned())
    }

    fn remove_chunk(&mut self, id: ChunkId) -> Result<Option<Vec<u8>>> {
        self.ensure_available()?;
        let removed = self.chunks.remove(&id);
        if removed.is_some() {
            self.stats.record_delete();
        }
        Ok(removed)
    }

    fn stats(&self) -> StorageStats {
        self.stats.clone()
    }
}

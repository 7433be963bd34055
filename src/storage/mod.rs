//! In-memory storage servers
//!
//! Stand-ins for the storage tier: chunk placement follows the stripe list,
//! parity is kept up to date through coding deltas, and the cluster answers
//! the router's remap requests.

pub mod cluster;
pub mod node;

pub use cluster::{Cluster, ClusterStats};
pub use node::{Chunk, ChunkId, NodeState, StorageNode};

use crate::Result;

/// Chunk-level storage backend
pub trait ChunkStore {
    /// Store a chunk, replacing any previous content
    fn put_chunk(&mut self, chunk: Chunk) -> Result<()>;

    fn get_chunk(&mut self, id: ChunkId) -> Result<Option<Vec<u8>>>;

    fn remove_chunk(&mut self, id: ChunkId) -> Result<Option<Vec<u8>>>;

    fn stats(&self) -> StorageStats;
}

/// Operation counters of one node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageStats {
    pub reads: usize,
    pub writes: usize,
    pub bytes_written: usize,
    pub deletes: usize,
    /// Parity deltas rolled back
    pub reverts: usize,
}

impl StorageStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_read(&mut self) {
        self.reads += 1;
    }

    pub fn record_write(&mut self, bytes: usize) {
        self.writes += 1;
        self.bytes_written += bytes;
    }

    pub fn record_delete(&mut self) {
        self.deletes += 1;
    }

    pub fn record_revert(&mut self, count: usize) {
        self.reverts += count;
    }
}

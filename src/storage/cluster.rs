//! Cluster of storage nodes laid out by a stripe list
//!
//! Chunks land on the nodes the stripe list assigns. Data updates are
//! propagated to parity nodes as coding deltas and backed up there until the
//! router acknowledges them. Reads fall back to reconstruction when the
//! owning node is unavailable.

use std::collections::{BTreeMap, HashMap};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::ds::BitmaskArray;
use crate::erasure::{create_coding, Coding};
use crate::pending::{ChunkRequest, ChunkUpdate, Key, Match, PendingIdentifier, StoragePending};
use crate::remap::{RouterEvent, ServerLink};
use crate::storage::{Chunk, ChunkId, ChunkStore, StorageNode};
use crate::stripe_list::StripeList;
use crate::{Error, Result};

/// First port handed out by [`Cluster::with_nodes`]
pub const BASE_PORT: u16 = 9000;

/// Instance id the cluster uses for its own peer requests
const CLUSTER_INSTANCE_ID: u16 = 0;

pub struct Cluster {
    nodes: BTreeMap<SocketAddrV4, Mutex<StorageNode>>,
    stripe_list: Arc<StripeList<SocketAddrV4>>,
    coding: Box<dyn Coding>,
    pending: StoragePending,
    /// Completion queues of attached routers, by instance id
    routers: Mutex<HashMap<u16, Sender<RouterEvent>>>,
    next_request_id: AtomicU32,
}

impl Cluster {
    /// Build a cluster over `addrs` for the coding and stripe settings of
    /// `config`
    pub fn new(config: &Config, addrs: Vec<SocketAddrV4>) -> Result<Self> {
        config.validate()?;
        let coding = create_coding(
            config.coding.scheme,
            config.coding.k,
            config.coding.m,
            config.coding.chunk_size,
        )?;
        let stripe_list = Arc::new(StripeList::new(config.stripe_params(), addrs.clone())?);
        let nodes = addrs
            .into_iter()
            .map(|addr| (addr, Mutex::new(StorageNode::new(addr))))
            .collect();
        info!(scheme = %config.coding.scheme, "cluster created\n{}", stripe_list);
        Ok(Self {
            nodes,
            stripe_list,
            coding,
            pending: StoragePending::new(),
            routers: Mutex::new(HashMap::new()),
            next_request_id: AtomicU32::new(1),
        })
    }

    /// Cluster of `count` nodes on consecutive local ports
    pub fn with_nodes(config: &Config, count: usize) -> Result<Self> {
        let addrs = (0..count)
            .map(|i| SocketAddrV4::new(Ipv4Addr::LOCALHOST, BASE_PORT + i as u16))
            .collect();
        Self::new(config, addrs)
    }

    /// Send completions for router `instance_id` to `events`
    pub fn attach_router(&self, instance_id: u16, events: Sender<RouterEvent>) {
        self.routers.lock().insert(instance_id, events);
    }

    pub fn stripe_list(&self) -> Arc<StripeList<SocketAddrV4>> {
        Arc::clone(&self.stripe_list)
    }

    pub fn coding(&self) -> &dyn Coding {
        self.coding.as_ref()
    }

    pub fn pending(&self) -> &StoragePending {
        &self.pending
    }

    pub fn node_addrs(&self) -> Vec<SocketAddrV4> {
        self.nodes.keys().copied().collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn available_node_count(&self) -> usize {
        self.nodes
            .values()
            .filter(|node| node.lock().is_available())
            .count()
    }

    /// Run `f` on a node under its lock
    pub fn with_node<R>(&self, addr: SocketAddrV4, f: impl FnOnce(&mut StorageNode) -> R) -> Result<R> {
        let node = self.nodes.get(&addr).ok_or(Error::UnknownServer(addr))?;
        let mut node = node.lock();
        Ok(f(&mut node))
    }

    pub fn fail_node(&self, addr: SocketAddrV4) -> Result<()> {
        self.with_node(addr, StorageNode::fail)?;
        warn!(node = %addr, "node failed");
        Ok(())
    }

    pub fn recover_node(&self, addr: SocketAddrV4) -> Result<()> {
        self.with_node(addr, StorageNode::recover)?;
        info!(node = %addr, "node recovered");
        Ok(())
    }

    pub fn overload_node(&self, addr: SocketAddrV4, latency_ms: u64) -> Result<()> {
        self.with_node(addr, |node| node.overload(latency_ms))?;
        info!(node = %addr, latency_ms, "node overloaded");
        Ok(())
    }

    /// Simulated latency of every available node, in seconds
    pub fn latencies(&self) -> Vec<(SocketAddrV4, f64)> {
        self.nodes
            .iter()
            .filter_map(|(&addr, node)| {
                let node = node.lock();
                node.is_available()
                    .then(|| (addr, node.latency_ms as f64 / 1000.0))
            })
            .collect()
    }

    fn owner(&self, list_id: u32, chunk_id: usize) -> SocketAddrV4 {
        *self.stripe_list.get_node(list_id as usize, chunk_id)
    }

    fn next_request_id(&self) -> u32 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Encode `data` (the `k` data chunks) and store the full stripe;
    /// unavailable nodes are skipped
    pub fn write_stripe(&self, list_id: u32, stripe_id: u32, data: &[Vec<u8>]) -> Result<usize> {
        let k = self.coding.data_chunks();
        if data.len() != k {
            return Err(Error::InvalidChunk(format!(
                "expected {} data chunks, got {}",
                k,
                data.len()
            )));
        }
        let refs: Vec<&[u8]> = data.iter().map(Vec::as_slice).collect();
        let mut parity = vec![vec![0u8; self.coding.chunk_size()]; self.coding.parity_chunks()];
        for (i, chunk) in parity.iter_mut().enumerate() {
            self.coding.encode(&refs, chunk, i + 1)?;
        }

        let mut stored = 0;
        for (chunk_id, bytes) in data.iter().chain(parity.iter()).enumerate() {
            let owner = self.owner(list_id, chunk_id);
            let chunk = Chunk {
                id: ChunkId::new(list_id, stripe_id, chunk_id as u32),
                data: bytes.clone(),
            };
            match self.with_node(owner, |node| node.put_chunk(chunk))? {
                Ok(()) => stored += 1,
                Err(err) => warn!(node = %owner, chunk_id, error = %err, "chunk not stored"),
            }
        }
        debug!(list_id, stripe_id, stored, "stripe written");
        Ok(stored)
    }

    /// Overwrite `bytes` at `offset` in the data chunk holding `key` and
    /// push the parity deltas, tagged with the update `timestamp`
    pub fn update_chunk(&self, key: &[u8], stripe_id: u32, offset: usize, bytes: &[u8], timestamp: u32) -> Result<()> {
        let chunk_size = self.coding.chunk_size();
        let end = offset + bytes.len();
        if end > chunk_size {
            return Err(Error::InvalidChunk(format!(
                "update [{}, {}) outside chunk of {} bytes",
                offset, end, chunk_size
            )));
        }
        let lookup = self.stripe_list.get(key);
        let list_id = lookup.list_id as u32;
        let data_index = lookup.data_index;
        let data_server = *lookup.node;
        let id = ChunkId::new(list_id, stripe_id, data_index as u32);

        let delta = self.with_node(data_server, |node| -> Result<Vec<u8>> {
            let old = node
                .get_chunk(id)?
                .ok_or_else(|| Error::InvalidChunk(format!("chunk {} not found on {}", id, node.addr)))?;
            let delta: Vec<u8> = old[offset..end].iter().zip(bytes).map(|(a, b)| a ^ b).collect();
            node.apply_delta(id, offset, &delta, chunk_size)?;
            Ok(delta)
        })??;

        let k = self.coding.data_chunks();
        let mut data = vec![vec![0u8; chunk_size]; k];
        data[data_index][offset..end].copy_from_slice(&delta);
        let refs: Vec<&[u8]> = data.iter().map(Vec::as_slice).collect();
        let start = data_index * chunk_size + offset;

        for parity_index in 1..=self.coding.parity_chunks() {
            let chunk_id = k + parity_index - 1;
            let peer = self.owner(list_id, chunk_id);
            let mut parity_delta = vec![0u8; chunk_size];
            self.coding
                .encode_range(&refs, &mut parity_delta, parity_index, start, start + bytes.len())?;

            let request_id = self.next_request_id();
            let pid = PendingIdentifier::new(CLUSTER_INSTANCE_ID, CLUSTER_INSTANCE_ID, request_id, request_id, None)
                .with_timestamp(timestamp);
            self.pending.peer_update.insert(
                pid,
                ChunkUpdate {
                    list_id,
                    stripe_id,
                    chunk_id: chunk_id as u32,
                    offset: offset as u32,
                    length: bytes.len() as u32,
                    key: Key::dup(key, None),
                    peer,
                },
            );

            let parity_id = ChunkId::new(list_id, stripe_id, chunk_id as u32);
            let applied = self.with_node(peer, |node| -> Result<()> {
                node.apply_delta(parity_id, 0, &parity_delta, chunk_size)?;
                node.backup_delta(data_server, timestamp, parity_id, parity_delta);
                Ok(())
            })?;
            self.pending.peer_update.erase(CLUSTER_INSTANCE_ID, request_id, Match::key(key));
            if let Err(err) = applied {
                warn!(peer = %peer, chunk = %parity_id, error = %err, "parity delta not applied");
            }
        }
        debug!(data_server = %data_server, chunk = %id, timestamp, "chunk updated");
        Ok(())
    }

    /// Read a chunk, reconstructing it when its owner cannot serve it
    pub fn read_chunk(&self, list_id: u32, stripe_id: u32, chunk_id: u32) -> Result<Vec<u8>> {
        let id = ChunkId::new(list_id, stripe_id, chunk_id);
        let owner = self.owner(list_id, chunk_id as usize);
        match self.with_node(owner, |node| node.get_chunk(id))? {
            Ok(Some(data)) => Ok(data),
            Ok(None) => Err(Error::InvalidChunk(format!("chunk {} not found on {}", id, owner))),
            Err(_) => self.degraded_read(list_id, stripe_id, chunk_id),
        }
    }

    /// Rebuild a chunk from the rest of its stripe without touching its
    /// owner
    pub fn degraded_read(&self, list_id: u32, stripe_id: u32, chunk_id: u32) -> Result<Vec<u8>> {
        let id = ChunkId::new(list_id, stripe_id, chunk_id);
        let n = self.coding.total_chunks();
        let mut status = BitmaskArray::new(n, 1);
        let mut chunks = vec![vec![0u8; self.coding.chunk_size()]; n];

        for (chunk_id, slot) in chunks.iter_mut().enumerate() {
            if chunk_id == id.chunk_id as usize {
                continue;
            }
            let peer = self.owner(id.list_id, chunk_id);
            let request_id = self.next_request_id();
            self.pending.peer_get_chunk.insert(
                PendingIdentifier::root(CLUSTER_INSTANCE_ID, request_id, None),
                ChunkRequest {
                    list_id: id.list_id,
                    stripe_id: id.stripe_id,
                    chunk_id: chunk_id as u32,
                    peer,
                    chunk: None,
                    is_degraded: true,
                },
            );
            let peer_id = ChunkId::new(id.list_id, id.stripe_id, chunk_id as u32);
            let fetched = self.with_node(peer, |node| node.get_chunk(peer_id))?;
            self.pending.peer_get_chunk.erase(CLUSTER_INSTANCE_ID, request_id, Match::any());
            if let Ok(Some(data)) = fetched {
                *slot = data;
                status.set(0, chunk_id);
            }
        }

        let lost = n - status.count(0);
        if lost > self.coding.fault_tolerance() {
            return Err(Error::Unrecoverable {
                failed: lost,
                tolerance: self.coding.fault_tolerance(),
            });
        }
        self.coding.decode(&mut chunks, &status)?;
        debug!(chunk = %id, lost, "chunk reconstructed");
        Ok(chunks.swap_remove(id.chunk_id as usize))
    }

    fn post(&self, origin: u16, event: RouterEvent) {
        match self.routers.lock().get(&origin) {
            Some(events) => {
                if events.send(event).is_err() {
                    warn!(origin, "router is gone");
                }
            }
            None => warn!(origin, ?event, "completion for unattached router"),
        }
    }

    pub fn stats(&self) -> ClusterStats {
        let mut stats = ClusterStats {
            total_nodes: self.nodes.len(),
            ..ClusterStats::default()
        };
        for node in self.nodes.values() {
            let node = node.lock();
            if node.is_available() {
                stats.available_nodes += 1;
            }
            stats.total_chunks += node.chunk_count();
            stats.total_bytes += node.bytes_stored();
            stats.backups += node.backup_count();
        }
        stats
    }
}

impl ServerLink for Cluster {
    fn sync_metadata(&self, server: SocketAddrV4) -> Result<()> {
        self.with_node(server, |node| {
            if !node.is_available() {
                return Err(Error::Unavailable(server));
            }
            debug!(server = %server, chunks = node.chunk_count(), "metadata synced");
            Ok(())
        })?
    }

    fn revert_parity_delta(
        &self,
        origin: u16,
        peer: SocketAddrV4,
        target: SocketAddrV4,
        timestamps: &[u32],
        keys: &[Key],
    ) -> Result<()> {
        let reverted = self.with_node(peer, |node| {
            if !node.is_available() {
                return Err(Error::Unavailable(peer));
            }
            Ok(node.revert_deltas(target, timestamps))
        })??;
        debug!(peer = %peer, target = %target, reverted, keys = keys.len(), "revert handled");
        self.post(origin, RouterEvent::RevertAcked { target });
        Ok(())
    }

    fn ack_parity_delta(
        &self,
        origin: u16,
        peer: SocketAddrV4,
        data_server: SocketAddrV4,
        from: u32,
        to: u32,
        request_id: u32,
    ) -> Result<()> {
        let dropped = self.with_node(peer, |node| node.ack_deltas(data_server, from, to))?;
        debug!(peer = %peer, data_server = %data_server, from, to, dropped, "parity backups released");
        self.post(origin, RouterEvent::ParityAcked { request_id });
        Ok(())
    }
}

/// Cluster-wide totals
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterStats {
    pub total_nodes: usize,
    pub available_nodes: usize,
    pub total_chunks: usize,
    pub total_bytes: usize,
    /// Parity deltas awaiting acknowledgement
    pub backups: usize,
}

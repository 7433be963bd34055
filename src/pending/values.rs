//! Values carried by pending entries
//!
//! Each value owns copies of the bytes it refers to; nothing here borrows
//! from a network buffer.

use std::net::SocketAddrV4;

use super::{PendingValue, Requester};
use crate::{Error, Result};

/// Largest value a key-value pair may carry (24-bit length)
pub const MAX_VALUE_SIZE: usize = (1 << 24) - 1;

/// Owned key bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Key {
    data: Box<[u8]>,
    pub requester: Option<Requester>,
}

impl Key {
    /// Copy `data` into a new key
    pub fn dup(data: &[u8], requester: Option<Requester>) -> Self {
        Self {
            data: data.into(),
            requester,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl PendingValue for Key {
    fn key_bytes(&self) -> Option<&[u8]> {
        Some(&self.data)
    }
}

/// Key and value stored as `[key_size u8][value_size u24 BE][key][value]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    buf: Box<[u8]>,
    pub requester: Option<Requester>,
}

impl KeyValue {
    pub fn new(key: &[u8], value: &[u8], requester: Option<Requester>) -> Result<Self> {
        if key.is_empty() || key.len() > u8::MAX as usize {
            return Err(Error::Message(format!("key size {} out of range", key.len())));
        }
        if value.len() > MAX_VALUE_SIZE {
            return Err(Error::Message(format!("value size {} out of range", value.len())));
        }
        let mut buf = Vec::with_capacity(4 + key.len() + value.len());
        buf.push(key.len() as u8);
        buf.extend_from_slice(&(value.len() as u32).to_be_bytes()[1..]);
        buf.extend_from_slice(key);
        buf.extend_from_slice(value);
        Ok(Self {
            buf: buf.into(),
            requester,
        })
    }

    /// Parse a serialized pair, copying it out of `bytes`
    pub fn deserialize(bytes: &[u8], requester: Option<Requester>) -> Result<Self> {
        let (key_size, value_size) = Self::sizes(bytes)?;
        let total = 4 + key_size + value_size;
        if bytes.len() < total {
            return Err(Error::Message(format!(
                "truncated key-value: need {} bytes, have {}",
                total,
                bytes.len()
            )));
        }
        Ok(Self {
            buf: bytes[..total].into(),
            requester,
        })
    }

    fn sizes(bytes: &[u8]) -> Result<(usize, usize)> {
        if bytes.len() < 4 {
            return Err(Error::Message("truncated key-value header".into()));
        }
        let value_size = u32::from_be_bytes([0, bytes[1], bytes[2], bytes[3]]) as usize;
        Ok((bytes[0] as usize, value_size))
    }

    fn key_size(&self) -> usize {
        self.buf[0] as usize
    }

    pub fn key(&self) -> &[u8] {
        &self.buf[4..4 + self.key_size()]
    }

    pub fn value(&self) -> &[u8] {
        &self.buf[4 + self.key_size()..]
    }

    pub fn serialized(&self) -> &[u8] {
        &self.buf
    }
}

impl PendingValue for KeyValue {
    fn key_bytes(&self) -> Option<&[u8]> {
        Some(self.key())
    }
}

/// In-place update of part of a value
#[derive(Debug, Clone)]
pub struct KeyValueUpdate {
    pub key: Key,
    pub offset: u32,
    pub length: u32,
    pub is_degraded: bool,
}

impl KeyValueUpdate {
    pub fn new(key: Key, offset: u32, length: u32) -> Self {
        Self {
            key,
            offset,
            length,
            is_degraded: false,
        }
    }
}

impl PendingValue for KeyValueUpdate {
    fn key_bytes(&self) -> Option<&[u8]> {
        Some(self.key.as_bytes())
    }
}

/// A `(list_id, chunk_id)` slot in a stripe list
pub type ChunkSlot = (u32, u32);

/// Lock a router holds on a degraded key while the coordinator answers
#[derive(Debug, Clone)]
pub struct DegradedLockData {
    pub key: Key,
    pub list_id: u32,
    pub stripe_id: u32,
    pub original: Vec<ChunkSlot>,
    pub reconstructed: Vec<ChunkSlot>,
    pub ongoing_at_chunk: u32,
}

impl PendingValue for DegradedLockData {
    fn key_bytes(&self) -> Option<&[u8]> {
        Some(self.key.as_bytes())
    }
}

/// Where a key's chunks were moved while its servers are degraded
#[derive(Debug, Clone)]
pub struct RemapList {
    pub key: Key,
    pub list_id: u32,
    pub chunk_id: u32,
    pub original: Vec<ChunkSlot>,
    pub remapped: Vec<ChunkSlot>,
}

impl PendingValue for RemapList {
    fn key_bytes(&self) -> Option<&[u8]> {
        Some(self.key.as_bytes())
    }
}

/// Outstanding acknowledgement of parity backups on one server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckInfo {
    pub server: SocketAddrV4,
    pub from_timestamp: u32,
    pub to_timestamp: u32,
}

impl PendingValue for AckInfo {}

/// Parity delta a storage node forwarded to a peer
#[derive(Debug, Clone)]
pub struct ChunkUpdate {
    pub list_id: u32,
    pub stripe_id: u32,
    pub chunk_id: u32,
    pub offset: u32,
    pub length: u32,
    pub key: Key,
    pub peer: SocketAddrV4,
}

impl PendingValue for ChunkUpdate {
    fn key_bytes(&self) -> Option<&[u8]> {
        Some(self.key.as_bytes())
    }
}

/// Chunk fetched from (or pushed to) a peer
#[derive(Debug, Clone)]
pub struct ChunkRequest {
    pub list_id: u32,
    pub stripe_id: u32,
    pub chunk_id: u32,
    pub peer: SocketAddrV4,
    pub chunk: Option<Vec<u8>>,
    pub is_degraded: bool,
}

impl PendingValue for ChunkRequest {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegradedOpcode {
    Get,
    Update,
    Delete,
}

/// Operation a storage node runs on behalf of an unavailable peer
#[derive(Debug, Clone)]
pub struct DegradedOp {
    pub opcode: DegradedOpcode,
    pub list_id: u32,
    pub stripe_id: u32,
    pub original: Vec<ChunkSlot>,
    pub reconstructed: Vec<ChunkSlot>,
    pub ongoing_at_chunk: u32,
    pub key: Key,
}

impl PendingValue for DegradedOp {
    fn key_bytes(&self) -> Option<&[u8]> {
        Some(self.key.as_bytes())
    }
}

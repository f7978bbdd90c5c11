use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ChunkVaultError, Result};

/// Chunk ID layout: 16-bit creator node ID followed by a 48-bit local sequence number
pub const LOCAL_ID_BITS: u32 = 48;
pub const LOCAL_ID_MASK: u64 = (1 << LOCAL_ID_BITS) - 1;

/// Replication factors above this cannot be packed into one 64-bit peer word
pub const MAX_REPLICATION_FACTOR: usize = 4;

/// Version record constants
pub const MAX_EPOCH: u16 = 0x7FFF;
pub const EON_BIT: u16 = 0x8000;
pub const MAX_VERSION: u32 = 0x00FF_FFFF;
pub const VERSION_RECORD_SIZE: usize = 13;

/// Unique identifier for nodes
pub type NodeId = u16;

/// Local sequence number of a chunk, unique per creator
pub type LocalId = u64;

/// Identifier of a backup range, unique per owning node
pub type RangeId = u16;

/// Rack and switch identifiers are topology hints only
pub type RackId = u16;
pub type SwitchId = u16;

/// Globally unique chunk identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkId(u64);

impl ChunkId {
    pub const INVALID: ChunkId = ChunkId(u64::MAX);

    pub const fn new(creator: NodeId, local_id: LocalId) -> Self {
        ChunkId(((creator as u64) << LOCAL_ID_BITS) | (local_id & LOCAL_ID_MASK))
    }

    pub const fn from_raw(raw: u64) -> Self {
        ChunkId(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Node that created the chunk (not necessarily the node holding it now)
    pub const fn creator(self) -> NodeId {
        (self.0 >> LOCAL_ID_BITS) as NodeId
    }

    pub const fn local_id(self) -> LocalId {
        self.0 & LOCAL_ID_MASK
    }

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

/// Split the inclusive interval `[start, end]` into per-creator pieces
pub fn creator_segments(start: ChunkId, end: ChunkId) -> Vec<(NodeId, ChunkId, ChunkId)> {
    if start > end {
        return Vec::new();
    }
    (start.creator()..=end.creator())
        .map(|creator| {
            let seg_start = if creator == start.creator() {
                start
            } else {
                ChunkId::new(creator, 0)
            };
            let seg_end = if creator == end.creator() {
                end
            } else {
                ChunkId::new(creator, LOCAL_ID_MASK)
            };
            (creator, seg_start, seg_end)
        })
        .collect()
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

/// A node that may hold backup replicas, with its topology hints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackupPeer {
    pub node_id: NodeId,
    pub rack: RackId,
    pub switch: SwitchId,
}

impl BackupPeer {
    pub fn new(node_id: NodeId, rack: RackId, switch: SwitchId) -> Self {
        Self { node_id, rack, switch }
    }
}

impl fmt::Display for BackupPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X} (rack {}, switch {})", self.node_id, self.rack, self.switch)
    }
}

/// Cluster-wide name of a backup range
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RangeKey {
    pub owner: NodeId,
    pub range_id: RangeId,
}

impl RangeKey {
    pub fn new(owner: NodeId, range_id: RangeId) -> Self {
        Self { owner, range_id }
    }
}

impl fmt::Display for RangeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}/{}", self.owner, self.range_id)
    }
}

/// A size-bounded group of chunks replicated together.
///
/// The slot array always has `replication_factor` entries. Empty slots mark a degraded range.
/// No node appears in more than one populated slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRange {
    range_id: RangeId,
    owner: NodeId,
    slots: Vec<Option<BackupPeer>>,
    size: u64,
}

impl BackupRange {
    /// Create a range without any backup peers
    pub fn new(owner: NodeId, range_id: RangeId, replication_factor: usize) -> Self {
        Self {
            range_id,
            owner,
            slots: vec![None; replication_factor],
            size: 0,
        }
    }

    /// Create a range with the given peers in slot order; duplicates and surplus peers are dropped
    pub fn with_peers<I>(owner: NodeId, range_id: RangeId, replication_factor: usize, peers: I) -> Self
    where
        I: IntoIterator<Item = BackupPeer>,
    {
        let mut range = Self::new(owner, range_id, replication_factor);
        for peer in peers {
            if !range.add_peer(peer) && range.populated() == replication_factor {
                break;
            }
        }
        range
    }

    /// Create a range from an explicit slot layout
    pub fn with_slots(owner: NodeId, range_id: RangeId, slots: Vec<Option<BackupPeer>>) -> Self {
        let mut range = Self::new(owner, range_id, slots.len());
        for (index, slot) in slots.into_iter().enumerate() {
            if let Some(peer) = slot {
                if !range.contains(peer.node_id) {
                    range.slots[index] = Some(peer);
                }
            }
        }
        range
    }

    pub fn range_id(&self) -> RangeId {
        self.range_id
    }

    pub fn owner(&self) -> NodeId {
        self.owner
    }

    pub fn key(&self) -> RangeKey {
        RangeKey::new(self.owner, self.range_id)
    }

    pub fn replication_factor(&self) -> usize {
        self.slots.len()
    }

    pub fn slots(&self) -> &[Option<BackupPeer>] {
        &self.slots
    }

    /// Populated peers in slot order
    pub fn peers(&self) -> Vec<BackupPeer> {
        self.slots.iter().flatten().copied().collect()
    }

    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.slots.iter().flatten().map(|p| p.node_id).collect()
    }

    pub fn populated(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_degraded(&self) -> bool {
        self.populated() < self.slots.len()
    }

    /// Accumulated size of all chunks including log header overhead
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether `size` more bytes fit without exceeding `limit`
    pub fn fits(&self, size: u64, limit: u64) -> bool {
        self.size.saturating_add(size) <= limit
    }

    pub fn add_chunk(&mut self, size: u64) {
        self.size = self.size.saturating_add(size);
    }

    pub fn remove_chunk(&mut self, size: u64) {
        self.size = self.size.saturating_sub(size);
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.slot_of(node_id).is_some()
    }

    pub fn slot_of(&self, node_id: NodeId) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| matches!(s, Some(p) if p.node_id == node_id))
    }

    /// Put `peer` into the first empty slot. Returns false if the peer is present or no slot is free.
    pub fn add_peer(&mut self, peer: BackupPeer) -> bool {
        if self.contains(peer.node_id) {
            return false;
        }
        match self.slots.iter_mut().find(|s| s.is_none()) {
            Some(slot) => {
                *slot = Some(peer);
                true
            }
            None => false,
        }
    }

    /// Replace `old` in place with `new` (or vacate its slot). Returns the slot index touched.
    ///
    /// A replacement that already sits in another slot vacates the old slot instead of duplicating it.
    pub fn replace_peer(&mut self, old: NodeId, new: Option<BackupPeer>) -> Option<usize> {
        let index = self.slot_of(old)?;
        let new = new.filter(|p| !self.contains(p.node_id));
        self.slots[index] = new;
        Some(index)
    }
}

impl fmt::Display for BackupRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ID {} of 0x{:04X} [", self.range_id, self.owner)?;
        let mut first = true;
        for peer in self.slots.iter().flatten() {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "0x{:04X}", peer.node_id)?;
            first = false;
        }
        write!(f, "]")
    }
}

/// Where a contiguous interval of chunk IDs currently lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationEntry {
    pub start: ChunkId,
    pub end: ChunkId,
    pub primary: NodeId,
    /// `None` when the owner runs without backup
    pub backup_range: Option<BackupRange>,
}

impl LocationEntry {
    pub fn contains(&self, chunk_id: ChunkId) -> bool {
        chunk_id >= self.start && chunk_id <= self.end
    }

    pub fn backup_peers(&self) -> Vec<BackupPeer> {
        self.backup_range
            .as_ref()
            .map(|r| r.peers())
            .unwrap_or_default()
    }
}

/// Write version of a chunk: (eon, epoch, version), ordered lexicographically
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub eon: u8,
    pub epoch: u16,
    pub version: u32,
}

impl Version {
    pub fn new(eon: u8, epoch: u16, version: u32) -> Self {
        Self {
            eon: eon & 1,
            epoch: epoch & MAX_EPOCH,
            version: version & MAX_VERSION,
        }
    }

    /// Epoch with the eon in its top bit, as stored in the version log
    pub fn packed_epoch(&self) -> u16 {
        (self.epoch & MAX_EPOCH) | ((self.eon as u16) << 15)
    }

    pub fn from_packed(packed_epoch: u16, version: u32) -> Self {
        Self::new((packed_epoch >> 15) as u8, packed_epoch & MAX_EPOCH, version)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.eon, self.epoch, self.version)
    }
}

/// Durable form of a version: 8-byte chunk ID, 2-byte epoch (eon in the top bit), 3-byte version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionRecord {
    pub chunk_id: ChunkId,
    pub version: Version,
}

impl VersionRecord {
    pub fn new(chunk_id: ChunkId, version: Version) -> Self {
        Self { chunk_id, version }
    }

    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        let v = self.version.version;
        dst.put_u64(self.chunk_id.raw());
        dst.put_u16(self.version.packed_epoch());
        dst.put_u8((v >> 16) as u8);
        dst.put_u8((v >> 8) as u8);
        dst.put_u8(v as u8);
    }

    /// Decode one record. The caller guarantees `VERSION_RECORD_SIZE` bytes are available.
    pub fn decode<B: Buf>(src: &mut B) -> Self {
        let chunk_id = ChunkId::from_raw(src.get_u64());
        let packed_epoch = src.get_u16();
        let version = (src.get_u8() as u32) << 16 | (src.get_u8() as u32) << 8 | src.get_u8() as u32;
        Self::new(chunk_id, Version::from_packed(packed_epoch, version))
    }

    /// Decode a sequence of records as read back from a version log
    pub fn decode_all(mut data: &[u8]) -> Result<Vec<VersionRecord>> {
        if data.len() % VERSION_RECORD_SIZE != 0 {
            return Err(ChunkVaultError::CorruptVersionLog { length: data.len() });
        }
        let mut records = Vec::with_capacity(data.len() / VERSION_RECORD_SIZE);
        while data.has_remaining() {
            records.push(Self::decode(&mut data));
        }
        Ok(records)
    }
}

/// Result of an external recovery of a failed node's backup range
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryMetadata {
    /// Inclusive chunk ID intervals that were recovered
    pub chunk_ranges: Vec<(ChunkId, ChunkId)>,
    pub total_bytes: u64,
}

impl RecoveryMetadata {
    pub fn new(chunk_ranges: Vec<(ChunkId, ChunkId)>, total_bytes: u64) -> Self {
        Self { chunk_ranges, total_bytes }
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunk_ranges
            .iter()
            .map(|(start, end)| end.raw().saturating_sub(start.raw()) + 1)
            .sum()
    }
}

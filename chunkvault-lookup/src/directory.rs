use chunkvault_common::types::creator_segments;
use chunkvault_common::{BackupPeer, BackupRange, ChunkId, IntervalMap, LocationEntry, NodeId, RangeKey};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Where an interval of chunks lives and which backup range covers it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub primary: NodeId,
    pub range: Option<RangeKey>,
}

/// Change notifications consumed by location caches
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocationChange {
    Migrated { start: ChunkId, end: ChunkId, primary: NodeId },
    Removed { start: ChunkId, end: ChunkId },
    RemovedChunks(Vec<ChunkId>),
    BackupRangeChanged(RangeKey),
    PeerFailed(NodeId),
}

type Shard = Arc<RwLock<IntervalMap<Placement>>>;

/// Authoritative mapping from chunk IDs to primary node and backup range.
///
/// Intervals are sharded by creator node so lookups and updates for different creators never
/// contend. Backup range snapshots are stored separately, keyed by owner and range ID, so the
/// intervals of a failed creator can point at a range owned by the node that recovered them.
pub struct LocationDirectory {
    shards: DashMap<NodeId, Shard>,
    ranges: DashMap<RangeKey, BackupRange>,
    changes: broadcast::Sender<LocationChange>,
}

impl Default for LocationDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl LocationDirectory {
    pub fn new() -> Self {
        Self::with_event_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Create a directory whose change channel buffers `capacity` events per subscriber
    pub fn with_event_capacity(capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity.max(1));
        Self {
            shards: DashMap::new(),
            ranges: DashMap::new(),
            changes,
        }
    }

    /// Subscribe to location changes
    pub fn subscribe(&self) -> broadcast::Receiver<LocationChange> {
        self.changes.subscribe()
    }

    /// Look up the current location of a chunk; unknown chunks resolve to `None`
    pub fn resolve(&self, chunk_id: ChunkId) -> Option<LocationEntry> {
        if !chunk_id.is_valid() {
            return None;
        }
        let shard = self.existing_shard(chunk_id.creator())?;
        let (start, end, placement) = {
            let map = shard.read();
            let (start, end, placement) = map.get_interval(chunk_id.raw())?;
            (start, end, *placement)
        };

        let backup_range = placement
            .range
            .and_then(|key| self.ranges.get(&key).map(|r| r.value().clone()));

        trace!("Resolved chunk {} to primary 0x{:04X}", chunk_id, placement.primary);
        Some(LocationEntry {
            start: ChunkId::from_raw(start),
            end: ChunkId::from_raw(end),
            primary: placement.primary,
            backup_range,
        })
    }

    /// Register a newly opened backup range starting at `first_chunk_id`
    pub fn init_range(&self, first_chunk_id: ChunkId, primary: NodeId, backup_range: Option<BackupRange>) {
        let key = backup_range.as_ref().map(|r| r.key());
        if let Some(range) = backup_range {
            debug!("Initializing backup range {} at chunk {}", range, first_chunk_id);
            self.ranges.insert(range.key(), range);
        }
        self.record_interval(first_chunk_id, first_chunk_id, primary, key);
    }

    pub fn record_chunk(&self, chunk_id: ChunkId, primary: NodeId, range: Option<RangeKey>) {
        self.record_interval(chunk_id, chunk_id, primary, range);
    }

    /// Point `[start, end]` at `primary` and `range`, overwriting previous entries. Pieces that
    /// had a different primary before are published as migrated.
    pub fn record_interval(&self, start: ChunkId, end: ChunkId, primary: NodeId, range: Option<RangeKey>) {
        let mut moved = Vec::new();
        for (creator, seg_start, seg_end) in creator_segments(start, end) {
            let shard = self.shard(creator);
            let mut map = shard.write();
            moved.extend(
                map.overlapping(seg_start.raw(), seg_end.raw())
                    .into_iter()
                    .filter(|(_, _, previous)| previous.primary != primary)
                    .map(|(s, e, _)| (ChunkId::from_raw(s), ChunkId::from_raw(e))),
            );
            map.insert(seg_start.raw(), seg_end.raw(), Placement { primary, range });
        }

        for (piece_start, piece_end) in moved {
            debug!("Chunks {}-{} moved to 0x{:04X}", piece_start, piece_end, primary);
            self.publish(LocationChange::Migrated {
                start: piece_start,
                end: piece_end,
                primary,
            });
        }
    }

    /// Repoint a single chunk to a new primary
    pub fn migrate(&self, chunk_id: ChunkId, new_primary: NodeId) -> bool {
        self.migrate_range(chunk_id, chunk_id, new_primary) > 0
    }

    /// Repoint every known chunk in `[start, end]` to a new primary. Returns the intervals touched.
    pub fn migrate_range(&self, start: ChunkId, end: ChunkId, new_primary: NodeId) -> usize {
        let mut touched = 0;
        for (creator, seg_start, seg_end) in creator_segments(start, end) {
            if let Some(shard) = self.existing_shard(creator) {
                touched += shard
                    .write()
                    .update_range(seg_start.raw(), seg_end.raw(), |p| p.primary = new_primary);
            }
        }

        if touched > 0 {
            debug!("Migrated chunks {}-{} to 0x{:04X}", start, end, new_primary);
            self.publish(LocationChange::Migrated { start, end, primary: new_primary });
        }
        touched
    }

    /// Drop every entry in `[start, end]`
    pub fn remove_range(&self, start: ChunkId, end: ChunkId) -> usize {
        let mut removed = 0;
        for (creator, seg_start, seg_end) in creator_segments(start, end) {
            if let Some(shard) = self.existing_shard(creator) {
                removed += shard.write().remove(seg_start.raw(), seg_end.raw());
            }
        }

        if removed > 0 {
            self.publish(LocationChange::Removed { start, end });
        }
        removed
    }

    /// Drop the entries of individual chunks
    pub fn remove_chunks(&self, chunk_ids: &[ChunkId]) -> usize {
        let mut removed = Vec::with_capacity(chunk_ids.len());
        for &chunk_id in chunk_ids {
            if let Some(shard) = self.existing_shard(chunk_id.creator()) {
                if shard.write().remove(chunk_id.raw(), chunk_id.raw()) > 0 {
                    removed.push(chunk_id);
                }
            }
        }

        let count = removed.len();
        if count > 0 {
            self.publish(LocationChange::RemovedChunks(removed));
        }
        count
    }

    /// Store a new snapshot of a backup range
    pub fn update_backup_range(&self, range: BackupRange) {
        let key = range.key();
        trace!("Updating backup range {}", range);
        self.ranges.insert(key, range);
        self.publish(LocationChange::BackupRangeChanged(key));
    }

    /// Replace `failed` in a stored range snapshot. A snapshot without `failed` is left unchanged.
    pub fn replace_backup_peer(&self, key: RangeKey, failed: NodeId, replacement: Option<BackupPeer>) -> bool {
        let replaced = match self.ranges.get_mut(&key) {
            Some(mut range) => range.replace_peer(failed, replacement).is_some(),
            None => false,
        };

        if replaced {
            debug!(
                "Replaced backup peer 0x{:04X} of range {} with {:?}",
                failed,
                key,
                replacement.map(|p| p.node_id)
            );
            self.publish(LocationChange::BackupRangeChanged(key));
        }
        replaced
    }

    pub fn backup_range(&self, key: RangeKey) -> Option<BackupRange> {
        self.ranges.get(&key).map(|r| r.value().clone())
    }

    /// All backup ranges owned by `owner`, ordered by range ID
    pub fn backup_ranges_of(&self, owner: NodeId) -> Vec<BackupRange> {
        let mut ranges: Vec<BackupRange> = self
            .ranges
            .iter()
            .filter(|r| r.key().owner == owner)
            .map(|r| r.value().clone())
            .collect();
        ranges.sort_by_key(|r| r.range_id());
        ranges
    }

    pub fn backup_peers(&self, chunk_id: ChunkId) -> Vec<BackupPeer> {
        self.resolve(chunk_id)
            .map(|entry| entry.backup_peers())
            .unwrap_or_default()
    }

    /// Tell caches that `node` failed
    pub fn announce_peer_failure(&self, node: NodeId) {
        info!("Announcing failure of node 0x{:04X}", node);
        self.publish(LocationChange::PeerFailed(node));
    }

    /// Number of intervals stored for `creator`
    pub fn interval_count(&self, creator: NodeId) -> usize {
        self.existing_shard(creator).map(|s| s.read().len()).unwrap_or(0)
    }

    fn shard(&self, creator: NodeId) -> Shard {
        self.shards.entry(creator).or_default().value().clone()
    }

    fn existing_shard(&self, creator: NodeId) -> Option<Shard> {
        self.shards.get(&creator).map(|s| s.value().clone())
    }

    fn publish(&self, change: LocationChange) {
        // No subscribers is fine
        if self.changes.send(change).is_err() {
            trace!("No location cache subscribed");
        }
    }
}

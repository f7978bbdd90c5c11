use chunkvault_common::{
    BackupConfig, BackupPeer, BackupRange, ChunkId, ChunkVaultError, IntervalMap, LocalId, NodeId, PlacementKind,
    RangeId, RangeKey, RecoveryMetadata, Result,
};
use chunkvault_lookup::LocationDirectory;
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::collaborators::{LogHeaderSizer, MembershipView};
use crate::placement::PlacementStrategy;

/// A backup slot that was re-assigned after a peer failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotReplacement {
    pub range: RangeKey,
    pub slot: usize,
    pub failed: NodeId,
    /// `None` leaves the slot empty
    pub replacement: Option<BackupPeer>,
    /// Chunks the replacement has to receive
    pub chunk_ranges: Vec<(ChunkId, ChunkId)>,
}

/// An empty slot of a degraded range that a joining peer filled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotFill {
    pub range: RangeKey,
    pub slot: usize,
    pub peer: BackupPeer,
    pub chunk_ranges: Vec<(ChunkId, ChunkId)>,
}

#[derive(Debug, Clone, Copy)]
struct RecoveredEntry {
    range_id: RangeId,
    replacement: Option<NodeId>,
}

struct AllocatorState {
    ranges: BTreeMap<RangeId, BackupRange>,
    current: Option<RangeId>,
    next_range_id: Option<RangeId>,
    // raw chunk id -> range
    chunk_map: IntervalMap<RangeId>,
    highest_local: Option<LocalId>,
    placement: PlacementStrategy,
    placement_initialized: bool,
    // (failed node, its range id) -> range minted for the recovered chunks
    recovered: HashMap<(NodeId, RangeId), RecoveredEntry>,
}

impl AllocatorState {
    fn chunk_ranges_of(&self, range_id: RangeId) -> Vec<(ChunkId, ChunkId)> {
        self.chunk_map
            .iter()
            .filter(|(_, _, id)| **id == range_id)
            .map(|(start, end, _)| (ChunkId::from_raw(start), ChunkId::from_raw(end)))
            .collect()
    }

    fn take_range_id(&mut self, node_id: NodeId) -> Result<RangeId> {
        let range_id = self.next_range_id.ok_or(ChunkVaultError::RangeIdsExhausted(node_id))?;
        self.next_range_id = range_id.checked_add(1);
        Ok(range_id)
    }
}

/// Groups this node's chunks into size-bounded backup ranges.
///
/// Callers hold their chunk-table lock around `register_chunk`/`deregister_chunk` so chunk
/// creation and range bookkeeping are atomic as a pair. Lock order: chunk-table lock, then
/// [`block_creation`](Self::block_creation), then the internal range-list lock.
pub struct BackupRangeAllocator {
    config: Arc<BackupConfig>,
    membership: Arc<dyn MembershipView>,
    header_sizer: Arc<dyn LogHeaderSizer>,
    directory: Arc<LocationDirectory>,
    state: Mutex<AllocatorState>,
    creation_lock: Mutex<()>,
    cannot_open: AtomicBool,
}

impl BackupRangeAllocator {
    pub fn new(
        config: Arc<BackupConfig>,
        membership: Arc<dyn MembershipView>,
        header_sizer: Arc<dyn LogHeaderSizer>,
        directory: Arc<LocationDirectory>,
    ) -> Self {
        if config.backup_active && !config.available_for_backup {
            warn!("Node 0x{:04X} replicates its data but does NOT store backups of other nodes", config.node_id);
        }

        let placement = PlacementStrategy::from_config(&config);
        Self {
            state: Mutex::new(AllocatorState {
                ranges: BTreeMap::new(),
                current: None,
                next_range_id: Some(0),
                chunk_map: IntervalMap::new(),
                highest_local: None,
                placement,
                placement_initialized: false,
                recovered: HashMap::new(),
            }),
            config,
            membership,
            header_sizer,
            directory,
            creation_lock: Mutex::new(()),
            cannot_open: AtomicBool::new(false),
        }
    }

    /// Hold chunk creation and registration together
    pub fn block_creation(&self) -> MutexGuard<'_, ()> {
        self.creation_lock.lock()
    }

    /// Assign a chunk to a backup range, opening a new range if none fits
    pub fn register_chunk(&self, chunk_id: ChunkId, size: u64) -> Result<BackupRange> {
        if !self.config.backup_active {
            return Err(ChunkVaultError::BackupDisabled(self.config.node_id));
        }
        if !chunk_id.is_valid() {
            return Err(ChunkVaultError::InvalidChunkId(chunk_id));
        }

        let charged = self.charged_size(chunk_id, size);
        let limit = self.config.backup_range_size;
        if charged > limit {
            return Err(ChunkVaultError::ChunkTooLarge { chunk_id, size: charged, limit });
        }

        let (snapshot, opened) = {
            let mut state = self.state.lock();
            let (range_id, opened) = self.select_range(&mut state, chunk_id, charged)?;
            let range = state
                .ranges
                .get_mut(&range_id)
                .ok_or_else(|| ChunkVaultError::Other(format!("backup range {} vanished", range_id)))?;
            range.add_chunk(charged);
            let snapshot = range.clone();
            state.chunk_map.insert(chunk_id.raw(), chunk_id.raw(), range_id);
            (snapshot, opened)
        };

        if opened {
            self.directory
                .init_range(chunk_id, self.config.node_id, Some(snapshot.clone()));
        } else {
            self.directory
                .record_chunk(chunk_id, self.config.node_id, Some(snapshot.key()));
        }

        Ok(snapshot)
    }

    /// Register chunks of individual sizes; invalid IDs are skipped. Returns the number registered.
    pub fn register_chunks(&self, chunks: &[(ChunkId, u64)]) -> Result<usize> {
        let mut registered = 0;
        for &(chunk_id, size) in chunks {
            if chunk_id.is_valid() {
                self.register_chunk(chunk_id, size)?;
                registered += 1;
            }
        }
        Ok(registered)
    }

    /// Register chunks that all have the same size
    pub fn register_chunks_uniform(&self, chunk_ids: &[ChunkId], size: u64) -> Result<usize> {
        let mut registered = 0;
        for &chunk_id in chunk_ids {
            if chunk_id.is_valid() {
                self.register_chunk(chunk_id, size)?;
                registered += 1;
            }
        }
        Ok(registered)
    }

    /// Release the size of a chunk from its range. The chunk stays mapped to the range.
    pub fn deregister_chunk(&self, chunk_id: ChunkId, size: u64) -> Option<RangeId> {
        if !self.config.backup_active || !chunk_id.is_valid() {
            return None;
        }

        let charged = self.charged_size(chunk_id, size);
        let mut state = self.state.lock();
        let range_id = *state.chunk_map.get(chunk_id.raw())?;
        match state.ranges.get_mut(&range_id) {
            Some(range) => {
                range.remove_chunk(charged);
                Some(range_id)
            }
            None => {
                warn!("Backup range {} of chunk {} is unknown", range_id, chunk_id);
                None
            }
        }
    }

    /// Mint a range for chunks this node recovered from `failed_peer`.
    ///
    /// The new range keeps the surviving peers of `original_range`; this node's own slot and the
    /// failed peer's slot are vacated and one replacement is added. Returns the replacement, or
    /// `None` if no peer is available and the range stays degraded. Registering the same recovered range twice returns the
    /// first replacement without changing anything.
    pub fn register_recovered_chunks(
        &self,
        metadata: &RecoveryMetadata,
        original_range: &BackupRange,
        failed_peer: NodeId,
    ) -> Result<Option<NodeId>> {
        let node_id = self.config.node_id;
        let ledger_key = (failed_peer, original_range.range_id());
        let eligible: Vec<BackupPeer> = self
            .eligible_peers()
            .into_iter()
            .filter(|p| p.node_id != failed_peer)
            .collect();

        let (snapshot, placed) = {
            let mut state = self.state.lock();
            if let Some(entry) = state.recovered.get(&ledger_key) {
                debug!(
                    "Range {} of 0x{:04X} already recovered as range {}",
                    original_range.range_id(),
                    failed_peer,
                    entry.range_id
                );
                return Ok(entry.replacement);
            }

            let replacement = state
                .placement
                .determine_replacement_backup_peer(original_range.slots(), &eligible);
            if replacement.is_none() {
                warn!(
                    "No replacement peer for recovered range {} of 0x{:04X}, range stays degraded",
                    original_range.range_id(),
                    failed_peer
                );
            }

            let own_slot = original_range.slot_of(node_id);
            let mut slots: Vec<Option<BackupPeer>> = original_range
                .slots()
                .iter()
                .map(|slot| slot.filter(|p| p.node_id != node_id && p.node_id != failed_peer))
                .collect();
            let target = own_slot.or_else(|| slots.iter().position(|s| s.is_none()));
            let placed = match (target, replacement) {
                (Some(index), Some(peer)) => {
                    slots[index] = Some(peer);
                    Some(peer.node_id)
                }
                _ => None,
            };

            let range_id = state.take_range_id(node_id)?;
            let mut range = BackupRange::with_slots(node_id, range_id, slots);
            range.add_chunk(metadata.total_bytes);
            if range.size() > self.config.backup_range_size {
                warn!(
                    "Recovered range {} holds {} bytes, above the range size of {}",
                    range_id,
                    range.size(),
                    self.config.backup_range_size
                );
            }

            for &(start, end) in &metadata.chunk_ranges {
                state.chunk_map.insert(start.raw(), end.raw(), range_id);
            }
            state.ranges.insert(range_id, range.clone());
            state.recovered.insert(
                ledger_key,
                RecoveredEntry { range_id, replacement: placed },
            );

            for (index, peer) in range.peers().iter().enumerate() {
                info!(
                    "{}. backup peer for recovered range {} of 0x{:04X} (now {} on 0x{:04X}): 0x{:04X}",
                    index + 1,
                    original_range.range_id(),
                    failed_peer,
                    range_id,
                    node_id,
                    peer.node_id
                );
            }
            (range, placed)
        };

        let key = snapshot.key();
        self.directory.update_backup_range(snapshot);
        for &(start, end) in &metadata.chunk_ranges {
            self.directory.record_interval(start, end, node_id, Some(key));
        }

        Ok(placed)
    }

    /// The range minted for a recovered range of `failed_peer`, if any
    pub fn recovered_range(&self, failed_peer: NodeId, original_range_id: RangeId) -> Option<BackupRange> {
        let state = self.state.lock();
        let entry = state.recovered.get(&(failed_peer, original_range_id))?;
        state.ranges.get(&entry.range_id).cloned()
    }

    /// Replace `failed` in every range it backs. Ranges without an available replacement lose the
    /// slot and stay degraded. Ranges that no longer contain `failed` are left alone.
    pub fn replace_failed_peer(&self, failed: NodeId) -> Vec<SlotReplacement> {
        let eligible: Vec<BackupPeer> = self
            .eligible_peers()
            .into_iter()
            .filter(|p| p.node_id != failed)
            .collect();

        let replacements = {
            let mut state = self.state.lock();
            let affected: Vec<RangeId> = state
                .ranges
                .iter()
                .filter(|(_, range)| range.contains(failed))
                .map(|(&id, _)| id)
                .collect();

            let mut replacements = Vec::with_capacity(affected.len());
            for range_id in affected {
                let slots = match state.ranges.get(&range_id) {
                    Some(range) => range.slots().to_vec(),
                    None => continue,
                };
                let replacement = state
                    .placement
                    .determine_replacement_backup_peer(&slots, &eligible);

                let Some(range) = state.ranges.get_mut(&range_id) else {
                    continue;
                };
                let Some(slot) = range.replace_peer(failed, replacement) else {
                    continue;
                };
                let key = range.key();

                match replacement {
                    Some(peer) => info!("Replaced failed peer 0x{:04X} of range {} with {}", failed, key, peer),
                    None => warn!("Range {} lost backup peer 0x{:04X} and stays degraded", key, failed),
                }

                replacements.push(SlotReplacement {
                    range: key,
                    slot,
                    failed,
                    replacement,
                    chunk_ranges: state.chunk_ranges_of(range_id),
                });
            }
            replacements
        };

        for replacement in &replacements {
            self.directory
                .replace_backup_peer(replacement.range, failed, replacement.replacement);
        }
        replacements
    }

    /// Tell the placement strategy about a new peer and let it fill degraded ranges
    pub fn add_backup_peer(&self, peer: BackupPeer) -> Vec<SlotFill> {
        if peer.node_id == self.config.node_id {
            return Vec::new();
        }

        let (fills, snapshots) = {
            let mut state = self.state.lock();
            state.placement.add_new_backup_peer(peer);

            if !self.membership.is_available(peer.node_id) {
                debug!("Joined node 0x{:04X} does not store backups", peer.node_id);
                return Vec::new();
            }

            let mut fills = Vec::new();
            let mut snapshots = Vec::new();
            let degraded: Vec<RangeId> = state
                .ranges
                .iter()
                .filter(|(_, range)| range.is_degraded() && !range.contains(peer.node_id))
                .map(|(&id, _)| id)
                .collect();

            for range_id in degraded {
                let chunk_ranges = state.chunk_ranges_of(range_id);
                let conflict = match state.ranges.get(&range_id) {
                    Some(range) => state.placement.policy().topology_conflict(&peer, &range.peers()),
                    None => continue,
                };
                if conflict {
                    debug!("Peer {} violates topology constraints of range {}", peer, range_id);
                    continue;
                }

                let Some(range) = state.ranges.get_mut(&range_id) else {
                    continue;
                };
                if !range.add_peer(peer) {
                    continue;
                }
                let Some(slot) = range.slot_of(peer.node_id) else {
                    continue;
                };

                info!("Added joined peer {} to degraded range {}", peer, range.key());
                fills.push(SlotFill {
                    range: range.key(),
                    slot,
                    peer,
                    chunk_ranges,
                });
                snapshots.push(range.clone());
            }
            (fills, snapshots)
        };

        for snapshot in snapshots {
            self.directory.update_backup_range(snapshot);
        }
        fills
    }

    /// The range a chunk was registered in
    pub fn backup_range(&self, chunk_id: ChunkId) -> Option<BackupRange> {
        let state = self.state.lock();
        let range_id = state.chunk_map.get(chunk_id.raw())?;
        state.ranges.get(range_id).cloned()
    }

    pub fn backup_peers(&self, chunk_id: ChunkId) -> Vec<BackupPeer> {
        self.backup_range(chunk_id)
            .map(|range| range.peers())
            .unwrap_or_default()
    }

    /// All ranges of this node, ordered by range ID
    pub fn ranges(&self) -> Vec<BackupRange> {
        self.state.lock().ranges.values().cloned().collect()
    }

    /// The range new chunks go to first
    pub fn current_range(&self) -> Option<BackupRange> {
        let state = self.state.lock();
        state.current.and_then(|id| state.ranges.get(&id).cloned())
    }

    /// Chunk intervals mapped to a range
    pub fn chunk_ranges_of(&self, range_id: RangeId) -> Vec<(ChunkId, ChunkId)> {
        self.state.lock().chunk_ranges_of(range_id)
    }

    /// True while the last attempt to open a range failed for lack of peers
    pub fn cannot_open_new_range(&self) -> bool {
        self.cannot_open.load(Ordering::Relaxed)
    }

    pub fn strategy_kind(&self) -> PlacementKind {
        self.state.lock().placement.kind()
    }

    fn charged_size(&self, chunk_id: ChunkId, size: u64) -> u64 {
        size.saturating_add(self.header_sizer.approx_header_size(chunk_id, size))
    }

    fn eligible_peers(&self) -> Vec<BackupPeer> {
        let node_id = self.config.node_id;
        self.membership
            .available_backup_peers()
            .into_iter()
            .filter(|p| p.node_id != node_id)
            .collect()
    }

    /// Pick the range for a chunk: its previous range if the local ID is reused, else the open
    /// range, else the first range with room, else a new one.
    fn select_range(&self, state: &mut AllocatorState, chunk_id: ChunkId, charged: u64) -> Result<(RangeId, bool)> {
        let limit = self.config.backup_range_size;

        if chunk_id.creator() == self.config.node_id {
            let local_id = chunk_id.local_id();
            let reused = matches!(state.highest_local, Some(highest) if local_id <= highest);
            if reused {
                let previous = state
                    .chunk_map
                    .get(chunk_id.raw())
                    .copied()
                    .filter(|id| state.ranges.get(id).map_or(false, |r| r.fits(charged, limit)));
                if let Some(range_id) = previous {
                    debug!("Reused chunk {} goes back to range {}", chunk_id, range_id);
                    return Ok((range_id, false));
                }
            } else {
                state.highest_local = Some(local_id);
            }
        }

        if let Some(current) = state.current {
            if state.ranges.get(&current).map_or(false, |r| r.fits(charged, limit)) {
                return Ok((current, false));
            }
        }

        let existing = state
            .ranges
            .iter()
            .find(|(_, range)| range.fits(charged, limit))
            .map(|(&id, _)| id);
        if let Some(range_id) = existing {
            return Ok((range_id, false));
        }

        self.open_range(state).map(|id| (id, true))
    }

    fn open_range(&self, state: &mut AllocatorState) -> Result<RangeId> {
        let node_id = self.config.node_id;
        let eligible = self.eligible_peers();

        if !state.placement_initialized {
            debug!("Initializing first backup range");
            state.placement.initialize(&eligible);
            state.placement_initialized = true;
        }

        let replication_factor = state.placement.replication_factor();
        let insufficient = ChunkVaultError::InsufficientPeers {
            needed: replication_factor,
            available: eligible.len(),
        };
        if eligible.is_empty() {
            if !self.cannot_open.swap(true, Ordering::Relaxed) {
                warn!("Cannot open new backup range on 0x{:04X}: no eligible backup peers", node_id);
            }
            return Err(insufficient);
        }

        let range_id = match state.next_range_id {
            Some(id) => id,
            None => return Err(ChunkVaultError::RangeIdsExhausted(node_id)),
        };
        let previous = state.current.and_then(|id| state.ranges.get(&id)).cloned();
        let Some(range) = state
            .placement
            .determine_backup_peers(node_id, range_id, &eligible, previous.as_ref())
        else {
            self.cannot_open.store(true, Ordering::Relaxed);
            return Err(insufficient);
        };
        state.take_range_id(node_id)?;

        if self.cannot_open.swap(false, Ordering::Relaxed) {
            info!("Backup ranges can be opened again on 0x{:04X}", node_id);
        }
        for (index, peer) in range.peers().iter().enumerate() {
            info!("{}. backup peer determined for new range {}: 0x{:04X}", index + 1, range_id, peer.node_id);
        }

        state.ranges.insert(range_id, range);
        state.current = Some(range_id);
        Ok(range_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{FixedHeaderSize, StaticMembership};

    fn allocator(range_size: u64, peers: Vec<BackupPeer>) -> BackupRangeAllocator {
        let config = BackupConfig {
            node_id: 1,
            replication_factor: 2,
            backup_range_size: range_size,
            placement_seed: Some(42),
            ..BackupConfig::default()
        };
        BackupRangeAllocator::new(
            Arc::new(config),
            Arc::new(StaticMembership::new(peers)),
            Arc::new(FixedHeaderSize(0)),
            Arc::new(LocationDirectory::new()),
        )
    }

    fn peers(ids: &[NodeId]) -> Vec<BackupPeer> {
        ids.iter().map(|&id| BackupPeer::new(id, 0, 0)).collect()
    }

    #[test]
    fn test_reused_local_id_returns_to_previous_range() {
        let allocator = allocator(1000, peers(&[2, 3, 4, 5]));
        let first = allocator.register_chunk(ChunkId::new(1, 0), 600).unwrap();
        let second = allocator.register_chunk(ChunkId::new(1, 1), 600).unwrap();
        assert_ne!(first.range_id(), second.range_id());

        // Chunk 0 is deleted and its ID reused while range 1 is open
        allocator.deregister_chunk(ChunkId::new(1, 0), 600);
        let reused = allocator.register_chunk(ChunkId::new(1, 0), 300).unwrap();
        assert_eq!(reused.range_id(), first.range_id());
        assert_eq!(reused.size(), 300);
    }

    #[test]
    fn test_rejects_invalid_and_oversized() {
        let allocator = allocator(1000, peers(&[2, 3]));
        assert!(matches!(
            allocator.register_chunk(ChunkId::INVALID, 10),
            Err(ChunkVaultError::InvalidChunkId(_))
        ));
        assert!(matches!(
            allocator.register_chunk(ChunkId::new(1, 0), 1001),
            Err(ChunkVaultError::ChunkTooLarge { .. })
        ));
        assert!(allocator.ranges().is_empty());
    }

    #[test]
    fn test_no_peers_enters_warning_state() {
        let allocator = allocator(1000, Vec::new());
        assert!(matches!(
            allocator.register_chunk(ChunkId::new(1, 0), 10),
            Err(ChunkVaultError::InsufficientPeers { needed: 2, available: 0 })
        ));
        assert!(allocator.cannot_open_new_range());
    }

    #[test]
    fn test_deregister_keeps_mapping() {
        let allocator = allocator(1000, peers(&[2, 3]));
        let range = allocator.register_chunk(ChunkId::new(1, 0), 100).unwrap();
        assert_eq!(allocator.deregister_chunk(ChunkId::new(1, 0), 100), Some(range.range_id()));
        assert_eq!(allocator.backup_range(ChunkId::new(1, 0)).unwrap().size(), 0);
        assert_eq!(allocator.deregister_chunk(ChunkId::new(1, 9), 100), None);
    }

    #[test]
    fn test_chunk_ranges_coalesce() {
        let allocator = allocator(10_000, peers(&[2, 3]));
        let ids: Vec<ChunkId> = (0..10).map(|local| ChunkId::new(1, local)).collect();
        assert_eq!(allocator.register_chunks_uniform(&ids, 10).unwrap(), 10);
        assert_eq!(
            allocator.chunk_ranges_of(0),
            vec![(ChunkId::new(1, 0), ChunkId::new(1, 9))]
        );
    }

    #[test]
    fn test_block_creation_guard() {
        let allocator = allocator(1000, peers(&[2, 3]));
        let guard = allocator.block_creation();
        allocator.register_chunk(ChunkId::new(1, 0), 10).unwrap();
        drop(guard);
        assert!(allocator.creation_lock.try_lock().is_some());
    }
}

use chunkvault_common::types::creator_segments;
use chunkvault_common::{BackupConfig, BackupRange, ChunkId, IntervalMap, LocationEntry, NodeId, RangeKey};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::directory::LocationChange;

/// Cached location with timestamp for TTL support
#[derive(Debug, Clone, PartialEq)]
struct CachedLocation {
    primary: NodeId,
    backup_range: Option<BackupRange>,
    cached_at: Instant,
}

impl CachedLocation {
    fn new(primary: NodeId, backup_range: Option<BackupRange>) -> Self {
        Self {
            primary,
            backup_range,
            cached_at: Instant::now(),
        }
    }

    fn is_expired(&self, ttl: Option<Duration>) -> bool {
        ttl.map_or(false, |ttl| self.cached_at.elapsed() > ttl)
    }

    fn references(&self, node: NodeId) -> bool {
        self.primary == node
            || self
                .backup_range
                .as_ref()
                .map_or(false, |range| range.contains(node))
    }
}

/// Statistics for cache performance monitoring
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    invalidations: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    pub fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn insert(&self) {
        self.inserts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn invalidate(&self, count: u64) {
        self.invalidations.fetch_add(count, Ordering::Relaxed);
    }

    pub fn evict(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    /// (hits, misses, inserts, invalidations, evictions)
    pub fn get_stats(&self) -> (u64, u64, u64, u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            self.inserts.load(Ordering::Relaxed),
            self.invalidations.load(Ordering::Relaxed),
            self.evictions.load(Ordering::Relaxed),
        )
    }

    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed) as f64;
        let misses = self.misses.load(Ordering::Relaxed) as f64;
        let total = hits + misses;
        if total > 0.0 {
            hits / total
        } else {
            0.0
        }
    }
}

/// Copy-on-write interval map for one creator. Readers clone the `Arc` and never wait on writers
/// for longer than that; writers are serialized by `writer`.
#[derive(Default)]
struct CacheShard {
    snapshot: RwLock<Arc<IntervalMap<CachedLocation>>>,
    writer: Mutex<()>,
}

impl CacheShard {
    fn load(&self) -> Arc<IntervalMap<CachedLocation>> {
        self.snapshot.read().clone()
    }

    fn update<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut IntervalMap<CachedLocation>) -> R,
    {
        let _writer = self.writer.lock();
        let mut next = (*self.load()).clone();
        let result = f(&mut next);
        *self.snapshot.write() = Arc::new(next);
        result
    }
}

/// Peer-local, read-mostly mirror of the location directory.
///
/// Entries may be stale; every entry is either absent or equal to what the directory returned
/// at some point. Staleness is bounded by invalidation events and the optional TTL.
pub struct LocationCache {
    shards: DashMap<NodeId, Arc<CacheShard>>,
    ttl: Option<Duration>,
    stats: CacheStats,
}

impl Default for LocationCache {
    fn default() -> Self {
        Self::new(None)
    }
}

impl LocationCache {
    /// Create a cache; `None` disables expiry
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            shards: DashMap::new(),
            ttl,
            stats: CacheStats::default(),
        }
    }

    pub fn from_config(config: &BackupConfig) -> Self {
        let ttl = (config.cache_ttl_ms > 0).then(|| Duration::from_millis(config.cache_ttl_ms));
        Self::new(ttl)
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Number of cached intervals
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.value().load().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the cached location of a chunk
    pub fn get(&self, chunk_id: ChunkId) -> Option<LocationEntry> {
        let Some(shard) = self.existing_shard(chunk_id.creator()) else {
            self.stats.miss();
            return None;
        };

        let snapshot = shard.load();
        match snapshot.get_interval(chunk_id.raw()) {
            Some((start, end, cached)) if cached.is_expired(self.ttl) => {
                trace!("Cached location of {} expired", chunk_id);
                let cached_at = cached.cached_at;
                shard.update(|map| {
                    // Another writer may have refreshed the interval in the meantime
                    if map.get(chunk_id.raw()).map_or(false, |c| c.cached_at == cached_at) {
                        map.remove(start, end);
                    }
                });
                self.stats.evict();
                self.stats.miss();
                None
            }
            Some((start, end, cached)) => {
                trace!("Cache hit for chunk {}", chunk_id);
                self.stats.hit();
                Some(LocationEntry {
                    start: ChunkId::from_raw(start),
                    end: ChunkId::from_raw(end),
                    primary: cached.primary,
                    backup_range: cached.backup_range.clone(),
                })
            }
            None => {
                trace!("Cache miss for chunk {}", chunk_id);
                self.stats.miss();
                None
            }
        }
    }

    /// Cache `[start, end]` on `primary` without backup information
    pub fn cache_range(&self, start: ChunkId, end: ChunkId, primary: NodeId) {
        self.insert(start, end, CachedLocation::new(primary, None));
    }

    /// Cache a location as resolved by the directory
    pub fn cache_entry(&self, entry: &LocationEntry) {
        self.insert(
            entry.start,
            entry.end,
            CachedLocation::new(entry.primary, entry.backup_range.clone()),
        );
    }

    /// Drop individual chunks
    pub fn invalidate(&self, chunk_ids: &[ChunkId]) -> usize {
        let mut removed = 0;
        for &chunk_id in chunk_ids {
            if let Some(shard) = self.existing_shard(chunk_id.creator()) {
                removed += shard.update(|map| map.remove(chunk_id.raw(), chunk_id.raw()));
            }
        }
        self.stats.invalidate(removed as u64);
        removed
    }

    /// Drop everything cached inside `[start, end]`
    pub fn invalidate_range(&self, start: ChunkId, end: ChunkId) -> usize {
        let mut removed = 0;
        for (creator, seg_start, seg_end) in creator_segments(start, end) {
            if let Some(shard) = self.existing_shard(creator) {
                removed += shard.update(|map| map.remove(seg_start.raw(), seg_end.raw()));
            }
        }
        self.stats.invalidate(removed as u64);
        removed
    }

    /// Drop every interval that names `node` as primary or backup peer
    pub fn invalidate_peer(&self, node: NodeId) -> usize {
        let removed = self.retain(|cached| !cached.references(node));
        debug!("Invalidated {} cached intervals referencing 0x{:04X}", removed, node);
        removed
    }

    /// Drop every interval covered by the given backup range
    pub fn invalidate_backup_range(&self, key: RangeKey) -> usize {
        self.retain(|cached| cached.backup_range.as_ref().map(|r| r.key()) != Some(key))
    }

    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.value().update(|map| map.clear());
        }
    }

    /// Apply a directory change. Returns the number of intervals dropped.
    pub fn apply(&self, change: &LocationChange) -> usize {
        match change {
            LocationChange::Migrated { start, end, .. } | LocationChange::Removed { start, end } => {
                self.invalidate_range(*start, *end)
            }
            LocationChange::RemovedChunks(chunk_ids) => self.invalidate(chunk_ids),
            LocationChange::BackupRangeChanged(key) => self.invalidate_backup_range(*key),
            LocationChange::PeerFailed(node) => self.invalidate_peer(*node),
        }
    }

    /// Apply directory changes until the channel closes. A lagging listener clears the whole
    /// cache since it can no longer tell which entries went stale.
    pub fn listen(self: Arc<Self>, mut changes: broadcast::Receiver<LocationChange>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        self.apply(&change);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Location cache missed {} changes, clearing", skipped);
                        self.clear();
                    }
                    Err(RecvError::Closed) => {
                        debug!("Location change channel closed");
                        break;
                    }
                }
            }
        })
    }

    fn insert(&self, start: ChunkId, end: ChunkId, cached: CachedLocation) {
        for (creator, seg_start, seg_end) in creator_segments(start, end) {
            let shard = self.shard(creator);
            let value = cached.clone();
            shard.update(|map| map.insert(seg_start.raw(), seg_end.raw(), value));
            self.stats.insert();
        }
    }

    fn retain<F>(&self, keep: F) -> usize
    where
        F: Fn(&CachedLocation) -> bool,
    {
        let mut removed = 0;
        for shard in self.shards.iter() {
            removed += shard.value().update(|map| map.retain(|_, _, cached| keep(cached)));
        }
        self.stats.invalidate(removed as u64);
        removed
    }

    fn shard(&self, creator: NodeId) -> Arc<CacheShard> {
        self.shards.entry(creator).or_default().value().clone()
    }

    fn existing_shard(&self, creator: NodeId) -> Option<Arc<CacheShard>> {
        self.shards.get(&creator).map(|s| s.value().clone())
    }
}

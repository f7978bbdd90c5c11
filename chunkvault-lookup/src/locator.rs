use chunkvault_common::{BackupPeer, ChunkId, LocationEntry, NodeId};
use std::sync::Arc;
use tracing::trace;

use crate::cache::LocationCache;
use crate::directory::LocationDirectory;

/// Resolves chunk locations through the local cache, falling back to the directory
#[derive(Clone)]
pub struct ChunkLocator {
    cache: Arc<LocationCache>,
    directory: Arc<LocationDirectory>,
}

impl ChunkLocator {
    pub fn new(cache: Arc<LocationCache>, directory: Arc<LocationDirectory>) -> Self {
        Self { cache, directory }
    }

    /// Cache first, then the directory; a directory hit populates the cache
    pub fn locate(&self, chunk_id: ChunkId) -> Option<LocationEntry> {
        if let Some(entry) = self.cache.get(chunk_id) {
            return Some(entry);
        }

        let entry = self.directory.resolve(chunk_id)?;
        trace!("Caching interval {}-{} on 0x{:04X}", entry.start, entry.end, entry.primary);
        self.cache.cache_entry(&entry);
        Some(entry)
    }

    pub fn primary_of(&self, chunk_id: ChunkId) -> Option<NodeId> {
        self.locate(chunk_id).map(|entry| entry.primary)
    }

    pub fn backup_peers(&self, chunk_id: ChunkId) -> Vec<BackupPeer> {
        self.locate(chunk_id)
            .map(|entry| entry.backup_peers())
            .unwrap_or_default()
    }

    pub fn cache(&self) -> &Arc<LocationCache> {
        &self.cache
    }

    pub fn directory(&self) -> &Arc<LocationDirectory> {
        &self.directory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locate_populates_cache() {
        let directory = Arc::new(LocationDirectory::new());
        let cache = Arc::new(LocationCache::default());
        let locator = ChunkLocator::new(cache.clone(), directory.clone());

        assert!(locator.locate(ChunkId::new(1, 0)).is_none());

        directory.record_interval(ChunkId::new(1, 0), ChunkId::new(1, 9), 1, None);
        assert_eq!(locator.primary_of(ChunkId::new(1, 3)), Some(1));
        assert_eq!(cache.len(), 1);

        // Served from cache now
        let (hits_before, _, _, _, _) = cache.stats().get_stats();
        assert_eq!(locator.primary_of(ChunkId::new(1, 8)), Some(1));
        let (hits_after, _, _, _, _) = cache.stats().get_stats();
        assert_eq!(hits_after, hits_before + 1);
    }
}

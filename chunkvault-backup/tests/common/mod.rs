#![allow(dead_code)]

use async_trait::async_trait;
use chunkvault_backup::{BackupRangeAllocator, FixedHeaderSize, ResyncTransport, StaticMembership};
use chunkvault_common::{BackupConfig, BackupPeer, ChunkId, NodeId, RangeKey, Result};
use chunkvault_lookup::LocationDirectory;
use parking_lot::Mutex;
use std::sync::Arc;

pub fn peers(ids: impl IntoIterator<Item = NodeId>) -> Vec<BackupPeer> {
    ids.into_iter().map(|id| BackupPeer::new(id, 0, 0)).collect()
}

pub fn config(node_id: NodeId, replication_factor: usize, range_size: u64) -> BackupConfig {
    BackupConfig {
        node_id,
        replication_factor,
        backup_range_size: range_size,
        placement_seed: Some(0xC0FFEE),
        ..BackupConfig::default()
    }
}

pub struct Fixture {
    pub membership: Arc<StaticMembership>,
    pub directory: Arc<LocationDirectory>,
    pub allocator: Arc<BackupRangeAllocator>,
}

pub fn fixture(config: BackupConfig, peers: Vec<BackupPeer>, header_size: u64) -> Fixture {
    let membership = Arc::new(StaticMembership::new(peers));
    let directory = Arc::new(LocationDirectory::new());
    let allocator = Arc::new(BackupRangeAllocator::new(
        Arc::new(config),
        membership.clone(),
        Arc::new(FixedHeaderSize(header_size)),
        directory.clone(),
    ));
    Fixture {
        membership,
        directory,
        allocator,
    }
}

/// Records every resync it is asked to perform
#[derive(Default)]
pub struct RecordingTransport {
    pub calls: Mutex<Vec<(NodeId, RangeKey, Vec<(ChunkId, ChunkId)>)>>,
}

impl RecordingTransport {
    pub fn targets(&self) -> Vec<NodeId> {
        self.calls.lock().iter().map(|(target, _, _)| *target).collect()
    }
}

#[async_trait]
impl ResyncTransport for RecordingTransport {
    async fn replicate_range(
        &self,
        target: NodeId,
        range: RangeKey,
        chunk_ranges: Vec<(ChunkId, ChunkId)>,
    ) -> Result<u64> {
        let chunks = chunk_ranges
            .iter()
            .map(|(start, end)| end.raw() - start.raw() + 1)
            .sum();
        self.calls.lock().push((target, range, chunk_ranges));
        Ok(chunks)
    }
}

pub async fn wait_for<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

use anyhow::{Context, Result};
use chunkvault_common::{
    BackupConfig, BackupPeer, BackupRange, ChunkId, ChunkVaultError, LocationEntry, RangeId, Version,
};
use chunkvault_lookup::{ChunkLocator, LocationCache, LocationDirectory};
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::allocator::BackupRangeAllocator;
use crate::collaborators::{
    FixedHeaderSize, LogHeaderSizer, MembershipEvent, MembershipView, PeerFailureEvent, PeerJoinEvent, RecoverySource,
    ResyncTransport,
};
use crate::recovery::{FailureOutcome, FailureRecoveryCoordinator, JoinOutcome};
use crate::resync::{ResyncDispatcher, ResyncStats};
use crate::versions::{VersionFlusher, VersionRegistry};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Handles to the services a node depends on
#[derive(Clone)]
pub struct Collaborators {
    pub membership: Arc<dyn MembershipView>,
    /// Defaults to a fixed `log_header_size` per chunk
    pub header_sizer: Option<Arc<dyn LogHeaderSizer>>,
    pub recovery: Arc<dyn RecoverySource>,
    pub transport: Arc<dyn ResyncTransport>,
}

/// Chunk location and backup management of a single node
pub struct BackupNode {
    config: Arc<BackupConfig>,
    locator: ChunkLocator,
    allocator: Arc<BackupRangeAllocator>,
    coordinator: FailureRecoveryCoordinator,
    versions: Arc<VersionRegistry>,
    resync: ResyncDispatcher,
    shutdown: broadcast::Sender<()>,
    cache_listener: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BackupNode {
    /// Build the node and spawn its background tasks. Must be called inside a tokio runtime.
    pub fn start(config: BackupConfig, directory: Arc<LocationDirectory>, collaborators: Collaborators) -> Result<Arc<Self>> {
        config.validate().context("Invalid backup configuration")?;
        let config = Arc::new(config);
        info!(
            "Starting backup node 0x{:04X} (replication factor {}, {} placement)",
            config.node_id,
            config.replication_factor,
            config.placement_strategy.as_str()
        );

        let (shutdown, _) = broadcast::channel(1);
        let mut tasks = Vec::new();

        let cache = Arc::new(LocationCache::from_config(&config));
        let cache_listener = Arc::clone(&cache).listen(directory.subscribe());
        let locator = ChunkLocator::new(cache, Arc::clone(&directory));

        let header_sizer = match collaborators.header_sizer {
            Some(sizer) => sizer,
            None => Arc::new(FixedHeaderSize(config.log_header_size)) as Arc<dyn LogHeaderSizer>,
        };
        let allocator = Arc::new(BackupRangeAllocator::new(
            Arc::clone(&config),
            collaborators.membership,
            header_sizer,
            Arc::clone(&directory),
        ));

        let versions = Arc::new(VersionRegistry::new(Arc::clone(&config)));
        tasks.push(VersionFlusher::spawn(Arc::clone(&versions), shutdown.subscribe()));

        let (resync, workers) =
            ResyncDispatcher::spawn(collaborators.transport, config.resync_workers, shutdown.subscribe());
        tasks.extend(workers);

        let coordinator = FailureRecoveryCoordinator::new(
            config.node_id,
            Arc::clone(&allocator),
            directory,
            collaborators.recovery,
            resync.clone(),
        );

        Ok(Arc::new(Self {
            config,
            locator,
            allocator,
            coordinator,
            versions,
            resync,
            shutdown,
            cache_listener: Mutex::new(Some(cache_listener)),
            tasks: Mutex::new(tasks),
        }))
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    pub fn locator(&self) -> &ChunkLocator {
        &self.locator
    }

    pub fn allocator(&self) -> &Arc<BackupRangeAllocator> {
        &self.allocator
    }

    pub fn versions(&self) -> &Arc<VersionRegistry> {
        &self.versions
    }

    /// Fires when [`shutdown`](Self::shutdown) is called
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    pub fn resync_stats(&self) -> &Arc<ResyncStats> {
        self.resync.stats()
    }

    /// Current primary and backups of a chunk
    pub fn resolve(&self, chunk_id: ChunkId) -> Option<LocationEntry> {
        self.locator.locate(chunk_id)
    }

    pub fn register_chunk(&self, chunk_id: ChunkId, size: u64) -> chunkvault_common::Result<BackupRange> {
        self.allocator.register_chunk(chunk_id, size)
    }

    pub fn register_chunks(&self, chunks: &[(ChunkId, u64)]) -> chunkvault_common::Result<usize> {
        self.allocator.register_chunks(chunks)
    }

    pub fn deregister_chunk(&self, chunk_id: ChunkId, size: u64) -> Option<RangeId> {
        self.allocator.deregister_chunk(chunk_id, size)
    }

    /// Backup peers of a chunk, from this node's ranges or the location service
    pub fn backup_peers(&self, chunk_id: ChunkId) -> Vec<BackupPeer> {
        match self.allocator.backup_range(chunk_id) {
            Some(range) => range.peers(),
            None => self.locator.backup_peers(chunk_id),
        }
    }

    pub fn on_peer_failure(&self, event: &PeerFailureEvent) -> chunkvault_common::Result<FailureOutcome> {
        self.coordinator.on_peer_failure(event)
    }

    pub fn on_peer_join(&self, event: &PeerJoinEvent) -> JoinOutcome {
        self.coordinator.on_peer_join(event)
    }

    /// Current version of a chunk of this node; `None` for unknown or never written chunks
    pub fn get_version(&self, chunk_id: ChunkId) -> chunkvault_common::Result<Option<Version>> {
        let Some(range) = self.allocator.backup_range(chunk_id) else {
            return Ok(None);
        };
        match self.versions.get(range.key()) {
            Some(tracker) => tracker.current(chunk_id),
            None => Ok(None),
        }
    }

    /// Version for the next write of a registered chunk. May block on version backpressure.
    pub fn get_next_version(&self, chunk_id: ChunkId) -> chunkvault_common::Result<Version> {
        let range = self
            .allocator
            .backup_range(chunk_id)
            .ok_or(ChunkVaultError::UnknownChunk(chunk_id))?;
        self.versions.tracker(range.key())?.get_next(chunk_id)
    }

    pub fn flush_versions(&self) -> chunkvault_common::Result<usize> {
        self.versions.flush_all()
    }

    fn handle_event(&self, event: MembershipEvent) {
        match event {
            MembershipEvent::Failure(failure) => match self.on_peer_failure(&failure) {
                Ok(outcome) => debug!(
                    "Failure of 0x{:04X}: {} slots replaced, {} ranges recovered, {} resyncs",
                    failure.node_id,
                    outcome.replacements.len(),
                    outcome.recovered.len(),
                    outcome.resyncs_dispatched
                ),
                Err(e) => error!("Failed to handle failure of 0x{:04X}: {}", failure.node_id, e),
            },
            MembershipEvent::Join(join) => {
                let outcome = self.on_peer_join(&join);
                debug!(
                    "Join of 0x{:04X}: {} slots filled, {} resyncs",
                    join.node_id,
                    outcome.fills.len(),
                    outcome.resyncs_dispatched
                );
            }
        }
    }

    /// Handle membership events one at a time until the channel closes or shutdown is signalled
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<MembershipEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        info!("Backup node 0x{:04X} processing membership events", self.config.node_id);
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        debug!("Membership event channel closed");
                        break;
                    };
                    let node = Arc::clone(&self);
                    tokio::task::spawn_blocking(move || node.handle_event(event))
                        .await
                        .context("Membership event handler panicked")?;
                }
                _ = shutdown.recv() => {
                    info!("Backup node 0x{:04X} received shutdown signal", self.config.node_id);
                    break;
                }
            }
        }
        Ok(())
    }

    /// Stop background tasks and flush buffered versions
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down backup node 0x{:04X}", self.config.node_id);
        if self.shutdown.send(()).is_err() {
            debug!("No background task was listening for shutdown");
        }

        let mut tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        match tokio::time::timeout(SHUTDOWN_GRACE, join_all(tasks.iter_mut())).await {
            Ok(results) => {
                for e in results.into_iter().filter_map(|r| r.err()) {
                    warn!("Background task failed during shutdown: {}", e);
                }
            }
            Err(_) => {
                warn!("Background tasks did not stop in time, aborting");
                tasks.iter().for_each(|task| task.abort());
            }
        }

        // The listener only ends when the directory goes away
        let listener = self.cache_listener.lock().take();
        if let Some(listener) = listener {
            listener.abort();
        }

        let versions = Arc::clone(&self.versions);
        let flushed = tokio::task::spawn_blocking(move || versions.flush_all())
            .await
            .context("Version flush panicked")??;
        info!("Flushed versions of {} ranges", flushed);
        Ok(())
    }
}

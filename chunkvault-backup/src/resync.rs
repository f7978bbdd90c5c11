use chunkvault_common::{ChunkId, ChunkVaultError, NodeId, RangeKey, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::collaborators::ResyncTransport;

/// Copy the chunks of a range to a peer that just took over a backup slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResyncRequest {
    pub target: NodeId,
    pub range: RangeKey,
    pub chunk_ranges: Vec<(ChunkId, ChunkId)>,
}

#[derive(Debug, Default)]
pub struct ResyncStats {
    requested: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    chunks_replicated: AtomicU64,
}

impl ResyncStats {
    pub fn requested(&self) -> u64 {
        self.requested.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn chunks_replicated(&self) -> u64 {
        self.chunks_replicated.load(Ordering::Relaxed)
    }

    /// Requests neither completed nor failed yet
    pub fn pending(&self) -> u64 {
        self.requested()
            .saturating_sub(self.completed())
            .saturating_sub(self.failed())
    }
}

/// Queue of resync requests served by a fixed pool of worker tasks
#[derive(Clone)]
pub struct ResyncDispatcher {
    sender: mpsc::UnboundedSender<ResyncRequest>,
    stats: Arc<ResyncStats>,
}

impl ResyncDispatcher {
    pub fn spawn(
        transport: Arc<dyn ResyncTransport>,
        workers: usize,
        shutdown: broadcast::Receiver<()>,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver = Arc::new(Mutex::new(receiver));
        let stats = Arc::new(ResyncStats::default());

        let handles = (0..workers.max(1))
            .map(|worker| {
                tokio::spawn(Self::worker_loop(
                    worker,
                    Arc::clone(&transport),
                    Arc::clone(&receiver),
                    Arc::clone(&stats),
                    shutdown.resubscribe(),
                ))
            })
            .collect();

        (Self { sender, stats }, handles)
    }

    pub fn dispatch(&self, request: ResyncRequest) -> Result<()> {
        debug!("Queueing resync of range {} to 0x{:04X}", request.range, request.target);
        self.stats.requested.fetch_add(1, Ordering::Relaxed);
        self.sender.send(request).map_err(|_| {
            self.stats.requested.fetch_sub(1, Ordering::Relaxed);
            ChunkVaultError::ChannelClosed("resync queue".to_string())
        })
    }

    pub fn stats(&self) -> &Arc<ResyncStats> {
        &self.stats
    }

    async fn worker_loop(
        worker: usize,
        transport: Arc<dyn ResyncTransport>,
        receiver: Arc<Mutex<mpsc::UnboundedReceiver<ResyncRequest>>>,
        stats: Arc<ResyncStats>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        debug!("Resync worker {} started", worker);
        loop {
            let request = tokio::select! {
                request = async { receiver.lock().await.recv().await } => request,
                _ = shutdown.recv() => {
                    debug!("Resync worker {} shutting down", worker);
                    break;
                }
            };
            let Some(request) = request else { break };

            let ResyncRequest { target, range, chunk_ranges } = request;
            match transport.replicate_range(target, range, chunk_ranges).await {
                Ok(chunks) => {
                    stats.completed.fetch_add(1, Ordering::Relaxed);
                    stats.chunks_replicated.fetch_add(chunks, Ordering::Relaxed);
                    info!("Resynced {} chunks of range {} to 0x{:04X}", chunks, range, target);
                }
                Err(e) => {
                    // The slot stays assigned; the next failure or join event repairs it
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    error!("Resync of range {} to 0x{:04X} failed: {}", range, target, e);
                }
            }
        }
        if stats.pending() > 0 {
            warn!("Resync worker {} stopped with {} requests pending", worker, stats.pending());
        }
    }
}

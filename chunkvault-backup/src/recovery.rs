use chunkvault_common::{ChunkId, NodeId, RangeId, RangeKey, Result};
use chunkvault_lookup::LocationDirectory;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::allocator::{BackupRangeAllocator, SlotFill, SlotReplacement};
use crate::collaborators::{FailureRole, PeerFailureEvent, PeerJoinEvent, RecoverySource};
use crate::resync::{ResyncDispatcher, ResyncRequest};

/// A range of a failed primary this node took over
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredOutcome {
    pub original_range: RangeId,
    pub new_range: Option<RangeKey>,
    pub replacement: Option<NodeId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureOutcome {
    pub replacements: Vec<SlotReplacement>,
    pub recovered: Vec<RecoveredOutcome>,
    pub resyncs_dispatched: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinOutcome {
    pub fills: Vec<SlotFill>,
    pub resyncs_dispatched: usize,
}

/// Restores the replication factor of this node's ranges after membership changes.
///
/// Events must be handled one at a time; replaying an event is a no-op.
pub struct FailureRecoveryCoordinator {
    node_id: NodeId,
    allocator: Arc<BackupRangeAllocator>,
    directory: Arc<LocationDirectory>,
    recovery: Arc<dyn RecoverySource>,
    resync: ResyncDispatcher,
}

impl FailureRecoveryCoordinator {
    pub fn new(
        node_id: NodeId,
        allocator: Arc<BackupRangeAllocator>,
        directory: Arc<LocationDirectory>,
        recovery: Arc<dyn RecoverySource>,
        resync: ResyncDispatcher,
    ) -> Self {
        Self {
            node_id,
            allocator,
            directory,
            recovery,
            resync,
        }
    }

    pub fn on_peer_failure(&self, event: &PeerFailureEvent) -> Result<FailureOutcome> {
        let failed = event.node_id;
        let mut outcome = FailureOutcome::default();
        if failed == self.node_id {
            debug!("Ignoring failure event about this node");
            return Ok(outcome);
        }

        info!("Handling failure of 0x{:04X} ({:?})", failed, event.role);
        self.directory.announce_peer_failure(failed);

        outcome.replacements = self.allocator.replace_failed_peer(failed);
        for replacement in &outcome.replacements {
            let Some(peer) = replacement.replacement else {
                continue;
            };
            if self.dispatch(peer.node_id, replacement.range, replacement.chunk_ranges.clone()) {
                outcome.resyncs_dispatched += 1;
            }
        }

        if event.role == FailureRole::Primary {
            for recovered in self.recovery.recovered_ranges(failed) {
                let original_range = recovered.original_range.range_id();
                if self.allocator.recovered_range(failed, original_range).is_some() {
                    debug!("Range {} of 0x{:04X} was already recovered", original_range, failed);
                    continue;
                }

                let replacement =
                    self.allocator
                        .register_recovered_chunks(&recovered.metadata, &recovered.original_range, failed)?;
                let new_range = self
                    .allocator
                    .recovered_range(failed, original_range)
                    .map(|range| range.key());

                if let (Some(target), Some(range)) = (replacement, new_range) {
                    if self.dispatch(target, range, recovered.metadata.chunk_ranges.clone()) {
                        outcome.resyncs_dispatched += 1;
                    }
                }
                outcome.recovered.push(RecoveredOutcome {
                    original_range,
                    new_range,
                    replacement,
                });
            }
        }

        Ok(outcome)
    }

    pub fn on_peer_join(&self, event: &PeerJoinEvent) -> JoinOutcome {
        let mut outcome = JoinOutcome::default();
        if event.node_id == self.node_id {
            return outcome;
        }

        info!("Handling join of 0x{:04X}", event.node_id);
        outcome.fills = self.allocator.add_backup_peer(event.peer());
        for fill in &outcome.fills {
            if self.dispatch(fill.peer.node_id, fill.range, fill.chunk_ranges.clone()) {
                outcome.resyncs_dispatched += 1;
            }
        }
        outcome
    }

    fn dispatch(&self, target: NodeId, range: RangeKey, chunk_ranges: Vec<(ChunkId, ChunkId)>) -> bool {
        if chunk_ranges.is_empty() {
            return false;
        }
        match self.resync.dispatch(ResyncRequest { target, range, chunk_ranges }) {
            Ok(()) => true,
            Err(e) => {
                warn!("Could not queue resync of range {} to 0x{:04X}: {}", range, target, e);
                false
            }
        }
    }
}

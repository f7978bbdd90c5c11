//! Interfaces to the parts of the cluster this subsystem does not own: membership, the log
//! store, external recovery and the messaging used for resyncs.

use async_trait::async_trait;
use chunkvault_common::{BackupPeer, BackupRange, ChunkId, NodeId, RackId, RangeKey, RecoveryMetadata, Result, SwitchId};
use parking_lot::RwLock;

/// Membership view: which nodes may currently hold backups
pub trait MembershipView: Send + Sync {
    /// Peers currently eligible to store backup replicas
    fn available_backup_peers(&self) -> Vec<BackupPeer>;

    fn is_available(&self, node_id: NodeId) -> bool {
        self.available_backup_peers().iter().any(|p| p.node_id == node_id)
    }
}

/// Membership backed by an explicit peer list
#[derive(Debug, Default)]
pub struct StaticMembership {
    peers: RwLock<Vec<BackupPeer>>,
}

impl StaticMembership {
    pub fn new(peers: Vec<BackupPeer>) -> Self {
        Self { peers: RwLock::new(peers) }
    }

    pub fn add_peer(&self, peer: BackupPeer) {
        let mut peers = self.peers.write();
        if !peers.iter().any(|p| p.node_id == peer.node_id) {
            peers.push(peer);
        }
    }

    pub fn remove_peer(&self, node_id: NodeId) -> bool {
        let mut peers = self.peers.write();
        let before = peers.len();
        peers.retain(|p| p.node_id != node_id);
        peers.len() != before
    }
}

impl MembershipView for StaticMembership {
    fn available_backup_peers(&self) -> Vec<BackupPeer> {
        self.peers.read().clone()
    }
}

/// Log header overhead charged to a range for every chunk
pub trait LogHeaderSizer: Send + Sync {
    fn approx_header_size(&self, chunk_id: ChunkId, size: u64) -> u64;
}

/// The same overhead for every chunk
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedHeaderSize(pub u64);

impl LogHeaderSizer for FixedHeaderSize {
    fn approx_header_size(&self, _chunk_id: ChunkId, _size: u64) -> u64 {
        self.0
    }
}

/// A backup range of a failed node that this node reconstructed
#[derive(Debug, Clone)]
pub struct RecoveredRange {
    pub metadata: RecoveryMetadata,
    /// The range as the failed owner had it
    pub original_range: BackupRange,
}

/// Source of recovery results for failed primaries
pub trait RecoverySource: Send + Sync {
    fn recovered_ranges(&self, failed: NodeId) -> Vec<RecoveredRange>;
}

/// This node never recovers data of failed primaries
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRecovery;

impl RecoverySource for NoRecovery {
    fn recovered_ranges(&self, _failed: NodeId) -> Vec<RecoveredRange> {
        Vec::new()
    }
}

/// Sends the contents of a backup range to a (new) backup peer
#[async_trait]
pub trait ResyncTransport: Send + Sync {
    /// Replicate all chunks in `chunk_ranges` to `target`. Returns the number of chunks sent.
    async fn replicate_range(
        &self,
        target: NodeId,
        range: RangeKey,
        chunk_ranges: Vec<(ChunkId, ChunkId)>,
    ) -> Result<u64>;
}

/// Role the failed node played for this node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureRole {
    /// The node stored backups of this node's ranges
    Backup,
    /// The node owned data that this node may have recovered
    Primary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerFailureEvent {
    pub node_id: NodeId,
    pub role: FailureRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerJoinEvent {
    pub node_id: NodeId,
    pub rack: RackId,
    pub switch: SwitchId,
}

impl PeerJoinEvent {
    pub fn peer(&self) -> BackupPeer {
        BackupPeer::new(self.node_id, self.rack, self.switch)
    }
}

/// Events delivered by the membership collaborator, one at a time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipEvent {
    Failure(PeerFailureEvent),
    Join(PeerJoinEvent),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_membership() {
        let membership = StaticMembership::new(vec![BackupPeer::new(1, 0, 0)]);
        membership.add_peer(BackupPeer::new(2, 1, 1));
        membership.add_peer(BackupPeer::new(2, 1, 1));
        assert_eq!(membership.available_backup_peers().len(), 2);
        assert!(membership.is_available(2));

        assert!(membership.remove_peer(1));
        assert!(!membership.remove_peer(1));
        assert!(!membership.is_available(1));
    }

    #[test]
    fn test_fixed_header_size() {
        let sizer = FixedHeaderSize(12);
        assert_eq!(sizer.approx_header_size(ChunkId::new(1, 1), 4096), 12);
    }
}

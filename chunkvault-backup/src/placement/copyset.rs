use chunkvault_common::{BackupPeer, BackupRange, NodeId, RangeId};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use tracing::{debug, info, warn};

use super::{PlacementPolicy, RandomPlacement};

/// Every node uses the same seed so identical peer pools yield identical copysets
const COPYSET_SEED: u64 = 123_456_789;

/// Attempts to place a peer into a permutation slot before giving up
const MAX_PERMUTATION_TRIES: usize = 100_000;

/// Copyset replica placement.
///
/// The eligible peers are shuffled into `permutations` permutations, each cut into copysets of
/// `replication_factor` peers. A range is always backed by exactly one copyset, which bounds the
/// number of distinct replica sets in the cluster regardless of how many ranges exist. Peers left
/// over form an incomplete copyset that joining peers complete.
#[derive(Debug, Clone)]
pub struct CopysetPlacement {
    policy: PlacementPolicy,
    scatter_width: usize,
    copysets: Vec<Vec<BackupPeer>>,
    incomplete: Vec<BackupPeer>,
    initialized: bool,
    random_fallbacks: u64,
}

impl CopysetPlacement {
    pub fn new(policy: PlacementPolicy, scatter_width: usize) -> Self {
        Self {
            policy,
            scatter_width: scatter_width.max(1),
            copysets: Vec::new(),
            incomplete: Vec::new(),
            initialized: false,
            random_fallbacks: 0,
        }
    }

    pub fn policy(&self) -> &PlacementPolicy {
        &self.policy
    }

    pub fn copysets(&self) -> &[Vec<BackupPeer>] {
        &self.copysets
    }

    pub fn incomplete_copyset(&self) -> &[BackupPeer] {
        &self.incomplete
    }

    /// Ranges placed randomly because no complete copyset was available at the time
    pub fn random_fallbacks(&self) -> u64 {
        self.random_fallbacks
    }

    /// Number of permutations needed to reach the scatter width
    pub fn permutations(&self) -> usize {
        let replication_factor = self.policy.replication_factor();
        if replication_factor <= 1 {
            return self.scatter_width;
        }
        ((self.scatter_width + replication_factor - 2) / (replication_factor - 1)).max(1)
    }

    /// Build the copysets. Fails when fewer than `replication_factor * scatter_width` peers are
    /// eligible or rack/switch constraints cannot be met.
    pub fn initialize(&mut self, eligible: &[BackupPeer]) -> bool {
        self.policy.check_awareness_applicability(eligible);

        let replication_factor = self.policy.replication_factor();
        let required = replication_factor * self.scatter_width;
        if eligible.len() < required {
            warn!(
                "Number of eligible peers is too small ({} < {}) for copyset placement",
                eligible.len(),
                required
            );
            return false;
        }

        // Membership order may differ between nodes
        let mut pool = eligible.to_vec();
        pool.sort_by_key(|p| p.node_id);
        pool.dedup_by_key(|p| p.node_id);

        let aligned = pool.len() - pool.len() % replication_factor;
        let mut rng = StdRng::seed_from_u64(COPYSET_SEED);
        let mut copysets = Vec::new();
        let mut covered: HashSet<NodeId> = HashSet::new();

        for _ in 0..self.permutations() {
            let Some(permutation) = self.permute(&pool, aligned, &mut rng) else {
                warn!("Unable to find copysets meeting the topology requirements");
                return false;
            };
            for copyset in permutation.chunks(replication_factor) {
                covered.extend(copyset.iter().map(|p| p.node_id));
                copysets.push(copyset.to_vec());
            }
        }

        self.incomplete = pool
            .iter()
            .filter(|p| !covered.contains(&p.node_id))
            .copied()
            .collect();
        self.copysets = copysets;
        self.initialized = true;

        info!(
            "Determined {} copysets, {} peers unallocated",
            self.copysets.len(),
            self.incomplete.len()
        );
        true
    }

    fn permute(&self, pool: &[BackupPeer], aligned: usize, rng: &mut StdRng) -> Option<Vec<BackupPeer>> {
        let replication_factor = self.policy.replication_factor();
        let mut remaining = pool.to_vec();
        let mut permutation: Vec<BackupPeer> = Vec::with_capacity(aligned);
        let mut tries = 0;

        while permutation.len() < aligned {
            let candidate = remaining.remove(rng.gen_range(0..remaining.len()));
            let group_start = permutation.len() - permutation.len() % replication_factor;

            if self.policy.topology_conflict(&candidate, &permutation[group_start..]) {
                // Put it back and try again
                remaining.push(candidate);
                tries += 1;
                if tries >= MAX_PERMUTATION_TRIES {
                    return None;
                }
                continue;
            }

            permutation.push(candidate);
            tries = 0;
        }

        Some(permutation)
    }

    pub fn determine_backup_peers(
        &mut self,
        owner: NodeId,
        range_id: RangeId,
        eligible: &[BackupPeer],
        previous: Option<&BackupRange>,
    ) -> Option<BackupRange> {
        let replication_factor = self.policy.replication_factor();
        let available: HashSet<NodeId> = eligible.iter().map(|p| p.node_id).collect();

        // Copysets with a failed member cannot be used until they are complete again
        let usable: Vec<&Vec<BackupPeer>> = self
            .copysets
            .iter()
            .filter(|c| c.iter().all(|p| available.contains(&p.node_id)))
            .collect();

        // Only this range is placed randomly; later ranges use copysets again once one is complete
        if eligible.len() < replication_factor || usable.is_empty() {
            self.random_fallbacks += 1;
            warn!(
                "No complete copyset available for range {}, placing replicas randomly ({} ranges so far)",
                range_id, self.random_fallbacks
            );
            let peers = RandomPlacement::select_peers(&mut self.policy, eligible, previous)?;
            return Some(BackupRange::with_peers(owner, range_id, replication_factor, peers));
        }

        let mut members: Vec<BackupPeer> = usable.iter().flat_map(|c| c.iter().copied()).collect();
        members.sort_by_key(|p| p.node_id);
        members.dedup_by_key(|p| p.node_id);

        let first = self.policy.pick_first_peer(&members)?;
        let copyset = usable
            .iter()
            .filter(|c| c.iter().any(|p| p.node_id == first.node_id))
            .collect::<Vec<_>>()
            .choose(self.policy.rng())
            .map(|c| c.to_vec())?;

        let peers = std::iter::once(first).chain(copyset.into_iter().filter(|p| p.node_id != first.node_id));
        Some(BackupRange::with_peers(owner, range_id, replication_factor, peers))
    }

    /// Every node picks the same replacement for the same range, since the generator is seeded
    /// with the current peers.
    pub fn determine_replacement_backup_peer(
        &mut self,
        current: &[Option<BackupPeer>],
        eligible: &[BackupPeer],
    ) -> Option<BackupPeer> {
        let replication_factor = self.policy.replication_factor();
        let current_ids: Vec<NodeId> = current.iter().flatten().map(|p| p.node_id).collect();

        let mut candidates: Vec<BackupPeer> = eligible
            .iter()
            .filter(|p| !current_ids.contains(&p.node_id))
            .copied()
            .collect();
        candidates.sort_by_key(|p| p.node_id);

        if candidates.is_empty() {
            warn!("No replacement backup peer available, range stays degraded");
            return None;
        }
        if eligible.len() < 2 * replication_factor {
            warn!("Less than {} peers for backup available, peers may store more than one range of a node", 2 * replication_factor);
        }

        let seed: u64 = current_ids.iter().map(|&id| id as u64).sum();
        let mut rng = StdRng::seed_from_u64(seed);
        candidates.choose(&mut rng).copied()
    }

    /// Add a peer to the incomplete copyset; a full incomplete copyset becomes a regular one
    pub fn add_new_backup_peer(&mut self, peer: BackupPeer) {
        if !self.initialized {
            // Included when the copysets are built
            return;
        }

        let known = self.incomplete.iter().any(|p| p.node_id == peer.node_id)
            || self.copysets.iter().flatten().any(|p| p.node_id == peer.node_id);
        if known {
            debug!("Peer {} is already part of a copyset", peer);
            return;
        }

        self.incomplete.push(peer);
        if self.incomplete.len() == self.policy.replication_factor() {
            let copyset = std::mem::take(&mut self.incomplete);
            info!(
                "New copyset complete: {:?}",
                copyset.iter().map(|p| p.node_id).collect::<Vec<_>>()
            );
            self.copysets.push(copyset);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers(ids: impl IntoIterator<Item = NodeId>) -> Vec<BackupPeer> {
        ids.into_iter().map(|id| BackupPeer::new(id, 0, 0)).collect()
    }

    fn copyset(replication_factor: usize, scatter_width: usize) -> CopysetPlacement {
        CopysetPlacement::new(PlacementPolicy::new(replication_factor, true, false, false), scatter_width)
    }

    #[test]
    fn test_permutations() {
        assert_eq!(copyset(3, 4).permutations(), 2);
        assert_eq!(copyset(3, 2).permutations(), 1);
        assert_eq!(copyset(2, 3).permutations(), 3);
        assert_eq!(copyset(1, 3).permutations(), 3);
    }

    #[test]
    fn test_initialize_requires_enough_peers() {
        let mut placement = copyset(3, 4);
        assert!(!placement.initialize(&peers(1..=11)));
        assert!(placement.initialize(&peers(1..=13)));
        // 13 peers, 12 aligned per permutation
        assert_eq!(placement.copysets().len(), 8);
        assert!(placement.copysets().iter().all(|c| c.len() == 3));
        assert!(placement.incomplete_copyset().len() < 3);
    }

    #[test]
    fn test_copysets_are_deterministic() {
        let mut a = copyset(3, 2);
        let mut b = copyset(3, 2);
        let mut shuffled = peers(1..=9);
        shuffled.reverse();
        assert!(a.initialize(&peers(1..=9)));
        assert!(b.initialize(&shuffled));
        assert_eq!(a.copysets(), b.copysets());
    }

    #[test]
    fn test_range_is_one_copyset() {
        let mut placement = copyset(3, 2);
        let eligible = peers(1..=9);
        assert!(placement.initialize(&eligible));

        for range_id in 0..10 {
            let range = placement.determine_backup_peers(0, range_id, &eligible, None).unwrap();
            let mut ids = range.peer_ids();
            ids.sort_unstable();
            let matches = placement.copysets().iter().any(|c| {
                let mut set: Vec<_> = c.iter().map(|p| p.node_id).collect();
                set.sort_unstable();
                set == ids
            });
            assert!(matches, "range {:?} is not a copyset", ids);
        }
    }

    #[test]
    fn test_range_without_complete_copyset_is_placed_randomly() {
        let mut placement = copyset(3, 2);
        let all = peers(1..=9);
        assert!(placement.initialize(&all));
        assert_eq!(placement.copysets().len(), 3);

        // One member of every copyset is gone
        let missing: Vec<NodeId> = placement.copysets().iter().map(|c| c[0].node_id).collect();
        let survivors: Vec<BackupPeer> = all.iter().copied().filter(|p| !missing.contains(&p.node_id)).collect();

        let range = placement.determine_backup_peers(0, 0, &survivors, None).unwrap();
        assert_eq!(range.populated(), 3);
        assert!(range.peer_ids().iter().all(|id| !missing.contains(id)));
        assert_eq!(placement.random_fallbacks(), 1);

        // Complete copysets are used again as soon as they are available
        let range = placement.determine_backup_peers(0, 1, &all, None).unwrap();
        let mut ids = range.peer_ids();
        ids.sort_unstable();
        assert!(placement.copysets().iter().any(|c| {
            let mut set: Vec<NodeId> = c.iter().map(|p| p.node_id).collect();
            set.sort_unstable();
            set == ids
        }));
        assert_eq!(placement.random_fallbacks(), 1);
    }

    #[test]
    fn test_replacement_is_deterministic() {
        let eligible = peers(1..=9);
        let current = vec![Some(BackupPeer::new(1, 0, 0)), None, Some(BackupPeer::new(3, 0, 0))];

        let mut a = copyset(3, 2);
        let mut b = copyset(3, 2);
        let first = a.determine_replacement_backup_peer(&current, &eligible).unwrap();
        let second = b.determine_replacement_backup_peer(&current, &eligible).unwrap();
        assert_eq!(first, second);
        assert!(first.node_id != 1 && first.node_id != 3);
    }

    #[test]
    fn test_new_peers_complete_a_copyset() {
        let mut placement = copyset(3, 2);
        assert!(placement.initialize(&peers(1..=9)));
        let before = placement.copysets().len();

        placement.add_new_backup_peer(BackupPeer::new(10, 0, 0));
        placement.add_new_backup_peer(BackupPeer::new(10, 0, 0));
        placement.add_new_backup_peer(BackupPeer::new(11, 0, 0));
        assert_eq!(placement.copysets().len(), before);
        placement.add_new_backup_peer(BackupPeer::new(12, 0, 0));
        assert_eq!(placement.copysets().len(), before + 1);
        assert!(placement.incomplete_copyset().is_empty());
    }
}

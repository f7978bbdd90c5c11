use chunkvault_common::{BackupPeer, BackupRange, NodeId, RangeId};
use rand::seq::SliceRandom;
use tracing::{debug, trace, warn};

use super::PlacementPolicy;

/// Random replica placement with optional disjunctive first peers and rack/switch spreading
#[derive(Debug, Clone)]
pub struct RandomPlacement {
    policy: PlacementPolicy,
}

impl RandomPlacement {
    pub fn new(policy: PlacementPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &PlacementPolicy {
        &self.policy
    }

    /// Random placement has no preconditions beyond checking topology diversity
    pub fn initialize(&mut self, eligible: &[BackupPeer]) -> bool {
        self.policy.check_awareness_applicability(eligible);
        true
    }

    pub fn determine_backup_peers(
        &mut self,
        owner: NodeId,
        range_id: RangeId,
        eligible: &[BackupPeer],
        previous: Option<&BackupRange>,
    ) -> Option<BackupRange> {
        let replication_factor = self.policy.replication_factor();
        let peers = Self::select_peers(&mut self.policy, eligible, previous)?;
        Some(BackupRange::with_peers(owner, range_id, replication_factor, peers))
    }

    /// Choose up to `replication_factor` distinct peers in slot order
    pub(crate) fn select_peers(
        policy: &mut PlacementPolicy,
        eligible: &[BackupPeer],
        previous: Option<&BackupRange>,
    ) -> Option<Vec<BackupPeer>> {
        let replication_factor = policy.replication_factor();

        if eligible.is_empty() {
            warn!("No peers available for backup");
            return None;
        }

        if eligible.len() < replication_factor {
            warn!(
                "Less than {} peers for backup available, replication will be incomplete",
                replication_factor
            );
            let mut peers = eligible.to_vec();
            peers.shuffle(policy.rng());
            return Some(peers);
        }

        // With enough peers, spread consecutive ranges over different peers
        let avoid: Vec<NodeId> = if eligible.len() >= 2 * replication_factor {
            previous.map(|r| r.peer_ids()).unwrap_or_default()
        } else {
            Vec::new()
        };
        let preferred: Vec<BackupPeer> = eligible
            .iter()
            .filter(|p| !avoid.contains(&p.node_id))
            .copied()
            .collect();

        let first = policy.pick_first_peer(&preferred)?;
        let mut chosen = vec![first];

        while chosen.len() < replication_factor {
            let mut next = policy.pick_random(&preferred, &chosen, true);
            if next.is_none() {
                next = policy.pick_random(eligible, &chosen, true);
            }
            if next.is_none() {
                if policy.is_rack_aware() || policy.is_switch_aware() {
                    debug!("Relaxing topology awareness for backup slot {}", chosen.len());
                }
                next = policy.pick_random(eligible, &chosen, false);
            }

            match next {
                Some(peer) => chosen.push(peer),
                None => break,
            }
        }

        Some(chosen)
    }

    pub fn determine_replacement_backup_peer(
        &mut self,
        current: &[Option<BackupPeer>],
        eligible: &[BackupPeer],
    ) -> Option<BackupPeer> {
        let current: Vec<BackupPeer> = current.iter().flatten().copied().collect();
        let pool: Vec<BackupPeer> = eligible
            .iter()
            .filter(|p| !current.iter().any(|c| c.node_id == p.node_id))
            .copied()
            .collect();

        if pool.is_empty() {
            warn!("No replacement backup peer available, range stays degraded");
            return None;
        }

        self.policy
            .pick_random(&pool, &current, true)
            .or_else(|| self.policy.pick_random(&pool, &current, false))
    }

    pub fn add_new_backup_peer(&mut self, peer: BackupPeer) {
        trace!("Random placement considers new peer {} from now on", peer);
    }
}

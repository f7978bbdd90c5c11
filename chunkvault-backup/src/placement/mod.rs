//! Replica placement: which peers store the backups of a range.

mod copyset;
mod random;

pub use copyset::CopysetPlacement;
pub use random::RandomPlacement;

use chunkvault_common::{BackupConfig, BackupPeer, BackupRange, NodeId, PlacementKind, RangeId};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::{HashSet, VecDeque};
use tracing::warn;

/// Constraints shared by all placement strategies
#[derive(Debug, Clone)]
pub struct PlacementPolicy {
    replication_factor: usize,
    disjunctive: bool,
    history_limit: usize,
    used_first_peers: VecDeque<NodeId>,
    rack_aware: bool,
    switch_aware: bool,
    rng: StdRng,
}

impl PlacementPolicy {
    pub fn new(replication_factor: usize, disjunctive: bool, rack_aware: bool, switch_aware: bool) -> Self {
        Self {
            replication_factor: replication_factor.max(1),
            disjunctive,
            history_limit: 8,
            used_first_peers: VecDeque::new(),
            rack_aware,
            switch_aware,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn from_config(config: &BackupConfig) -> Self {
        let mut policy = Self::new(
            config.replication_factor,
            config.disjunctive_first_peer,
            config.rack_aware,
            config.switch_aware,
        );
        policy.history_limit = config.disjunctive_history.max(1);
        if let Some(seed) = config.placement_seed {
            policy.rng = StdRng::seed_from_u64(seed);
        }
        policy
    }

    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    pub fn is_disjunctive(&self) -> bool {
        self.disjunctive
    }

    pub fn is_rack_aware(&self) -> bool {
        self.rack_aware
    }

    pub fn is_switch_aware(&self) -> bool {
        self.switch_aware
    }

    /// Disable rack/switch awareness when the peer pool is not diverse enough to honor it
    pub fn check_awareness_applicability(&mut self, peers: &[BackupPeer]) {
        if !self.rack_aware && !self.switch_aware {
            return;
        }

        let racks: HashSet<_> = peers.iter().map(|p| p.rack).collect();
        let switches: HashSet<_> = peers.iter().map(|p| p.switch).collect();

        if self.rack_aware && racks.len() < self.replication_factor {
            warn!("Rack-awareness not applicable with {} racks in initial set of peers", racks.len());
            self.rack_aware = false;
        } else if self.rack_aware && racks.len() <= 2 * self.replication_factor {
            warn!("Rack-awareness restricts replica placement with only {} racks", racks.len());
        }

        if self.switch_aware && switches.len() < self.replication_factor {
            warn!("Switch-awareness not applicable with {} switches in initial set of peers", switches.len());
            self.switch_aware = false;
        } else if self.switch_aware && switches.len() <= 2 * self.replication_factor {
            warn!("Switch-awareness restricts replica placement with only {} switches", switches.len());
        }
    }

    /// Whether `candidate` shares a rack or switch with any chosen peer, as far as awareness is on
    pub fn topology_conflict(&self, candidate: &BackupPeer, chosen: &[BackupPeer]) -> bool {
        chosen.iter().any(|peer| {
            (self.rack_aware && peer.rack == candidate.rack)
                || (self.switch_aware && peer.switch == candidate.switch)
        })
    }

    /// Pick a random peer from `pool` that is not chosen yet. With `aware` set, peers violating
    /// rack/switch spreading are skipped.
    pub(crate) fn pick_random(&mut self, pool: &[BackupPeer], chosen: &[BackupPeer], aware: bool) -> Option<BackupPeer> {
        let candidates: Vec<BackupPeer> = pool
            .iter()
            .filter(|p| !chosen.iter().any(|c| c.node_id == p.node_id))
            .filter(|p| !aware || !self.topology_conflict(p, chosen))
            .copied()
            .collect();
        candidates.choose(&mut self.rng).copied()
    }

    /// Pick the first peer of a new range, avoiding recently used first peers if disjunctive
    pub(crate) fn pick_first_peer(&mut self, pool: &[BackupPeer]) -> Option<BackupPeer> {
        if !self.disjunctive {
            return pool.choose(&mut self.rng).copied();
        }

        let fresh: Vec<BackupPeer> = pool
            .iter()
            .filter(|p| !self.used_first_peers.contains(&p.node_id))
            .copied()
            .collect();

        let choice = if fresh.is_empty() {
            warn!("Insufficient peers for disjunctive placement, first backup peers may repeat");
            self.used_first_peers.clear();
            pool.choose(&mut self.rng).copied()
        } else {
            fresh.choose(&mut self.rng).copied()
        };
        let first = choice?;

        self.used_first_peers.push_back(first.node_id);
        while self.used_first_peers.len() > self.history_limit {
            self.used_first_peers.pop_front();
        }
        Some(first)
    }

    pub(crate) fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}

/// Placement strategy of a node, chosen once at startup.
///
/// Copyset placement falls back to random placement when it cannot be initialized; the
/// transition happens at most once and never the other way round.
#[derive(Debug, Clone)]
pub enum PlacementStrategy {
    Random(RandomPlacement),
    Copyset(CopysetPlacement),
}

impl PlacementStrategy {
    /// The configured strategy, not yet initialized
    pub fn from_config(config: &BackupConfig) -> Self {
        let policy = PlacementPolicy::from_config(config);
        match config.placement_strategy {
            PlacementKind::Random => PlacementStrategy::Random(RandomPlacement::new(policy)),
            PlacementKind::Copyset => {
                PlacementStrategy::Copyset(CopysetPlacement::new(policy, config.scatter_width))
            }
        }
    }

    /// Build and initialize the configured strategy for the given peer pool
    pub fn select(config: &BackupConfig, eligible: &[BackupPeer]) -> Self {
        let mut strategy = Self::from_config(config);
        strategy.initialize(eligible);
        strategy
    }

    /// Prepare the strategy for `eligible`. Returns false when the requested strategy could not
    /// be initialized and random placement took over.
    pub fn initialize(&mut self, eligible: &[BackupPeer]) -> bool {
        let fallback = match self {
            PlacementStrategy::Random(random) => {
                random.initialize(eligible);
                None
            }
            PlacementStrategy::Copyset(copyset) => {
                if copyset.initialize(eligible) {
                    None
                } else {
                    Some(copyset.policy().clone())
                }
            }
        };

        match fallback {
            Some(policy) => {
                warn!(
                    "Copyset placement unavailable with {} eligible peers, falling back to random placement",
                    eligible.len()
                );
                let mut random = RandomPlacement::new(policy);
                random.initialize(eligible);
                *self = PlacementStrategy::Random(random);
                false
            }
            None => true,
        }
    }

    pub fn kind(&self) -> PlacementKind {
        match self {
            PlacementStrategy::Random(_) => PlacementKind::Random,
            PlacementStrategy::Copyset(_) => PlacementKind::Copyset,
        }
    }

    pub fn policy(&self) -> &PlacementPolicy {
        match self {
            PlacementStrategy::Random(random) => random.policy(),
            PlacementStrategy::Copyset(copyset) => copyset.policy(),
        }
    }

    pub fn replication_factor(&self) -> usize {
        self.policy().replication_factor()
    }

    /// Backup peers for a new range. `None` when no peer is eligible at all; a partially
    /// populated range when fewer than the replication factor are.
    pub fn determine_backup_peers(
        &mut self,
        owner: NodeId,
        range_id: RangeId,
        eligible: &[BackupPeer],
        previous: Option<&BackupRange>,
    ) -> Option<BackupRange> {
        match self {
            PlacementStrategy::Random(random) => random.determine_backup_peers(owner, range_id, eligible, previous),
            PlacementStrategy::Copyset(copyset) => {
                copyset.determine_backup_peers(owner, range_id, eligible, previous)
            }
        }
    }

    /// A peer to replace a failed one; never one of `current`
    pub fn determine_replacement_backup_peer(
        &mut self,
        current: &[Option<BackupPeer>],
        eligible: &[BackupPeer],
    ) -> Option<BackupPeer> {
        match self {
            PlacementStrategy::Random(random) => random.determine_replacement_backup_peer(current, eligible),
            PlacementStrategy::Copyset(copyset) => copyset.determine_replacement_backup_peer(current, eligible),
        }
    }

    /// A peer became eligible; only affects future decisions
    pub fn add_new_backup_peer(&mut self, peer: BackupPeer) {
        match self {
            PlacementStrategy::Random(random) => random.add_new_backup_peer(peer),
            PlacementStrategy::Copyset(copyset) => copyset.add_new_backup_peer(peer),
        }
    }
}

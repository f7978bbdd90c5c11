//! Backup range management: allocation, replica placement, failure recovery and write versions.

pub mod allocator;
pub mod collaborators;
pub mod node;
pub mod placement;
pub mod recovery;
pub mod resync;
pub mod versions;

pub use allocator::{BackupRangeAllocator, SlotFill, SlotReplacement};
pub use collaborators::{
    FailureRole, FixedHeaderSize, LogHeaderSizer, MembershipEvent, MembershipView, NoRecovery, PeerFailureEvent,
    PeerJoinEvent, RecoveredRange, RecoverySource, ResyncTransport, StaticMembership,
};
pub use node::{BackupNode, Collaborators};
pub use placement::{CopysetPlacement, PlacementPolicy, PlacementStrategy, RandomPlacement};
pub use recovery::{FailureOutcome, FailureRecoveryCoordinator, JoinOutcome, RecoveredOutcome};
pub use resync::{ResyncDispatcher, ResyncRequest, ResyncStats};
pub use versions::{
    FileVersionLog, MemoryVersionLog, VersionFlusher, VersionLog, VersionRegistry, VersionSnapshot, VersionTracker,
};

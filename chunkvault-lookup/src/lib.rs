//! Chunk location lookup: the authoritative directory, peer-local caches and the resolver
//! combining both.

pub mod cache;
pub mod directory;
pub mod locator;

pub use cache::{CacheStats, LocationCache};
pub use directory::{LocationChange, LocationDirectory, Placement};
pub use locator::ChunkLocator;

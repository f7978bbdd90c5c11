pub mod types;
pub mod error;
pub mod config;
pub mod interval;
pub mod logging;

pub use types::*;
pub use error::{ChunkVaultError, Result};
pub use config::{BackupConfig, PlacementKind};
pub use interval::IntervalMap;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(LOCAL_ID_BITS, 48);
        assert_eq!(LOCAL_ID_MASK, 0x0000_FFFF_FFFF_FFFF);
        assert_eq!(MAX_EPOCH, 0x7FFF);
        assert_eq!(MAX_VERSION, 0x00FF_FFFF);
        assert_eq!(VERSION_RECORD_SIZE, 13);
    }
}

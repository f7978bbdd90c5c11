use thiserror::Error;

use crate::types::{ChunkId, NodeId};

/// Main error type for ChunkVault
#[derive(Error, Debug)]
pub enum ChunkVaultError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid chunk id: {0}")]
    InvalidChunkId(ChunkId),

    #[error("Chunk {0} is not registered in any backup range")]
    UnknownChunk(ChunkId),

    #[error("Backup range IDs exhausted on node 0x{0:04X}")]
    RangeIdsExhausted(NodeId),

    #[error("Backup is disabled on node 0x{0:04X}")]
    BackupDisabled(NodeId),

    #[error("Chunk {chunk_id} of {size} bytes exceeds the backup range limit of {limit} bytes")]
    ChunkTooLarge { chunk_id: ChunkId, size: u64, limit: u64 },

    #[error("Insufficient backup peers: need {needed}, have {available}")]
    InsufficientPeers { needed: usize, available: usize },

    #[error("Version log is corrupt: {length} bytes is not a whole number of records")]
    CorruptVersionLog { length: usize },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl From<config::ConfigError> for ChunkVaultError {
    fn from(error: config::ConfigError) -> Self {
        ChunkVaultError::Config(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ChunkVaultError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = ChunkVaultError::ChunkTooLarge {
            chunk_id: ChunkId::new(1, 2),
            size: 10,
            limit: 5,
        };
        assert_eq!(
            err.to_string(),
            "Chunk 0x0001000000000002 of 10 bytes exceeds the backup range limit of 5 bytes"
        );

        let err = ChunkVaultError::InsufficientPeers { needed: 3, available: 0 };
        assert_eq!(err.to_string(), "Insufficient backup peers: need 3, have 0");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: ChunkVaultError = io.into();
        assert!(matches!(err, ChunkVaultError::Io(_)));
    }
}

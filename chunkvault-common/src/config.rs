use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::types::{NodeId, RackId, SwitchId, MAX_REPLICATION_FACTOR};

const ENV_PREFIX: &str = "CHUNKVAULT_BACKUP";

/// Which placement strategy a node starts with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlacementKind {
    Random,
    Copyset,
}

impl PlacementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlacementKind::Random => "random",
            PlacementKind::Copyset => "copyset",
        }
    }
}

/// Configuration for the backup subsystem of one node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// ID of this node
    pub node_id: NodeId,

    /// Rack of this node
    pub rack: RackId,

    /// Switch of this node
    pub switch: SwitchId,

    /// Replicate this node's chunks to backup peers
    pub backup_active: bool,

    /// Accept backup replicas from other nodes
    pub available_for_backup: bool,

    /// Backup peers per range
    pub replication_factor: usize,

    /// Maximum accumulated size of a backup range in bytes
    pub backup_range_size: u64,

    /// Placement strategy requested at startup
    pub placement_strategy: PlacementKind,

    /// Distinct peers each node shares copysets with
    pub scatter_width: usize,

    /// Avoid reusing recent first backup peers
    pub disjunctive_first_peer: bool,

    /// Number of recent first peers remembered
    pub disjunctive_history: usize,

    /// Place replicas of one range on distinct racks
    pub rack_aware: bool,

    /// Place replicas of one range on distinct switches
    pub switch_aware: bool,

    /// Seed for random placement (entropy when absent)
    pub placement_seed: Option<u64>,

    /// Buffered versions per range that trigger a background flush
    pub version_flush_threshold: usize,

    /// Buffered versions per range at which writers block
    pub version_wait_threshold: usize,

    /// Directory for version logs; in-memory logs when absent
    pub version_dir: Option<PathBuf>,

    /// Approximate per-chunk log header size charged to a range
    pub log_header_size: u64,

    /// Location cache entry time-to-live in milliseconds, 0 disables expiry
    pub cache_ttl_ms: u64,

    /// Concurrent resync workers
    pub resync_workers: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            rack: 0,
            switch: 0,
            backup_active: true,
            available_for_backup: true,
            replication_factor: 3,
            backup_range_size: 256 * 1024 * 1024, // 256MB
            placement_strategy: PlacementKind::Random,
            scatter_width: 4,
            disjunctive_first_peer: true,
            disjunctive_history: 8,
            rack_aware: false,
            switch_aware: false,
            placement_seed: None,
            version_flush_threshold: 65_000,
            version_wait_threshold: 100_000,
            version_dir: None,
            log_header_size: 16,
            cache_ttl_ms: 0,
            resync_workers: 4,
        }
    }
}

impl BackupConfig {
    /// Load configuration from specific file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let mut builder = Self::builder_with_defaults()?;

        debug!("Loading backup configuration from {}", path.as_ref().display());
        builder = builder.add_source(config::File::with_name(path.as_ref().to_string_lossy().as_ref()));

        // Override with environment variables
        builder = builder.add_source(config::Environment::with_prefix(ENV_PREFIX));

        let config: BackupConfig = builder.build()?.try_deserialize()?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from file or environment
    pub fn load() -> anyhow::Result<Self> {
        let mut builder = Self::builder_with_defaults()?;

        if let Ok(config_file) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            info!("Loading backup configuration from {}", config_file);
            builder = builder.add_source(config::File::with_name(&config_file));
        } else {
            let config_paths = [
                "/etc/chunkvault/backup.toml",
                "./backup.toml",
                "./config/backup.toml",
            ];

            match config_paths.iter().find(|path| Path::new(path).exists()) {
                Some(path) => {
                    info!("Loading backup configuration from {}", path);
                    builder = builder.add_source(config::File::with_name(path));
                }
                None => warn!("No backup configuration file found, using defaults and environment"),
            }
        }

        builder = builder.add_source(config::Environment::with_prefix(ENV_PREFIX));

        let config: BackupConfig = builder.build()?.try_deserialize()?;
        config.validate()?;

        Ok(config)
    }

    fn builder_with_defaults() -> anyhow::Result<config::ConfigBuilder<config::builder::DefaultState>> {
        let d = Self::default();

        let mut builder = config::Config::builder()
            .set_default("node_id", d.node_id as i64)?
            .set_default("rack", d.rack as i64)?
            .set_default("switch", d.switch as i64)?
            .set_default("backup_active", d.backup_active)?
            .set_default("available_for_backup", d.available_for_backup)?
            .set_default("replication_factor", d.replication_factor as i64)?
            .set_default("backup_range_size", d.backup_range_size as i64)?
            .set_default("placement_strategy", d.placement_strategy.as_str())?
            .set_default("scatter_width", d.scatter_width as i64)?
            .set_default("disjunctive_first_peer", d.disjunctive_first_peer)?
            .set_default("disjunctive_history", d.disjunctive_history as i64)?
            .set_default("rack_aware", d.rack_aware)?
            .set_default("switch_aware", d.switch_aware)?
            .set_default("version_flush_threshold", d.version_flush_threshold as i64)?
            .set_default("version_wait_threshold", d.version_wait_threshold as i64)?
            .set_default("log_header_size", d.log_header_size as i64)?
            .set_default("cache_ttl_ms", d.cache_ttl_ms as i64)?
            .set_default("resync_workers", d.resync_workers as i64)?;

        if let Some(dir) = d.version_dir {
            builder = builder.set_default("version_dir", dir.to_string_lossy().to_string())?;
        }

        Ok(builder)
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.replication_factor == 0 || self.replication_factor > MAX_REPLICATION_FACTOR {
            return Err(anyhow::anyhow!(
                "Replication factor must be between 1 and {}, got {}",
                MAX_REPLICATION_FACTOR,
                self.replication_factor
            ));
        }

        if self.backup_range_size == 0 {
            return Err(anyhow::anyhow!("Backup range size must be greater than 0"));
        }

        if self.scatter_width == 0 {
            return Err(anyhow::anyhow!("Scatter width must be greater than 0"));
        }

        if self.version_flush_threshold == 0 {
            return Err(anyhow::anyhow!("Version flush threshold must be greater than 0"));
        }

        if self.version_wait_threshold < self.version_flush_threshold {
            return Err(anyhow::anyhow!(
                "Version wait threshold ({}) must not be below the flush threshold ({})",
                self.version_wait_threshold,
                self.version_flush_threshold
            ));
        }

        if self.resync_workers == 0 {
            return Err(anyhow::anyhow!("Resync workers must be greater than 0"));
        }

        Ok(())
    }

    /// Version log file for a range owned by `owner`
    pub fn version_log_path(&self, owner: NodeId, range_id: u16) -> Option<PathBuf> {
        self.version_dir
            .as_ref()
            .map(|dir| dir.join(format!("versions_{:04x}_{}.log", owner, range_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = BackupConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.placement_strategy, PlacementKind::Random);
        assert!(config.version_dir.is_none());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = BackupConfig::default();
        config.replication_factor = 5;
        assert!(config.validate().is_err());

        let mut config = BackupConfig::default();
        config.replication_factor = 0;
        assert!(config.validate().is_err());

        let mut config = BackupConfig::default();
        config.version_wait_threshold = config.version_flush_threshold - 1;
        assert!(config.validate().is_err());

        let mut config = BackupConfig::default();
        config.backup_range_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "node_id = 7").unwrap();
        writeln!(file, "replication_factor = 2").unwrap();
        writeln!(file, "placement_strategy = \"copyset\"").unwrap();
        writeln!(file, "version_dir = \"{}\"", dir.path().display()).unwrap();
        drop(file);

        let config = BackupConfig::from_file(&path).unwrap();
        assert_eq!(config.node_id, 7);
        assert_eq!(config.replication_factor, 2);
        assert_eq!(config.placement_strategy, PlacementKind::Copyset);
        assert_eq!(config.scatter_width, 4);
        assert_eq!(
            config.version_log_path(7, 3),
            Some(dir.path().join("versions_0007_3.log"))
        );
    }

    #[test]
    fn test_load_from_config_variable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        std::fs::write(&path, "node_id = 12\nlog_header_size = 32\n").unwrap();

        std::env::set_var(format!("{}_CONFIG", ENV_PREFIX), &path);
        let loaded = BackupConfig::load();
        std::env::remove_var(format!("{}_CONFIG", ENV_PREFIX));

        let config = loaded.unwrap();
        assert_eq!(config.node_id, 12);
        assert_eq!(config.log_header_size, 32);
        assert_eq!(config.replication_factor, 3);
    }

    #[test]
    fn test_from_file_rejects_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "replication_factor = 9\n").unwrap();
        assert!(BackupConfig::from_file(&path).is_err());
    }
}

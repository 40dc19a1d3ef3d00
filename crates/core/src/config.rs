//! Engine configuration via `keel.toml`.
//!
//! The controller consumes a read-only snapshot of operator configuration
//! during mode transitions. On first open a default `keel.toml` can be
//! written next to the data directory; to change settings, edit the file
//! and restart.
//!
//! Periodic-trigger cadences are configured in seconds; a value `<= 0`
//! means "disabled". The clamping to 0 happens here, at the config
//! boundary, so the trigger layer only ever sees `0 = disabled`.

use crate::error::{KeelError, KeelResult};
use crate::mode::StorageType;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Config file name placed next to the data directory.
pub const CONFIG_FILE_NAME: &str = "keel.toml";

/// Well-known name of the database created on first Writable bring-up.
pub const DEFAULT_DATABASE_NAME: &str = "default_db";

/// fsync policy applied when a transaction commit reaches the WAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushMethod {
    /// Write without fsync; the OS decides when bytes hit disk.
    OnlyWrite,
    /// fsync on every commit. Zero data loss on crash, slowest.
    FlushAtOnce,
    /// Background thread fsyncs roughly once per second.
    FlushPerSecond,
}

/// Credentials and endpoint for a remote S3-compatible object store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RemoteStoreConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub https: bool,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub bucket: String,
}

/// Read-only snapshot of operator configuration.
///
/// Constructed once (from `keel.toml` or programmatically) and shared with
/// the controller via `Arc`. Nothing mutates it after open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Selects whether the remote object-store gateway is brought up.
    #[serde(default = "default_storage_type")]
    pub storage_type: StorageType,

    /// Directory roots.
    pub data_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub wal_dir: PathBuf,
    /// Empty path disables the local persistence manager.
    #[serde(default)]
    pub persistence_dir: PathBuf,

    /// Remote store endpoint and credentials (used only when
    /// `storage_type = "remote"`).
    #[serde(default)]
    pub object_store: RemoteStoreConfig,

    /// Page-cache capacity in bytes.
    #[serde(default = "default_buffer_manager_size")]
    pub buffer_manager_size: u64,
    /// Number of independent LRU classes in the buffer manager.
    #[serde(default = "default_lru_num")]
    pub lru_num: usize,
    /// Per-object size cap for the local persistence manager, in bytes.
    #[serde(default = "default_persistence_object_size_limit")]
    pub persistence_object_size_limit: u64,

    /// WAL segment rotation / compaction threshold, in bytes.
    #[serde(default = "default_wal_compact_threshold")]
    pub wal_compact_threshold: u64,
    /// Accumulated WAL bytes that trigger a delta checkpoint.
    #[serde(default = "default_delta_checkpoint_threshold")]
    pub delta_checkpoint_threshold: u64,
    /// fsync policy at commit.
    #[serde(default = "default_flush_method")]
    pub flush_method_at_commit: FlushMethod,

    /// Trigger cadences in seconds; `<= 0` disables the trigger.
    #[serde(default)]
    pub compact_interval_secs: i64,
    #[serde(default)]
    pub optimize_index_interval_secs: i64,
    #[serde(default)]
    pub cleanup_interval_secs: i64,
    #[serde(default)]
    pub full_checkpoint_interval_secs: i64,
    #[serde(default)]
    pub delta_checkpoint_interval_secs: i64,

    /// Memory budget for in-memory indexes, in bytes.
    #[serde(default = "default_mem_index_memory_quota")]
    pub mem_index_memory_quota: u64,

    /// Gates the result-cache accessor on the controller.
    #[serde(default)]
    pub result_cache: bool,
    /// Result cache capacity, in entries.
    #[serde(default = "default_cache_result_num")]
    pub cache_result_num: usize,
}

fn default_storage_type() -> StorageType {
    StorageType::Local
}
fn default_buffer_manager_size() -> u64 {
    4 * 1024 * 1024 * 1024 // 4GB
}
fn default_lru_num() -> usize {
    7
}
fn default_persistence_object_size_limit() -> u64 {
    128 * 1024 * 1024 // 128MB
}
fn default_wal_compact_threshold() -> u64 {
    1024 * 1024 * 1024 // 1GB
}
fn default_delta_checkpoint_threshold() -> u64 {
    64 * 1024 * 1024 // 64MB
}
fn default_flush_method() -> FlushMethod {
    FlushMethod::OnlyWrite
}
fn default_mem_index_memory_quota() -> u64 {
    4 * 1024 * 1024 * 1024 // 4GB
}
fn default_cache_result_num() -> usize {
    10_000
}

/// Clamp a seconds cadence to the `0 = disabled` contract.
fn clamp_interval(secs: i64) -> u64 {
    if secs > 0 {
        secs as u64
    } else {
        0
    }
}

impl StorageConfig {
    /// Cleanup trigger cadence in seconds; 0 = disabled.
    pub fn cleanup_interval(&self) -> u64 {
        clamp_interval(self.cleanup_interval_secs)
    }

    /// Segment-compaction trigger cadence in seconds; 0 = disabled.
    pub fn compact_interval(&self) -> u64 {
        clamp_interval(self.compact_interval_secs)
    }

    /// Index-optimization trigger cadence in seconds; 0 = disabled.
    pub fn optimize_index_interval(&self) -> u64 {
        clamp_interval(self.optimize_index_interval_secs)
    }

    /// Full-checkpoint trigger cadence in seconds; 0 = disabled.
    pub fn full_checkpoint_interval(&self) -> u64 {
        clamp_interval(self.full_checkpoint_interval_secs)
    }

    /// Delta-checkpoint trigger cadence in seconds; 0 = disabled.
    pub fn delta_checkpoint_interval(&self) -> u64 {
        clamp_interval(self.delta_checkpoint_interval_secs)
    }

    /// True when a local persistence manager should be constructed.
    pub fn persistence_enabled(&self) -> bool {
        !self.persistence_dir.as_os_str().is_empty()
    }

    /// Validate the configuration before it reaches the controller.
    pub fn validate(&self) -> KeelResult<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(KeelError::config("data_dir must not be empty"));
        }
        if self.wal_dir.as_os_str().is_empty() {
            return Err(KeelError::config("wal_dir must not be empty"));
        }
        if self.temp_dir.as_os_str().is_empty() {
            return Err(KeelError::config("temp_dir must not be empty"));
        }
        if self.buffer_manager_size == 0 {
            return Err(KeelError::config("buffer_manager_size must be > 0"));
        }
        if self.lru_num == 0 {
            return Err(KeelError::config("lru_num must be > 0"));
        }
        if self.storage_type == StorageType::Remote && self.object_store.url.is_empty() {
            return Err(KeelError::config(
                "object_store.url must be set when storage_type = \"remote\"",
            ));
        }
        Ok(())
    }

    /// Read and parse config from a file path.
    pub fn from_file(path: &Path) -> KeelResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            KeelError::config(format!(
                "failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: StorageConfig = toml::from_str(&content).map_err(|e| {
            KeelError::config(format!(
                "failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> KeelResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| KeelError::internal(format!("failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            KeelError::config(format!(
                "failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path, root: &Path) -> KeelResult<()> {
        if !path.exists() {
            Self::rooted_default(root).write_to_file(path)?;
        }
        Ok(())
    }

    /// A default configuration rooted at `root` (directories become
    /// `root/data`, `root/tmp`, `root/wal`; persistence stays disabled).
    pub fn rooted_default(root: &Path) -> Self {
        StorageConfig {
            storage_type: StorageType::Local,
            data_dir: root.join("data"),
            temp_dir: root.join("tmp"),
            wal_dir: root.join("wal"),
            persistence_dir: PathBuf::new(),
            object_store: RemoteStoreConfig::default(),
            buffer_manager_size: default_buffer_manager_size(),
            lru_num: default_lru_num(),
            persistence_object_size_limit: default_persistence_object_size_limit(),
            wal_compact_threshold: default_wal_compact_threshold(),
            delta_checkpoint_threshold: default_delta_checkpoint_threshold(),
            flush_method_at_commit: default_flush_method(),
            compact_interval_secs: 120,
            optimize_index_interval_secs: 10,
            cleanup_interval_secs: 10,
            full_checkpoint_interval_secs: 86_400,
            delta_checkpoint_interval_secs: 60,
            mem_index_memory_quota: default_mem_index_memory_quota(),
            result_cache: false,
            cache_result_num: default_cache_result_num(),
        }
    }

    /// A configuration suited to tests: everything rooted under `root`,
    /// small thresholds so rotation and checkpoints actually fire, all
    /// periodic triggers disabled so tests control timing, result cache on.
    pub fn for_testing(root: &Path) -> Self {
        StorageConfig {
            storage_type: StorageType::Local,
            data_dir: root.join("data"),
            temp_dir: root.join("tmp"),
            wal_dir: root.join("wal"),
            persistence_dir: PathBuf::new(),
            object_store: RemoteStoreConfig::default(),
            buffer_manager_size: 8 * 1024 * 1024,
            lru_num: 2,
            persistence_object_size_limit: 64 * 1024,
            wal_compact_threshold: 64 * 1024,
            delta_checkpoint_threshold: 16 * 1024,
            flush_method_at_commit: FlushMethod::FlushAtOnce,
            compact_interval_secs: 0,
            optimize_index_interval_secs: 0,
            cleanup_interval_secs: 0,
            full_checkpoint_interval_secs: 0,
            delta_checkpoint_interval_secs: 0,
            mem_index_memory_quota: 1024 * 1024,
            result_cache: true,
            cache_result_num: 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn intervals_clamp_to_zero() {
        let dir = TempDir::new().unwrap();
        let mut config = StorageConfig::for_testing(dir.path());
        config.compact_interval_secs = -5;
        config.cleanup_interval_secs = 0;
        config.full_checkpoint_interval_secs = 30;

        assert_eq!(config.compact_interval(), 0);
        assert_eq!(config.cleanup_interval(), 0);
        assert_eq!(config.full_checkpoint_interval(), 30);
    }

    #[test]
    fn persistence_gate() {
        let dir = TempDir::new().unwrap();
        let mut config = StorageConfig::for_testing(dir.path());
        assert!(!config.persistence_enabled());
        config.persistence_dir = dir.path().join("persist");
        assert!(config.persistence_enabled());
    }

    #[test]
    fn validate_rejects_empty_dirs() {
        let dir = TempDir::new().unwrap();
        let mut config = StorageConfig::for_testing(dir.path());
        config.data_dir = PathBuf::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_remote_without_url() {
        let dir = TempDir::new().unwrap();
        let mut config = StorageConfig::for_testing(dir.path());
        config.storage_type = StorageType::Remote;
        assert!(config.validate().is_err());

        config.object_store.url = "http://localhost:9000".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);

        let mut config = StorageConfig::for_testing(dir.path());
        config.storage_type = StorageType::Remote;
        config.object_store = RemoteStoreConfig {
            url: "http://localhost:9000".to_string(),
            https: false,
            access_key: "minioadmin".to_string(),
            secret_key: "minioadmin".to_string(),
            bucket: "keel".to_string(),
        };
        config.write_to_file(&path).unwrap();

        let loaded = StorageConfig::from_file(&path).unwrap();
        assert_eq!(loaded.storage_type, StorageType::Remote);
        assert_eq!(loaded.object_store.bucket, "keel");
        assert_eq!(loaded.flush_method_at_commit, FlushMethod::FlushAtOnce);
    }

    #[test]
    fn write_default_does_not_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);

        let mut config = StorageConfig::rooted_default(dir.path());
        config.cleanup_interval_secs = 77;
        config.write_to_file(&path).unwrap();

        StorageConfig::write_default_if_missing(&path, dir.path()).unwrap();
        let loaded = StorageConfig::from_file(&path).unwrap();
        assert_eq!(loaded.cleanup_interval_secs, 77);
    }

    #[test]
    fn missing_fields_use_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(
            &path,
            "data_dir = \"/tmp/k/data\"\ntemp_dir = \"/tmp/k/tmp\"\nwal_dir = \"/tmp/k/wal\"\n",
        )
        .unwrap();

        let loaded = StorageConfig::from_file(&path).unwrap();
        assert_eq!(loaded.storage_type, StorageType::Local);
        assert_eq!(loaded.lru_num, 7);
        assert!(!loaded.result_cache);
    }
}

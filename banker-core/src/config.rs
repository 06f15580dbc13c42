//! Configuration for the banker

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Banker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory for snapshots
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// RPC listen address
    pub listen_addr: String,

    /// Metrics listen address
    pub metrics_listen_addr: String,

    /// Snapshot configuration
    pub snapshot: SnapshotConfig,

    /// Sync configuration
    pub sync: SyncConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/banker"),
            service_name: "banker-core".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            listen_addr: "0.0.0.0:50052".to_string(),
            metrics_listen_addr: "0.0.0.0:9091".to_string(),
            snapshot: SnapshotConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

/// Snapshot configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// File name inside the data directory
    pub file_name: String,

    /// Interval between periodic snapshots (milliseconds)
    pub interval_ms: u64,

    /// Enable periodic snapshots
    pub enabled: bool,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            file_name: "accounts.json".to_string(),
            interval_ms: 5_000,
            enabled: true,
        }
    }
}

/// Sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Actor mailbox depth (bounded for backpressure)
    pub mailbox_depth: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mailbox_depth: 1_000,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("BANKER_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(addr) = std::env::var("BANKER_LISTEN_ADDR") {
            config.listen_addr = addr;
        }

        if let Ok(addr) = std::env::var("BANKER_METRICS_ADDR") {
            config.metrics_listen_addr = addr;
        }

        if let Ok(interval) = std::env::var("BANKER_SNAPSHOT_INTERVAL_MS") {
            config.snapshot.interval_ms = interval
                .parse()
                .map_err(|e| crate::Error::Config(format!("bad snapshot interval: {e}")))?;
        }

        Ok(config)
    }
}

//! Persistence configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Storage backend for persistent sessions and retained messages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Local LSM-tree storage
    #[default]
    Fjall,
}

fn default_flush_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_max_batch_size() -> usize {
    100
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,

    pub backend: BackendType,

    /// Data directory
    pub path: PathBuf,

    /// Flush interval (e.g., "100ms", "1s")
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Operations buffered before a forced flush
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: BackendType::Fjall,
            path: PathBuf::from("./data"),
            flush_interval: default_flush_interval(),
            max_batch_size: default_max_batch_size(),
        }
    }
}

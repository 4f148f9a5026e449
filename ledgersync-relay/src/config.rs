//! Relay server configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub listen_addr: String,
    pub storage_path: PathBuf,
    pub max_messages_per_ledger: usize,
    pub max_payload_size: usize,
    /// Upper bound on `limit` in a pull request
    pub max_pull_limit: u64,
    pub rate_limit_per_minute: u32,
    /// How long used nonces are remembered
    pub nonce_retention_secs: i64,
    pub cleanup_interval_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8743".to_string(),
            storage_path: PathBuf::from("relay.db"),
            max_messages_per_ledger: 1_000_000,
            max_payload_size: 8 * 1024 * 1024,
            max_pull_limit: 5_000,
            rate_limit_per_minute: 120,
            nonce_retention_secs: 600,
            cleanup_interval_secs: 3600,
        }
    }
}

impl RelayConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml_dep::from_str(&content)?;
        Ok(config)
    }
}

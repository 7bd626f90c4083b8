//! Configuration loading and management.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Daemon configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Server identity.
    pub server: ServerConfig,
    /// Metrics HTTP listener.
    pub listen: ListenConfig,
    /// Database configuration.
    pub database: Option<DatabaseConfig>,
    /// CVR lifecycle tuning.
    #[serde(default)]
    pub cvr: CvrConfig,
}

/// Server identity configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Server name (e.g., "viewsyncd-1").
    pub name: String,
}

/// Metrics listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    /// Address to serve `/metrics` on (e.g., "0.0.0.0:9090").
    pub metrics_address: SocketAddr,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the CVR database file, or ":memory:".
    pub path: String,
}

/// CVR lifecycle configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CvrConfig {
    /// Idle time in ms after which a client group is purged.
    #[serde(default = "default_purge_idle_ms")]
    pub purge_idle_ms: i64,
    /// Interval in ms between purge sweeps.
    #[serde(default = "default_purge_interval_ms")]
    pub purge_interval_ms: u64,
}

impl Default for CvrConfig {
    fn default() -> Self {
        Self {
            purge_idle_ms: default_purge_idle_ms(),
            purge_interval_ms: default_purge_interval_ms(),
        }
    }
}

fn default_purge_idle_ms() -> i64 {
    // Two weeks.
    14 * 24 * 60 * 60 * 1000
}

fn default_purge_interval_ms() -> u64 {
    // Ten minutes.
    10 * 60 * 1000
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

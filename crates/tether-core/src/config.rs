//! Configuration system for Tether.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $TETHER_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/tether/config.toml
//!   3. ~/.config/tether/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    pub network: NetworkConfig,
    pub relay: RelayConfig,
    pub connection: ConnectionConfig,
    pub transfer: TransferConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Discovery server URLs probed for reachability.
    pub stun_servers: Vec<String>,
    /// Per-server probe timeout.
    pub probe_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Credential-issuance endpoint. Empty = no relay.
    pub credential_endpoint: String,
    /// Bearer token for the endpoint. Empty = none.
    pub api_key: String,
    /// Requested lease length.
    pub lease_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub max_peers: usize,
    /// Bound on initial offer/answer negotiation.
    pub connect_timeout_secs: u64,
    /// Restart attempts before a peer is declared dead.
    pub max_reconnect_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub chunk_size: usize,
    /// Total outbound ceiling shared by all recipients, bytes/sec. 0 = unlimited.
    pub bandwidth_limit: u64,
    /// Pause a recipient when its transport queues more than this.
    pub high_water_mark: u64,
    /// Resume once the queue drains below this.
    pub low_water_mark: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun.cloudflare.com:3478".to_string(),
            ],
            probe_timeout_ms: 3_000,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            credential_endpoint: String::new(),
            api_key: String::new(),
            lease_secs: 86_400,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_peers: 10,
            connect_timeout_secs: 30,
            max_reconnect_attempts: 3,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            bandwidth_limit: 0,
            high_water_mark: 1024 * 1024, // 1 MB
            low_water_mark: 256 * 1024,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

pub fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("tether")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl TetherConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path())
    }

    /// Load from an explicit path, falling back to defaults if it is absent.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
        } else {
            TetherConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("TETHER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&TetherConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply TETHER_* overrides. `lookup` is `std::env::var` outside tests.
    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("TETHER_NETWORK__STUN_SERVERS") {
            self.network.stun_servers = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = lookup("TETHER_RELAY__CREDENTIAL_ENDPOINT") {
            self.relay.credential_endpoint = v;
        }
        if let Some(v) = lookup("TETHER_RELAY__API_KEY") {
            self.relay.api_key = v;
        }
        if let Some(p) = lookup("TETHER_RELAY__LEASE_SECS").and_then(|v| v.parse().ok()) {
            self.relay.lease_secs = p;
        }
        if let Some(p) = lookup("TETHER_CONNECTION__MAX_PEERS").and_then(|v| v.parse().ok()) {
            self.connection.max_peers = p;
        }
        if let Some(p) = lookup("TETHER_CONNECTION__CONNECT_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.connection.connect_timeout_secs = p;
        }
        if let Some(p) = lookup("TETHER_TRANSFER__BANDWIDTH_LIMIT").and_then(|v| v.parse().ok()) {
            self.transfer.bandwidth_limit = p;
        }
    }
}

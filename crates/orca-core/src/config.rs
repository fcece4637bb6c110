//! Configuration system for Orca.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $ORCA_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/orca/config.toml
//!   3. ~/.config/orca/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrcaConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub market: MarketConfig,
    pub storage: StorageConfig,
    pub jobs: JobsConfig,
    pub directory: DirectoryConfig,
    pub payment: PaymentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Path to the Ed25519 secret key. Auto-generated on first run.
    pub keypair_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the transfer listener binds to.
    pub bind_addr: String,
    /// IP published in our holder records. Empty = bind_addr's IP.
    pub advertise_ip: String,
    /// TCP port serving chunk requests.
    pub transfer_port: u16,
    /// Local HTTP API port.
    pub api_port: u16,
    /// TCP port of the Kademlia DHT node, on `bind_addr`.
    pub dht_port: u16,
    /// DHT nodes to join through, as `peer_id@host:dht_port`.
    pub bootstrap_peers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    /// Price we charge for each chunk served.
    pub price_per_chunk: u64,
    /// Re-publish local holder records every N seconds. 0 = once at startup.
    pub announce_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Files in this directory are imported and offered on the market.
    pub shared_dir: PathBuf,
    /// Content-addressed chunk store root.
    pub chunk_root: PathBuf,
    /// Where downloaded files are assembled.
    pub download_dir: PathBuf,
    /// Chunk size in bytes.
    pub chunk_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub history_path: PathBuf,
    /// Dirty job lists are flushed every N seconds.
    pub save_interval_secs: u64,
    /// Fallback poll while a job is paused, in milliseconds.
    pub pause_poll_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    pub crawl_interval_secs: u64,
    pub probe_timeout_secs: u64,
    pub snapshot_path: PathBuf,
    /// Look up peer locations through ipinfo.io.
    pub geolocate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaymentConfig {
    pub ledger_path: PathBuf,
    /// Passed to the payment capability with every chunk payment.
    pub auth_token: String,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            keypair_path: config_dir().join("identity.key"),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            advertise_ip: String::new(),
            transfer_port: 7700,
            api_port: 7701,
            dht_port: 7702,
            bootstrap_peers: Vec::new(),
        }
    }
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            price_per_chunk: 1,
            announce_interval_secs: 600,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            shared_dir: data_dir().join("shared"),
            chunk_root: data_dir().join("chunks"),
            download_dir: data_dir().join("requested"),
            chunk_size: 4 * 1024 * 1024, // 4 MiB
        }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            history_path: data_dir().join("jobs.json"),
            save_interval_secs: 10,
            pause_poll_ms: 10_000,
        }
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            crawl_interval_secs: 3,
            probe_timeout_secs: 2,
            snapshot_path: data_dir().join("peers.json"),
            geolocate: false,
        }
    }
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            ledger_path: data_dir().join("transactions.jsonl"),
            auth_token: String::new(),
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("orca")
}

/// Base directory for persistent daemon state.
pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("orca")
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

impl OrcaConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path())
    }

    /// Load from an explicit path, then apply env overrides.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
        } else {
            OrcaConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("ORCA_CONFIG")
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
            let text = toml::to_string_pretty(&OrcaConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// The IP to publish in holder records.
    pub fn advertised_ip(&self) -> &str {
        if self.network.advertise_ip.is_empty() {
            &self.network.bind_addr
        } else {
            &self.network.advertise_ip
        }
    }

    /// Apply ORCA_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("ORCA_NETWORK__TRANSFER_PORT") {
            if let Ok(p) = v.parse() {
                self.network.transfer_port = p;
            }
        }
        if let Ok(v) = std::env::var("ORCA_NETWORK__API_PORT") {
            if let Ok(p) = v.parse() {
                self.network.api_port = p;
            }
        }
        if let Ok(v) = std::env::var("ORCA_NETWORK__DHT_PORT") {
            if let Ok(p) = v.parse() {
                self.network.dht_port = p;
            }
        }
        if let Ok(v) = std::env::var("ORCA_NETWORK__BOOTSTRAP_PEERS") {
            self.network.bootstrap_peers = v
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(v) = std::env::var("ORCA_NETWORK__ADVERTISE_IP") {
            self.network.advertise_ip = v;
        }
        if let Ok(v) = std::env::var("ORCA_MARKET__PRICE_PER_CHUNK") {
            if let Ok(p) = v.parse() {
                self.market.price_per_chunk = p;
            }
        }
        if let Ok(v) = std::env::var("ORCA_JOBS__HISTORY_PATH") {
            self.jobs.history_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ORCA_PAYMENT__AUTH_TOKEN") {
            self.payment.auth_token = v;
        }
    }
}

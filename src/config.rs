//! Node configuration, read from a TOML file with defaults for every value

use serde::Deserialize;
use thiserror::Error;

use std::fs;
use std::io;
use std::path::Path;

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "LEDGER_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "ledger.toml";

/// Longest hex-zero prefix a SHA-256 digest can have
const MAX_DIFFICULTY: usize = 64;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub path: String,
    /// Keep everything in memory (nothing survives a restart)
    #[serde(default)]
    pub in_memory: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_data_dir(),
            in_memory: false,
        }
    }
}

/// Proof-of-work and reward parameters
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LedgerConfig {
    /// Leading zero hex digits required in a block hash
    #[serde(default = "default_difficulty")]
    pub difficulty: usize,
    #[serde(default = "default_mining_reward")]
    pub mining_reward: f64,
    /// Time limit for a single mining request made through the API
    #[serde(default = "default_mining_timeout")]
    pub mining_timeout_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            difficulty: default_difficulty(),
            mining_reward: default_mining_reward(),
            mining_timeout_secs: default_mining_timeout(),
        }
    }
}

impl NodeConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `path`, falling back to defaults when the file does not exist
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Invalid("server.port must be non-zero".to_string()));
        }

        if !self.storage.in_memory && self.storage.path.trim().is_empty() {
            return Err(ConfigError::Invalid("storage.path must be set".to_string()));
        }

        if self.ledger.difficulty > MAX_DIFFICULTY {
            return Err(ConfigError::Invalid(format!(
                "ledger.difficulty must be at most {}",
                MAX_DIFFICULTY
            )));
        }

        if !self.ledger.mining_reward.is_finite() || self.ledger.mining_reward < 0.0 {
            return Err(ConfigError::Invalid(
                "ledger.mining_reward must be a non-negative number".to_string(),
            ));
        }

        Ok(())
    }
}

/// Loads the config named by `LEDGER_CONFIG`, or `ledger.toml`
pub fn load_config() -> Result<NodeConfig, ConfigError> {
    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    NodeConfig::load_from(path)
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_data_dir() -> String {
    "data/ledger".to_string()
}

fn default_difficulty() -> usize {
    3
}

fn default_mining_reward() -> f64 {
    50.0
}

fn default_mining_timeout() -> u64 {
    120
}

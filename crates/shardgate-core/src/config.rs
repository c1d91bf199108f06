//! Configuration module for shardgate
//!
//! Loaded once before anything else starts and never mutated afterwards.
//!
//! Priority (highest to lowest):
//! 1. Environment variables (`SHARDGATE_*`)
//! 2. TOML configuration file
//! 3. Built-in defaults

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/shardgate.toml";

/// Default virtual nodes per shard on the hash ring
pub const DEFAULT_VIRTUAL_NODES: u32 = 160;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Instance ID, used to tag log output
    pub instance_id: String,

    /// Free-form title of the deployment
    pub title: String,

    /// HTTP listen address
    pub listen_addr: String,

    /// Ring points per shard
    pub virtual_nodes: u32,

    /// Upper bound for a single backend call
    pub command_timeout_ms: u64,

    /// Upper bound for connect + ping during admission
    pub connect_timeout_ms: u64,

    /// Default tracing filter when `SHARDGATE_LOG` is unset
    pub log_level: String,

    /// Node discovery endpoint
    pub discovery: DiscoveryConfig,

    /// Shard name -> shard parameters
    pub shards: BTreeMap<String, ShardConfig>,
}

/// Node-listing API used to find each shard's hosts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub server: String,
    pub port: u16,
    pub timeout_ms: u64,
}

/// Per-shard static parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardConfig {
    /// `key:value` label selector matched against node labels
    pub node_label: String,

    /// Sentinel master group name
    pub failover_group: String,

    /// Port appended to every discovered hostname
    pub port: u16,

    /// Backend password, empty for none
    #[serde(default)]
    pub password: String,

    /// Logical database index
    #[serde(default)]
    pub database: i64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            title: "shardgate".to_string(),
            listen_addr: "0.0.0.0:9090".to_string(),
            virtual_nodes: DEFAULT_VIRTUAL_NODES,
            command_timeout_ms: 3_000,
            connect_timeout_ms: 5_000,
            log_level: "info".to_string(),
            discovery: DiscoveryConfig::default(),
            shards: BTreeMap::new(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1".to_string(),
            port: 8080,
            timeout_ms: 5_000,
        }
    }
}

impl DiscoveryConfig {
    /// URL of the node-listing API
    pub fn nodes_url(&self) -> String {
        format!("http://{}:{}/api/v1/nodes", self.server, self.port)
    }
}

impl ShardConfig {
    /// Password as the backend expects it (`None` when unset)
    pub fn password(&self) -> Option<&str> {
        if self.password.is_empty() {
            None
        } else {
            Some(&self.password)
        }
    }
}

/// Split a `key:value` selector into its two halves
pub fn parse_selector(selector: &str) -> Option<(&str, &str)> {
    let mut parts = selector.split(':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(key), Some(value), None) if !key.is_empty() => Some((key, value)),
        _ => None,
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file, then apply environment overrides.
    ///
    /// A missing file is an error: the gateway has nothing to route to
    /// without its shard table.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let mut config = Self::from_toml(&contents)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text without touching the environment
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Apply `SHARDGATE_*` environment overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("SHARDGATE_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Ok(val) = std::env::var("SHARDGATE_VIRTUAL_NODES") {
            if let Ok(v) = val.parse() {
                self.virtual_nodes = v;
            }
        }
        if let Ok(val) = std::env::var("SHARDGATE_COMMAND_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.command_timeout_ms = v;
            }
        }
        if let Ok(level) = std::env::var("SHARDGATE_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Ok(server) = std::env::var("SHARDGATE_DISCOVERY_SERVER") {
            self.discovery.server = server;
        }
        if let Ok(val) = std::env::var("SHARDGATE_DISCOVERY_PORT") {
            if let Ok(v) = val.parse() {
                self.discovery.port = v;
            }
        }
    }

    /// Reject configurations the gateway cannot start with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.virtual_nodes == 0 {
            return Err(ConfigError::Invalid("virtual_nodes must be > 0".into()));
        }
        if self.command_timeout_ms == 0 {
            return Err(ConfigError::Invalid("command_timeout_ms must be > 0".into()));
        }
        if self.shards.is_empty() {
            return Err(ConfigError::Invalid("no shards configured".into()));
        }
        for (name, shard) in &self.shards {
            if parse_selector(&shard.node_label).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "shard '{}': node_label '{}' is not a key:value pair",
                    name, shard.node_label
                )));
            }
            if shard.failover_group.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "shard '{}': failover_group is empty",
                    name
                )));
            }
        }
        Ok(())
    }
}

//! WolfCore Configuration
//!
//! This module provides configuration structures for log shipping, state
//! catch-up and upstream selection.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::id::MemberId;
use crate::replication::ReplicationConfig;
use crate::upstream::KNOWN_STRATEGIES;

/// Main WolfCore configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Log shipping configuration
    #[serde(default)]
    pub replication: ShippingConfig,

    /// Catch-up transfer configuration
    #[serde(default)]
    pub catchup: CatchupConfig,

    /// Upstream selection configuration
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique member identifier
    pub id: String,

    /// Address to bind the catch-up server
    pub catchup_address: String,

    /// Data directory holding the store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Server groups this member belongs to
    #[serde(default)]
    pub server_groups: Vec<String>,
}

/// Log shipping configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShippingConfig {
    /// Maximum entries per catch-up batch
    #[serde(default = "default_catchup_batch_size")]
    pub catchup_batch_size: usize,

    /// Maximum unacknowledged entries pipelined to one follower
    #[serde(default = "default_max_allowed_shipping_lag")]
    pub max_allowed_shipping_lag: u64,

    /// Resend interval in milliseconds
    #[serde(default = "default_retry_time_ms")]
    pub retry_time_ms: u64,

    /// Capacity of each follower's event queue
    #[serde(default = "default_shipper_queue_size")]
    pub shipper_queue_size: usize,
}

/// Catch-up transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatchupConfig {
    /// Time allowed to fetch a core snapshot, in milliseconds
    #[serde(default = "default_snapshot_timeout_ms")]
    pub snapshot_timeout_ms: u64,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Longest silence tolerated while streaming, in milliseconds
    #[serde(default = "default_inactivity_timeout_ms")]
    pub inactivity_timeout_ms: u64,

    /// Size of each file chunk sent during a store copy
    #[serde(default = "default_file_chunk_size")]
    pub file_chunk_size: usize,

    /// Transactions pulled per read from the upstream
    #[serde(default = "default_tx_pull_batch_size")]
    pub tx_pull_batch_size: usize,
}

/// Upstream selection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Strategy names in precedence order
    #[serde(default = "default_strategies")]
    pub strategies: Vec<String>,

    /// Time allowed for each strategy, in milliseconds
    #[serde(default = "default_strategy_timeout_ms")]
    pub strategy_timeout_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/wolfcore")
}

fn default_catchup_batch_size() -> usize {
    64
}

fn default_max_allowed_shipping_lag() -> u64 {
    256
}

fn default_retry_time_ms() -> u64 {
    5000
}

fn default_shipper_queue_size() -> usize {
    1024
}

fn default_snapshot_timeout_ms() -> u64 {
    60_000
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_inactivity_timeout_ms() -> u64 {
    30_000
}

fn default_file_chunk_size() -> usize {
    64 * 1024
}

fn default_tx_pull_batch_size() -> usize {
    256
}

fn default_strategies() -> Vec<String> {
    vec![crate::upstream::CONNECT_TO_RANDOM_CORE.to_string()]
}

fn default_strategy_timeout_ms() -> u64 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ShippingConfig {
    fn default() -> Self {
        Self {
            catchup_batch_size: default_catchup_batch_size(),
            max_allowed_shipping_lag: default_max_allowed_shipping_lag(),
            retry_time_ms: default_retry_time_ms(),
            shipper_queue_size: default_shipper_queue_size(),
        }
    }
}

impl Default for CatchupConfig {
    fn default() -> Self {
        Self {
            snapshot_timeout_ms: default_snapshot_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            inactivity_timeout_ms: default_inactivity_timeout_ms(),
            file_chunk_size: default_file_chunk_size(),
            tx_pull_batch_size: default_tx_pull_batch_size(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            strategies: default_strategies(),
            strategy_timeout_ms: default_strategy_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl CatchupConfig {
    /// Get snapshot timeout as Duration
    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.snapshot_timeout_ms)
    }

    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Get inactivity timeout as Duration
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }
}

impl UpstreamConfig {
    /// Get strategy timeout as Duration
    pub fn strategy_timeout(&self) -> Duration {
        Duration::from_millis(self.strategy_timeout_ms)
    }
}

impl CoreConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: CoreConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: CoreConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.node.catchup_address.is_empty() {
            return Err(crate::Error::Config(
                "node.catchup_address cannot be empty".into(),
            ));
        }

        if self.replication.catchup_batch_size == 0 {
            return Err(crate::Error::Config(
                "replication.catchup_batch_size must be positive".into(),
            ));
        }

        if self.replication.shipper_queue_size == 0 {
            return Err(crate::Error::Config(
                "replication.shipper_queue_size must be positive".into(),
            ));
        }

        if self.catchup.file_chunk_size == 0 || self.catchup.tx_pull_batch_size == 0 {
            return Err(crate::Error::Config(
                "catchup chunk and batch sizes must be positive".into(),
            ));
        }

        for name in &self.upstream.strategies {
            if !KNOWN_STRATEGIES.contains(&name.as_str()) {
                return Err(crate::Error::Config(format!(
                    "Unknown upstream strategy '{}'",
                    name
                )));
            }
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "compact") {
            return Err(crate::Error::Config(format!(
                "logging.format must be pretty or compact, got '{}'",
                self.logging.format
            )));
        }

        Ok(())
    }

    /// This member's id
    pub fn member_id(&self) -> MemberId {
        MemberId::new(self.node.id.clone())
    }

    /// Get the store directory path
    pub fn store_dir(&self) -> PathBuf {
        self.node.data_dir.join("store")
    }

    /// Log shipping settings
    pub fn replication_config(&self) -> ReplicationConfig {
        ReplicationConfig {
            catchup_batch_size: self.replication.catchup_batch_size,
            max_allowed_shipping_lag: self.replication.max_allowed_shipping_lag,
            retry_interval_ms: self.replication.retry_time_ms,
            queue_size: self.replication.shipper_queue_size,
        }
    }
}

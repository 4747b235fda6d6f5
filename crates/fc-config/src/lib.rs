//! FlowCatalyst Router Configuration
//!
//! This crate provides TOML-based configuration with environment variable override support.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use fc_common::{PoolConfig, QueueConfig, QueueType, RouterConfig};

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub router: RouterSettings,
    pub mediator: MediatorSettings,
    pub health: HealthSettings,
    pub pools: Vec<PoolConfig>,
    pub queues: Vec<QueueConfig>,

    /// Data directory for the embedded SQLite queue
    pub data_dir: String,

    /// Enable development mode (in-memory queue when none is configured)
    pub dev_mode: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            router: RouterSettings::default(),
            mediator: MediatorSettings::default(),
            health: HealthSettings::default(),
            pools: Vec::new(),
            queues: Vec::new(),
            data_dir: "./data".to_string(),
            dev_mode: false,
        }
    }
}

/// HTTP server configuration (health checks, metrics, monitoring)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub port: u16,
    pub host: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
        }
    }
}

/// Routing and lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterSettings {
    /// Grace period for pools to finish accepted work at shutdown
    pub drain_timeout_secs: u64,
    /// Maximum messages per receive
    pub batch_size: u32,
    /// A consumer that has not polled for this long is reported stalled
    pub consumer_stall_timeout_secs: u64,
    pub visibility_extension_interval_secs: u64,
    /// In-flight age after which visibility is extended
    pub visibility_extension_threshold_secs: u64,
    pub config_sync: ConfigSyncSettings,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            drain_timeout_secs: 60,
            batch_size: 10,
            consumer_stall_timeout_secs: 60,
            visibility_extension_interval_secs: 55,
            visibility_extension_threshold_secs: 50,
            config_sync: ConfigSyncSettings::default(),
        }
    }
}

/// Periodic pool configuration sync from a central config service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigSyncSettings {
    pub enabled: bool,
    pub config_url: String,
    pub interval_seconds: u64,
    /// Attempts per sync round
    pub max_retry_attempts: u32,
    pub retry_delay_seconds: u64,
    pub request_timeout_seconds: u64,
}

impl Default for ConfigSyncSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            config_url: String::new(),
            interval_seconds: 300,
            max_retry_attempts: 3,
            retry_delay_seconds: 5,
            request_timeout_seconds: 30,
        }
    }
}

/// HTTP mediation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediatorSettings {
    /// Per-attempt timeout in milliseconds
    pub timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub http1_only: bool,
    /// Consecutive failures that open a target's circuit
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_reset_secs: u64,
}

impl Default for MediatorSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
            http1_only: false,
            circuit_breaker_threshold: 5,
            circuit_breaker_reset_secs: 30,
        }
    }
}

impl MediatorSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Queue health monitor thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub enabled: bool,
    pub check_interval_secs: u64,
    pub backlog_threshold: u64,
    pub growth_threshold: u64,
    pub growth_periods_threshold: u32,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_secs: 30,
            backlog_threshold: 1000,
            growth_threshold: 100,
            growth_periods_threshold: 3,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Reject configurations the router cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut codes = HashSet::new();
        for pool in &self.pools {
            if pool.code.trim().is_empty() {
                return Err(ConfigError::ValidationError("pool code must not be empty".to_string()));
            }
            if !codes.insert(pool.code.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate pool code [{}]",
                    pool.code
                )));
            }
            if pool.concurrency == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "pool [{}] concurrency must be at least 1",
                    pool.code
                )));
            }
            if pool.rate_limit_per_minute == Some(0) {
                return Err(ConfigError::ValidationError(format!(
                    "pool [{}] rate limit must be positive or absent",
                    pool.code
                )));
            }
        }

        let mut names = HashSet::new();
        for queue in &self.queues {
            if queue.name.trim().is_empty() {
                return Err(ConfigError::ValidationError("queue name must not be empty".to_string()));
            }
            if !names.insert(queue.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate queue name [{}]",
                    queue.name
                )));
            }
            if queue.queue_type == QueueType::Sqs && queue.uri.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "SQS queue [{}] needs a queue URL",
                    queue.name
                )));
            }
        }

        if self.router.config_sync.enabled && self.router.config_sync.config_url.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "router.config_sync.config_url is required when config sync is enabled".to_string(),
            ));
        }
        if self.router.config_sync.enabled && self.router.config_sync.interval_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "router.config_sync.interval_seconds must be at least 1".to_string(),
            ));
        }

        if self.router.batch_size == 0 {
            return Err(ConfigError::ValidationError("router.batch_size must be at least 1".to_string()));
        }
        Ok(())
    }

    /// The explicit configuration handed to the router at construction
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            processing_pools: self.pools.clone(),
            queues: self.queues.clone(),
        }
    }

    /// Generate example TOML configuration
    pub fn example_toml() -> String {
        r#"# FlowCatalyst Router Configuration
# Environment variables override these settings

data_dir = "./data"
dev_mode = false

[http]
port = 8080
host = "0.0.0.0"

[router]
drain_timeout_secs = 60
batch_size = 10
consumer_stall_timeout_secs = 60
visibility_extension_interval_secs = 55
visibility_extension_threshold_secs = 50

# Pools are re-read from this URL and hot-reloaded when they change
[router.config_sync]
enabled = false
config_url = "http://localhost:8081/api/config/router"
interval_seconds = 300
max_retry_attempts = 3
retry_delay_seconds = 5
request_timeout_seconds = 30

[mediator]
timeout_ms = 30000
connect_timeout_ms = 10000
http1_only = false
circuit_breaker_threshold = 5
circuit_breaker_reset_secs = 30

[health]
enabled = true
check_interval_secs = 30
backlog_threshold = 1000
growth_threshold = 100
growth_periods_threshold = 3

[[pools]]
code = "ORDERS"
concurrency = 10
rate_limit_per_minute = 600

[[pools]]
code = "NOTIFICATIONS"
concurrency = 5

[[queues]]
name = "orders"
queue_type = "sqs"
uri = "https://sqs.us-east-1.amazonaws.com/000000000000/orders.fifo"
connections = 2
visibility_timeout = 120
"#
        .to_string()
    }
}

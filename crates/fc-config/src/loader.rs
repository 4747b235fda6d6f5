//! Configuration loader with file and environment variable support

use std::env;
use std::path::PathBuf;

use tracing::{info, warn};

use fc_common::{QueueConfig, QueueType};

use crate::{AppConfig, ConfigError};

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "router.toml",
    "flowcatalyst.toml",
    "./config/config.toml",
    "./config/router.toml",
    "/etc/flowcatalyst/router.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable
    /// overrides, then validate it
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        self.load_with(|key| env::var(key).ok())
    }

    /// Same as [`load`](Self::load) with an explicit variable lookup
    pub fn load_with(&self, lookup: impl Fn(&str) -> Option<String>) -> Result<AppConfig, ConfigError> {
        let mut config = match self.find_config_file(&lookup) {
            Some(path) => {
                info!(?path, "Loading configuration from file");
                AppConfig::from_file(&path)?
            }
            None => {
                info!("No configuration file found, using defaults");
                AppConfig::default()
            }
        };

        apply_overrides(&mut config, &lookup);
        config.validate()?;
        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(&self, lookup: &impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!(?path, "Configured file does not exist, searching standard paths");
        }

        if let Some(path) = lookup("FLOWCATALYST_CONFIG").map(PathBuf::from) {
            if path.exists() {
                return Some(path);
            }
        }

        CONFIG_PATHS.iter().map(PathBuf::from).find(|p| p.exists())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_queue_type(value: &str) -> Option<QueueType> {
    match value.trim().to_ascii_lowercase().as_str() {
        "memory" | "embedded" => Some(QueueType::Memory),
        "sqlite" => Some(QueueType::Sqlite),
        "sqs" => Some(QueueType::Sqs),
        _ => None,
    }
}

/// Queue name from the last path segment of a URL or file path
fn queue_name_from_uri(uri: &str) -> String {
    uri.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("default")
        .to_string()
}

fn parse_into<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(value) => *target = value,
            Err(_) => warn!(key, value = %raw, "Ignoring unparseable environment override"),
        }
    }
}

/// Apply environment variable overrides
fn apply_overrides(config: &mut AppConfig, lookup: &impl Fn(&str) -> Option<String>) {
    // HTTP
    parse_into(lookup, "FLOWCATALYST_HTTP_PORT", &mut config.http.port);
    if let Some(host) = lookup("FLOWCATALYST_HTTP_HOST") {
        config.http.host = host;
    }

    // Queue: the URL overrides the first queue, or defines one when none is configured
    let queue_type = lookup("FLOWCATALYST_QUEUE_TYPE").and_then(|v| parse_queue_type(&v));
    if let Some(uri) = lookup("FLOWCATALYST_QUEUE_URL") {
        match config.queues.first_mut() {
            Some(queue) => {
                queue.uri = uri;
                if let Some(queue_type) = queue_type {
                    queue.queue_type = queue_type;
                }
            }
            None => config.queues.push(QueueConfig {
                name: queue_name_from_uri(&uri),
                queue_type: queue_type.unwrap_or(QueueType::Sqs),
                uri,
                connections: 1,
                visibility_timeout: 120,
            }),
        }
    } else if let (Some(queue_type), Some(queue)) = (queue_type, config.queues.first_mut()) {
        queue.queue_type = queue_type;
    }

    // Mediator
    parse_into(lookup, "FLOWCATALYST_MEDIATION_TIMEOUT_MS", &mut config.mediator.timeout_ms);
    parse_into(lookup, "FLOWCATALYST_HTTP1_ONLY", &mut config.mediator.http1_only);

    // Config sync
    parse_into(lookup, "FLOWCATALYST_CONFIG_SYNC_ENABLED", &mut config.router.config_sync.enabled);
    if let Some(url) = lookup("FLOWCATALYST_CONFIG_SYNC_URL") {
        config.router.config_sync.config_url = url;
    }
    parse_into(
        lookup,
        "FLOWCATALYST_CONFIG_SYNC_INTERVAL",
        &mut config.router.config_sync.interval_seconds,
    );

    // Health
    parse_into(lookup, "FLOWCATALYST_HEALTH_ENABLED", &mut config.health.enabled);
    parse_into(lookup, "FLOWCATALYST_HEALTH_BACKLOG_THRESHOLD", &mut config.health.backlog_threshold);
    parse_into(lookup, "FLOWCATALYST_HEALTH_GROWTH_THRESHOLD", &mut config.health.growth_threshold);

    // General
    if let Some(dir) = lookup("FLOWCATALYST_DATA_DIR") {
        config.data_dir = dir;
    }
    parse_into(lookup, "FLOWCATALYST_DEV_MODE", &mut config.dev_mode);
}

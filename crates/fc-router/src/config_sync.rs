//! Configuration Sync Service
//!
//! Periodically fetches the router configuration from a central service and
//! hot-reloads processing pools through [`Router::apply_config`]. Queue
//! definitions in the response are parsed but only take effect on restart.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use fc_common::{PoolConfig, QueueConfig, RouterConfig, WarningCategory, WarningSeverity};

use crate::error::RouterError;
use crate::router::{ReloadSummary, Router};
use crate::warning::WarningService;
use crate::Result;

#[derive(Debug, Clone)]
pub struct ConfigSyncConfig {
    /// URL to fetch configuration from
    pub config_url: String,
    pub sync_interval: Duration,
    /// Attempts per sync round before waiting for the next interval
    pub max_retry_attempts: u32,
    pub retry_delay: Duration,
    pub request_timeout: Duration,
}

impl Default for ConfigSyncConfig {
    fn default() -> Self {
        Self {
            config_url: String::new(),
            sync_interval: Duration::from_secs(300),
            max_retry_attempts: 3,
            retry_delay: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl ConfigSyncConfig {
    pub fn new(config_url: impl Into<String>) -> Self {
        Self {
            config_url: config_url.into(),
            ..Default::default()
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, delay: Duration) -> Self {
        self.max_retry_attempts = max_attempts;
        self.retry_delay = delay;
        self
    }
}

/// Body served by the configuration endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteRouterConfig {
    processing_pools: Vec<PoolConfig>,
    #[serde(default)]
    queues: Vec<QueueConfig>,
}

impl From<RemoteRouterConfig> for RouterConfig {
    fn from(remote: RemoteRouterConfig) -> Self {
        RouterConfig {
            processing_pools: remote.processing_pools,
            queues: remote.queues,
        }
    }
}

/// Result of one sync round
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Applied(ReloadSummary),
    Unchanged,
    Failed(String),
}

pub struct ConfigSyncService {
    config: ConfigSyncConfig,
    http_client: reqwest::Client,
    router: Arc<Router>,
    warning_service: Arc<WarningService>,
    last_applied: Mutex<Option<RouterConfig>>,
}

impl ConfigSyncService {
    pub fn new(
        config: ConfigSyncConfig,
        router: Arc<Router>,
        warning_service: Arc<WarningService>,
    ) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            config,
            http_client,
            router,
            warning_service,
            last_applied: Mutex::new(None),
        })
    }

    pub fn sync_interval(&self) -> Duration {
        self.config.sync_interval
    }

    /// Fetch the configuration, retrying up to `max_retry_attempts` times
    pub async fn fetch_config(&self) -> Result<RouterConfig> {
        let max_attempts = self.config.max_retry_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.fetch_config_once().await {
                Ok(config) => {
                    if attempt > 1 {
                        info!(attempt, "Fetched configuration after retries");
                    }
                    return Ok(config);
                }
                Err(e) if attempt < max_attempts => {
                    warn!(
                        attempt,
                        max_attempts,
                        error = %e,
                        retry_delay_ms = self.config.retry_delay.as_millis() as u64,
                        "Failed to fetch config, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_config_once(&self) -> Result<RouterConfig> {
        let response = self.http_client.get(&self.config.config_url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RouterError::ConfigFetch(format!(
                "config service returned status {}",
                status
            )));
        }
        let remote: RemoteRouterConfig = response.json().await?;
        Ok(remote.into())
    }

    /// Fetch and apply if the configuration differs from the last one applied
    pub async fn sync(&self) -> SyncOutcome {
        let config = match self.fetch_config().await {
            Ok(config) => config,
            Err(e) => {
                error!(
                    url = %self.config.config_url,
                    error = %e,
                    "Config sync failed, keeping current configuration"
                );
                self.warning_service.add_warning(
                    WarningCategory::Configuration,
                    WarningSeverity::Error,
                    format!("Config sync failed: {}", e),
                    "ConfigSyncService",
                );
                return SyncOutcome::Failed(e.to_string());
            }
        };

        if self.last_applied.lock().as_ref() == Some(&config) {
            debug!("Configuration unchanged, skipping reload");
            return SyncOutcome::Unchanged;
        }

        if !self.router.is_running() {
            return SyncOutcome::Failed(RouterError::ShutdownInProgress.to_string());
        }

        info!(
            pools = config.processing_pools.len(),
            queues = config.queues.len(),
            "Configuration changed, applying updates"
        );
        let summary = self.router.apply_config(config.clone());
        *self.last_applied.lock() = Some(config);
        SyncOutcome::Applied(summary)
    }
}

//! Lifecycle Manager - background tasks around the router
//!
//! Handles:
//! - Visibility extension for long-running messages
//! - Consumer stall detection and restart
//! - Warning housekeeping
//! - The queue health monitor
//! - Periodic config sync, when configured
//!
//! Every task stops on the shared shutdown signal.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use fc_common::{WarningCategory, WarningSeverity};

use crate::config_sync::{ConfigSyncService, SyncOutcome};
use crate::health_monitor::{spawn_health_monitor, HealthMonitor};
use crate::router::Router;
use crate::warning::WarningService;

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub visibility_extension_interval: Duration,
    /// Messages in flight at least this long get their visibility extended
    pub visibility_extension_threshold: Duration,
    pub consumer_health_interval: Duration,
    pub warning_cleanup_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            visibility_extension_interval: Duration::from_secs(55),
            visibility_extension_threshold: Duration::from_secs(50),
            consumer_health_interval: Duration::from_secs(30),
            warning_cleanup_interval: Duration::from_secs(300),
        }
    }
}

pub struct LifecycleManager {
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

/// Run `tick` every `interval` until shutdown. The immediate first tick of
/// the interval is skipped.
fn spawn_periodic<F, Fut>(
    name: &'static str,
    interval: Duration,
    shutdown_tx: &broadcast::Sender<()>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let mut shutdown_rx = shutdown_tx.subscribe();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => tick().await,
                _ = shutdown_rx.recv() => {
                    debug!(task = name, "Lifecycle task shutting down");
                    break;
                }
            }
        }
    })
}

impl LifecycleManager {
    pub fn start(
        router: Arc<Router>,
        warning_service: Arc<WarningService>,
        health_monitor: Option<Arc<HealthMonitor>>,
        config_sync: Option<Arc<ConfigSyncService>>,
        config: LifecycleConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let mut tasks = Vec::new();

        {
            let router = router.clone();
            let threshold = config.visibility_extension_threshold;
            tasks.push(spawn_periodic(
                "visibility-extender",
                config.visibility_extension_interval,
                &shutdown_tx,
                move || {
                    let router = router.clone();
                    async move {
                        let extended = router.extend_visibility_for_long_running(threshold).await;
                        if extended > 0 {
                            debug!(extended, "Extended visibility for long-running messages");
                        }
                    }
                },
            ));
        }

        {
            let router = router.clone();
            let warning_service = warning_service.clone();
            let stalled = Arc::new(parking_lot::Mutex::new(HashMap::new()));
            tasks.push(spawn_periodic(
                "consumer-health",
                config.consumer_health_interval,
                &shutdown_tx,
                move || {
                    let router = router.clone();
                    let warning_service = warning_service.clone();
                    let stalled = stalled.clone();
                    async move {
                        check_consumers(&router, &warning_service, &stalled).await;
                    }
                },
            ));
        }

        {
            let warning_service = warning_service.clone();
            tasks.push(spawn_periodic(
                "warning-cleanup",
                config.warning_cleanup_interval,
                &shutdown_tx,
                move || {
                    let warning_service = warning_service.clone();
                    async move {
                        warning_service.cleanup();
                    }
                },
            ));
        }

        if let Some(sync) = config_sync {
            let interval = sync.sync_interval();
            tasks.push(spawn_periodic("config-sync", interval, &shutdown_tx, move || {
                let sync = sync.clone();
                async move {
                    if let SyncOutcome::Applied(summary) = sync.sync().await {
                        info!(?summary, "Applied synced configuration");
                    }
                }
            }));
        }

        if let Some(monitor) = health_monitor {
            tasks.push(spawn_health_monitor(monitor, router, &shutdown_tx));
        }

        info!(tasks = tasks.len(), "Lifecycle tasks started");
        Self { shutdown_tx, tasks }
    }

    /// Signal every task and wait for them to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        for task in self.tasks {
            let _ = task.await;
        }
        info!("Lifecycle tasks stopped");
    }
}

/// Restart attempts per stall episode before the consumer is left alone
const MAX_RESTART_ATTEMPTS: u32 = 3;

/// Raise one CONSUMER_HEALTH warning when a running consumer stops polling
/// and restart it, up to [`MAX_RESTART_ATTEMPTS`] times until it recovers.
async fn check_consumers(
    router: &Arc<Router>,
    warning_service: &WarningService,
    stalled: &parking_lot::Mutex<HashMap<String, u32>>,
) {
    let mut to_restart = Vec::new();
    {
        let mut stalled = stalled.lock();
        for health in router.consumer_health() {
            let queue = health.queue_identifier.clone();
            if !(health.is_running && !health.is_healthy) {
                if stalled.remove(&queue).is_some() {
                    info!(queue = %queue, "Consumer recovered");
                }
                continue;
            }

            let attempts = stalled.entry(queue.clone()).or_insert(0);
            if *attempts == 0 {
                warn!(
                    queue = %queue,
                    since_last_poll_ms = ?health.time_since_last_poll_ms,
                    "Consumer appears stalled"
                );
                warning_service.add_warning(
                    WarningCategory::ConsumerHealth,
                    WarningSeverity::Error,
                    format!(
                        "Consumer for queue {} has not polled for {}s",
                        queue,
                        health.time_since_last_poll_ms.unwrap_or(0) / 1000
                    ),
                    "LifecycleManager",
                );
            }
            if *attempts < MAX_RESTART_ATTEMPTS {
                *attempts += 1;
                to_restart.push((queue, *attempts));
            } else if *attempts == MAX_RESTART_ATTEMPTS {
                *attempts += 1;
                error!(queue = %queue, attempts = MAX_RESTART_ATTEMPTS, "Consumer restart attempts exhausted");
            }
        }
    }

    for (queue, attempt) in to_restart {
        info!(queue = %queue, attempt, "Restarting stalled consumer");
        router.restart_consumer(&queue).await;
    }
}

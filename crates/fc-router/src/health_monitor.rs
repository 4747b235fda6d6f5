//! Queue health monitor - periodic backlog and growth checks
//!
//! - QUEUE_BACKLOG: pending messages above the backlog threshold, raised once
//!   per check while the queue stays above it
//! - QUEUE_GROWING: pending messages grew by at least the growth threshold for
//!   N consecutive checks
//!
//! Purely observational: it reads queue stats and raises warnings, nothing else.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use fc_common::{QueueStats, WarningCategory, WarningSeverity};

use crate::metrics;
use crate::router::Router;
use crate::warning::WarningService;

/// Growth counter ceiling, so a long growth streak recovers quickly once it ends
const MAX_GROWTH_PERIODS: u32 = 10;

#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    pub enabled: bool,
    pub check_interval: Duration,
    pub backlog_threshold: u64,
    /// Minimum growth per check to count as a growth period
    pub growth_threshold: u64,
    /// Consecutive growth periods before warning
    pub growth_periods_threshold: u32,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval: Duration::from_secs(30),
            backlog_threshold: 1000,
            growth_threshold: 100,
            growth_periods_threshold: 3,
        }
    }
}

#[derive(Debug, Default)]
struct QueueSizeHistory {
    last_size: Option<u64>,
    consecutive_growth_periods: u32,
}

pub struct HealthMonitor {
    config: HealthMonitorConfig,
    warning_service: Arc<WarningService>,
    history: Mutex<HashMap<String, QueueSizeHistory>>,
}

impl HealthMonitor {
    pub fn new(config: HealthMonitorConfig, warning_service: Arc<WarningService>) -> Self {
        Self {
            config,
            warning_service,
            history: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &HealthMonitorConfig {
        &self.config
    }

    /// Run one check over a snapshot of queue stats. Returns the number of
    /// warnings raised.
    pub fn check(&self, stats: &[QueueStats]) -> usize {
        if !self.config.enabled {
            return 0;
        }

        let mut raised = 0;
        for queue in stats {
            metrics::set_queue_pending(&queue.queue_identifier, queue.pending_messages);
            if self.check_backlog(&queue.queue_identifier, queue.pending_messages) {
                raised += 1;
            }
            if self.check_growth(&queue.queue_identifier, queue.pending_messages) {
                raised += 1;
            }
        }
        raised
    }

    fn check_backlog(&self, queue: &str, pending: u64) -> bool {
        if pending <= self.config.backlog_threshold {
            return false;
        }

        warn!(
            queue = %queue,
            pending,
            threshold = self.config.backlog_threshold,
            "Queue backlog detected"
        );
        self.warning_service.add_warning(
            WarningCategory::QueueBacklog,
            WarningSeverity::Warn,
            format!(
                "Queue {} has {} pending messages (threshold: {})",
                queue, pending, self.config.backlog_threshold
            ),
            "HealthMonitor",
        );
        true
    }

    fn check_growth(&self, queue: &str, pending: u64) -> bool {
        let mut history = self.history.lock();
        let entry = history.entry(queue.to_string()).or_default();
        let previous = entry.last_size.replace(pending);

        let Some(previous) = previous else {
            return false;
        };

        let growth = pending.saturating_sub(previous);
        if growth < self.config.growth_threshold {
            if entry.consecutive_growth_periods > 0 {
                debug!(queue = %queue, periods = entry.consecutive_growth_periods, "Queue stopped growing");
            }
            entry.consecutive_growth_periods = 0;
            return false;
        }

        entry.consecutive_growth_periods = (entry.consecutive_growth_periods + 1).min(MAX_GROWTH_PERIODS);
        if entry.consecutive_growth_periods < self.config.growth_periods_threshold {
            return false;
        }

        warn!(
            queue = %queue,
            periods = entry.consecutive_growth_periods,
            pending,
            growth,
            "Queue growth detected"
        );
        self.warning_service.add_warning(
            WarningCategory::QueueGrowing,
            WarningSeverity::Warn,
            format!(
                "Queue {} growing for {} periods (pending: {}, +{} in {}s)",
                queue,
                entry.consecutive_growth_periods,
                pending,
                growth,
                self.config.check_interval.as_secs()
            ),
            "HealthMonitor",
        );
        true
    }
}

/// Run the monitor against the router's consumers until shutdown
pub fn spawn_health_monitor(
    monitor: Arc<HealthMonitor>,
    router: Arc<Router>,
    shutdown_tx: &broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    let mut shutdown_rx = shutdown_tx.subscribe();
    let interval = monitor.config.check_interval;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately; skip it so stats have time to settle
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let stats = router.queue_stats().await;
                    monitor.check(&stats);
                }
                _ = shutdown_rx.recv() => {
                    info!("Health monitor shutting down");
                    break;
                }
            }
        }
    })
}

//! Router - turns consumer batches into pool submissions
//!
//! - Partitions each batch by pool, then by message group, keeping arrival order
//! - Nacks what cannot be placed (unknown pool, pool full, shutting down)
//! - Tracks messages in the pipeline so a broker redelivery of a message that
//!   is still being processed only refreshes its receipt handle
//! - Owns the consumers and pools, and shuts them down consumer-first

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use indexmap::IndexMap;
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use fc_common::{
    ConsumerHealth, PoolConfig, PoolStats, QueueStats, RouterConfig, WarningCategory,
    WarningSeverity,
};
use fc_queue::{
    BatchHandler, ConsumerConfig, MessageCallback, QueueClient, QueueConsumer, ReceivedMessage,
};

use crate::error::RouterError;
use crate::mediator::Mediator;
use crate::metrics;
use crate::pool::{CompletionGuard, ConfigResult, PoolTask, ProcessPool, RejectReason, SubmitResult};
use crate::warning::WarningService;
use crate::Result;

/// Grace period for pools to finish accepted work at shutdown
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

/// A message between acceptance by a pool and its ack/nack
#[derive(Debug, Clone)]
pub struct InPipelineMessage {
    pub message_id: String,
    pub pool_code: String,
    pub queue_identifier: String,
    pub callback: Arc<MessageCallback>,
}

/// Outcome of [`Router::apply_config`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadSummary {
    pub created: usize,
    pub updated: usize,
    pub removed: usize,
    pub rejected: usize,
}

pub struct Router {
    pools: DashMap<String, Arc<ProcessPool>>,
    /// Removed pools still finishing work, keyed by a per-removal sequence
    /// number since a code can be removed again while an earlier drain runs
    draining_pools: Arc<DashMap<u64, Arc<ProcessPool>>>,
    drain_seq: AtomicU64,
    consumers: RwLock<Vec<Arc<QueueConsumer>>>,
    mediator: Arc<dyn Mediator>,
    warning_service: Arc<WarningService>,
    in_pipeline: Arc<DashMap<String, InPipelineMessage>>,
    batch_counter: AtomicU64,
    running: AtomicBool,
    drain_timeout: Duration,
}

/// Unit of ordering inside one pool partition of a batch
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum OrderingUnit {
    Group(String),
    /// Ungrouped messages are independent; numbered by arrival
    Single(usize),
}

fn pipeline_key(received: &ReceivedMessage) -> String {
    let id = received
        .broker_message_id
        .as_deref()
        .unwrap_or(received.message.id.as_str());
    format!("{}:{}", received.queue_identifier, id)
}

impl Router {
    pub fn new(
        config: RouterConfig,
        mediator: Arc<dyn Mediator>,
        warning_service: Arc<WarningService>,
    ) -> Arc<Self> {
        Self::with_drain_timeout(config, mediator, warning_service, DEFAULT_DRAIN_TIMEOUT)
    }

    pub fn with_drain_timeout(
        config: RouterConfig,
        mediator: Arc<dyn Mediator>,
        warning_service: Arc<WarningService>,
        drain_timeout: Duration,
    ) -> Arc<Self> {
        let router = Self {
            pools: DashMap::new(),
            draining_pools: Arc::new(DashMap::new()),
            drain_seq: AtomicU64::new(0),
            consumers: RwLock::new(Vec::new()),
            mediator,
            warning_service,
            in_pipeline: Arc::new(DashMap::new()),
            batch_counter: AtomicU64::new(0),
            running: AtomicBool::new(true),
            drain_timeout,
        };
        for pool_config in config.processing_pools {
            router.create_pool(pool_config);
        }
        Arc::new(router)
    }

    fn create_pool(&self, config: PoolConfig) -> Arc<ProcessPool> {
        let code = config.code.clone();
        let pool = Arc::new(ProcessPool::new(
            config,
            self.mediator.clone(),
            Some(self.warning_service.clone()),
        ));
        pool.start();
        self.pools.insert(code, pool.clone());
        pool
    }

    /// Start consuming `client` into this router. A broker that cannot be
    /// reached fails here and the consumer is not kept.
    pub async fn add_consumer(
        self: &Arc<Self>,
        client: Arc<dyn QueueClient>,
        config: ConsumerConfig,
    ) -> Result<Arc<QueueConsumer>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(RouterError::ShutdownInProgress);
        }

        let handler: Arc<dyn BatchHandler> = self.clone();
        let consumer = Arc::new(QueueConsumer::new(client, handler, config));
        consumer
            .start()
            .await
            .map_err(|source| RouterError::ConsumerStart {
                queue: consumer.identifier().to_string(),
                source,
            })?;

        self.consumers.write().push(consumer.clone());
        Ok(consumer)
    }

    /// Replace the consumer for `queue_identifier` with a fresh one on the
    /// same broker client. Returns false when there is nothing to restart or
    /// the replacement could not start.
    pub async fn restart_consumer(self: &Arc<Self>, queue_identifier: &str) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }
        let existing = self
            .consumers
            .read()
            .iter()
            .find(|c| c.identifier() == queue_identifier)
            .cloned();
        let Some(existing) = existing else {
            warn!(queue = %queue_identifier, "Consumer not found for restart");
            return false;
        };

        info!(queue = %queue_identifier, "Restarting consumer");
        existing.stop().await;

        let replacement = Arc::new(existing.recreate(self.clone()));
        if let Err(e) = replacement.start().await {
            error!(queue = %queue_identifier, error = %e, "Consumer restart failed");
            return false;
        }

        let replaced = {
            let mut consumers = self.consumers.write();
            match consumers.iter_mut().find(|c| Arc::ptr_eq(c, &existing)) {
                Some(slot) => {
                    *slot = replacement.clone();
                    true
                }
                None => false,
            }
        };
        if !replaced {
            // Shutdown took the consumer list while we were restarting
            replacement.stop().await;
        }
        replaced
    }

    /// Route one batch pulled from `queue_identifier`
    pub async fn route_batch(&self, queue_identifier: &str, batch: Vec<ReceivedMessage>) {
        if batch.is_empty() {
            return;
        }
        if !self.running.load(Ordering::SeqCst) {
            for received in batch {
                nack_default(&received.callback, &received.message.id).await;
            }
            return;
        }

        let batch_id: Arc<str> = Arc::from(format!(
            "{}-{}",
            queue_identifier,
            self.batch_counter.fetch_add(1, Ordering::Relaxed)
        ));

        // pool code -> ordering unit -> members, all in arrival order
        let mut by_pool: IndexMap<String, IndexMap<OrderingUnit, Vec<ReceivedMessage>>> =
            IndexMap::new();
        let mut singles = 0usize;

        for received in batch {
            let key = pipeline_key(&received);
            if let Some(live) = self.in_pipeline.get(&key) {
                live.callback
                    .update_receipt_handle(received.callback.receipt_handle());
                debug!(
                    message_id = %received.message.id,
                    pool_code = %live.pool_code,
                    "Redelivery of a message still in the pipeline, receipt handle refreshed"
                );
                continue;
            }

            let unit = match received.message.group_id() {
                Some(group) => OrderingUnit::Group(group.to_string()),
                None => {
                    singles += 1;
                    OrderingUnit::Single(singles)
                }
            };
            by_pool
                .entry(received.message.pool_code.clone())
                .or_default()
                .entry(unit)
                .or_default()
                .push(received);
        }

        for (pool_code, groups) in by_pool {
            let Some(pool) = self.pool(&pool_code) else {
                self.reject_unknown_pool(&pool_code, groups.into_values().flatten()).await;
                continue;
            };

            let mut at_capacity = 0usize;
            for (_, members) in groups {
                let mut group_rejected = false;
                for received in members {
                    if group_rejected {
                        // Keep the group's order: nothing after a rejected member may run
                        nack_default(&received.callback, &received.message.id).await;
                        continue;
                    }
                    let callback = received.callback.clone();
                    let message_id = received.message.id.clone();
                    if let SubmitResult::Rejected(reason) = self.submit(&pool, received, &batch_id) {
                        debug!(
                            pool_code = %pool_code,
                            message_id = %message_id,
                            reason = reason.as_str(),
                            "Pool rejected message, nacking"
                        );
                        metrics::record_message_rejected(&pool_code, reason.as_str());
                        if reason == RejectReason::AtCapacity {
                            at_capacity += 1;
                        }
                        nack_default(&callback, &message_id).await;
                        group_rejected = true;
                    }
                }
            }

            if at_capacity > 0 {
                warn!(pool_code = %pool_code, rejected = at_capacity, "Pool at capacity, messages nacked");
                self.warning_service.add_warning(
                    WarningCategory::PoolCapacity,
                    WarningSeverity::Warn,
                    format!(
                        "Pool [{}] at capacity ({}), {} message(s) returned to the queue",
                        pool_code,
                        pool.get_stats().queue_capacity,
                        at_capacity
                    ),
                    "Router",
                );
            }
        }

        metrics::set_in_pipeline_count(self.in_pipeline.len());
    }

    fn submit(&self, pool: &ProcessPool, received: ReceivedMessage, batch_id: &Arc<str>) -> SubmitResult {
        let key = pipeline_key(&received);
        self.in_pipeline.insert(
            key.clone(),
            InPipelineMessage {
                message_id: received.message.id.clone(),
                pool_code: pool.code().to_string(),
                queue_identifier: received.queue_identifier.clone(),
                callback: received.callback.clone(),
            },
        );

        let in_pipeline = self.in_pipeline.clone();
        let task = PoolTask::new(received.message, received.callback)
            .with_batch(batch_id.clone())
            .on_complete(CompletionGuard::new(move || {
                in_pipeline.remove(&key);
            }));
        pool.submit(task)
    }

    async fn reject_unknown_pool(
        &self,
        pool_code: &str,
        messages: impl Iterator<Item = ReceivedMessage>,
    ) {
        let mut count = 0usize;
        for received in messages {
            nack_default(&received.callback, &received.message.id).await;
            count += 1;
        }
        error!(pool_code = %pool_code, count, "No pool configured for messages, nacked");
        metrics::record_message_rejected(pool_code, "UNKNOWN_POOL");
        self.warning_service.add_warning(
            WarningCategory::Routing,
            WarningSeverity::Error,
            format!("{} message(s) reference unknown pool [{}]", count, pool_code),
            "Router",
        );
    }

    /// Bring pools in line with `config` without restarting running work.
    ///
    /// New pools are created, changed pools updated in place, and pools no
    /// longer configured stop accepting work and drain in the background.
    pub fn apply_config(&self, config: RouterConfig) -> ReloadSummary {
        let mut summary = ReloadSummary::default();
        if !self.running.load(Ordering::SeqCst) {
            warn!("Router shutting down, configuration not applied");
            return summary;
        }

        let wanted: HashMap<String, PoolConfig> = config
            .processing_pools
            .into_iter()
            .map(|p| (p.code.clone(), p))
            .collect();

        let existing: Vec<String> = self.pools.iter().map(|e| e.key().clone()).collect();
        for code in existing {
            if wanted.contains_key(&code) {
                continue;
            }
            if let Some((code, pool)) = self.pools.remove(&code) {
                info!(pool_code = %code, queued = pool.queued(), "Pool removed from configuration, draining");
                let drain_id = self.drain_seq.fetch_add(1, Ordering::Relaxed);
                self.draining_pools.insert(drain_id, pool.clone());
                let draining = self.draining_pools.clone();
                let timeout = self.drain_timeout;
                tokio::spawn(async move {
                    pool.drain(timeout).await;
                    draining.remove(&drain_id);
                });
                summary.removed += 1;
            }
        }

        for (code, pool_config) in wanted {
            match self.pool(&code) {
                Some(pool) => match pool.update_config(pool_config.concurrency, pool_config.rate_limit_per_minute) {
                    ConfigResult::Updated { .. } => summary.updated += 1,
                    ConfigResult::Unchanged => {}
                    ConfigResult::Rejected(reason) => {
                        summary.rejected += 1;
                        self.warning_service.add_warning(
                            WarningCategory::Configuration,
                            WarningSeverity::Warn,
                            format!("Update for pool [{}] rejected: {}", code, reason),
                            "Router",
                        );
                    }
                },
                None => {
                    self.create_pool(pool_config);
                    summary.created += 1;
                }
            }
        }

        info!(
            created = summary.created,
            updated = summary.updated,
            removed = summary.removed,
            rejected = summary.rejected,
            active_pools = self.pools.len(),
            "Configuration applied"
        );
        summary
    }

    /// Stop polling, then let pools finish accepted work within the drain
    /// timeout. Anything unfinished after that is left for the broker to
    /// redeliver.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Router shutting down");

        let consumers: Vec<Arc<QueueConsumer>> = std::mem::take(&mut *self.consumers.write());
        futures::future::join_all(consumers.iter().map(|c| c.stop())).await;
        info!(consumers = consumers.len(), "Consumers stopped");

        let pools: Vec<Arc<ProcessPool>> = self
            .pools
            .iter()
            .map(|e| e.value().clone())
            .chain(self.draining_pools.iter().map(|e| e.value().clone()))
            .collect();
        let drained = futures::future::join_all(pools.iter().map(|p| p.drain(self.drain_timeout))).await;

        let remaining = self.in_pipeline.len();
        if drained.iter().all(|d| *d) {
            info!("Router shutdown complete");
        } else {
            warn!(remaining, "Router shutdown complete, unfinished messages left to the broker");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Heartbeat every in-pipeline message older than `threshold` so its
    /// visibility does not lapse mid-processing. Returns how many were extended.
    pub async fn extend_visibility_for_long_running(&self, threshold: Duration) -> usize {
        let due: Vec<InPipelineMessage> = self
            .in_pipeline
            .iter()
            .filter(|e| e.callback.age() >= threshold && !e.callback.is_resolved())
            .map(|e| e.value().clone())
            .collect();

        let mut extended = 0;
        for entry in due {
            match entry.callback.in_progress().await {
                Ok(()) => {
                    extended += 1;
                    debug!(
                        message_id = %entry.message_id,
                        queue = %entry.queue_identifier,
                        "Extended visibility for long-running message"
                    );
                }
                Err(e) => warn!(
                    message_id = %entry.message_id,
                    queue = %entry.queue_identifier,
                    error = %e,
                    "Failed to extend visibility"
                ),
            }
        }
        extended
    }

    pub fn pool(&self, code: &str) -> Option<Arc<ProcessPool>> {
        self.pools.get(code).map(|p| p.clone())
    }

    pub fn pool_codes(&self) -> Vec<String> {
        let mut codes: Vec<String> = self.pools.iter().map(|e| e.key().clone()).collect();
        codes.sort();
        codes
    }

    pub fn pool_stats(&self) -> Vec<PoolStats> {
        let mut stats: Vec<PoolStats> = self.pools.iter().map(|e| e.get_stats()).collect();
        stats.sort_by(|a, b| a.pool_code.cmp(&b.pool_code));
        stats
    }

    pub fn consumers(&self) -> Vec<Arc<QueueConsumer>> {
        self.consumers.read().clone()
    }

    pub async fn queue_stats(&self) -> Vec<QueueStats> {
        let consumers = self.consumers();
        futures::future::join_all(consumers.iter().map(|c| c.get_queue_metrics())).await
    }

    pub fn consumer_health(&self) -> Vec<ConsumerHealth> {
        self.consumers().iter().map(|c| c.get_health()).collect()
    }

    pub fn in_pipeline_count(&self) -> usize {
        self.in_pipeline.len()
    }

    pub fn in_pipeline_messages(&self) -> Vec<InPipelineMessage> {
        self.in_pipeline.iter().map(|e| e.value().clone()).collect()
    }

    pub fn draining_pool_count(&self) -> usize {
        self.draining_pools.len()
    }

    pub fn warning_service(&self) -> &Arc<WarningService> {
        &self.warning_service
    }
}

async fn nack_default(callback: &MessageCallback, message_id: &str) {
    if let Err(e) = callback.nack(None).await {
        warn!(message_id = %message_id, error = %e, "Nack failed, message returns after its visibility timeout");
    }
}

#[async_trait]
impl BatchHandler for Router {
    async fn handle_batch(&self, queue_identifier: &str, batch: Vec<ReceivedMessage>) {
        self.route_batch(queue_identifier, batch).await;
    }

    fn malformed_message(&self, queue_identifier: &str, error: &str) {
        self.warning_service.add_warning(
            WarningCategory::MalformedMessage,
            WarningSeverity::Warn,
            format!("Unparseable message removed from [{}]: {}", queue_identifier, error),
            format!("QueueConsumer:{}", queue_identifier),
        );
    }
}

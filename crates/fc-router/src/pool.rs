//! ProcessPool - bounded, rate-limited, group-ordered execution of mediations
//!
//! - Semaphore-based concurrency ceiling, adjustable at runtime
//! - Smooth per-minute rate limiting using governor
//! - Per-message-group FIFO: one worker task per active group, which resolves
//!   message n back to the queue before it takes message n+1
//! - Ungrouped messages run independently, one task each
//! - Hard capacity on accepted-but-unresolved messages; beyond it submissions
//!   are rejected so the router can nack them

use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use parking_lot::RwLock;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, info, warn};

use fc_common::{Message, PoolConfig, PoolStats, WarningCategory, WarningSeverity};
use fc_queue::{MessageCallback, DEFAULT_NACK_DELAY_SECONDS};

use crate::mediation::MediationResult;
use crate::mediator::Mediator;
use crate::metrics;
use crate::warning::WarningService;

const QUEUE_CAPACITY_MULTIPLIER: u32 = 2;
const MIN_QUEUE_CAPACITY: u32 = 50;

/// Longest single sleep while waiting for a rate limit cell, so a replaced
/// or removed limiter is noticed quickly
const RATE_LIMIT_POLL: Duration = Duration::from_millis(100);

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

fn queue_capacity(concurrency: u32) -> u32 {
    std::cmp::max(concurrency * QUEUE_CAPACITY_MULTIPLIER, MIN_QUEUE_CAPACITY)
}

/// At most `rate_per_minute` starts in any rolling minute: cells are spaced
/// evenly and no burst is allowed.
fn build_limiter(rate_per_minute: Option<u32>) -> Option<Arc<DirectLimiter>> {
    rate_per_minute
        .and_then(NonZeroU32::new)
        .map(|rpm| Arc::new(RateLimiter::direct(Quota::per_minute(rpm).allow_burst(nonzero!(1u32)))))
}

/// Runs a closure when dropped. Lets the submitter learn that a task left the
/// pool, whether it was resolved, rejected or abandoned at shutdown.
pub struct CompletionGuard(Option<Box<dyn FnOnce() + Send + Sync>>);

impl CompletionGuard {
    pub fn new(on_complete: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self(Some(Box::new(on_complete)))
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

/// Composite key for batch+group failure tracking
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BatchGroupKey {
    batch_id: Arc<str>,
    group_id: Arc<str>,
}

impl std::fmt::Display for BatchGroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.batch_id, self.group_id)
    }
}

/// One message handed to a pool
pub struct PoolTask {
    pub message: Message,
    pub callback: Arc<MessageCallback>,
    pub batch_id: Option<Arc<str>>,
    completion: Option<CompletionGuard>,
}

impl PoolTask {
    pub fn new(message: Message, callback: Arc<MessageCallback>) -> Self {
        Self {
            message,
            callback,
            batch_id: None,
            completion: None,
        }
    }

    pub fn with_batch(mut self, batch_id: Arc<str>) -> Self {
        self.batch_id = Some(batch_id);
        self
    }

    pub fn on_complete(mut self, guard: CompletionGuard) -> Self {
        self.completion = Some(guard);
        self
    }

    fn batch_group_key(&self) -> Option<BatchGroupKey> {
        let batch_id = self.batch_id.clone()?;
        let group_id = self.message.group_id()?;
        Some(BatchGroupKey {
            batch_id,
            group_id: Arc::from(group_id),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    AtCapacity,
    ShuttingDown,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::AtCapacity => "AT_CAPACITY",
            RejectReason::ShuttingDown => "SHUTTING_DOWN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitResult {
    Accepted,
    Rejected(RejectReason),
}

impl SubmitResult {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmitResult::Accepted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigResult {
    Updated {
        concurrency_changed: bool,
        rate_limit_changed: bool,
    },
    Unchanged,
    Rejected(String),
}

struct PoolInner {
    code: String,
    mediator: Arc<dyn Mediator>,
    warning_service: Option<Arc<WarningService>>,

    concurrency: AtomicU32,
    semaphore: Arc<Semaphore>,

    /// Swapped in place on config updates; workers re-read it on every check
    rate_limiter: RwLock<Option<Arc<DirectLimiter>>>,
    rate_limit_per_minute: RwLock<Option<u32>>,
    rate_limit_waiters: AtomicU32,

    /// Pending members per active group. An entry exists exactly while the
    /// group's worker task is alive.
    groups: DashMap<String, VecDeque<PoolTask>>,

    /// Batch+groups with a nacked member, and the delay that member got
    failed_batch_groups: DashMap<BatchGroupKey, u32>,
    /// Unresolved members per batch+group, for cleanup
    batch_group_counts: DashMap<BatchGroupKey, u32>,

    running: AtomicBool,
    abandoned: AtomicBool,
    /// Accepted and not yet resolved
    queued: AtomicU32,
    in_flight: AtomicU32,
    idle: Notify,

    total_succeeded: AtomicU64,
    total_nacked: AtomicU64,
    total_config_errors: AtomicU64,
}

pub struct ProcessPool {
    inner: Arc<PoolInner>,
}

impl ProcessPool {
    pub fn new(
        config: PoolConfig,
        mediator: Arc<dyn Mediator>,
        warning_service: Option<Arc<WarningService>>,
    ) -> Self {
        let concurrency = config.concurrency.max(1);
        Self {
            inner: Arc::new(PoolInner {
                code: config.code,
                mediator,
                warning_service,
                concurrency: AtomicU32::new(concurrency),
                semaphore: Arc::new(Semaphore::new(concurrency as usize)),
                rate_limiter: RwLock::new(build_limiter(config.rate_limit_per_minute)),
                rate_limit_per_minute: RwLock::new(config.rate_limit_per_minute),
                rate_limit_waiters: AtomicU32::new(0),
                groups: DashMap::new(),
                failed_batch_groups: DashMap::new(),
                batch_group_counts: DashMap::new(),
                running: AtomicBool::new(false),
                abandoned: AtomicBool::new(false),
                queued: AtomicU32::new(0),
                in_flight: AtomicU32::new(0),
                idle: Notify::new(),
                total_succeeded: AtomicU64::new(0),
                total_nacked: AtomicU64::new(0),
                total_config_errors: AtomicU64::new(0),
            }),
        }
    }

    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            pool_code = %self.inner.code,
            concurrency = self.concurrency(),
            rate_limit = ?self.rate_limit_per_minute(),
            "Starting process pool"
        );
    }

    pub fn code(&self) -> &str {
        &self.inner.code
    }

    /// Accept a message or reject it immediately. Never waits.
    pub fn submit(&self, task: PoolTask) -> SubmitResult {
        let inner = &self.inner;
        if !inner.running.load(Ordering::SeqCst) {
            return SubmitResult::Rejected(RejectReason::ShuttingDown);
        }

        let capacity = queue_capacity(inner.concurrency.load(Ordering::SeqCst));
        let reserved = inner
            .queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |q| (q < capacity).then_some(q + 1));
        if reserved.is_err() {
            debug!(pool_code = %inner.code, capacity, "Pool at capacity, rejecting");
            return SubmitResult::Rejected(RejectReason::AtCapacity);
        }

        if let Some(key) = task.batch_group_key() {
            *inner.batch_group_counts.entry(key).or_insert(0) += 1;
        }

        let Some(group_id) = task.message.group_id().map(str::to_string) else {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                PoolInner::run_task(&inner, task).await;
            });
            return SubmitResult::Accepted;
        };

        // Queue behind the group's worker, or become the first task of a new one
        let first = match inner.groups.entry(group_id.clone()) {
            Entry::Occupied(mut pending) => {
                pending.get_mut().push_back(task);
                None
            }
            Entry::Vacant(slot) => {
                slot.insert(VecDeque::new());
                Some(task)
            }
        };

        if let Some(task) = first {
            debug!(pool_code = %inner.code, group_id = %group_id, "Spawning group worker");
            let inner = self.inner.clone();
            tokio::spawn(async move {
                PoolInner::run_group(inner, group_id, task).await;
            });
        }

        SubmitResult::Accepted
    }

    /// Apply new limits without disturbing in-flight work.
    ///
    /// Raising concurrency takes effect at once. Lowering it retires permits
    /// as running mediations finish, so no new work starts above the new
    /// ceiling.
    pub fn update_config(&self, concurrency: u32, rate_limit_per_minute: Option<u32>) -> ConfigResult {
        let inner = &self.inner;
        if concurrency == 0 {
            return ConfigResult::Rejected("concurrency must be at least 1".to_string());
        }
        if rate_limit_per_minute == Some(0) {
            return ConfigResult::Rejected("rate limit must be positive or absent".to_string());
        }

        let old_concurrency = inner.concurrency.swap(concurrency, Ordering::SeqCst);
        let concurrency_changed = old_concurrency != concurrency;
        if concurrency > old_concurrency {
            inner.semaphore.add_permits((concurrency - old_concurrency) as usize);
        } else if concurrency < old_concurrency {
            let excess = old_concurrency - concurrency;
            let semaphore = inner.semaphore.clone();
            tokio::spawn(async move {
                if let Ok(permits) = semaphore.acquire_many_owned(excess).await {
                    permits.forget();
                }
            });
        }

        let rate_limit_changed = {
            let mut current = inner.rate_limit_per_minute.write();
            if *current != rate_limit_per_minute {
                *inner.rate_limiter.write() = build_limiter(rate_limit_per_minute);
                *current = rate_limit_per_minute;
                true
            } else {
                false
            }
        };

        if !concurrency_changed && !rate_limit_changed {
            return ConfigResult::Unchanged;
        }

        info!(
            pool_code = %inner.code,
            old_concurrency,
            new_concurrency = concurrency,
            rate_limit = ?rate_limit_per_minute,
            "Pool configuration updated"
        );
        ConfigResult::Updated {
            concurrency_changed,
            rate_limit_changed,
        }
    }

    /// Stop accepting work and wait for accepted messages to resolve.
    ///
    /// Returns `false` if `timeout` elapsed first. Whatever has not started by
    /// then is dropped un-acked; the broker redelivers it after its visibility
    /// timeout.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let inner = &self.inner;
        inner.running.store(false, Ordering::SeqCst);
        info!(pool_code = %inner.code, queued = inner.queued.load(Ordering::SeqCst), "Draining pool");

        let drained = tokio::time::timeout(timeout, async {
            loop {
                let idle = inner.idle.notified();
                if inner.queued.load(Ordering::SeqCst) == 0 {
                    return;
                }
                idle.await;
            }
        })
        .await
        .is_ok();

        if !drained {
            inner.abandoned.store(true, Ordering::SeqCst);
            warn!(
                pool_code = %inner.code,
                remaining = inner.queued.load(Ordering::SeqCst),
                "Drain timed out, leaving remaining messages to the broker"
            );
        }
        drained
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn is_fully_drained(&self) -> bool {
        self.inner.queued.load(Ordering::SeqCst) == 0
    }

    pub fn concurrency(&self) -> u32 {
        self.inner.concurrency.load(Ordering::SeqCst)
    }

    pub fn rate_limit_per_minute(&self) -> Option<u32> {
        *self.inner.rate_limit_per_minute.read()
    }

    pub fn in_flight(&self) -> u32 {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> u32 {
        self.inner.queued.load(Ordering::SeqCst)
    }

    pub fn get_stats(&self) -> PoolStats {
        let inner = &self.inner;
        let concurrency = self.concurrency();
        PoolStats {
            pool_code: inner.code.clone(),
            concurrency,
            rate_limit_per_minute: self.rate_limit_per_minute(),
            in_flight: self.in_flight(),
            queued: self.queued(),
            queue_capacity: queue_capacity(concurrency),
            active_groups: inner.groups.len() as u32,
            is_rate_limited: inner.rate_limit_waiters.load(Ordering::SeqCst) > 0,
            is_running: self.is_running(),
            total_succeeded: inner.total_succeeded.load(Ordering::Relaxed),
            total_nacked: inner.total_nacked.load(Ordering::Relaxed),
            total_config_errors: inner.total_config_errors.load(Ordering::Relaxed),
        }
    }
}

impl PoolInner {
    /// Worker for one message group: runs members strictly one after another
    /// and exits once the group's queue is empty.
    async fn run_group(inner: Arc<PoolInner>, group_id: String, first: PoolTask) {
        let mut task = first;
        loop {
            PoolInner::run_task(&inner, task).await;

            let next = match inner.groups.entry(group_id.clone()) {
                Entry::Occupied(mut pending) => match pending.get_mut().pop_front() {
                    Some(next) => Some(next),
                    None => {
                        pending.remove();
                        None
                    }
                },
                Entry::Vacant(_) => None,
            };

            match next {
                Some(next) => task = next,
                None => break,
            }
        }
        debug!(pool_code = %inner.code, group_id = %group_id, "Group worker exited");
    }

    async fn run_task(inner: &Arc<PoolInner>, task: PoolTask) {
        let key = task.batch_group_key();
        inner.execute(&task, key.as_ref()).await;

        if let Some(key) = &key {
            inner.release_batch_group(key);
        }
        drop(task);
        if inner.queued.fetch_sub(1, Ordering::SeqCst) == 1 {
            inner.idle.notify_waiters();
        }
    }

    async fn execute(&self, task: &PoolTask, key: Option<&BatchGroupKey>) {
        if self.abandoned.load(Ordering::SeqCst) {
            return;
        }

        // An earlier member of this batch+group was nacked; follow it back to the queue
        if let Some(delay) = key.and_then(|k| self.failed_batch_groups.get(k).map(|d| *d)) {
            debug!(
                message_id = %task.message.id,
                batch_group = %key.map(ToString::to_string).unwrap_or_default(),
                "Batch+group already failed, nacking to keep group order"
            );
            self.resolve_nack(task, delay).await;
            return;
        }

        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                self.resolve_nack(task, DEFAULT_NACK_DELAY_SECONDS).await;
                return;
            }
        };

        // Rate limit cells are only taken while holding a permit
        if !self.wait_for_rate_limit().await {
            return;
        }

        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::set_pool_in_flight(&self.code, in_flight);

        let result = self.mediator.mediate(&task.message).await;

        let in_flight = self.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::set_pool_in_flight(&self.code, in_flight);
        drop(permit);

        match result {
            MediationResult::Success => {
                self.total_succeeded.fetch_add(1, Ordering::Relaxed);
                self.resolve_ack(task).await;
            }
            MediationResult::Nack { delay_seconds, reason } => {
                debug!(message_id = %task.message.id, delay_seconds, reason = %reason, "Nacking message");
                if let Some(key) = key {
                    if self.failed_batch_groups.insert(key.clone(), delay_seconds).is_none() {
                        debug!(batch_group = %key, "Batch+group failed, later members will be nacked");
                    }
                }
                self.resolve_nack(task, delay_seconds).await;
            }
            MediationResult::ConfigError { reason } => {
                // Retrying cannot help; remove it from the queue and tell the operator
                self.total_config_errors.fetch_add(1, Ordering::Relaxed);
                metrics::record_config_error(&self.code);
                warn!(
                    pool_code = %self.code,
                    message_id = %task.message.id,
                    reason = %reason,
                    "Configuration error, acking to prevent redelivery"
                );
                if let Some(ws) = &self.warning_service {
                    ws.add_warning(
                        WarningCategory::Configuration,
                        WarningSeverity::Error,
                        format!(
                            "Message {} to {} failed permanently: {}",
                            task.message.id, task.message.mediation_target, reason
                        ),
                        format!("ProcessPool:{}", self.code),
                    );
                }
                self.resolve_ack(task).await;
            }
        }
    }

    /// Wait until the current limiter grants a cell. Returns `false` if the
    /// pool was abandoned meanwhile.
    async fn wait_for_rate_limit(&self) -> bool {
        let mut waiting = false;
        let granted = loop {
            if self.abandoned.load(Ordering::SeqCst) {
                break false;
            }
            let limiter = self.rate_limiter.read().clone();
            let Some(limiter) = limiter else {
                break true;
            };
            match limiter.check() {
                Ok(()) => break true,
                Err(not_until) => {
                    if !waiting {
                        waiting = true;
                        self.rate_limit_waiters.fetch_add(1, Ordering::SeqCst);
                        debug!(pool_code = %self.code, "Rate limited, waiting for permit");
                    }
                    let wait = not_until.wait_time_from(DefaultClock::default().now());
                    tokio::time::sleep(wait.min(RATE_LIMIT_POLL)).await;
                }
            }
        };
        if waiting {
            self.rate_limit_waiters.fetch_sub(1, Ordering::SeqCst);
        }
        granted
    }

    async fn resolve_ack(&self, task: &PoolTask) {
        if let Err(e) = task.callback.ack().await {
            warn!(
                pool_code = %self.code,
                message_id = %task.message.id,
                error = %e,
                "Ack failed, message will be redelivered"
            );
        }
    }

    async fn resolve_nack(&self, task: &PoolTask, delay_seconds: u32) {
        self.total_nacked.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = task.callback.nack(Some(delay_seconds as i64)).await {
            warn!(
                pool_code = %self.code,
                message_id = %task.message.id,
                error = %e,
                "Nack failed, message returns after its visibility timeout"
            );
        }
    }

    fn release_batch_group(&self, key: &BatchGroupKey) {
        let finished = match self.batch_group_counts.get_mut(key) {
            Some(mut remaining) => {
                *remaining = remaining.saturating_sub(1);
                *remaining == 0
            }
            None => false,
        };
        if finished {
            self.batch_group_counts.remove(key);
            self.failed_batch_groups.remove(key);
        }
    }
}

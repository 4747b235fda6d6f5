//! Poll-loop driver that turns a [`QueueClient`] into a running consumer.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use fc_common::{ConsumerHealth, Message, QueueStats};
use crate::callback::ResolutionCounters;
use crate::{MessageCallback, QueueClient, RawMessage, Result};

/// A parsed delivery handed to the [`BatchHandler`]
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message: Message,
    pub callback: Arc<MessageCallback>,
    /// Broker-native id, stable across redeliveries
    pub broker_message_id: Option<String>,
    pub queue_identifier: String,
}

/// Receives every batch a consumer pulls
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle_batch(&self, queue_identifier: &str, batch: Vec<ReceivedMessage>);

    /// Called after an unparseable body has been removed from the queue
    fn malformed_message(&self, _queue_identifier: &str, _error: &str) {}
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Number of concurrent poll loops
    pub connections: u32,
    /// Maximum messages per receive
    pub batch_size: u32,
    /// Visibility timeout applied by `in_progress` heartbeats, in seconds
    pub visibility_timeout: u32,
    /// Pause after an empty receive (long-polling brokers return slowly anyway)
    pub idle_delay: Duration,
    /// Pause after a failed receive
    pub error_backoff: Duration,
    /// A running consumer that has not polled for this long is unhealthy
    pub stall_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            connections: 1,
            batch_size: 10,
            visibility_timeout: 120,
            idle_delay: Duration::from_millis(100),
            error_backoff: Duration::from_secs(1),
            stall_timeout: Duration::from_secs(60),
        }
    }
}

struct Shared {
    client: Arc<dyn QueueClient>,
    handler: Arc<dyn BatchHandler>,
    config: ConsumerConfig,
    running: AtomicBool,
    active_pollers: AtomicUsize,
    last_poll_ms: AtomicI64,
    counters: Arc<ResolutionCounters>,
    shutdown: Notify,
}

/// Consumes one physical queue.
///
/// `start` verifies connectivity and spawns the poll loops; `stop` is
/// idempotent and waits for every loop to finish its current poll.
pub struct QueueConsumer {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for QueueConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueConsumer")
            .field("identifier", &self.identifier())
            .finish_non_exhaustive()
    }
}

impl QueueConsumer {
    pub fn new(
        client: Arc<dyn QueueClient>,
        handler: Arc<dyn BatchHandler>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                client,
                handler,
                config,
                running: AtomicBool::new(false),
                active_pollers: AtomicUsize::new(0),
                last_poll_ms: AtomicI64::new(0),
                counters: Arc::default(),
                shutdown: Notify::new(),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn identifier(&self) -> &str {
        self.shared.client.identifier()
    }

    /// Connect and begin polling. Connection failure is returned to the caller
    /// and leaves the consumer stopped.
    pub async fn start(&self) -> Result<()> {
        if self.shared.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.shared.client.connect().await?;

        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let connections = self.shared.config.connections.max(1);
        info!(
            queue = %self.identifier(),
            connections = connections,
            "Starting queue consumer"
        );

        let mut tasks = self.tasks.lock();
        for worker in 0..connections {
            let shared = self.shared.clone();
            shared.active_pollers.fetch_add(1, Ordering::SeqCst);
            tasks.push(tokio::spawn(async move {
                poll_loop(shared.clone(), worker).await;
                shared.active_pollers.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        Ok(())
    }

    /// Stop polling and wait for in-flight polls (and the batches they are
    /// handing off) to finish. Safe to call repeatedly.
    pub async fn stop(&self) {
        if self.shared.running.swap(false, Ordering::SeqCst) {
            info!(queue = %self.identifier(), "Stopping queue consumer");
        }
        self.shared.shutdown.notify_waiters();

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                error!(queue = %self.identifier(), error = %e, "Poll loop terminated abnormally");
            }
        }
    }

    /// Not accepting new polls
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// No poll loop is still executing
    pub fn is_fully_stopped(&self) -> bool {
        !self.is_running() && self.shared.active_pollers.load(Ordering::SeqCst) == 0
    }

    pub async fn get_queue_metrics(&self) -> QueueStats {
        let depth = match self.shared.client.depth().await {
            Ok(depth) => depth.unwrap_or_default(),
            Err(e) => {
                warn!(queue = %self.identifier(), error = %e, "Failed to read queue depth");
                Default::default()
            }
        };
        let counters = &self.shared.counters;
        QueueStats {
            queue_identifier: self.identifier().to_string(),
            pending_messages: depth.pending,
            messages_not_visible: depth.not_visible,
            total_received: counters.received.load(Ordering::Relaxed),
            total_acked: counters.acked.load(Ordering::Relaxed),
            total_nacked: counters.nacked.load(Ordering::Relaxed),
        }
    }

    pub fn get_health(&self) -> ConsumerHealth {
        let is_running = self.is_running();
        let last_poll = self.shared.last_poll_ms.load(Ordering::SeqCst);
        let (last_poll_time_ms, time_since_last_poll_ms) = if last_poll == 0 {
            (None, None)
        } else {
            let since = (chrono::Utc::now().timestamp_millis() - last_poll).max(0);
            (Some(last_poll), Some(since))
        };

        // Never polled yet counts as healthy while running: it may have just started
        let stalled = time_since_last_poll_ms
            .map(|ms| ms >= self.shared.config.stall_timeout.as_millis() as i64)
            .unwrap_or(false);

        ConsumerHealth {
            queue_identifier: self.identifier().to_string(),
            is_healthy: is_running && !stalled,
            last_poll_time_ms,
            time_since_last_poll_ms,
            is_running,
        }
    }

    /// A new, unstarted consumer on the same queue and settings feeding a
    /// different handler. The broker client is shared, not reconnected.
    pub fn recreate(&self, handler: Arc<dyn BatchHandler>) -> QueueConsumer {
        QueueConsumer::new(self.shared.client.clone(), handler, self.shared.config.clone())
    }
}

async fn poll_loop(shared: Arc<Shared>, worker: u32) {
    let queue = shared.client.identifier().to_string();
    debug!(queue = %queue, worker = worker, "Poll loop started");

    while shared.running.load(Ordering::SeqCst) {
        shared
            .last_poll_ms
            .store(chrono::Utc::now().timestamp_millis(), Ordering::SeqCst);

        let pause = match shared.client.receive(shared.config.batch_size).await {
            Ok(raw) if raw.is_empty() => Some(shared.config.idle_delay),
            Ok(raw) => {
                let batch = parse_batch(&shared, raw).await;
                if !batch.is_empty() {
                    shared.handler.handle_batch(&queue, batch).await;
                }
                None
            }
            Err(e) => {
                warn!(queue = %queue, error = %e, "Poll failed, retrying next cycle");
                Some(shared.config.error_backoff)
            }
        };

        if let Some(pause) = pause {
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = shared.shutdown.notified() => {}
            }
        }
    }

    debug!(queue = %queue, worker = worker, "Poll loop exited");
}

/// Parse raw deliveries, removing poison pills and in-batch duplicates.
async fn parse_batch(shared: &Shared, raw: Vec<RawMessage>) -> Vec<ReceivedMessage> {
    let queue = shared.client.identifier();
    let mut seen = HashSet::new();
    let mut batch = Vec::with_capacity(raw.len());

    for delivery in raw {
        shared.counters.received.fetch_add(1, Ordering::Relaxed);

        let message: Message = match serde_json::from_str(&delivery.body) {
            Ok(message) => message,
            Err(e) => {
                let preview: String = delivery.body.chars().take(100).collect();
                warn!(queue = %queue, error = %e, body = %preview, "Malformed message, removing from queue");
                if let Err(del) = shared.client.delete(&delivery.receipt_handle).await {
                    error!(queue = %queue, error = %del, "Failed to remove malformed message");
                }
                shared.handler.malformed_message(queue, &e.to_string());
                continue;
            }
        };

        if !seen.insert(message.id.clone()) {
            warn!(queue = %queue, message_id = %message.id, "Duplicate message id in batch, removing duplicate");
            if let Err(e) = shared.client.delete(&delivery.receipt_handle).await {
                error!(queue = %queue, error = %e, "Failed to remove duplicate message");
            }
            continue;
        }

        batch.push(ReceivedMessage {
            message,
            callback: Arc::new(MessageCallback::new(
                shared.client.clone(),
                delivery.receipt_handle,
                shared.config.visibility_timeout,
                shared.counters.clone(),
            )),
            broker_message_id: delivery.broker_message_id,
            queue_identifier: queue.to_string(),
        });
    }

    batch
}

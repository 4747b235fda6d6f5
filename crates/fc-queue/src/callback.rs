//! Per-message acknowledgement handle.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::{clamp_nack_delay, QueueClient, Result};

/// Running totals shared by a consumer and every callback it hands out
#[derive(Debug, Default)]
pub(crate) struct ResolutionCounters {
    pub received: AtomicU64,
    pub acked: AtomicU64,
    pub nacked: AtomicU64,
}

/// Resolves one delivered message back to its queue.
///
/// The first `ack` or `nack` wins; later calls return `Ok(false)` without
/// touching the broker. The receipt handle can be swapped while the message
/// is in flight, which happens when the broker redelivers a message that is
/// still being processed.
pub struct MessageCallback {
    client: Arc<dyn QueueClient>,
    receipt_handle: RwLock<String>,
    visibility_timeout: u32,
    resolved: AtomicBool,
    received_at: Instant,
    counters: Arc<ResolutionCounters>,
}

impl MessageCallback {
    pub(crate) fn new(
        client: Arc<dyn QueueClient>,
        receipt_handle: String,
        visibility_timeout: u32,
        counters: Arc<ResolutionCounters>,
    ) -> Self {
        Self {
            client,
            receipt_handle: RwLock::new(receipt_handle),
            visibility_timeout,
            resolved: AtomicBool::new(false),
            received_at: Instant::now(),
            counters,
        }
    }

    /// Build a callback outside a running consumer, bound directly to `client`.
    pub fn detached(client: Arc<dyn QueueClient>, receipt_handle: String, visibility_timeout: u32) -> Self {
        Self::new(client, receipt_handle, visibility_timeout, Arc::default())
    }

    pub fn queue_identifier(&self) -> &str {
        self.client.identifier()
    }

    /// Delete the message. Returns `true` if this call resolved it.
    pub async fn ack(&self) -> Result<bool> {
        if self.resolved.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        let handle = self.receipt_handle();
        self.client.delete(&handle).await?;
        self.counters.acked.fetch_add(1, Ordering::Relaxed);
        debug!(queue = %self.queue_identifier(), "Message acknowledged");
        Ok(true)
    }

    /// Return the message to the queue after a clamped delay.
    /// Returns `true` if this call resolved it.
    pub async fn nack(&self, delay_seconds: Option<i64>) -> Result<bool> {
        if self.resolved.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        let delay = clamp_nack_delay(delay_seconds);
        let handle = self.receipt_handle();
        self.client.change_visibility(&handle, delay).await?;
        self.counters.nacked.fetch_add(1, Ordering::Relaxed);
        debug!(queue = %self.queue_identifier(), delay_seconds = delay, "Message nacked");
        Ok(true)
    }

    /// Heartbeat: push the visibility deadline out by the queue's visibility
    /// timeout without resolving the message. No-op once resolved.
    pub async fn in_progress(&self) -> Result<()> {
        if self.is_resolved() {
            return Ok(());
        }
        let handle = self.receipt_handle();
        self.client
            .change_visibility(&handle, self.visibility_timeout)
            .await
    }

    pub fn update_receipt_handle(&self, new_handle: String) {
        *self.receipt_handle.write() = new_handle;
    }

    pub fn receipt_handle(&self) -> String {
        self.receipt_handle.read().clone()
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }

    /// Time since the consumer received this delivery
    pub fn age(&self) -> Duration {
        self.received_at.elapsed()
    }
}

impl std::fmt::Debug for MessageCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageCallback")
            .field("queue", &self.queue_identifier())
            .field("receipt_handle", &*self.receipt_handle.read())
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryQueue;

    async fn received(queue: &Arc<MemoryQueue>) -> MessageCallback {
        queue.publish_body("{}");
        let raw = queue.receive(1).await.unwrap().remove(0);
        MessageCallback::detached(queue.clone(), raw.receipt_handle, 30)
    }

    #[tokio::test]
    async fn test_ack_is_idempotent() {
        let queue = Arc::new(MemoryQueue::new("q", 30));
        let callback = received(&queue).await;

        assert!(callback.ack().await.unwrap());
        assert!(!callback.ack().await.unwrap());
        assert!(!callback.nack(Some(10)).await.unwrap());

        assert_eq!(queue.deleted_count(), 1);
        assert_eq!(queue.visibility_change_count(), 0);
    }

    #[tokio::test]
    async fn test_nack_is_idempotent_and_clamped() {
        let queue = Arc::new(MemoryQueue::new("q", 30));
        let callback = received(&queue).await;

        assert!(callback.nack(Some(999_999)).await.unwrap());
        assert!(!callback.nack(Some(5)).await.unwrap());
        assert!(!callback.ack().await.unwrap());

        assert_eq!(queue.deleted_count(), 0);
        assert_eq!(queue.visibility_changes(), vec![43_200]);
    }

    #[tokio::test]
    async fn test_non_positive_nack_uses_default_delay() {
        let queue = Arc::new(MemoryQueue::new("q", 30));
        let a = received(&queue).await;
        let b = received(&queue).await;

        a.nack(Some(0)).await.unwrap();
        b.nack(Some(-5)).await.unwrap();

        assert_eq!(queue.visibility_changes(), vec![30, 30]);
    }

    #[tokio::test]
    async fn test_in_progress_after_resolution_is_noop() {
        let queue = Arc::new(MemoryQueue::new("q", 30));
        let callback = received(&queue).await;

        callback.in_progress().await.unwrap();
        assert_eq!(queue.visibility_changes(), vec![30]);

        callback.ack().await.unwrap();
        callback.in_progress().await.unwrap();
        assert_eq!(queue.visibility_changes(), vec![30]);
    }

    #[tokio::test]
    async fn test_updated_receipt_handle_is_used_for_ack() {
        let queue = Arc::new(MemoryQueue::new("q", 30));
        let callback = received(&queue).await;
        let stale = callback.receipt_handle();

        // Simulate a redelivery: the broker issues a fresh handle for the same message
        queue.change_visibility(&stale, 0).await.unwrap();
        let fresh = queue.receive(1).await.unwrap().remove(0);
        callback.update_receipt_handle(fresh.receipt_handle.clone());

        assert_eq!(callback.receipt_handle(), fresh.receipt_handle);
        callback.ack().await.unwrap();
        assert_eq!(queue.len(), 0);
    }
}

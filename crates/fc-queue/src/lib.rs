//! Queue consumption for the message router.
//!
//! A [`QueueClient`] is the thin broker adapter (receive, delete, change
//! visibility, depth). A [`QueueConsumer`] drives one client with a set of poll
//! loops and hands parsed batches to a [`BatchHandler`]. Each delivered message
//! carries a [`MessageCallback`] that resolves it back to the broker exactly once.

use async_trait::async_trait;

pub mod callback;
pub mod consumer;
pub mod error;
pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqs")]
pub mod sqs;

pub use callback::MessageCallback;
pub use consumer::{BatchHandler, ConsumerConfig, QueueConsumer, ReceivedMessage};
pub use error::QueueError;
pub use memory::MemoryQueue;

pub type Result<T> = std::result::Result<T, QueueError>;

/// Delay applied when a nack carries no usable delay
pub const DEFAULT_NACK_DELAY_SECONDS: u32 = 30;

/// Upper bound on any nack delay (12 hours, the SQS visibility maximum)
pub const MAX_NACK_DELAY_SECONDS: u32 = 43_200;

/// Normalize a requested nack delay.
///
/// Absent, zero or negative delays fall back to [`DEFAULT_NACK_DELAY_SECONDS`];
/// anything above [`MAX_NACK_DELAY_SECONDS`] is clamped.
pub fn clamp_nack_delay(delay_seconds: Option<i64>) -> u32 {
    match delay_seconds {
        Some(d) if d > 0 => d.min(MAX_NACK_DELAY_SECONDS as i64) as u32,
        _ => DEFAULT_NACK_DELAY_SECONDS,
    }
}

/// A message as the broker handed it over, before parsing
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub body: String,
    pub receipt_handle: String,
    /// Broker-native id, stable across redeliveries
    pub broker_message_id: Option<String>,
}

/// Approximate backlog reported by the broker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    pub pending: u64,
    pub not_visible: u64,
}

/// Broker adapter for one physical queue
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Unique identifier for this queue (name or URL suffix)
    fn identifier(&self) -> &str;

    /// Verify the broker is reachable. Called once from [`QueueConsumer::start`].
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    /// Receive up to `max_messages`, hiding them for the queue's visibility timeout
    async fn receive(&self, max_messages: u32) -> Result<Vec<RawMessage>>;

    /// Permanently remove a message
    async fn delete(&self, receipt_handle: &str) -> Result<()>;

    /// Make a message visible again after `seconds` (0 = immediately)
    async fn change_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<()>;

    /// Current backlog, or `None` if the broker cannot report it
    async fn depth(&self) -> Result<Option<QueueDepth>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_nack_delay() {
        assert_eq!(clamp_nack_delay(None), 30);
        assert_eq!(clamp_nack_delay(Some(0)), 30);
        assert_eq!(clamp_nack_delay(Some(-5)), 30);
        assert_eq!(clamp_nack_delay(Some(1)), 1);
        assert_eq!(clamp_nack_delay(Some(120)), 120);
        assert_eq!(clamp_nack_delay(Some(43_200)), 43_200);
        assert_eq!(clamp_nack_delay(Some(999_999)), 43_200);
    }
}

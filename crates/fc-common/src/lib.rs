use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};

pub mod logging;

// ============================================================================
// Core Message Types
// ============================================================================

/// The message pointer that flows through the routing pipeline.
///
/// Producers enqueue this as a camelCase JSON body. The router only reads it;
/// broker bookkeeping (receipt handles, batch ids) travels alongside it and
/// never on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    #[serde(default)]
    pub pool_code: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Optional HMAC-SHA256 secret used to sign the outgoing mediation request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_secret: Option<String>,
    pub mediation_type: MediationType,
    pub mediation_target: String,
    #[serde(default)]
    pub message_group_id: Option<String>,
}

impl Message {
    /// The ordering group of this message, or `None` when it is ungrouped.
    ///
    /// An empty or whitespace-only group id counts as ungrouped.
    pub fn group_id(&self) -> Option<&str> {
        self.message_group_id
            .as_deref()
            .map(str::trim)
            .filter(|g| !g.is_empty())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MediationType {
    HTTP,
}

// ============================================================================
// Configuration Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(alias = "poolCode")]
    pub code: String,
    pub concurrency: u32,
    /// `None` means unbounded
    #[serde(default, alias = "rateLimitPerMinute")]
    pub rate_limit_per_minute: Option<u32>,
}

impl PoolConfig {
    pub fn new(code: impl Into<String>, concurrency: u32, rate_limit_per_minute: Option<u32>) -> Self {
        Self {
            code: code.into(),
            concurrency,
            rate_limit_per_minute,
        }
    }
}

/// Which broker adapter backs a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueType {
    Memory,
    Sqlite,
    Sqs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    #[serde(default = "default_queue_type", alias = "queueType")]
    pub queue_type: QueueType,
    /// Queue URL for SQS, database path for SQLite, ignored for memory
    #[serde(default, alias = "queueUrl")]
    pub uri: String,
    #[serde(default = "default_connections")]
    pub connections: u32,
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout: u32,
}

fn default_queue_type() -> QueueType {
    QueueType::Memory
}

fn default_connections() -> u32 {
    1
}

fn default_visibility_timeout() -> u32 {
    120
}

/// Everything the router needs at construction time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterConfig {
    pub processing_pools: Vec<PoolConfig>,
    pub queues: Vec<QueueConfig>,
}

// ============================================================================
// Warning System Types
// ============================================================================

/// Warning categories raised by the router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WarningCategory {
    /// Queue depth above the backlog threshold
    QueueBacklog,
    /// Queue depth growing for several consecutive checks
    QueueGrowing,
    /// Body could not be parsed into a message
    MalformedMessage,
    /// Message referenced a pool that does not exist
    Routing,
    /// Target rejected the request as misconfigured
    Configuration,
    /// A target's circuit breaker opened
    CircuitBreaker,
    ConsumerHealth,
    /// Pool rejected messages because it was full
    PoolCapacity,
}

/// Warning severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WarningSeverity {
    Info,
    Warn,
    Error,
    Critical,
}

/// An operator-facing warning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Warning {
    pub id: String,
    pub category: WarningCategory,
    pub severity: WarningSeverity,
    pub message: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub acknowledged: bool,
}

impl Warning {
    pub fn new(
        category: WarningCategory,
        severity: WarningSeverity,
        message: String,
        source: String,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            category,
            severity,
            message,
            source,
            created_at: Utc::now(),
            acknowledged: false,
        }
    }

    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.created_at).num_minutes()
    }
}

// ============================================================================
// Health & Metrics Types
// ============================================================================

/// Point-in-time view of one processing pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub pool_code: String,
    pub concurrency: u32,
    pub rate_limit_per_minute: Option<u32>,
    /// Mediations currently holding a concurrency slot
    pub in_flight: u32,
    /// Accepted messages not yet resolved (waiting or in flight)
    pub queued: u32,
    pub queue_capacity: u32,
    pub active_groups: u32,
    pub is_rate_limited: bool,
    pub is_running: bool,
    pub total_succeeded: u64,
    pub total_nacked: u64,
    pub total_config_errors: u64,
}

/// Backlog figures for one physical queue, refreshed on each poll
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub queue_identifier: String,
    pub pending_messages: u64,
    pub messages_not_visible: u64,
    pub total_received: u64,
    pub total_acked: u64,
    pub total_nacked: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerHealth {
    pub queue_identifier: String,
    pub is_healthy: bool,
    pub last_poll_time_ms: Option<i64>,
    pub time_since_last_poll_ms: Option<i64>,
    pub is_running: bool,
}

//! FlowCatalyst Message Router
//!
//! This crate provides the core message routing functionality with:
//! - Router: Partitions polled batches by pool and message group, deduplicates redeliveries
//! - ProcessPool: Worker pools with concurrency control, rate limiting, and FIFO ordering
//! - HttpMediator: HTTP-based message delivery with per-target circuit breakers
//! - WarningService: In-memory warning storage with categories and severity
//! - HealthMonitor: Queue backlog and growth detection
//! - Lifecycle: Background tasks for visibility extension, consumer health, cleanup
//! - ConfigSyncService: Periodic fetch of pool configuration, hot-reloaded into the router
//! - API: Health checks, Prometheus scrape endpoint and monitoring views

pub mod api;
pub mod circuit_breaker;
pub mod config_sync;
pub mod error;
pub mod health_monitor;
pub mod lifecycle;
pub mod mediation;
pub mod mediator;
pub mod metrics;
pub mod pool;
pub mod router;
pub mod warning;

pub use api::{create_router, AppState};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerStats, CircuitState,
};
pub use config_sync::{ConfigSyncConfig, ConfigSyncService, SyncOutcome};
pub use error::RouterError;
pub use health_monitor::{spawn_health_monitor, HealthMonitor, HealthMonitorConfig};
pub use lifecycle::{LifecycleConfig, LifecycleManager};
pub use mediation::{MediationError, MediationResponse, MediationResult, OutcomeCode};
pub use mediator::{HttpMediator, HttpMediatorConfig, Mediator};
pub use pool::{CompletionGuard, ConfigResult, PoolTask, ProcessPool, RejectReason, SubmitResult};
pub use router::{InPipelineMessage, ReloadSummary, Router, DEFAULT_DRAIN_TIMEOUT};
pub use warning::{WarningService, WarningServiceConfig};

pub type Result<T> = std::result::Result<T, RouterError>;

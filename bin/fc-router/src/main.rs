//! FlowCatalyst Message Router
//!
//! Consumes message pointers from the configured queues, routes them through
//! the processing pools and delivers them over HTTP. Serves health checks, Prometheus
//! metrics and monitoring views on the HTTP port.
//!
//! ## Configuration
//!
//! TOML file (see `fc_config::ConfigLoader` for the search order) with
//! `FLOWCATALYST_*` environment overrides. A `.env` file is loaded first.
//! With `FLOWCATALYST_CONFIG_SYNC_ENABLED=true` the processing pools are
//! periodically re-fetched from `FLOWCATALYST_CONFIG_SYNC_URL` and hot-reloaded.
//!
//! ## Development Mode
//!
//! Set `FLOWCATALYST_DEV_MODE=true` to run without any broker: an in-memory
//! queue and a default pool are created when none are configured, and SQS
//! clients point at LocalStack.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::SqlitePoolOptions;
use tokio::{net::TcpListener, signal};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use fc_common::{PoolConfig, QueueConfig, QueueType};
use fc_config::{AppConfig, ConfigLoader};
use fc_queue::sqlite::SqliteQueue;
use fc_queue::sqs::SqsQueue;
use fc_queue::{ConsumerConfig, MemoryQueue, QueueClient};
use fc_router::{
    create_router, AppState, CircuitBreakerConfig, ConfigSyncConfig, ConfigSyncService, HealthMonitor,
    HealthMonitorConfig, HttpMediator, HttpMediatorConfig, LifecycleConfig, LifecycleManager, Router,
    WarningService, WarningServiceConfig,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for local development)
    let _ = dotenvy::dotenv();

    fc_common::logging::init_logging("fc-router");

    info!("Starting FlowCatalyst Message Router");

    // 1. Configuration
    let mut config = ConfigLoader::new().load().context("failed to load configuration")?;
    if config.dev_mode {
        apply_dev_defaults(&mut config);
    }
    if config.queues.is_empty() {
        anyhow::bail!("No queues configured (set FLOWCATALYST_QUEUE_URL or FLOWCATALYST_DEV_MODE=true)");
    }

    // 2. Metrics recorder
    let prometheus = match fc_router::metrics::install_prometheus() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "Prometheus recorder not installed, /metrics disabled");
            None
        }
    };

    // 3. Warning service and mediator
    let warning_service = Arc::new(WarningService::new(WarningServiceConfig::default()));
    let mediator = HttpMediator::new(HttpMediatorConfig {
        timeout: config.mediator.timeout(),
        connect_timeout: config.mediator.connect_timeout(),
        http1_only: config.mediator.http1_only,
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: config.mediator.circuit_breaker_threshold,
            reset_timeout: Duration::from_secs(config.mediator.circuit_breaker_reset_secs),
            ..Default::default()
        },
    })?
    .with_warning_service(warning_service.clone());
    let circuit_breakers = mediator.circuit_breakers();

    // 4. Router
    let router = Router::with_drain_timeout(
        config.router_config(),
        Arc::new(mediator),
        warning_service.clone(),
        Duration::from_secs(config.router.drain_timeout_secs),
    );
    info!(pools = ?router.pool_codes(), "Processing pools created");

    // 5. Consumers, one per configured queue
    for queue_config in &config.queues {
        let client = build_queue_client(&config, queue_config).await?;
        let consumer_config = ConsumerConfig {
            connections: queue_config.connections,
            batch_size: config.router.batch_size,
            visibility_timeout: queue_config.visibility_timeout,
            stall_timeout: Duration::from_secs(config.router.consumer_stall_timeout_secs),
            ..Default::default()
        };
        info!(
            queue = %queue_config.name,
            queue_type = ?queue_config.queue_type,
            connections = queue_config.connections,
            visibility_timeout = queue_config.visibility_timeout,
            "Starting consumer"
        );
        router.add_consumer(client, consumer_config).await?;
    }

    // 6. Optional config sync, then lifecycle tasks and the queue health monitor
    let config_sync = if config.router.config_sync.enabled {
        let settings = &config.router.config_sync;
        let sync_config = ConfigSyncConfig {
            config_url: settings.config_url.clone(),
            sync_interval: Duration::from_secs(settings.interval_seconds),
            max_retry_attempts: settings.max_retry_attempts,
            retry_delay: Duration::from_secs(settings.retry_delay_seconds),
            request_timeout: Duration::from_secs(settings.request_timeout_seconds),
        };
        info!(
            url = %sync_config.config_url,
            interval_secs = settings.interval_seconds,
            "Config sync enabled"
        );
        Some(Arc::new(ConfigSyncService::new(
            sync_config,
            router.clone(),
            warning_service.clone(),
        )?))
    } else {
        None
    };

    let health_monitor = Arc::new(HealthMonitor::new(
        HealthMonitorConfig {
            enabled: config.health.enabled,
            check_interval: Duration::from_secs(config.health.check_interval_secs),
            backlog_threshold: config.health.backlog_threshold,
            growth_threshold: config.health.growth_threshold,
            growth_periods_threshold: config.health.growth_periods_threshold,
        },
        warning_service.clone(),
    ));
    let lifecycle = LifecycleManager::start(
        router.clone(),
        warning_service.clone(),
        Some(health_monitor),
        config_sync,
        LifecycleConfig {
            visibility_extension_interval: Duration::from_secs(config.router.visibility_extension_interval_secs),
            visibility_extension_threshold: Duration::from_secs(config.router.visibility_extension_threshold_secs),
            ..Default::default()
        },
    );

    // 7. HTTP API
    let app = create_router(AppState {
        router: router.clone(),
        circuit_breakers,
        prometheus,
    })
    .layer(TraceLayer::new_for_http())
    .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));

    let addr = format!("{}:{}", config.http.host, config.http.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(addr = %addr, "Starting HTTP API server");
    let server_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "HTTP server failed");
        }
    });

    info!(
        queues = config.queues.len(),
        pools = config.pools.len(),
        "FlowCatalyst Router started. Press Ctrl+C to shutdown."
    );

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received...");

    // Stop polling and drain pools first, then background tasks and the API
    router.shutdown().await;
    lifecycle.shutdown().await;
    server_task.abort();

    info!("FlowCatalyst Router shutdown complete");
    Ok(())
}

/// Dev mode runs without a broker: an in-memory queue and a default pool
fn apply_dev_defaults(config: &mut AppConfig) {
    if config.queues.is_empty() {
        info!("Development mode - using in-memory queue");
        config.queues.push(QueueConfig {
            name: "dev".to_string(),
            queue_type: QueueType::Memory,
            uri: String::new(),
            connections: 1,
            visibility_timeout: 30,
        });
    }
    if config.pools.is_empty() {
        config.pools.push(PoolConfig::new("DEFAULT", 10, None));
    }
}

async fn build_queue_client(config: &AppConfig, queue: &QueueConfig) -> Result<Arc<dyn QueueClient>> {
    let client: Arc<dyn QueueClient> = match queue.queue_type {
        QueueType::Memory => Arc::new(MemoryQueue::new(queue.name.clone(), queue.visibility_timeout)),
        QueueType::Sqlite => {
            let path = if queue.uri.is_empty() {
                format!("{}/{}.db", config.data_dir, queue.name)
            } else {
                queue.uri.clone()
            };
            if let Some(parent) = std::path::Path::new(&path).parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            let pool = SqlitePoolOptions::new()
                .max_connections(5)
                .connect(&format!("sqlite://{}?mode=rwc", path))
                .await
                .with_context(|| format!("failed to open SQLite queue at {}", path))?;
            let sqlite = SqliteQueue::new(pool, queue.name.clone(), queue.visibility_timeout);
            sqlite.init_schema().await?;
            Arc::new(sqlite)
        }
        QueueType::Sqs => {
            let aws_config = if config.dev_mode {
                let endpoint_url = std::env::var("LOCALSTACK_ENDPOINT")
                    .unwrap_or_else(|_| "http://localhost:4566".to_string());
                info!(endpoint = %endpoint_url, "Configuring SQS client for LocalStack");
                aws_config::defaults(aws_config::BehaviorVersion::latest())
                    .endpoint_url(&endpoint_url)
                    .load()
                    .await
            } else {
                aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await
            };
            Arc::new(SqsQueue::new(
                aws_sdk_sqs::Client::new(&aws_config),
                queue.uri.clone(),
                queue.visibility_timeout as i32,
            ))
        }
    };
    Ok(client)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

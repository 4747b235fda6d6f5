//! Router HTTP API
//!
//! Health checks, Prometheus scrape endpoint and read-mostly monitoring views.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router as AxumRouter,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};

use fc_common::{ConsumerHealth, PoolStats, QueueStats, Warning, WarningCategory};

use crate::circuit_breaker::{CircuitBreakerRegistry, CircuitBreakerStats};
use crate::router::Router;

#[derive(Clone)]
pub struct AppState {
    pub router: Arc<Router>,
    pub circuit_breakers: Arc<CircuitBreakerRegistry>,
    /// Absent when no recorder was installed (tests)
    pub prometheus: Option<PrometheusHandle>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatusResponse {
    /// LIVE, READY or NOT_READY
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringResponse {
    pub running: bool,
    pub pools: Vec<PoolStats>,
    pub consumers: Vec<ConsumerHealth>,
    pub in_pipeline: usize,
    pub draining_pools: usize,
    pub open_circuits: usize,
    pub unacknowledged_warnings: usize,
    pub critical_warnings: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InPipelineResponse {
    pub message_id: String,
    pub pool_code: String,
    pub queue_identifier: String,
    pub age_ms: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarningsQuery {
    pub category: Option<WarningCategory>,
    #[serde(default)]
    pub unacknowledged: bool,
}

pub fn create_router(state: AppState) -> AxumRouter {
    AxumRouter::new()
        .route("/health/live", get(liveness))
        .route("/health/ready", get(readiness))
        .route("/metrics", get(metrics_handler))
        .route("/monitoring", get(monitoring_handler))
        .route("/monitoring/pools", get(pool_stats_handler))
        .route("/monitoring/queues", get(queue_stats_handler))
        .route("/monitoring/consumers", get(consumer_health_handler))
        .route("/monitoring/in-flight", get(in_pipeline_handler))
        .route("/monitoring/warnings", get(list_warnings))
        .route("/monitoring/warnings/:id/acknowledge", post(acknowledge_warning))
        .route("/monitoring/circuit-breakers", get(circuit_breakers_handler))
        .with_state(state)
}

async fn liveness() -> Json<HealthStatusResponse> {
    Json(HealthStatusResponse { status: "LIVE".to_string() })
}

/// Ready while the router runs and every running consumer is polling
async fn readiness(State(state): State<AppState>) -> Response {
    let consumers_healthy = state
        .router
        .consumer_health()
        .iter()
        .all(|c| !c.is_running || c.is_healthy);

    if state.router.is_running() && consumers_healthy {
        (StatusCode::OK, Json(HealthStatusResponse { status: "READY".to_string() })).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthStatusResponse { status: "NOT_READY".to_string() }),
        )
            .into_response()
    }
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    let Some(handle) = &state.prometheus else {
        return (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response();
    };
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        handle.render(),
    )
        .into_response()
}

async fn monitoring_handler(State(state): State<AppState>) -> Json<MonitoringResponse> {
    let router = &state.router;
    let warnings = router.warning_service();
    Json(MonitoringResponse {
        running: router.is_running(),
        pools: router.pool_stats(),
        consumers: router.consumer_health(),
        in_pipeline: router.in_pipeline_count(),
        draining_pools: router.draining_pool_count(),
        open_circuits: state.circuit_breakers.open_count(),
        unacknowledged_warnings: warnings.unacknowledged_count(),
        critical_warnings: warnings.has_critical_warnings(),
    })
}

async fn pool_stats_handler(State(state): State<AppState>) -> Json<Vec<PoolStats>> {
    Json(state.router.pool_stats())
}

async fn queue_stats_handler(State(state): State<AppState>) -> Json<Vec<QueueStats>> {
    Json(state.router.queue_stats().await)
}

async fn consumer_health_handler(State(state): State<AppState>) -> Json<Vec<ConsumerHealth>> {
    Json(state.router.consumer_health())
}

async fn in_pipeline_handler(State(state): State<AppState>) -> Json<Vec<InPipelineResponse>> {
    let mut messages: Vec<InPipelineResponse> = state
        .router
        .in_pipeline_messages()
        .into_iter()
        .map(|m| InPipelineResponse {
            age_ms: m.callback.age().as_millis() as u64,
            message_id: m.message_id,
            pool_code: m.pool_code,
            queue_identifier: m.queue_identifier,
        })
        .collect();
    messages.sort_by(|a, b| b.age_ms.cmp(&a.age_ms));
    Json(messages)
}

async fn list_warnings(
    State(state): State<AppState>,
    Query(query): Query<WarningsQuery>,
) -> Json<Vec<Warning>> {
    let warnings = state.router.warning_service();
    let list = match (query.category, query.unacknowledged) {
        (None, false) => warnings.get_all_warnings(),
        (None, true) => warnings.get_unacknowledged_warnings(),
        (Some(category), unacknowledged) => {
            let mut list = warnings.get_warnings_by_category(category);
            if unacknowledged {
                list.retain(|w| !w.acknowledged);
            }
            list
        }
    };
    Json(list)
}

async fn acknowledge_warning(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if state.router.warning_service().acknowledge_warning(&id) {
        (StatusCode::OK, Json(serde_json::json!({ "status": "acknowledged", "id": id }))).into_response()
    } else {
        (StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": "warning not found", "id": id }))).into_response()
    }
}

async fn circuit_breakers_handler(State(state): State<AppState>) -> Json<Vec<CircuitBreakerStats>> {
    Json(state.circuit_breakers.all_stats())
}

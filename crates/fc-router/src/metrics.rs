//! Prometheus metrics for the router.
//!
//! Thin wrappers over the `metrics` macros so metric and label names live in
//! one place. Nothing is recorded until a recorder is installed; tests run
//! without one.

use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Install the global Prometheus recorder. Call once at startup.
pub fn install_prometheus() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// One mediation attempt finished
pub fn record_message_processed(pool_code: &str, outcome: &'static str) {
    counter!(
        "fc_messages_processed_total",
        "pool" => pool_code.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_mediation_latency(pool_code: &str, duration: Duration) {
    histogram!(
        "fc_mediation_duration_seconds",
        "pool" => pool_code.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn set_pool_in_flight(pool_code: &str, count: u32) {
    gauge!(
        "fc_pool_in_flight",
        "pool" => pool_code.to_string()
    )
    .set(count as f64);
}

pub fn record_config_error(pool_code: &str) {
    counter!(
        "fc_config_errors_total",
        "pool" => pool_code.to_string()
    )
    .increment(1);
}

/// Message rejected at submission (pool full, shutting down, unknown pool)
pub fn record_message_rejected(pool_code: &str, reason: &'static str) {
    counter!(
        "fc_messages_rejected_total",
        "pool" => pool_code.to_string(),
        "reason" => reason
    )
    .increment(1);
}

pub fn set_queue_pending(queue: &str, pending: u64) {
    gauge!(
        "fc_queue_pending_messages",
        "queue" => queue.to_string()
    )
    .set(pending as f64);
}

pub fn set_in_pipeline_count(count: usize) {
    gauge!("fc_in_pipeline_messages").set(count as f64);
}

//! Mediation outcome vocabulary.
//!
//! [`MediationError`] is the single classification of a failed delivery
//! attempt. [`MediationResult`] is what a pool acts on. Legacy outcome codes
//! ([`OutcomeCode`]) are only ever converted into a `MediationError`, never
//! acted on directly.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use fc_queue::{clamp_nack_delay, DEFAULT_NACK_DELAY_SECONDS};

/// Why one delivery attempt failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediationError {
    #[error("mediation timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("circuit open for {0}")]
    CircuitOpen(String),

    #[error("HTTP {0}: {1}")]
    HttpError(u16, String),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("rate limited, retry after {}s", .0.as_secs())]
    RateLimited(Duration),
}

impl MediationError {
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// Whether redelivering the same message can reasonably succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            MediationError::Timeout(_) => true,
            MediationError::CircuitOpen(_) => false,
            MediationError::HttpError(status, _) => *status >= 500,
            MediationError::NetworkError(_) => true,
            MediationError::RateLimited(_) => true,
        }
    }

    /// Does this failure say something about the target's health?
    pub(crate) fn counts_against_circuit(&self) -> bool {
        match self {
            MediationError::Timeout(_) | MediationError::NetworkError(_) => true,
            MediationError::HttpError(status, _) => *status >= 500,
            MediationError::CircuitOpen(_) | MediationError::RateLimited(_) => false,
        }
    }

    /// Stable label for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            MediationError::Timeout(_) => "TIMEOUT",
            MediationError::CircuitOpen(_) => "CIRCUIT_OPEN",
            MediationError::HttpError(..) => "HTTP_ERROR",
            MediationError::NetworkError(_) => "NETWORK_ERROR",
            MediationError::RateLimited(_) => "RATE_LIMITED",
        }
    }

    /// Map a legacy outcome code onto the error taxonomy. `None` for success.
    ///
    /// Config and process errors become non-retryable HTTP errors (falling back
    /// to 400 when no 4xx status is known); server errors become retryable HTTP
    /// errors (falling back to 500); connection errors become network errors.
    pub fn from_outcome(code: OutcomeCode, status: Option<u16>, detail: impl Into<String>) -> Option<Self> {
        let detail = detail.into();
        match code {
            OutcomeCode::Success => None,
            OutcomeCode::ErrorConfig | OutcomeCode::ErrorProcess => {
                let status = status.filter(|s| (400..500).contains(s) && *s != 429).unwrap_or(400);
                Some(MediationError::HttpError(status, detail))
            }
            OutcomeCode::ErrorServer => {
                let status = status.filter(|s| *s >= 500).unwrap_or(500);
                Some(MediationError::HttpError(status, detail))
            }
            OutcomeCode::ErrorConnection => Some(MediationError::NetworkError(detail)),
        }
    }
}

/// Outcome codes used by producers and older router deployments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeCode {
    Success,
    ErrorConfig,
    ErrorProcess,
    ErrorServer,
    ErrorConnection,
}

impl OutcomeCode {
    /// Classify an HTTP status. 429 is not covered here; it is rate limiting.
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=299 => OutcomeCode::Success,
            401 | 403 | 404 | 405 => OutcomeCode::ErrorConfig,
            400..=499 => OutcomeCode::ErrorProcess,
            500..=599 => OutcomeCode::ErrorServer,
            // 1xx/3xx are not valid final answers from a webhook target
            _ => OutcomeCode::ErrorProcess,
        }
    }

    /// The legacy code reported for a failed attempt
    pub fn of(error: &MediationError) -> Self {
        match error {
            MediationError::Timeout(_)
            | MediationError::NetworkError(_)
            | MediationError::CircuitOpen(_) => OutcomeCode::ErrorConnection,
            MediationError::HttpError(status, _) => Self::from_status(*status),
            MediationError::RateLimited(_) => OutcomeCode::ErrorProcess,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeCode::Success => "SUCCESS",
            OutcomeCode::ErrorConfig => "ERROR_CONFIG",
            OutcomeCode::ErrorProcess => "ERROR_PROCESS",
            OutcomeCode::ErrorServer => "ERROR_SERVER",
            OutcomeCode::ErrorConnection => "ERROR_CONNECTION",
        }
    }
}

/// What a pool does with a message after one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediationResult {
    /// Delivered; ack
    Success,
    /// Transient failure or explicit deferral; nack with this delay
    Nack { delay_seconds: u32, reason: String },
    /// Target rejected the message as invalid or is misconfigured; retrying
    /// will not help
    ConfigError { reason: String },
}

impl MediationResult {
    /// Nack with a clamped delay (absent or non-positive means the default)
    pub fn nack(delay_seconds: Option<i64>, reason: impl Into<String>) -> Self {
        MediationResult::Nack {
            delay_seconds: clamp_nack_delay(delay_seconds),
            reason: reason.into(),
        }
    }

    pub fn config_error(reason: impl Into<String>) -> Self {
        MediationResult::ConfigError { reason: reason.into() }
    }

    pub fn from_error(error: &MediationError) -> Self {
        match error {
            MediationError::RateLimited(retry_after) => {
                Self::nack(Some(retry_after.as_secs() as i64), error.message())
            }
            MediationError::CircuitOpen(_) => {
                // Not retried now; the broker brings it back once the breaker has had time
                Self::nack(Some(DEFAULT_NACK_DELAY_SECONDS as i64), error.message())
            }
            e if e.is_retryable() => Self::nack(None, e.message()),
            e => Self::config_error(e.message()),
        }
    }

    /// Label for metrics
    pub fn label(&self) -> &'static str {
        match self {
            MediationResult::Success => "SUCCESS",
            MediationResult::Nack { .. } => "NACK",
            MediationResult::ConfigError { .. } => "ERROR_CONFIG",
        }
    }
}

/// Response body contract of a mediation target
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediationResponse {
    #[serde(default = "default_ack")]
    pub ack: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub delay_seconds: Option<i64>,
}

fn default_ack() -> bool {
    true
}

impl MediationResponse {
    /// Interpret a 2xx body. Unparseable or empty bodies count as `ack=true`.
    pub fn parse(body: &str) -> Self {
        serde_json::from_str(body).unwrap_or(MediationResponse {
            ack: true,
            message: None,
            delay_seconds: None,
        })
    }

    pub fn into_result(self) -> MediationResult {
        if self.ack {
            MediationResult::Success
        } else {
            let reason = self
                .message
                .unwrap_or_else(|| "target returned ack=false".to_string());
            MediationResult::nack(self.delay_seconds, reason)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(MediationError::HttpError(500, String::new()).is_retryable());
        assert!(MediationError::HttpError(503, String::new()).is_retryable());
        assert!(!MediationError::HttpError(404, String::new()).is_retryable());
        assert!(!MediationError::HttpError(400, String::new()).is_retryable());
        assert!(MediationError::RateLimited(Duration::from_secs(5)).is_retryable());
        assert!(!MediationError::CircuitOpen("http://t".into()).is_retryable());
        assert!(MediationError::Timeout(Duration::from_secs(30)).is_retryable());
        assert!(MediationError::NetworkError("refused".into()).is_retryable());
    }

    #[test]
    fn test_every_error_maps_to_a_result() {
        let cases = [
            (MediationError::Timeout(Duration::from_secs(30)), "NACK"),
            (MediationError::CircuitOpen("t".into()), "NACK"),
            (MediationError::HttpError(502, "bad gateway".into()), "NACK"),
            (MediationError::HttpError(404, "missing".into()), "ERROR_CONFIG"),
            (MediationError::NetworkError("reset".into()), "NACK"),
            (MediationError::RateLimited(Duration::from_secs(12)), "NACK"),
        ];
        for (error, label) in cases {
            assert_eq!(MediationResult::from_error(&error).label(), label, "{:?}", error);
        }
    }

    #[test]
    fn test_rate_limited_nack_uses_retry_after() {
        let result = MediationResult::from_error(&MediationError::RateLimited(Duration::from_secs(12)));
        assert!(matches!(result, MediationResult::Nack { delay_seconds: 12, .. }));

        let result = MediationResult::from_error(&MediationError::RateLimited(Duration::ZERO));
        assert!(matches!(result, MediationResult::Nack { delay_seconds: 30, .. }));
    }

    #[test]
    fn test_legacy_codes_map_deterministically() {
        let config = MediationError::from_outcome(OutcomeCode::ErrorConfig, Some(404), "x").unwrap();
        assert_eq!(config, MediationError::HttpError(404, "x".into()));
        assert!(!config.is_retryable());

        let process = MediationError::from_outcome(OutcomeCode::ErrorProcess, None, "x").unwrap();
        assert_eq!(process, MediationError::HttpError(400, "x".into()));
        assert!(!process.is_retryable());

        let server = MediationError::from_outcome(OutcomeCode::ErrorServer, Some(200), "x").unwrap();
        assert_eq!(server, MediationError::HttpError(500, "x".into()));
        assert!(server.is_retryable());

        let connection = MediationError::from_outcome(OutcomeCode::ErrorConnection, None, "x").unwrap();
        assert!(matches!(connection, MediationError::NetworkError(_)));
        assert!(connection.is_retryable());

        assert!(MediationError::from_outcome(OutcomeCode::Success, Some(200), "").is_none());
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(OutcomeCode::from_status(204), OutcomeCode::Success);
        assert_eq!(OutcomeCode::from_status(404), OutcomeCode::ErrorConfig);
        assert_eq!(OutcomeCode::from_status(422), OutcomeCode::ErrorProcess);
        assert_eq!(OutcomeCode::from_status(501), OutcomeCode::ErrorServer);
        assert_eq!(OutcomeCode::from_status(503), OutcomeCode::ErrorServer);
    }

    #[test]
    fn test_outcome_code_round_trips_through_taxonomy() {
        for status in [400u16, 404, 422, 500, 503] {
            let code = OutcomeCode::from_status(status);
            let error = MediationError::from_outcome(code, Some(status), "x").unwrap();
            assert_eq!(OutcomeCode::of(&error), code, "status {}", status);
        }
        assert_eq!(
            OutcomeCode::of(&MediationError::Timeout(Duration::from_secs(30))).as_str(),
            "ERROR_CONNECTION"
        );
    }

    #[test]
    fn test_mediation_response_parsing() {
        assert_eq!(MediationResponse::parse("").into_result(), MediationResult::Success);
        assert_eq!(MediationResponse::parse(r#"{"ack":true}"#).into_result(), MediationResult::Success);

        let deferred = MediationResponse::parse(r#"{"ack":false,"message":"not yet","delaySeconds":90}"#);
        assert_eq!(
            deferred.into_result(),
            MediationResult::Nack { delay_seconds: 90, reason: "not yet".into() }
        );

        let clamped = MediationResponse::parse(r#"{"ack":false,"delaySeconds":999999}"#);
        assert!(matches!(clamped.into_result(), MediationResult::Nack { delay_seconds: 43_200, .. }));

        let defaulted = MediationResponse::parse(r#"{"ack":false,"delaySeconds":-1}"#);
        assert!(matches!(defaulted.into_result(), MediationResult::Nack { delay_seconds: 30, .. }));
    }
}

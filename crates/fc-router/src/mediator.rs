//! HTTP delivery of message pointers.
//!
//! - POST `{"messageId": "<id>"}` to the mediation target
//! - Bearer auth from the message's auth token
//! - Optional HMAC-SHA256 signing (signature and timestamp headers)
//! - One attempt per call; redelivery happens through the queue via nack
//! - Per-target circuit breakers

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use sha2::Sha256;
use tracing::{debug, info, info_span, warn, Instrument};

use fc_common::{Message, WarningCategory, WarningSeverity};

use crate::circuit_breaker::{Admission, CircuitBreakerConfig, CircuitBreakerRegistry};
use crate::error::RouterError;
use crate::mediation::{MediationError, MediationResponse, MediationResult, OutcomeCode};
use crate::metrics;
use crate::warning::WarningService;

pub const SIGNATURE_HEADER: &str = "X-FlowCatalyst-Signature";
pub const TIMESTAMP_HEADER: &str = "X-FlowCatalyst-Timestamp";

/// Retry-After fallback for a 429 without a usable header
const DEFAULT_RETRY_AFTER_SECONDS: u64 = 30;

type HmacSha256 = Hmac<Sha256>;

/// Sign `timestamp + body`, returning the hex signature and the timestamp used
fn sign_payload(body: &str, signing_secret: &str) -> Option<(String, String)> {
    let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
    let mut mac = HmacSha256::new_from_slice(signing_secret.as_bytes()).ok()?;
    mac.update(timestamp.as_bytes());
    mac.update(body.as_bytes());
    Some((hex::encode(mac.finalize().into_bytes()), timestamp))
}

/// Delivers one message and reports what the pool should do with it
#[async_trait]
pub trait Mediator: Send + Sync {
    async fn mediate(&self, message: &Message) -> MediationResult;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MediationPayload<'a> {
    message_id: &'a str,
}

#[derive(Debug, Clone)]
pub struct HttpMediatorConfig {
    /// Per-attempt timeout
    pub timeout: Duration,
    pub connect_timeout: Duration,
    /// Force HTTP/1.1 (easier to debug locally)
    pub http1_only: bool,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for HttpMediatorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            http1_only: false,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

pub struct HttpMediator {
    client: Client,
    config: HttpMediatorConfig,
    breakers: Arc<CircuitBreakerRegistry>,
    warning_service: Option<Arc<WarningService>>,
}

impl HttpMediator {
    pub fn new(config: HttpMediatorConfig) -> Result<Self, RouterError> {
        let mut builder = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(10);
        if config.http1_only {
            builder = builder.http1_only();
        }
        let client = builder.build()?;

        info!(
            timeout_secs = config.timeout.as_secs(),
            failure_threshold = config.circuit_breaker.failure_threshold,
            "HttpMediator initialized"
        );

        Ok(Self {
            client,
            breakers: Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone())),
            config,
            warning_service: None,
        })
    }

    pub fn with_warning_service(mut self, warning_service: Arc<WarningService>) -> Self {
        self.warning_service = Some(warning_service);
        self
    }

    pub fn circuit_breakers(&self) -> Arc<CircuitBreakerRegistry> {
        self.breakers.clone()
    }

    fn warn(&self, category: WarningCategory, severity: WarningSeverity, message: String) {
        if let Some(ws) = &self.warning_service {
            ws.add_warning(category, severity, message, "HttpMediator");
        }
    }

    /// Make exactly one delivery attempt.
    ///
    /// Returns the parsed response of a 2xx, or the classified failure.
    /// While the target's breaker is open no request is sent.
    pub async fn deliver(&self, message: &Message) -> Result<MediationResponse, MediationError> {
        let target = message.mediation_target.as_str();
        let breaker = self.breakers.get_or_create(target);

        if breaker.admit() == Admission::Rejected {
            debug!(message_id = %message.id, target = %target, "Circuit open, skipping request");
            return Err(MediationError::CircuitOpen(target.to_string()));
        }

        let outcome = self.send(message).await;

        match &outcome {
            Err(e) if e.counts_against_circuit() => {
                if breaker.record_failure() {
                    self.warn(
                        WarningCategory::CircuitBreaker,
                        WarningSeverity::Error,
                        format!("Circuit breaker opened for {} after repeated failures: {}", target, e),
                    );
                }
            }
            // 4xx and rate limiting mean the target is up
            _ => breaker.record_success(),
        }

        outcome
    }

    async fn send(&self, message: &Message) -> Result<MediationResponse, MediationError> {
        let body = serde_json::to_string(&MediationPayload { message_id: &message.id })
            .map_err(|e| MediationError::NetworkError(format!("failed to encode request: {}", e)))?;

        let mut request = self
            .client
            .post(&message.mediation_target)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::ACCEPT, "application/json");

        if let Some(token) = &message.auth_token {
            request = request.bearer_auth(token);
        }
        if let Some((signature, timestamp)) = message
            .signing_secret
            .as_deref()
            .and_then(|secret| sign_payload(&body, secret))
        {
            request = request
                .header(SIGNATURE_HEADER, signature)
                .header(TIMESTAMP_HEADER, timestamp);
        }

        let response = request.body(body).send().await.map_err(|e| {
            if e.is_timeout() {
                MediationError::Timeout(self.config.timeout)
            } else {
                MediationError::NetworkError(e.to_string())
            }
        })?;

        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .unwrap_or(DEFAULT_RETRY_AFTER_SECONDS);
            return Err(MediationError::RateLimited(Duration::from_secs(retry_after)));
        }

        if status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Ok(MediationResponse::parse(&text));
        }

        let code = OutcomeCode::from_status(status.as_u16());
        let detail = status
            .canonical_reason()
            .unwrap_or("unexpected status")
            .to_string();
        Err(MediationError::from_outcome(code, Some(status.as_u16()), detail)
            .unwrap_or_else(|| MediationError::HttpError(status.as_u16(), "unexpected status".to_string())))
    }
}

#[async_trait]
impl Mediator for HttpMediator {
    async fn mediate(&self, message: &Message) -> MediationResult {
        let span = info_span!(
            "mediate",
            message_id = %message.id,
            pool_code = %message.pool_code,
            target = %message.mediation_target
        );

        async {
            let started = Instant::now();
            let outcome = self.deliver(message).await;
            metrics::record_mediation_latency(&message.pool_code, started.elapsed());

            match outcome {
                Ok(response) => {
                    let result = response.into_result();
                    match &result {
                        MediationResult::Success => info!("Message delivered"),
                        _ => debug!(result = result.label(), "Target deferred message"),
                    }
                    metrics::record_message_processed(&message.pool_code, OutcomeCode::Success.as_str());
                    result
                }
                Err(error) => {
                    let code = OutcomeCode::of(&error);
                    metrics::record_message_processed(&message.pool_code, code.as_str());

                    let result = MediationResult::from_error(&error);
                    if let MediationResult::ConfigError { .. } = result {
                        warn!(error = %error, outcome = code.as_str(), "Mediation rejected by target");
                    } else {
                        warn!(error = %error, kind = error.kind(), "Mediation failed, will retry");
                    }
                    result
                }
            }
        }
        .instrument(span)
        .await
    }
}

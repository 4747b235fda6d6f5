//! HttpMediator Tests
//!
//! Tests for:
//! - HTTP status classification into ack / nack / config error
//! - Response body contract (ack, delaySeconds)
//! - Request shape (payload, bearer auth, signing headers)
//! - Per-target circuit breaking

mod common;

use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_json, header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use fc_common::{Message, WarningCategory};
use fc_router::{
    CircuitBreakerConfig, CircuitState, HttpMediator, HttpMediatorConfig, MediationError,
    MediationResult, Mediator, WarningService,
};

use common::message;

fn target_message(server: &MockServer, route: &str) -> Message {
    let mut msg = message("msg-1", "TEST", None);
    msg.mediation_target = format!("{}{}", server.uri(), route);
    msg
}

fn mediator() -> HttpMediator {
    HttpMediator::new(HttpMediatorConfig::default()).unwrap()
}

async fn mediate_status(status: u16) -> MediationResult {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(status))
        .mount(&server)
        .await;

    mediator().mediate(&target_message(&server, "/hook")).await
}

#[tokio::test]
async fn test_success_acks() {
    assert_eq!(mediate_status(200).await, MediationResult::Success);
    assert_eq!(mediate_status(204).await, MediationResult::Success);
}

#[tokio::test]
async fn test_server_errors_nack_with_default_delay() {
    for status in [500, 501, 502, 503] {
        match mediate_status(status).await {
            MediationResult::Nack { delay_seconds, .. } => assert_eq!(delay_seconds, 30),
            other => panic!("status {} gave {:?}", status, other),
        }
    }
}

#[tokio::test]
async fn test_client_errors_are_config_errors() {
    for status in [400, 401, 403, 404, 422] {
        assert!(
            matches!(mediate_status(status).await, MediationResult::ConfigError { .. }),
            "status {}",
            status
        );
    }
}

#[tokio::test]
async fn test_rate_limited_uses_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "45"))
        .mount(&server)
        .await;

    let result = mediator().mediate(&target_message(&server, "/hook")).await;
    assert!(matches!(result, MediationResult::Nack { delay_seconds: 45, .. }));
}

#[tokio::test]
async fn test_ack_false_nacks_with_requested_delay() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ack": false,
            "message": "not ready",
            "delaySeconds": 120
        })))
        .mount(&server)
        .await;

    let result = mediator().mediate(&target_message(&server, "/hook")).await;
    assert_eq!(
        result,
        MediationResult::Nack {
            delay_seconds: 120,
            reason: "not ready".to_string()
        }
    );
}

#[tokio::test]
async fn test_unparseable_success_body_acks() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
        .mount(&server)
        .await;

    assert_eq!(
        mediator().mediate(&target_message(&server, "/hook")).await,
        MediationResult::Success
    );
}

#[tokio::test]
async fn test_request_carries_pointer_and_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(header("Authorization", "Bearer secret-token"))
        .and(header("Content-Type", "application/json"))
        .and(body_json(json!({ "messageId": "msg-1" })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let mut msg = target_message(&server, "/hook");
    msg.auth_token = Some("secret-token".to_string());

    assert_eq!(mediator().mediate(&msg).await, MediationResult::Success);
}

#[tokio::test]
async fn test_signing_secret_adds_signature_headers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header_exists("X-FlowCatalyst-Signature"))
        .and(header_exists("X-FlowCatalyst-Timestamp"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let mut msg = target_message(&server, "/hook");
    msg.signing_secret = Some("shh".to_string());

    assert_eq!(mediator().mediate(&msg).await, MediationResult::Success);
}

#[tokio::test]
async fn test_timeout_is_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let mediator = HttpMediator::new(HttpMediatorConfig {
        timeout: Duration::from_millis(200),
        ..Default::default()
    })
    .unwrap();

    let err = mediator.deliver(&target_message(&server, "/hook")).await.unwrap_err();
    assert!(matches!(err, MediationError::Timeout(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_circuit_opens_after_threshold_and_skips_requests() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let warnings = std::sync::Arc::new(WarningService::default());
    let mediator = HttpMediator::new(HttpMediatorConfig {
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 3,
            ..Default::default()
        },
        ..Default::default()
    })
    .unwrap()
    .with_warning_service(warnings.clone());

    let msg = target_message(&server, "/flaky");
    for _ in 0..3 {
        assert!(matches!(mediator.mediate(&msg).await, MediationResult::Nack { .. }));
    }

    let breakers = mediator.circuit_breakers();
    assert_eq!(breakers.state(&msg.mediation_target), Some(CircuitState::Open));
    assert_eq!(warnings.get_warnings_by_category(WarningCategory::CircuitBreaker).len(), 1);

    // Short-circuited: no fourth request reaches the server
    let err = mediator.deliver(&msg).await.unwrap_err();
    assert!(matches!(err, MediationError::CircuitOpen(_)));
    assert_eq!(
        mediator.mediate(&msg).await,
        MediationResult::Nack {
            delay_seconds: 30,
            reason: err.message()
        }
    );
}

#[tokio::test]
async fn test_client_errors_do_not_open_circuit() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(404))
        .expect(4)
        .mount(&server)
        .await;

    let mediator = HttpMediator::new(HttpMediatorConfig {
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 2,
            ..Default::default()
        },
        ..Default::default()
    })
    .unwrap();

    let msg = target_message(&server, "/hook");
    for _ in 0..4 {
        assert!(matches!(mediator.mediate(&msg).await, MediationResult::ConfigError { .. }));
    }
    assert_eq!(
        mediator.circuit_breakers().state(&msg.mediation_target),
        Some(CircuitState::Closed)
    );
}

#[tokio::test]
async fn test_breakers_are_per_target() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/down"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/up"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mediator = HttpMediator::new(HttpMediatorConfig {
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        },
        ..Default::default()
    })
    .unwrap();

    mediator.mediate(&target_message(&server, "/down")).await;
    assert_eq!(
        mediator.mediate(&target_message(&server, "/up")).await,
        MediationResult::Success
    );
    assert_eq!(mediator.circuit_breakers().open_count(), 1);
}

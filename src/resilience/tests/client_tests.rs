// src/resilience/tests/client_tests.rs

use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time;
use tokio_test::{assert_err, assert_ok};

use super::utils::{fast_breaker_config, test_config, FlakyDependency};
use crate::config::BreakerConfig;
use crate::error::{ResilienceError, Result};
use crate::resilience::{CallOutcome, CircuitState, FallbackStrategy, HealthStatus, ResilientClient};

fn lenient_breaker() -> BreakerConfig {
    BreakerConfig {
        volume_threshold: 100,
        ..fast_breaker_config()
    }
}

#[tokio::test]
async fn test_healthy_dependency_passes_through() {
    let dir = TempDir::new().unwrap();
    let client = ResilientClient::new(test_config(&dir, lenient_breaker(), 3));
    let dependency = FlakyDependency::new(0);

    let outcome = assert_ok!(
        client
            .call("auth", json!({}), FallbackStrategy::Degraded, || dependency.call())
            .await
    );

    assert_eq!(outcome.completed(), Some("ok"));
    assert_eq!(dependency.calls(), 1);

    let snapshot = client.snapshot().await;
    let auth = snapshot.dependency("auth").unwrap();
    assert_eq!(auth.retries.successful_retries, 1);
    assert_eq!(auth.fallbacks.total_fallbacks, 0);
    assert_eq!(snapshot.status, HealthStatus::Healthy);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let dir = TempDir::new().unwrap();
    let client = ResilientClient::new(test_config(&dir, lenient_breaker(), 3));
    let dependency = FlakyDependency::new(2);

    let outcome = client
        .call("payment", json!({ "order": 1 }), FallbackStrategy::Queue, || dependency.call())
        .await
        .unwrap();

    assert!(!outcome.is_fallback());
    assert_eq!(dependency.calls(), 3);
    assert_eq!(client.fallback().queued_len().await.unwrap(), 0);
}

#[tokio::test]
async fn test_exhausted_retries_run_fallback() {
    let dir = TempDir::new().unwrap();
    let client = ResilientClient::new(test_config(&dir, lenient_breaker(), 2));
    let dependency = FlakyDependency::always_failing();
    let payload = json!({ "to": "buyer@example.com" });

    let outcome = client
        .call("notification", payload.clone(), FallbackStrategy::Queue, || dependency.call())
        .await
        .unwrap();

    let fallback = outcome.fallback().expect("fallback expected");
    assert!(fallback.success);
    assert_eq!(fallback.strategy, FallbackStrategy::Queue);
    assert_eq!(dependency.calls(), 3);

    let queued = client.fallback().drain_queue().await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].record.kind, "notification");
    assert_eq!(queued[0].record.data, payload);

    let snapshot = client.snapshot().await;
    let metrics = snapshot.dependency("notification").unwrap();
    assert_eq!(metrics.retries.failed_retries, 1);
    assert_eq!(metrics.fallbacks.queue_fallbacks, 1);
}

#[tokio::test]
async fn test_open_circuit_skips_dependency() {
    let dir = TempDir::new().unwrap();
    let breaker = BreakerConfig {
        volume_threshold: 1,
        ..fast_breaker_config()
    };
    let client = ResilientClient::new(test_config(&dir, breaker, 3));
    let dependency = FlakyDependency::always_failing();

    // First failure trips the breaker, the retry is rejected and falls back
    let first = client
        .call("logging", json!({ "n": 1 }), FallbackStrategy::LocalStorage, || dependency.call())
        .await
        .unwrap();
    assert!(first.is_fallback());
    assert_eq!(dependency.calls(), 1);

    let second = client
        .call("logging", json!({ "n": 2 }), FallbackStrategy::LocalStorage, || dependency.call())
        .await
        .unwrap();
    assert!(second.is_fallback());
    assert_eq!(dependency.calls(), 1, "Open circuit must not reach the dependency");

    let log = std::fs::read_to_string(client.fallback().storage_dir().join("logging.log")).unwrap();
    assert_eq!(log.lines().count(), 2);

    time::sleep(Duration::from_millis(20)).await;
    let snapshot = client.snapshot().await;
    assert_eq!(snapshot.status, HealthStatus::Unavailable);
    assert_eq!(snapshot.open_breakers(), vec!["logging"]);
    assert_eq!(snapshot.recent_transitions.len(), 1);
    assert_eq!(snapshot.dependency("logging").unwrap().fallbacks.storage_fallbacks, 2);
}

#[tokio::test]
async fn test_dependency_recovers_after_reset_timeout() {
    let dir = TempDir::new().unwrap();
    let breaker = BreakerConfig {
        volume_threshold: 1,
        ..fast_breaker_config()
    };
    let client = ResilientClient::new(test_config(&dir, breaker, 0));
    let dependency = FlakyDependency::new(1);

    let first = client
        .call("auth", json!({}), FallbackStrategy::Degraded, || dependency.call())
        .await
        .unwrap();
    assert!(first.is_fallback());
    assert!(client.registry().is_open("auth").await);

    time::sleep(Duration::from_millis(200)).await;

    let second = client
        .call("auth", json!({}), FallbackStrategy::Degraded, || dependency.call())
        .await
        .unwrap();
    assert_eq!(second.completed(), Some("ok"));
    assert_eq!(
        client.registry().get_state("auth").await.unwrap().state,
        CircuitState::Closed
    );
}

#[tokio::test]
async fn test_permanent_error_is_returned() {
    let dir = TempDir::new().unwrap();
    let client = ResilientClient::new(test_config(&dir, lenient_breaker(), 3));
    let calls = AtomicUsize::new(0);

    let result: Result<CallOutcome<()>> = client
        .call("payment", json!({ "card": "declined" }), FallbackStrategy::Queue, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ResilienceError::Validation("card number invalid".into()))
        })
        .await;

    let err = assert_err!(result);
    assert!(matches!(err, ResilienceError::Validation(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(client.fallback().queued_len().await.unwrap(), 0);

    let snapshot = client.snapshot().await;
    let payment = snapshot.dependency("payment").unwrap();
    assert_eq!(payment.retries.failed_retries, 1);
    assert_eq!(payment.fallbacks.total_fallbacks, 0);
}

#[tokio::test]
async fn test_fire_and_forget_failure_is_logged_locally() {
    let dir = TempDir::new().unwrap();
    let client = ResilientClient::new(test_config(&dir, lenient_breaker(), 0));

    let handle = client
        .fire_and_forget("logging", json!({ "event": "order-placed" }), || async {
            Err(ResilienceError::Upstream {
                status: 503,
                message: "log sink unavailable".into(),
            })
        })
        .await;
    assert_ok!(handle.await);

    let log = std::fs::read_to_string(client.fallback().storage_dir().join("logging.log")).unwrap();
    assert!(log.contains("order-placed"));
    assert!(log.contains("log sink unavailable"));

    let counts = client
        .registry()
        .breaker("logging", None)
        .await
        .window_counts()
        .await;
    assert_eq!(counts.failures, 1);
}

#[test]
fn test_try_new_outside_runtime_reports_config_error() {
    let dir = TempDir::new().unwrap();

    let result = ResilientClient::try_new(test_config(&dir, lenient_breaker(), 3));

    match result {
        Err(ResilienceError::Config(msg)) => assert!(msg.contains("Tokio runtime")),
        Err(other) => panic!("unexpected error: {:?}", other),
        Ok(_) => panic!("client built without a runtime"),
    }
}

#[test]
fn test_try_new_inside_runtime_watches_transitions() {
    let dir = TempDir::new().unwrap();
    let runtime = tokio::runtime::Runtime::new().unwrap();

    runtime.block_on(async {
        let breaker = BreakerConfig {
            volume_threshold: 1,
            ..fast_breaker_config()
        };
        let client = assert_ok!(ResilientClient::try_new(test_config(&dir, breaker, 0)));

        client.registry().breaker("payments", None).await.record_failure().await;
        time::sleep(Duration::from_millis(50)).await;

        let snapshot = client.snapshot().await;
        assert_eq!(snapshot.recent_transitions.len(), 1);
        assert_eq!(snapshot.recent_transitions[0].to, CircuitState::Open);
    });
}

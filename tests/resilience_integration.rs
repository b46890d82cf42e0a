//! Resilience Integration Tests
//!
//! Retry, circuit breaker, cancellation and health monitoring working
//! together through the client manager. Time is paused so cooldowns and
//! backoff delays are deterministic.

mod common;

use std::time::Duration;

use serde_json::json;

use common::{manager, manager_with, server, ScriptedServer, Step, StubConnector};
use toolgate::core::{CircuitConfig, CircuitState, HealthConfig, HealthState, RetryConfig};
use toolgate::mcp::ErrorClass;
use toolgate::{CallContext, ClientError, ManagerSettings};

fn breaker(threshold: u32, cooldown_ms: u64) -> CircuitConfig {
    CircuitConfig {
        failure_threshold: threshold,
        cooldown: Duration::from_millis(cooldown_ms),
        ..CircuitConfig::default()
    }
}

fn retries(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(5),
        jitter: 0.0,
    }
}

// ============================================================================
// Circuit Breaker
// ============================================================================

mod circuit_breaker {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_recovers_through_trial() {
        let connector = StubConnector::new();
        let github = ScriptedServer::new(&["search"]);
        github.script([Step::Timeout, Step::Timeout, Step::Timeout]);
        connector.add("github", github.clone());
        let manager = manager(&connector);
        manager
            .connect(server("github").with_circuit(breaker(3, 1000)).with_retry(RetryConfig::no_retry()))
            .await
            .unwrap();

        let ctx = CallContext::background();
        for _ in 0..3 {
            let err = manager.call(&ctx, "github", "search", json!({})).await.unwrap_err();
            assert!(matches!(err, ClientError::RetriesExhausted { attempts: 1, .. }));
        }
        assert_eq!(manager.server_status("github").unwrap().circuit, CircuitState::Open);

        // Rejected without touching the transport.
        let err = manager.call(&ctx, "github", "search", json!({})).await.unwrap_err();
        match err {
            ClientError::CircuitOpen { ref server, retry_after } => {
                assert_eq!(server, "github");
                assert!(retry_after <= Duration::from_secs(1));
            }
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
        assert_eq!(err.class(), ErrorClass::BreakerOpen);
        assert_eq!(github.calls(), 3);

        tokio::time::advance(Duration::from_millis(1100)).await;
        assert_eq!(manager.server_status("github").unwrap().circuit, CircuitState::HalfOpen);

        let outcome = manager.call(&ctx, "github", "search", json!({})).await.unwrap();
        assert_eq!(outcome.attempts, 1);

        let status = manager.server_status("github").unwrap();
        assert_eq!(status.circuit, CircuitState::Closed);
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.stats.circuit_rejections, 1);
        assert_eq!(github.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_a_single_trial() {
        let connector = StubConnector::new();
        let github = ScriptedServer::new(&["search"]);
        github.script([Step::Timeout, Step::Slow(Duration::from_millis(500))]);
        connector.add("github", github.clone());
        let manager = manager(&connector);
        manager
            .connect(server("github").with_circuit(breaker(1, 1000)).with_retry(RetryConfig::no_retry()))
            .await
            .unwrap();

        let ctx = CallContext::background();
        manager.call(&ctx, "github", "search", json!({})).await.unwrap_err();
        tokio::time::advance(Duration::from_millis(1100)).await;

        let trial = tokio::spawn({
            let manager = manager.clone();
            async move { manager.call(&CallContext::background(), "github", "search", json!({})).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = manager.call(&ctx, "github", "search", json!({})).await.unwrap_err();
        assert!(matches!(err, ClientError::CircuitOpen { .. }));

        trial.await.unwrap().unwrap();
        assert_eq!(manager.server_status("github").unwrap().circuit, CircuitState::Closed);
        assert_eq!(github.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_lengthens_cooldown() {
        let connector = StubConnector::new();
        let github = ScriptedServer::new(&["search"]);
        github.script([Step::Timeout, Step::Timeout]);
        connector.add("github", github.clone());
        let manager = manager(&connector);
        let circuit = CircuitConfig { cooldown_multiplier: 2.0, ..breaker(1, 1000) };
        manager
            .connect(server("github").with_circuit(circuit).with_retry(RetryConfig::no_retry()))
            .await
            .unwrap();

        let ctx = CallContext::background();
        manager.call(&ctx, "github", "search", json!({})).await.unwrap_err();
        tokio::time::advance(Duration::from_millis(1100)).await;

        // The trial fails and the circuit reopens for twice as long.
        manager.call(&ctx, "github", "search", json!({})).await.unwrap_err();
        assert_eq!(manager.server_status("github").unwrap().circuit, CircuitState::Open);

        tokio::time::advance(Duration::from_millis(1100)).await;
        let err = manager.call(&ctx, "github", "search", json!({})).await.unwrap_err();
        assert!(matches!(err, ClientError::CircuitOpen { .. }));

        tokio::time::advance(Duration::from_millis(1000)).await;
        assert_eq!(manager.server_status("github").unwrap().circuit, CircuitState::HalfOpen);
        manager.call(&ctx, "github", "search", json!({})).await.unwrap();
        assert_eq!(github.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breakers_are_per_server() {
        let connector = StubConnector::new();
        let flaky = ScriptedServer::new(&["search"]);
        flaky.script([Step::Closed]);
        connector.add("flaky", flaky);
        connector.add("steady", ScriptedServer::new(&["search"]));
        let manager = manager(&connector);
        manager
            .connect(server("flaky").with_circuit(breaker(1, 1000)).with_retry(RetryConfig::no_retry()))
            .await
            .unwrap();
        manager.connect(server("steady").with_circuit(breaker(1, 1000))).await.unwrap();

        let ctx = CallContext::background();
        manager.call(&ctx, "flaky", "search", json!({})).await.unwrap_err();

        assert_eq!(manager.server_status("flaky").unwrap().circuit, CircuitState::Open);
        assert_eq!(manager.server_status("steady").unwrap().circuit, CircuitState::Closed);
        manager.call(&ctx, "steady", "search", json!({})).await.unwrap();
    }
}

// ============================================================================
// Retry
// ============================================================================

mod retry {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_last_attempt() {
        let connector = StubConnector::new();
        let github = ScriptedServer::new(&["search"]);
        github.script([Step::Closed, Step::Timeout, Step::Closed]);
        connector.add("github", github.clone());
        let manager = manager(&connector);
        manager.connect(server("github").with_retry(retries(4))).await.unwrap();

        let outcome =
            manager.call(&CallContext::background(), "github", "search", json!({"q": "x"})).await.unwrap();

        assert_eq!(outcome.attempts, 4);
        assert_eq!(github.calls(), 4);
        // 100ms + 200ms + 400ms of backoff
        assert!(outcome.elapsed >= Duration::from_millis(700));

        let status = manager.server_status("github").unwrap();
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.stats.retried, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reports_last_error() {
        let connector = StubConnector::new();
        let github = ScriptedServer::new(&["search"]);
        github.script([Step::Closed, Step::Closed, Step::Timeout]);
        connector.add("github", github.clone());
        let manager = manager(&connector);
        manager.connect(server("github").with_retry(retries(3))).await.unwrap();

        let err = manager.call(&CallContext::background(), "github", "search", json!({})).await.unwrap_err();

        match &err {
            ClientError::RetriesExhausted { server, tool, attempts, source } => {
                assert_eq!(server, "github");
                assert_eq!(tool, "search");
                assert_eq!(*attempts, 3);
                assert!(source.to_string().contains("Timed out"));
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
        assert_eq!(err.class(), ErrorClass::Transient);
        assert_eq!(github.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_retried_and_does_not_trip() {
        let connector = StubConnector::new();
        let github = ScriptedServer::new(&["search"]);
        github.script([Step::InvalidParams, Step::InvalidParams]);
        connector.add("github", github.clone());
        let manager = manager(&connector);
        manager
            .connect(server("github").with_retry(retries(5)).with_circuit(breaker(1, 1000)))
            .await
            .unwrap();

        let ctx = CallContext::background();
        for _ in 0..2 {
            let err = manager.call(&ctx, "github", "search", json!({})).await.unwrap_err();
            assert!(matches!(err, ClientError::Remote { .. }));
            assert_eq!(err.class(), ErrorClass::Permanent);
        }

        assert_eq!(github.calls(), 2);
        assert_eq!(manager.server_status("github").unwrap().circuit, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_stops_retrying() {
        let connector = StubConnector::new();
        let github = ScriptedServer::new(&["search"]);
        github.script(std::iter::repeat(Step::Timeout).take(5));
        connector.add("github", github.clone());
        let manager = manager(&connector);
        manager
            .connect(server("github").with_retry(retries(5)).with_circuit(breaker(2, 60_000)))
            .await
            .unwrap();

        let err = manager.call(&CallContext::background(), "github", "search", json!({})).await.unwrap_err();

        assert!(matches!(err, ClientError::CircuitOpen { .. }));
        assert_eq!(github.calls(), 2);
    }
}

// ============================================================================
// Cancellation & Deadlines
// ============================================================================

mod cancellation {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_deadline_during_trial_releases_the_slot() {
        let connector = StubConnector::new();
        let github = ScriptedServer::new(&["search"]);
        github.script([Step::Timeout, Step::Hang]);
        connector.add("github", github.clone());
        let manager = manager(&connector);
        manager
            .connect(server("github").with_circuit(breaker(1, 1000)).with_retry(RetryConfig::no_retry()))
            .await
            .unwrap();

        manager.call(&CallContext::background(), "github", "search", json!({})).await.unwrap_err();
        tokio::time::advance(Duration::from_millis(1100)).await;

        let ctx = CallContext::background().with_timeout(Duration::from_millis(100));
        let err = manager.call(&ctx, "github", "search", json!({})).await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout));
        assert_eq!(err.class(), ErrorClass::Cancelled);

        // No outcome was recorded, so the next caller gets the trial.
        assert_eq!(manager.server_status("github").unwrap().circuit, CircuitState::HalfOpen);
        manager.call(&CallContext::background(), "github", "search", json!({})).await.unwrap();
        assert_eq!(manager.server_status("github").unwrap().circuit, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_in_flight_call() {
        let connector = StubConnector::new();
        let github = ScriptedServer::new(&["search"]);
        github.script([Step::Hang]);
        connector.add("github", github.clone());
        let manager = manager(&connector);
        manager.connect(server("github").with_circuit(breaker(1, 1000))).await.unwrap();

        let (ctx, handle) = CallContext::cancellable();
        let call = tokio::spawn({
            let manager = manager.clone();
            async move { manager.call(&ctx, "github", "search", json!({})).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::Cancelled));

        // Cancellation is not a server failure.
        let status = manager.server_status("github").unwrap();
        assert_eq!(status.circuit, CircuitState::Closed);
        assert_eq!(status.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cuts_backoff_short() {
        let connector = StubConnector::new();
        let github = ScriptedServer::new(&["search"]);
        github.script(std::iter::repeat(Step::Closed).take(5));
        connector.add("github", github.clone());
        let manager = manager(&connector);
        let retry = RetryConfig { base_delay: Duration::from_secs(10), ..retries(5) };
        manager.connect(server("github").with_retry(retry)).await.unwrap();

        let ctx = CallContext::background().with_timeout(Duration::from_secs(1));
        let err = manager.call(&ctx, "github", "search", json!({})).await.unwrap_err();

        assert!(matches!(err, ClientError::Timeout));
        assert_eq!(github.calls(), 1);
    }
}

// ============================================================================
// Health Monitoring
// ============================================================================

mod health {
    use super::*;

    fn probing_settings() -> ManagerSettings {
        let mut settings = ManagerSettings::default();
        settings.session.health = HealthConfig {
            enabled: true,
            interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(200),
            unreachable_after: 2,
        };
        settings
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_server_trips_breaker() {
        let connector = StubConnector::new();
        let github = ScriptedServer::new(&["search"]);
        connector.add("github", github.clone());
        let manager = manager_with(probing_settings(), &connector);
        manager.connect(server("github")).await.unwrap();

        github.set_alive(false);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(manager.server_status("github").unwrap().health, HealthState::Degraded);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        let status = manager.server_status("github").unwrap();
        assert_eq!(status.health, HealthState::Unreachable);
        assert_eq!(status.circuit, CircuitState::Open);

        let err = manager.call(&CallContext::background(), "github", "search", json!({})).await.unwrap_err();
        assert!(matches!(err, ClientError::CircuitOpen { .. }));
        assert_eq!(github.calls(), 0);

        github.set_alive(true);
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(manager.server_status("github").unwrap().health, HealthState::Degraded);
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(manager.server_status("github").unwrap().health, HealthState::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_stops_probing() {
        let connector = StubConnector::new();
        let github = ScriptedServer::new(&["search"]);
        connector.add("github", github.clone());
        let manager = manager_with(probing_settings(), &connector);
        manager.connect(server("github")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(github.pings(), 2);

        manager.disconnect("github").await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(github.pings(), 2);
    }
}

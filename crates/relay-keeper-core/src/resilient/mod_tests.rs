//! Tests for the resilient call facade.

use super::*;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::dedupe::DedupeConfig;
use crate::error::{ErrorClass, StatusCodeClassifier, UpstreamError};
use crate::process_lock::LockConfig;
use crate::token::{Credential, MockTokenRefresher, SecretValue};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

// ============================================================================
// Test Helpers
// ============================================================================

fn create_call(dir: &TempDir) -> ResilientCall {
    let breaker = Arc::new(UpstreamCircuitBreaker::new(CircuitBreakerConfig::for_service(
        "test-upstream",
    )));
    let credential = Credential::new(
        "client-1",
        SecretValue::new("client-secret"),
        SecretValue::new("refresh-1"),
    )
    .with_access_token(SecretValue::new("access-0"));
    let tokens = Arc::new(TokenCoordinator::new(
        credential,
        Arc::new(MockTokenRefresher::new()),
        breaker.clone(),
    ));
    let policy = RetryPolicy::new(1, Duration::from_secs(1), Duration::from_secs(30), 2.0);
    let executor = Arc::new(RetryExecutor::new(policy, breaker, tokens));

    ResilientCall::new(
        Arc::new(DedupeRegistry::new(DedupeConfig::default())),
        ProcessLock::new(LockConfig::in_directory(dir.path())),
        executor,
    )
}

fn identity(value: &str) -> Identity {
    Identity::new(value).unwrap()
}

/// Operation counting its invocations and answering with a fixed result.
fn counting_operation(
    calls: &Arc<AtomicU32>,
    result: Result<&'static str, UpstreamError>,
) -> impl FnMut(BearerToken) -> std::future::Ready<Result<&'static str, UpstreamError>> {
    let calls = calls.clone();
    move |_token| {
        calls.fetch_add(1, Ordering::SeqCst);
        std::future::ready(result.clone())
    }
}

// ============================================================================
// Run Tests
// ============================================================================

mod run_tests {
    use super::*;

    /// Verify a second run for the same identity is skipped.
    #[tokio::test]
    async fn test_second_run_already_handled() {
        let dir = TempDir::new().unwrap();
        let call = create_call(&dir).with_completion_policy(CompletionPolicy::ReleaseImmediately);
        let calls = Arc::new(AtomicU32::new(0));

        let first = call
            .run(
                &identity("lead-1"),
                counting_operation(&calls, Ok("sent")),
                &StatusCodeClassifier,
            )
            .await
            .unwrap();
        assert_eq!(first, RunOutcome::Completed("sent"));

        let second = call
            .run(
                &identity("lead-1"),
                counting_operation(&calls, Ok("sent")),
                &StatusCodeClassifier,
            )
            .await
            .unwrap();
        assert_eq!(second, RunOutcome::AlreadyHandled);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    /// Verify a lock held by another process skips the operation.
    #[tokio::test]
    async fn test_busy_lock_concurrently_handled() {
        let dir = TempDir::new().unwrap();
        let call = create_call(&dir);
        let other_process = ProcessLock::new(LockConfig::in_directory(dir.path()));
        let calls = Arc::new(AtomicU32::new(0));

        assert!(other_process
            .try_acquire(&identity("lead-1"))
            .await
            .unwrap()
            .is_acquired());

        let outcome = call
            .run(
                &identity("lead-1"),
                counting_operation(&calls, Ok("sent")),
                &StatusCodeClassifier,
            )
            .await
            .unwrap();

        assert_eq!(outcome, RunOutcome::ConcurrentlyHandled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!call.dedupe().was_handled(&DedupeKey::from(&identity("lead-1"))));
    }

    /// Verify a failure releases the lock and leaves the identity unhandled.
    #[tokio::test]
    async fn test_failure_releases_lock_without_marking() {
        let dir = TempDir::new().unwrap();
        let call = create_call(&dir);
        let calls = Arc::new(AtomicU32::new(0));
        let lead = identity("lead-1");

        let result = call
            .run(
                &lead,
                counting_operation(&calls, Err(UpstreamError::status(400, "bad number"))),
                &StatusCodeClassifier,
            )
            .await;

        let error = result.unwrap_err();
        assert_eq!(error.error_class(), Some(ErrorClass::ClientError));
        assert_eq!(error.status_code(), Some(400));
        assert!(!call.lock().lock_path(&lead).exists());
        assert!(!call.dedupe().was_handled(&DedupeKey::from(&lead)));

        // A redelivery runs again
        let outcome = call
            .run(&lead, counting_operation(&calls, Ok("sent")), &StatusCodeClassifier)
            .await
            .unwrap();
        assert!(outcome.is_completed());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_release_immediately_removes_lock() {
        let dir = TempDir::new().unwrap();
        let call = create_call(&dir).with_completion_policy(CompletionPolicy::ReleaseImmediately);
        let calls = Arc::new(AtomicU32::new(0));
        let lead = identity("lead-1");

        call.run(&lead, counting_operation(&calls, Ok("sent")), &StatusCodeClassifier)
            .await
            .unwrap();

        assert!(!call.lock().lock_path(&lead).exists());
    }

    /// Verify the default policy keeps the lock for the release delay.
    #[tokio::test(start_paused = true)]
    async fn test_hold_keeps_lock_until_delay() {
        let dir = TempDir::new().unwrap();
        let call = create_call(&dir);
        let calls = Arc::new(AtomicU32::new(0));
        let lead = identity("lead-1");

        assert_eq!(
            call.completion_policy(),
            CompletionPolicy::HoldFor(Duration::from_secs(120))
        );

        call.run(&lead, counting_operation(&calls, Ok("sent")), &StatusCodeClassifier)
            .await
            .unwrap();
        assert!(call.lock().lock_path(&lead).exists());

        tokio::time::sleep(Duration::from_secs(121)).await;
        // Let the release task finish its file operations
        for _ in 0..50 {
            if !call.lock().lock_path(&lead).exists() {
                break;
            }
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!call.lock().lock_path(&lead).exists());
    }

    #[tokio::test]
    async fn test_circuit_open_surfaces_transient_error() {
        let dir = TempDir::new().unwrap();
        let call = create_call(&dir);
        for _ in 0..5 {
            call.circuit_breaker().record_server_failure();
        }
        let calls = Arc::new(AtomicU32::new(0));

        let error = call
            .run(
                &identity("lead-1"),
                counting_operation(&calls, Ok("sent")),
                &StatusCodeClassifier,
            )
            .await
            .unwrap_err();

        assert!(matches!(error, CallError::CircuitOpen { attempts: 0 }));
        assert!(error.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!call.lock().lock_path(&identity("lead-1")).exists());
    }
}

// ============================================================================
// Batch Tests
// ============================================================================

mod batch_tests {
    use super::*;

    /// Verify an item repeated in one payload runs once even if it failed.
    #[tokio::test]
    async fn test_repeated_item_in_batch_skipped() {
        let dir = TempDir::new().unwrap();
        let call = create_call(&dir);
        let calls = Arc::new(AtomicU32::new(0));
        let mut batch = call.begin_batch();

        let first = call
            .run_in_batch(
                &mut batch,
                &identity("lead-1"),
                counting_operation(&calls, Err(UpstreamError::status(422, "invalid"))),
                &StatusCodeClassifier,
            )
            .await;
        assert!(first.is_err());

        let second = call
            .run_in_batch(
                &mut batch,
                &identity("lead-1"),
                counting_operation(&calls, Ok("sent")),
                &StatusCodeClassifier,
            )
            .await
            .unwrap();
        assert_eq!(second, RunOutcome::AlreadyHandled);

        let other = call
            .run_in_batch(
                &mut batch,
                &identity("lead-2"),
                counting_operation(&calls, Ok("sent")),
                &StatusCodeClassifier,
            )
            .await
            .unwrap();
        assert!(other.is_completed());

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(batch.finish(), 2);
    }
}

// ============================================================================
// Construction Tests
// ============================================================================

mod construction_tests {
    use super::*;

    #[test]
    fn test_from_config() {
        let dir = TempDir::new().unwrap();
        let config: RelayConfig = serde_json::from_value(json!({
            "circuit_breaker": { "service_name": "sms-gateway", "failure_threshold": 3 },
            "lock": { "directory": dir.path(), "release_delay_seconds": 30 },
            "credentials": {
                "token_url": "https://auth.example.com/oauth/token",
                "client_id": "client-1",
                "client_secret": "secret",
                "refresh_token": "refresh-1",
                "access_token": "access-0"
            }
        }))
        .unwrap();

        let call = ResilientCall::from_config(&config, Arc::new(MockTokenRefresher::new())).unwrap();

        assert_eq!(call.circuit_breaker().config().service_name, "sms-gateway");
        assert_eq!(call.circuit_breaker().config().failure_threshold, 3);
        assert_eq!(call.tokens().token().expose_secret(), "access-0");
        assert_eq!(
            call.completion_policy(),
            CompletionPolicy::HoldFor(Duration::from_secs(30))
        );
        assert_eq!(call.lock().config().directory, dir.path());
    }

    #[test]
    fn test_from_invalid_config() {
        let result = ResilientCall::from_config(
            &RelayConfig::default(),
            Arc::new(MockTokenRefresher::new()),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_run_outcome_value() {
        assert_eq!(RunOutcome::Completed(5).into_value(), Some(5));
        assert_eq!(RunOutcome::<u32>::AlreadyHandled.into_value(), None);
        assert!(!RunOutcome::<u32>::ConcurrentlyHandled.is_completed());
    }
}

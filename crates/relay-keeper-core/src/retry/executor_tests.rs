//! Tests for the retry executor.

use super::*;
use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};
use crate::error::{StatusCodeClassifier, UpstreamError};
use crate::token::{
    Credential, MockTokenRefresher, RefreshError, SecretValue, TokenGrant, TokenRefresher,
};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

// ============================================================================
// Test Helpers
// ============================================================================

type Response = Result<&'static str, UpstreamError>;

/// Upstream answering from a script and recording every call.
#[derive(Clone, Default)]
struct ScriptedUpstream {
    responses: Arc<Mutex<VecDeque<Response>>>,
    calls: Arc<Mutex<Vec<(Instant, String)>>>,
    latency: Duration,
}

impl ScriptedUpstream {
    fn new(responses: Vec<Response>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into())),
            ..Self::default()
        }
    }

    fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn call(&self, token: BearerToken) -> impl Future<Output = Response> {
        let this = self.clone();
        async move {
            this.calls
                .lock()
                .unwrap()
                .push((Instant::now(), token.expose_secret().to_string()));
            if !this.latency.is_zero() {
                tokio::time::sleep(this.latency).await;
            }
            this.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok("default"))
        }
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn tokens(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, token)| token.clone())
            .collect()
    }

    /// Milliseconds between consecutive calls.
    fn gaps_ms(&self) -> Vec<u128> {
        let calls = self.calls.lock().unwrap();
        calls
            .windows(2)
            .map(|pair| (pair[1].0 - pair[0].0).as_millis())
            .collect()
    }
}

fn server_error() -> Response {
    Err(UpstreamError::status(503, "unavailable"))
}

fn create_breaker(threshold: u32) -> Arc<UpstreamCircuitBreaker> {
    Arc::new(UpstreamCircuitBreaker::new(CircuitBreakerConfig {
        service_name: "test-upstream".to_string(),
        failure_threshold: threshold,
        reset_timeout_seconds: 300,
    }))
}

fn create_tokens(
    refresher: impl TokenRefresher + 'static,
    breaker: Arc<UpstreamCircuitBreaker>,
) -> Arc<TokenCoordinator> {
    let credential = Credential::new(
        "client-1",
        SecretValue::new("client-secret"),
        SecretValue::new("refresh-1"),
    )
    .with_access_token(SecretValue::new("access-0"));

    Arc::new(TokenCoordinator::new(credential, Arc::new(refresher), breaker))
}

/// Refresher that must not be called.
fn no_refresh() -> MockTokenRefresher {
    let mut refresher = MockTokenRefresher::new();
    refresher.expect_refresh().times(0);
    refresher
}

fn refresh_to(access_token: &'static str) -> MockTokenRefresher {
    let mut refresher = MockTokenRefresher::new();
    refresher.expect_refresh().times(1).returning(move |_| {
        Ok(TokenGrant {
            access_token: SecretValue::new(access_token),
            refresh_token: None,
            expires_in: None,
        })
    });
    refresher
}

fn create_executor(
    policy: RetryPolicy,
    threshold: u32,
    refresher: MockTokenRefresher,
) -> RetryExecutor {
    let breaker = create_breaker(threshold);
    let tokens = create_tokens(refresher, breaker.clone());
    RetryExecutor::new(policy, breaker, tokens)
}

// ============================================================================
// Backoff Tests
// ============================================================================

mod backoff_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_success_on_first_attempt() {
        let executor = create_executor(RetryPolicy::default(), 5, no_refresh());
        let upstream = ScriptedUpstream::new(vec![Ok("sent")]);

        let result = executor
            .execute(|token| upstream.call(token), &StatusCodeClassifier)
            .await;

        assert_eq!(result.unwrap(), "sent");
        assert_eq!(upstream.call_count(), 1);
        assert_eq!(upstream.tokens(), vec!["access-0".to_string()]);
        assert_eq!(executor.circuit_breaker().snapshot().total_successes, 1);
    }

    /// Verify the schedule between five failing attempts.
    #[tokio::test(start_paused = true)]
    async fn test_exhausted_after_full_schedule() {
        let executor = create_executor(RetryPolicy::default(), 10, no_refresh());
        let upstream = ScriptedUpstream::new(vec![
            server_error(),
            server_error(),
            server_error(),
            server_error(),
            Err(UpstreamError::status(500, "boom")),
        ]);

        let result = executor
            .execute(|token| upstream.call(token), &StatusCodeClassifier)
            .await;

        assert_eq!(upstream.gaps_ms(), vec![1000, 2000, 4000, 8000]);

        match result {
            Err(CallError::Exhausted {
                class,
                attempts,
                status,
                failure,
            }) => {
                assert_eq!(class, ErrorClass::ServerError);
                assert_eq!(attempts, 5);
                assert_eq!(status, Some(500));
                assert_eq!(
                    failure.into_upstream(),
                    Some(UpstreamError::status(500, "boom"))
                );
            }
            other => panic!("Expected Exhausted, got {:?}", other),
        }
        assert_eq!(upstream.call_count(), 5);
    }

    /// Verify a rate-limited second attempt adds the penalty to its backoff.
    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_attempt_adds_penalty() {
        let executor = create_executor(RetryPolicy::default(), 5, no_refresh());
        let upstream = ScriptedUpstream::new(vec![
            server_error(),
            Err(UpstreamError::status(429, "slow down")),
            Ok("sent"),
        ]);

        let result = executor
            .execute(|token| upstream.call(token), &StatusCodeClassifier)
            .await;

        assert_eq!(result.unwrap(), "sent");
        assert_eq!(upstream.gaps_ms(), vec![1000, 7000]);
    }

    /// Verify rate limiting never counts toward the breaker.
    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_does_not_count_toward_circuit() {
        let executor = create_executor(RetryPolicy::default(), 2, no_refresh());
        let upstream = ScriptedUpstream::new(vec![
            Err(UpstreamError::status(429, "slow down")),
            Err(UpstreamError::status(429, "slow down")),
            Err(UpstreamError::status(429, "slow down")),
        ]);

        let result = executor
            .execute(|token| upstream.call(token), &StatusCodeClassifier)
            .await;

        assert_eq!(result.unwrap(), "default");
        assert_eq!(upstream.call_count(), 4);
        assert_eq!(executor.circuit_breaker().state(), CircuitState::Closed);
    }

    /// Verify a hung attempt is cut off by the per-call timeout.
    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_network_error() {
        let policy = RetryPolicy::new(2, Duration::from_secs(1), Duration::from_secs(30), 2.0)
            .with_call_timeout(Duration::from_secs(10));
        let executor = create_executor(policy, 5, no_refresh());
        let upstream =
            ScriptedUpstream::new(vec![Ok("late"), Ok("late")]).with_latency(Duration::from_secs(60));

        let result = executor
            .execute(|token| upstream.call(token), &StatusCodeClassifier)
            .await;

        match result {
            Err(CallError::Exhausted {
                class,
                attempts,
                status,
                failure,
            }) => {
                assert_eq!(class, ErrorClass::NetworkError);
                assert_eq!(attempts, 2);
                assert_eq!(status, None);
                assert!(matches!(
                    failure,
                    AttemptFailure::TimedOut { timeout_ms: 10_000 }
                ));
            }
            other => panic!("Expected Exhausted, got {:?}", other),
        }
        assert_eq!(executor.circuit_breaker().snapshot().failure_count, 2);
    }
}

// ============================================================================
// Classification Tests
// ============================================================================

mod classification_tests {
    use super::*;

    /// Verify a client error makes exactly one attempt.
    #[tokio::test(start_paused = true)]
    async fn test_client_error_not_retried() {
        let executor = create_executor(RetryPolicy::default(), 5, no_refresh());
        let upstream = ScriptedUpstream::new(vec![
            Err(UpstreamError::status(422, "invalid phone number")),
            Ok("sent"),
        ]);

        let result = executor
            .execute(|token| upstream.call(token), &StatusCodeClassifier)
            .await;

        match result {
            Err(CallError::NonRetryable {
                class,
                attempts,
                status,
                ..
            }) => {
                assert_eq!(class, ErrorClass::ClientError);
                assert_eq!(attempts, 1);
                assert_eq!(status, Some(422));
            }
            other => panic!("Expected NonRetryable, got {:?}", other),
        }
        assert_eq!(upstream.call_count(), 1);
        assert_eq!(executor.circuit_breaker().snapshot().failure_count, 0);
    }

    /// Verify closures work as classifiers.
    #[tokio::test(start_paused = true)]
    async fn test_closure_classifier() {
        let executor = create_executor(RetryPolicy::default(), 5, no_refresh());
        let attempts = Arc::new(Mutex::new(0u32));

        let classifier = |error: &String| {
            if error == "busy" {
                ErrorClass::ServerError
            } else {
                ErrorClass::ClientError
            }
        };

        let result = executor
            .execute(
                |_token| {
                    let attempts = attempts.clone();
                    async move {
                        let mut count = attempts.lock().unwrap();
                        *count += 1;
                        if *count < 3 {
                            Err("busy".to_string())
                        } else {
                            Ok(*count)
                        }
                    }
                },
                &classifier,
            )
            .await;

        assert_eq!(result.unwrap(), 3);
    }
}

// ============================================================================
// Auth Refresh Tests
// ============================================================================

mod auth_tests {
    use super::*;

    /// Verify an auth failure refreshes once and retries with the new token.
    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_refreshes_and_retries() {
        let executor = create_executor(RetryPolicy::default(), 5, refresh_to("access-1"));
        let upstream = ScriptedUpstream::new(vec![
            Err(UpstreamError::status(401, "token expired")),
            Ok("sent"),
        ]);

        let result = executor
            .execute(|token| upstream.call(token), &StatusCodeClassifier)
            .await;

        assert_eq!(result.unwrap(), "sent");
        assert_eq!(
            upstream.tokens(),
            vec!["access-0".to_string(), "access-1".to_string()]
        );
        // No backoff before the retry
        assert_eq!(upstream.gaps_ms(), vec![0]);
    }

    /// Verify a failed refresh surfaces the original auth failure.
    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_keeps_original_error() {
        let mut refresher = MockTokenRefresher::new();
        refresher.expect_refresh().times(1).returning(|_| {
            Err(RefreshError::Rejected {
                status: 400,
                message: "invalid_grant".to_string(),
            })
        });
        let executor = create_executor(RetryPolicy::default(), 5, refresher);
        let upstream = ScriptedUpstream::new(vec![Err(UpstreamError::status(401, "token expired"))]);

        let result = executor
            .execute(|token| upstream.call(token), &StatusCodeClassifier)
            .await;

        match result {
            Err(CallError::RefreshFailed {
                attempts,
                status,
                reason,
                failure,
            }) => {
                assert_eq!(attempts, 1);
                assert_eq!(status, Some(401));
                assert!(reason.contains("invalid_grant"));
                assert_eq!(
                    failure.into_upstream(),
                    Some(UpstreamError::status(401, "token expired"))
                );
            }
            other => panic!("Expected RefreshFailed, got {:?}", other),
        }
        assert_eq!(upstream.call_count(), 1);
    }

    /// Verify a second auth failure after refresh is returned, not looped on.
    #[tokio::test(start_paused = true)]
    async fn test_second_auth_failure_returned() {
        let executor = create_executor(RetryPolicy::default(), 5, refresh_to("access-1"));
        let upstream = ScriptedUpstream::new(vec![
            Err(UpstreamError::status(401, "token expired")),
            Err(UpstreamError::status(401, "still expired")),
            Ok("sent"),
        ]);

        let result = executor
            .execute(|token| upstream.call(token), &StatusCodeClassifier)
            .await;

        match result {
            Err(CallError::NonRetryable {
                class, attempts, ..
            }) => {
                assert_eq!(class, ErrorClass::AuthExpired);
                assert_eq!(attempts, 2);
            }
            other => panic!("Expected NonRetryable, got {:?}", other),
        }
        assert_eq!(upstream.call_count(), 2);
    }

    /// Verify the attempt after a refresh is not counted against the budget.
    #[tokio::test(start_paused = true)]
    async fn test_refresh_retry_outside_budget() {
        let policy = RetryPolicy::new(2, Duration::from_secs(1), Duration::from_secs(30), 2.0);
        let executor = create_executor(policy, 5, refresh_to("access-1"));
        let upstream = ScriptedUpstream::new(vec![
            server_error(),
            Err(UpstreamError::status(401, "token expired")),
            Ok("sent"),
        ]);

        let result = executor
            .execute(|token| upstream.call(token), &StatusCodeClassifier)
            .await;

        assert_eq!(result.unwrap(), "sent");
        assert_eq!(upstream.call_count(), 3);
    }
}

// ============================================================================
// Circuit Breaker Tests
// ============================================================================

mod circuit_breaker_tests {
    use super::*;

    /// Verify the sixth call after five server errors is rejected unsent.
    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_rejects_without_calling() {
        let policy = RetryPolicy::new(1, Duration::from_secs(1), Duration::from_secs(30), 2.0);
        let executor = create_executor(policy, 5, no_refresh());
        let upstream = ScriptedUpstream::new(vec![
            server_error(),
            server_error(),
            server_error(),
            server_error(),
            server_error(),
        ]);

        for _ in 0..5 {
            let result = executor
                .execute(|token| upstream.call(token), &StatusCodeClassifier)
                .await;
            assert!(matches!(result, Err(CallError::Exhausted { .. })));
        }
        assert_eq!(executor.circuit_breaker().state(), CircuitState::Open);

        let result = executor
            .execute(|token| upstream.call(token), &StatusCodeClassifier)
            .await;

        assert!(matches!(result, Err(CallError::CircuitOpen { attempts: 0 })));
        assert_eq!(upstream.call_count(), 5);
    }

    /// Verify a circuit opening mid-call stops further attempts.
    #[tokio::test(start_paused = true)]
    async fn test_circuit_opening_stops_retries() {
        let executor = create_executor(RetryPolicy::default(), 2, no_refresh());
        let upstream = ScriptedUpstream::new(vec![server_error(), server_error(), Ok("sent")]);

        let result = executor
            .execute(|token| upstream.call(token), &StatusCodeClassifier)
            .await;

        assert!(matches!(result, Err(CallError::CircuitOpen { attempts: 2 })));
        assert_eq!(upstream.call_count(), 2);
    }

    /// Verify the first request after a cool-down can refresh a missing token
    /// on its own trial slot.
    #[tokio::test(start_paused = true)]
    async fn test_trial_request_refreshes_missing_token() {
        let breaker = create_breaker(1);
        let credential = Credential::new(
            "client-1",
            SecretValue::new("client-secret"),
            SecretValue::new("refresh-1"),
        );
        let tokens = Arc::new(TokenCoordinator::new(
            credential,
            Arc::new(refresh_to("access-1")),
            breaker.clone(),
        ));
        let executor = RetryExecutor::new(RetryPolicy::default(), breaker.clone(), tokens);

        breaker.record_server_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        tokio::time::advance(Duration::from_secs(301)).await;

        let upstream = ScriptedUpstream::new(vec![Ok("sent")]);
        let result = executor
            .execute(|token| upstream.call(token), &StatusCodeClassifier)
            .await;

        assert_eq!(result.unwrap(), "sent");
        assert_eq!(upstream.tokens(), vec!["access-1".to_string()]);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(!breaker.snapshot().trial_in_flight);
    }

    /// Verify an auth failure on the trial request still gets its refresh.
    #[tokio::test(start_paused = true)]
    async fn test_trial_auth_failure_refreshes() {
        let executor = create_executor(RetryPolicy::default(), 1, refresh_to("access-1"));
        let breaker = executor.circuit_breaker().clone();
        breaker.record_server_failure();
        tokio::time::advance(Duration::from_secs(301)).await;

        let upstream = ScriptedUpstream::new(vec![
            Err(UpstreamError::status(401, "token expired")),
            Ok("sent"),
        ]);
        let result = executor
            .execute(|token| upstream.call(token), &StatusCodeClassifier)
            .await;

        assert_eq!(result.unwrap(), "sent");
        assert_eq!(
            upstream.tokens(),
            vec!["access-0".to_string(), "access-1".to_string()]
        );
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    /// Verify a trial cancelled by its caller does not block the upstream
    /// for good.
    #[tokio::test(start_paused = true)]
    async fn test_cancelled_trial_does_not_block_forever() {
        let executor = create_executor(RetryPolicy::default(), 1, no_refresh());
        let breaker = executor.circuit_breaker().clone();
        breaker.record_server_failure();
        tokio::time::advance(Duration::from_secs(301)).await;

        let slow = ScriptedUpstream::new(vec![Ok("late")]).with_latency(Duration::from_secs(10));
        let cancelled = tokio::time::timeout(
            Duration::from_secs(1),
            executor.execute(|token| slow.call(token), &StatusCodeClassifier),
        )
        .await;
        assert!(cancelled.is_err());
        assert!(breaker.snapshot().trial_in_flight);

        tokio::time::advance(Duration::from_secs(301)).await;

        let upstream = ScriptedUpstream::new(vec![Ok("sent")]);
        let result = executor
            .execute(|token| upstream.call(token), &StatusCodeClassifier)
            .await;

        assert_eq!(result.unwrap(), "sent");
        assert_eq!(upstream.call_count(), 1);
        assert!(!breaker.snapshot().trial_in_flight);
    }

    /// Verify client errors never trip the breaker.
    #[tokio::test(start_paused = true)]
    async fn test_client_errors_never_trip() {
        let executor = create_executor(RetryPolicy::default(), 2, no_refresh());

        for _ in 0..5 {
            let upstream = ScriptedUpstream::new(vec![Err(UpstreamError::status(400, "bad"))]);
            let _ = executor
                .execute(|token| upstream.call(token), &StatusCodeClassifier)
                .await;
        }

        assert_eq!(executor.circuit_breaker().state(), CircuitState::Closed);
    }
}

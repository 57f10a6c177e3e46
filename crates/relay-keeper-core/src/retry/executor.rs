//! Retry executor.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::RetryPolicy;
use crate::circuit_breaker::UpstreamCircuitBreaker;
use crate::error::{AttemptFailure, CallError, Classify, ErrorClass};
use crate::token::{BearerToken, RefreshOutcome, TokenCoordinator};

/// Classified failure of one attempt.
struct FailedAttempt<E> {
    class: ErrorClass,
    status: Option<u16>,
    failure: AttemptFailure<E>,
}

/// Runs operations against one upstream with retries, circuit breaking and
/// token refresh.
///
/// The executor never retries on its own: the caller's operation is invoked
/// again with the current bearer token for every attempt, so it must be
/// safe to repeat.
#[derive(Debug)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    circuit_breaker: Arc<UpstreamCircuitBreaker>,
    tokens: Arc<TokenCoordinator>,
}

impl RetryExecutor {
    /// Create an executor sharing a breaker and token coordinator.
    pub fn new(
        policy: RetryPolicy,
        circuit_breaker: Arc<UpstreamCircuitBreaker>,
        tokens: Arc<TokenCoordinator>,
    ) -> Self {
        Self {
            policy,
            circuit_breaker,
            tokens,
        }
    }

    /// Get the retry policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Get the circuit breaker guarding the upstream.
    pub fn circuit_breaker(&self) -> &Arc<UpstreamCircuitBreaker> {
        &self.circuit_breaker
    }

    /// Get the token coordinator supplying bearer tokens.
    pub fn tokens(&self) -> &Arc<TokenCoordinator> {
        &self.tokens
    }

    /// Execute an operation until it succeeds, fails permanently or the
    /// retry budget is used up.
    ///
    /// # Arguments
    ///
    /// * `operation` - Makes one upstream request with the given token
    /// * `classifier` - Maps the operation's error to an [`ErrorClass`]
    ///
    /// # Returns
    ///
    /// The operation's value, or a [`CallError`] carrying the class, the
    /// number of attempts and the last status code.
    ///
    /// An `AuthExpired` failure triggers one token refresh and one extra
    /// attempt that is not counted against the budget; the outcome of that
    /// attempt is returned as is.
    pub async fn execute<T, E, F, Fut, C>(
        &self,
        mut operation: F,
        classifier: &C,
    ) -> Result<T, CallError<E>>
    where
        F: FnMut(BearerToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
        C: Classify<E> + ?Sized,
    {
        let mut attempts: u32 = 0;

        loop {
            // Token first: a proactive refresh asks the breaker on its own, and
            // after a cool-down it must not find the trial slot already taken
            // by this very request.
            let token = self.tokens.token_for_request().await;

            if !self.circuit_breaker.can_make_request() {
                warn!(
                    service = %self.circuit_breaker.config().service_name,
                    attempts,
                    "Circuit breaker open, request not sent"
                );
                return Err(CallError::CircuitOpen { attempts });
            }
            attempts += 1;

            let failed = match self.attempt(&mut operation, token.clone(), classifier).await {
                Ok(value) => {
                    self.circuit_breaker.record_success();
                    if attempts > 1 {
                        info!(attempts, "Upstream call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(failed) => failed,
            };

            self.record_outcome(failed.class);

            match failed.class {
                ErrorClass::AuthExpired => {
                    return self
                        .retry_after_refresh(&mut operation, classifier, &token, attempts, failed)
                        .await;
                }
                ErrorClass::ClientError => {
                    warn!(
                        attempt = attempts,
                        error_class = %failed.class,
                        status = ?failed.status,
                        error = %failed.failure,
                        "Upstream rejected request, not retrying"
                    );
                    return Err(CallError::NonRetryable {
                        class: failed.class,
                        attempts,
                        status: failed.status,
                        failure: failed.failure,
                    });
                }
                ErrorClass::RateLimited | ErrorClass::ServerError | ErrorClass::NetworkError => {}
            }

            let Some(retry) = self.policy.plan_retry(failed.class, attempts) else {
                warn!(
                    attempts,
                    error_class = %failed.class,
                    status = ?failed.status,
                    error = %failed.failure,
                    "Retry budget exhausted"
                );
                return Err(CallError::Exhausted {
                    class: failed.class,
                    attempts,
                    status: failed.status,
                    failure: failed.failure,
                });
            };

            warn!(
                attempt = attempts,
                next_attempt = retry.attempt_number,
                delay_ms = retry.delay.as_millis() as u64,
                error_class = %retry.error_class,
                status = ?failed.status,
                error = %failed.failure,
                "Upstream call failed, retrying after backoff"
            );

            tokio::time::sleep(retry.delay).await;
        }
    }

    /// Refresh the token after an auth failure and make one extra attempt.
    async fn retry_after_refresh<T, E, F, Fut, C>(
        &self,
        operation: &mut F,
        classifier: &C,
        rejected_token: &BearerToken,
        attempts: u32,
        auth_failure: FailedAttempt<E>,
    ) -> Result<T, CallError<E>>
    where
        F: FnMut(BearerToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
        C: Classify<E> + ?Sized,
    {
        let outcome = self
            .tokens
            .ensure_fresh_after_auth_failure(rejected_token)
            .await;

        if let RefreshOutcome::Failed(reason) = outcome {
            warn!(
                attempt = attempts,
                reason = %reason,
                error = %auth_failure.failure,
                "Token refresh failed after auth failure"
            );
            return Err(CallError::RefreshFailed {
                attempts,
                status: auth_failure.status,
                reason: reason.to_string(),
                failure: auth_failure.failure,
            });
        }

        if !self.circuit_breaker.can_make_request() {
            return Err(CallError::CircuitOpen { attempts });
        }

        let token = self.tokens.token();
        let attempts = attempts + 1;
        debug!(
            attempt = attempts,
            generation = token.generation(),
            "Retrying with refreshed token"
        );

        match self.attempt(operation, token, classifier).await {
            Ok(value) => {
                self.circuit_breaker.record_success();
                Ok(value)
            }
            Err(failed) => {
                self.record_outcome(failed.class);
                warn!(
                    attempt = attempts,
                    error_class = %failed.class,
                    status = ?failed.status,
                    error = %failed.failure,
                    "Upstream call failed after token refresh"
                );

                if failed.class.is_retryable() {
                    Err(CallError::Exhausted {
                        class: failed.class,
                        attempts,
                        status: failed.status,
                        failure: failed.failure,
                    })
                } else {
                    Err(CallError::NonRetryable {
                        class: failed.class,
                        attempts,
                        status: failed.status,
                        failure: failed.failure,
                    })
                }
            }
        }
    }

    /// Make one attempt under the per-call timeout.
    async fn attempt<T, E, F, Fut, C>(
        &self,
        operation: &mut F,
        token: BearerToken,
        classifier: &C,
    ) -> Result<T, FailedAttempt<E>>
    where
        F: FnMut(BearerToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Classify<E> + ?Sized,
    {
        match tokio::time::timeout(self.policy.call_timeout, operation(token)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(FailedAttempt {
                class: classifier.classify(&error),
                status: classifier.status_code(&error),
                failure: AttemptFailure::Upstream(error),
            }),
            Err(_) => Err(FailedAttempt {
                class: ErrorClass::NetworkError,
                status: None,
                failure: AttemptFailure::TimedOut {
                    timeout_ms: self.policy.call_timeout.as_millis() as u64,
                },
            }),
        }
    }

    fn record_outcome(&self, class: ErrorClass) {
        if class.counts_toward_circuit() {
            self.circuit_breaker.record_server_failure();
        } else {
            self.circuit_breaker.record_neutral_outcome();
        }
    }
}

#[cfg(test)]
#[path = "executor_tests.rs"]
mod tests;

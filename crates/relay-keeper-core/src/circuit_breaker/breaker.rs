//! Default circuit breaker implementation.
//!
//! State lives behind an `RwLock`; callers share the breaker through an
//! `Arc`. Two callers recording failures at nearly the same moment may both
//! see the pre-increment count. That is acceptable: the breaker limits damage,
//! it does not keep exact accounts.

use std::sync::RwLock;
use tokio::time::Instant;
use tracing::{info, warn};

use super::{CircuitBreakerConfig, CircuitSnapshot, CircuitState};
use crate::Timestamp;

// ============================================================================
// Internal State
// ============================================================================

#[derive(Debug)]
struct InternalState {
    current_state: CircuitState,

    /// Consecutive server-class failures
    failure_count: u32,

    last_failure: Option<Instant>,

    opened_at: Option<Timestamp>,

    /// Set when the cool-down has elapsed and one trial request was let through
    trial_in_flight: bool,

    /// When the outstanding trial was granted; a trial that never reports
    /// back within the reset timeout is abandoned
    trial_started: Option<Instant>,

    total_successes: u64,
    total_failures: u64,
    rejected_requests: u64,
}

impl InternalState {
    fn new() -> Self {
        Self {
            current_state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            opened_at: None,
            trial_in_flight: false,
            trial_started: None,
            total_successes: 0,
            total_failures: 0,
            rejected_requests: 0,
        }
    }
}

// ============================================================================
// Upstream Circuit Breaker
// ============================================================================

/// Circuit breaker shared by all calls to one upstream.
///
/// Only server-class failures are recorded through
/// [`record_server_failure`](Self::record_server_failure); client errors,
/// rate limiting and auth expiry are reported with
/// [`record_neutral_outcome`](Self::record_neutral_outcome), which never
/// changes the failure count.
#[derive(Debug)]
pub struct UpstreamCircuitBreaker {
    config: CircuitBreakerConfig,
    state: RwLock<InternalState>,
}

impl UpstreamCircuitBreaker {
    /// Create new circuit breaker with configuration.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: RwLock::new(InternalState::new()),
        }
    }

    /// Get breaker configuration.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Check whether a request may be sent now.
    ///
    /// Closed: true, unless a trial request is outstanding.
    /// Open: true only once the cool-down has elapsed since the last failure;
    /// the breaker then closes and this caller owns the trial slot.
    ///
    /// A trial whose caller was cancelled never reports back. Once it has
    /// been outstanding for longer than the reset timeout, the slot passes
    /// to the next caller.
    pub fn can_make_request(&self) -> bool {
        // Fail-safe: treat lock poisoning as open
        let Ok(mut state) = self.state.write() else {
            return false;
        };

        match state.current_state {
            CircuitState::Closed if state.trial_in_flight => {
                let abandoned = state
                    .trial_started
                    .map(|at| at.elapsed() > self.config.reset_timeout())
                    .unwrap_or(true);

                if abandoned {
                    state.trial_started = Some(Instant::now());
                    warn!(
                        service = %self.config.service_name,
                        "Trial request never reported back, allowing a new trial"
                    );
                    true
                } else {
                    state.rejected_requests += 1;
                    false
                }
            }
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled_down = state
                    .last_failure
                    .map(|at| at.elapsed() > self.config.reset_timeout())
                    .unwrap_or(true);

                if cooled_down {
                    state.current_state = CircuitState::Closed;
                    state.failure_count = 0;
                    state.trial_in_flight = true;
                    state.trial_started = Some(Instant::now());
                    info!(
                        service = %self.config.service_name,
                        "Circuit cool-down elapsed, allowing trial request"
                    );
                    true
                } else {
                    state.rejected_requests += 1;
                    false
                }
            }
        }
    }

    /// Record a server-class failure (5xx or connectivity).
    pub fn record_server_failure(&self) {
        let Ok(mut state) = self.state.write() else {
            return;
        };

        state.failure_count = state.failure_count.saturating_add(1);
        state.total_failures += 1;
        state.last_failure = Some(Instant::now());

        if state.trial_in_flight {
            state.trial_in_flight = false;
            state.trial_started = None;
            state.failure_count = state.failure_count.max(self.config.failure_threshold);
            self.trip(&mut state);
            warn!(
                service = %self.config.service_name,
                "Trial request failed, circuit reopened"
            );
            return;
        }

        match state.current_state {
            CircuitState::Closed => {
                if state.failure_count >= self.config.failure_threshold {
                    self.trip(&mut state);
                    warn!(
                        service = %self.config.service_name,
                        failure_count = state.failure_count,
                        reset_timeout_seconds = self.config.reset_timeout_seconds,
                        "Circuit opened after consecutive server failures"
                    );
                }
            }
            CircuitState::Open => {
                // Late failure from a request sent before the circuit opened;
                // last_failure was refreshed above, which restarts the cool-down
            }
        }
    }

    /// Record a successful request; resets the count and closes the circuit.
    pub fn record_success(&self) {
        let Ok(mut state) = self.state.write() else {
            return;
        };

        let was_recovering = state.trial_in_flight || state.current_state == CircuitState::Open;

        state.total_successes += 1;
        state.failure_count = 0;
        state.trial_in_flight = false;
        state.trial_started = None;
        state.current_state = CircuitState::Closed;
        state.opened_at = None;

        if was_recovering {
            info!(service = %self.config.service_name, "Circuit closed after successful request");
        }
    }

    /// Record an outcome that says nothing about upstream health.
    ///
    /// Frees the trial slot if one is outstanding.
    pub fn record_neutral_outcome(&self) {
        if let Ok(mut state) = self.state.write() {
            state.trial_in_flight = false;
            state.trial_started = None;
        }
    }

    /// Get current circuit state.
    pub fn state(&self) -> CircuitState {
        self.state
            .read()
            .map(|state| state.current_state)
            .unwrap_or(CircuitState::Open)
    }

    /// Get a point-in-time view of the breaker.
    pub fn snapshot(&self) -> CircuitSnapshot {
        let guard = self.state.read();
        let state = match guard {
            Ok(ref state) => state,
            Err(ref poisoned) => poisoned.get_ref(),
        };

        CircuitSnapshot {
            service_name: self.config.service_name.clone(),
            state: state.current_state,
            failure_count: state.failure_count,
            threshold: self.config.failure_threshold,
            reset_timeout_seconds: self.config.reset_timeout_seconds,
            last_failure_age_ms: state
                .last_failure
                .map(|at| at.elapsed().as_millis() as u64),
            opened_at: state.opened_at,
            trial_in_flight: state.trial_in_flight,
            total_successes: state.total_successes,
            total_failures: state.total_failures,
            rejected_requests: state.rejected_requests,
        }
    }

    /// Reset circuit breaker to closed state (admin operation).
    pub fn reset(&self) {
        let mut state = match self.state.write() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        *state = InternalState::new();
        info!(service = %self.config.service_name, "Circuit breaker reset");
    }

    fn trip(&self, state: &mut InternalState) {
        state.current_state = CircuitState::Open;
        state.opened_at = Some(Timestamp::now());
    }
}

#[cfg(test)]
#[path = "breaker_tests.rs"]
mod tests;

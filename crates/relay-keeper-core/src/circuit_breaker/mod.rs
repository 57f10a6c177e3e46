//! Circuit breaker guarding calls to one upstream.
//!
//! The breaker counts consecutive server-class failures (5xx and
//! connectivity failures). Once the count reaches the threshold it opens and
//! every request is refused without touching the network until the
//! cool-down has elapsed.
//!
//! # Circuit Breaker States
//!
//! - **Closed**: Normal operation, requests pass through
//! - **Open**: Upstream is failing, requests are rejected immediately
//!
//! There is no observable half-open state. The first
//! [`UpstreamCircuitBreaker::can_make_request`] after the cool-down closes the
//! breaker and hands the caller a single trial slot; until that trial
//! reports back every other caller is refused. A failed trial reopens the
//! breaker with a fresh cool-down.
//!
//! # Example
//!
//! ```rust
//! use relay_keeper_core::circuit_breaker::{CircuitBreakerConfig, UpstreamCircuitBreaker};
//!
//! let breaker = UpstreamCircuitBreaker::new(CircuitBreakerConfig::default());
//! if breaker.can_make_request() {
//!     // send the request, then report the outcome
//!     breaker.record_success();
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::Timestamp;

mod breaker;
pub use breaker::UpstreamCircuitBreaker;

// ============================================================================
// Circuit State
// ============================================================================

/// Observable state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests pass through, failures are counted.
    Closed,

    /// Requests are rejected until the cool-down elapses.
    Open,
}

impl CircuitState {
    /// Check if requests are allowed in this state.
    pub fn allows_requests(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

// ============================================================================
// Circuit Breaker Configuration
// ============================================================================

/// Configuration for circuit breaker behavior.
///
/// # Default Configuration
///
/// - Failure threshold: 5 consecutive server-class failures
/// - Reset timeout: 300 seconds (5 minutes)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Upstream name for identification in logs and status.
    pub service_name: String,

    /// Number of consecutive server-class failures that opens the circuit.
    pub failure_threshold: u32,

    /// Time the circuit stays open before a trial request is allowed (seconds).
    pub reset_timeout_seconds: u64,
}

impl CircuitBreakerConfig {
    /// Create configuration for a named upstream with default thresholds.
    pub fn for_service(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Self::default()
        }
    }

    /// Cool-down as a duration.
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_seconds)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            service_name: "upstream".to_string(),
            failure_threshold: 5,
            reset_timeout_seconds: 300,
        }
    }
}

// ============================================================================
// Circuit Snapshot
// ============================================================================

/// Point-in-time view of the breaker for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    /// Upstream name.
    pub service_name: String,

    /// Current circuit state.
    pub state: CircuitState,

    /// Consecutive server-class failures.
    pub failure_count: u32,

    /// Failures needed to open.
    pub threshold: u32,

    /// Cool-down in seconds.
    pub reset_timeout_seconds: u64,

    /// Milliseconds since the last recorded failure.
    pub last_failure_age_ms: Option<u64>,

    /// Wall-clock time the circuit last opened.
    pub opened_at: Option<Timestamp>,

    /// Whether a post-cool-down trial request is outstanding.
    pub trial_in_flight: bool,

    /// Total successes recorded.
    pub total_successes: u64,

    /// Total server-class failures recorded.
    pub total_failures: u64,

    /// Requests refused while open or while a trial was outstanding.
    pub rejected_requests: u64,
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;

//! # Retry Module
//!
//! Classification-aware retry of upstream calls.
//!
//! [`RetryPolicy`] computes the backoff schedule; [`RetryExecutor`] runs an
//! operation under that policy, consulting the circuit breaker before every
//! attempt and the token coordinator after an auth failure.

use rand::Rng;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::ErrorClass;

mod executor;
pub use executor::RetryExecutor;

// ============================================================================
// Retry Policy
// ============================================================================

/// Retry budget and exponential backoff schedule.
///
/// The delay after the failed attempt with 0-based index `n` is
/// `min(initial_delay * backoff_multiplier^n, max_delay)`, plus
/// `rate_limit_penalty` when the attempt was rate limited.
///
/// # Examples
///
/// ```rust
/// use relay_keeper_core::retry::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::default();
/// assert_eq!(policy.calculate_delay(0), Duration::from_secs(1));
/// assert_eq!(policy.calculate_delay(3), Duration::from_secs(8));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per call, the first one included
    pub max_attempts: u32,

    /// Delay after the first failed attempt
    pub initial_delay: Duration,

    /// Maximum delay between attempts
    pub max_delay: Duration,

    /// Exponential backoff multiplier (typically 2.0)
    pub backoff_multiplier: f64,

    /// Extra wait after a rate-limited attempt
    pub rate_limit_penalty: Duration,

    /// Bound on a single attempt
    pub call_timeout: Duration,

    /// Whether to add jitter to delays
    pub use_jitter: bool,

    /// Jitter range as fraction of the delay (0.25 = ±25%)
    pub jitter_percent: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_delay: config.initial_delay(),
            max_delay: config.max_delay(),
            backoff_multiplier: config.backoff_multiplier,
            rate_limit_penalty: config.rate_limit_penalty(),
            call_timeout: config.call_timeout(),
            use_jitter: config.use_jitter,
            jitter_percent: config.jitter_percent.clamp(0.0, 1.0),
        }
    }
}

impl RetryPolicy {
    /// Create a policy without jitter.
    ///
    /// # Arguments
    ///
    /// * `max_attempts` - Total attempts, the first one included
    /// * `initial_delay` - Delay after the first failed attempt
    /// * `max_delay` - Maximum delay cap
    /// * `backoff_multiplier` - Exponential growth factor
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            backoff_multiplier,
            ..Self::default()
        }
    }

    /// Set the extra wait after a rate-limited attempt.
    pub fn with_rate_limit_penalty(mut self, penalty: Duration) -> Self {
        self.rate_limit_penalty = penalty;
        self
    }

    /// Set the bound on a single attempt.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Calculate the backoff delay after a failed attempt.
    ///
    /// # Arguments
    ///
    /// * `attempt` - 0-based index of the attempt that failed
    ///
    /// # Returns
    ///
    /// Duration to wait before the next attempt, capped at `max_delay`
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base_delay_secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);

        let capped_delay_secs = base_delay_secs.min(self.max_delay.as_secs_f64());

        let final_delay_secs = if self.use_jitter {
            Self::add_jitter(capped_delay_secs, self.jitter_percent)
        } else {
            capped_delay_secs
        };

        Duration::from_secs_f64(final_delay_secs)
    }

    /// Calculate the delay after a failed attempt of a given class.
    pub fn delay_for(&self, class: ErrorClass, attempt: u32) -> Duration {
        let delay = self.calculate_delay(attempt);
        if class == ErrorClass::RateLimited {
            delay + self.rate_limit_penalty
        } else {
            delay
        }
    }

    /// Plan the next attempt after a failure.
    ///
    /// # Arguments
    ///
    /// * `class` - Classification of the failure
    /// * `attempts_made` - Attempts counted against the budget so far
    ///
    /// # Returns
    ///
    /// `None` when the class is not retryable or the budget is used up
    pub fn plan_retry(&self, class: ErrorClass, attempts_made: u32) -> Option<RetryAttempt> {
        if !class.is_retryable() || attempts_made >= self.max_attempts {
            return None;
        }

        let failed_index = attempts_made.saturating_sub(1);
        Some(RetryAttempt {
            attempt_number: attempts_made + 1,
            delay: self.delay_for(class, failed_index),
            error_class: class,
        })
    }

    fn add_jitter(delay_secs: f64, jitter_percent: f64) -> f64 {
        let jitter_range = delay_secs * jitter_percent;
        if jitter_range <= 0.0 {
            return delay_secs;
        }

        let jitter = rand::rng().random_range(-jitter_range..=jitter_range);
        (delay_secs + jitter).max(0.0)
    }
}

// ============================================================================
// Retry Attempt
// ============================================================================

/// A scheduled retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryAttempt {
    /// 1-based number of the attempt about to be made
    pub attempt_number: u32,

    /// Wait before making it
    pub delay: Duration,

    /// Classification of the failure that caused it
    pub error_class: ErrorClass,
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;

//! Configuration for the resilient-call components.
//!
//! Every section has serde defaults so that a configuration file only needs
//! the upstream credentials. Durations are expressed in whole seconds or
//! milliseconds, the unit is part of the field name.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::dedupe::DedupeConfig;
use crate::process_lock::LockConfig;
use crate::token::{Credential, SecretValue};

// ============================================================================
// Errors
// ============================================================================

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid configuration for '{field}': {message}")]
    Invalid { field: String, message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Invalid URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },

    #[error("Failed to build HTTP client: {message}")]
    HttpClient { message: String },
}

impl ConfigError {
    fn invalid(field: &str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

// ============================================================================
// Relay Configuration
// ============================================================================

/// Configuration of one upstream and everything guarding calls to it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Circuit breaker thresholds
    pub circuit_breaker: CircuitBreakerConfig,

    /// Retry budget and backoff
    pub retry: RetryConfig,

    /// Dedupe retention
    pub dedupe: DedupeConfig,

    /// Cross-process lock directory and timing
    pub lock: LockConfig,

    /// OAuth credentials of the upstream
    pub credentials: CredentialsConfig,
}

impl RelayConfig {
    /// Check every section for values the components cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                "circuit_breaker.failure_threshold",
                "must be at least 1",
            ));
        }
        if self.circuit_breaker.reset_timeout_seconds == 0 {
            return Err(ConfigError::invalid(
                "circuit_breaker.reset_timeout_seconds",
                "must be at least 1",
            ));
        }

        self.retry.validate()?;
        self.dedupe.validate()?;
        self.lock.validate()?;
        self.credentials.validate()?;

        Ok(())
    }
}

// ============================================================================
// Retry Configuration
// ============================================================================

/// Retry budget and backoff schedule.
///
/// # Default Configuration
///
/// - 5 attempts in total
/// - 1 s initial delay, doubling, capped at 30 s
/// - 5 s extra wait after a rate-limited attempt
/// - 30 s per-call timeout
/// - no jitter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per call, the first one included
    pub max_attempts: u32,

    /// Delay after the first failed attempt (milliseconds)
    pub initial_delay_ms: u64,

    /// Growth factor between consecutive delays
    pub backoff_multiplier: f64,

    /// Upper bound of a backoff delay (milliseconds)
    pub max_delay_ms: u64,

    /// Added to the backoff delay after a rate-limited attempt (milliseconds)
    pub rate_limit_penalty_ms: u64,

    /// Bound on a single attempt (seconds)
    pub call_timeout_seconds: u64,

    /// Randomize delays by `jitter_percent`
    pub use_jitter: bool,

    /// Jitter range as fraction of the delay (0.0 to 1.0)
    pub jitter_percent: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            max_delay_ms: 30_000,
            rate_limit_penalty_ms: 5_000,
            call_timeout_seconds: 30,
            use_jitter: false,
            jitter_percent: 0.25,
        }
    }
}

impl RetryConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "retry.backoff_multiplier",
                format!("must be at least 1.0, got {}", self.backoff_multiplier),
            ));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(ConfigError::invalid(
                "retry.max_delay_ms",
                format!(
                    "{}ms is less than initial_delay_ms {}ms",
                    self.max_delay_ms, self.initial_delay_ms
                ),
            ));
        }
        if self.call_timeout_seconds == 0 {
            return Err(ConfigError::invalid(
                "retry.call_timeout_seconds",
                "must be at least 1",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_percent) {
            return Err(ConfigError::invalid(
                "retry.jitter_percent",
                format!("must be between 0.0 and 1.0, got {}", self.jitter_percent),
            ));
        }
        Ok(())
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn rate_limit_penalty(&self) -> Duration {
        Duration::from_millis(self.rate_limit_penalty_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_seconds)
    }
}

// ============================================================================
// Credentials Configuration
// ============================================================================

/// OAuth credentials and token endpoint of the upstream.
///
/// Only deserializable: the secrets are never written back out.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// OAuth token endpoint
    pub token_url: String,

    pub client_id: String,
    pub client_secret: SecretValue,
    pub refresh_token: SecretValue,

    /// Access token to start with; refreshed before first use when absent
    pub access_token: Option<SecretValue>,

    /// Bound on one token exchange (seconds)
    pub refresh_timeout_seconds: u64,

    /// Refresh proactively when the token expires within this window (seconds)
    pub refresh_margin_seconds: u64,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            token_url: String::new(),
            client_id: String::new(),
            client_secret: SecretValue::new(""),
            refresh_token: SecretValue::new(""),
            access_token: None,
            refresh_timeout_seconds: 30,
            refresh_margin_seconds: 60,
        }
    }
}

impl CredentialsConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.token_url.trim().is_empty() {
            return Err(ConfigError::Missing {
                key: "credentials.token_url".to_string(),
            });
        }
        if let Err(e) = url::Url::parse(&self.token_url) {
            return Err(ConfigError::InvalidUrl {
                url: self.token_url.clone(),
                message: e.to_string(),
            });
        }
        if self.client_id.trim().is_empty() {
            return Err(ConfigError::Missing {
                key: "credentials.client_id".to_string(),
            });
        }
        if self.refresh_token.is_empty() {
            return Err(ConfigError::Missing {
                key: "credentials.refresh_token".to_string(),
            });
        }
        if self.refresh_timeout_seconds == 0 {
            return Err(ConfigError::invalid(
                "credentials.refresh_timeout_seconds",
                "must be at least 1",
            ));
        }
        Ok(())
    }

    /// Build the initial credential held by the token coordinator.
    pub fn to_credential(&self) -> Credential {
        let credential = Credential::new(
            self.client_id.clone(),
            self.client_secret.clone(),
            self.refresh_token.clone(),
        );

        match &self.access_token {
            Some(token) if !token.is_empty() => credential.with_access_token(token.clone()),
            _ => credential,
        }
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_seconds)
    }

    pub fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.refresh_margin_seconds)
    }
}

impl DedupeConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.ttl_seconds == 0 {
            return Err(ConfigError::invalid("dedupe.ttl_seconds", "must be at least 1"));
        }
        if self.sweep_interval_seconds == 0 {
            return Err(ConfigError::invalid(
                "dedupe.sweep_interval_seconds",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

impl LockConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.directory.as_os_str().is_empty() {
            return Err(ConfigError::Missing {
                key: "lock.directory".to_string(),
            });
        }
        if self.stale_after_seconds == 0 {
            return Err(ConfigError::invalid(
                "lock.stale_after_seconds",
                "must be at least 1",
            ));
        }
        if self.release_delay_seconds == 0 {
            return Err(ConfigError::invalid(
                "lock.release_delay_seconds",
                "must be at least 1",
            ));
        }
        if self.release_delay_seconds >= self.stale_after_seconds {
            return Err(ConfigError::invalid(
                "lock.release_delay_seconds",
                "must be shorter than stale_after_seconds",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

//! # Relay-Keeper Core
//!
//! Resilient-call core for forwarding webhook events to unreliable,
//! rate-limited upstream APIs.
//!
//! Webhook handlers hand the core an operation (one upstream request) and an
//! [`Identity`] (what the request is about). The core makes sure that:
//!
//! - the same logical event is not processed twice in one process
//!   ([`dedupe`]) or by two processes on one host ([`process_lock`]),
//! - failing requests are retried with bounded exponential backoff
//!   ([`retry`]),
//! - an expired bearer token is refreshed exactly once even when many
//!   requests notice the expiry at the same time ([`token`]),
//! - a degraded upstream is not hammered ([`circuit_breaker`]).
//!
//! [`resilient::ResilientCall`] composes all of the above and
//! [`dispatch::Dispatcher`] runs it detached from the inbound request.
//!
//! ## Usage
//!
//! ```rust
//! use relay_keeper_core::Identity;
//!
//! let identity = Identity::from_parts(["spring-campaign", "lead-42", "+31612345678"]).unwrap();
//! assert_eq!(identity.as_str(), "spring-campaign:lead-42:+31612345678");
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Maximum length of an identity string.
pub const MAX_IDENTITY_LENGTH: usize = 512;

// ============================================================================
// Identity
// ============================================================================

/// Stable identifier of one logical unit of work.
///
/// Used both as dedupe key and as the basis of the lock file name. Callers
/// build it from fields that stay the same across redeliveries of the same
/// webhook (campaign, contact, destination), never from payload content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity(String);

impl Identity {
    /// Create new identity with validation
    ///
    /// # Validation Rules
    /// - Must not be empty
    /// - Must be at most 512 characters
    /// - Must not contain control characters
    pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();

        if value.trim().is_empty() {
            return Err(ValidationError::Required {
                field: "identity".to_string(),
            });
        }

        if value.len() > MAX_IDENTITY_LENGTH {
            return Err(ValidationError::TooLong {
                field: "identity".to_string(),
                max_length: MAX_IDENTITY_LENGTH,
            });
        }

        if value.chars().any(|c| c.is_control()) {
            return Err(ValidationError::InvalidCharacters {
                field: "identity".to_string(),
                invalid_chars: "control characters".to_string(),
            });
        }

        Ok(Self(value))
    }

    /// Create identity from component parts joined with `:`
    ///
    /// Empty parts are rejected so that `("a", "", "b")` and `("a", "b")`
    /// can never collide.
    pub fn from_parts<I, S>(parts: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut joined = String::new();
        for (index, part) in parts.into_iter().enumerate() {
            let part = part.as_ref();
            if part.is_empty() {
                return Err(ValidationError::InvalidFormat {
                    field: "identity".to_string(),
                    message: format!("part {} is empty", index),
                });
            }
            if index > 0 {
                joined.push(':');
            }
            joined.push_str(part);
        }
        Self::new(joined)
    }

    /// Get string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Identity {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

// ============================================================================
// Time
// ============================================================================

/// UTC wall-clock timestamp
///
/// Monotonic decisions (cool-downs, TTLs) use `tokio::time::Instant`; this
/// type is for values that are reported or written to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current moment
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// Add duration to timestamp
    pub fn add_duration(&self, duration: Duration) -> Self {
        let chrono_duration = chrono::Duration::from_std(duration).unwrap_or_default();
        Self(self.0 + chrono_duration)
    }

    /// Subtract duration from timestamp
    pub fn subtract_duration(&self, duration: Duration) -> Self {
        let chrono_duration = chrono::Duration::from_std(duration).unwrap_or_default();
        Self(self.0 - chrono_duration)
    }

    /// Get duration since another timestamp, zero if `other` is later
    pub fn duration_since(&self, other: Self) -> Duration {
        self.0
            .signed_duration_since(other.0)
            .to_std()
            .unwrap_or_default()
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(value: DateTime<Utc>) -> Self {
        Self(value)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Error type for input validation failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ValidationError {
    #[error("Field '{field}' is required")]
    Required { field: String },

    #[error("Field '{field}' has invalid format: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Field '{field}' exceeds maximum length of {max_length}")]
    TooLong { field: String, max_length: usize },

    #[error("Field '{field}' contains invalid characters: {invalid_chars}")]
    InvalidCharacters {
        field: String,
        invalid_chars: String,
    },

    #[error("Field '{field}' is out of range: {message}")]
    OutOfRange { field: String, message: String },
}

// ============================================================================
// Module declarations
// ============================================================================

/// Failure classification and call errors
pub mod error;

/// Configuration for every core component
pub mod config;

/// Circuit breaker guarding one upstream
pub mod circuit_breaker;

/// Bearer credential and single-flight refresh
pub mod token;

/// Classification-aware retry with backoff
pub mod retry;

/// In-memory registry of handled identities
pub mod dedupe;

/// Filesystem-backed cross-process lock
pub mod process_lock;

/// Facade composing dedupe, lock and retry
pub mod resilient;

/// Detached execution of resilient calls
pub mod dispatch;

// Re-export key types for convenience
pub use circuit_breaker::{
    CircuitBreakerConfig, CircuitSnapshot, CircuitState, UpstreamCircuitBreaker,
};
pub use config::{ConfigError, CredentialsConfig, RelayConfig, RetryConfig};
pub use dedupe::{DedupeBatch, DedupeConfig, DedupeKey, DedupeRegistry};
pub use dispatch::{CompletionObserver, DispatchReport, Dispatcher, TracingCompletionObserver};
pub use error::{
    AttemptFailure, CallError, Classify, ErrorClass, StatusCodeClassifier, UpstreamError,
    UpstreamFailure,
};
pub use process_lock::{
    LockAcquisition, LockConfig, LockError, LockHandle, LockRecord, ProcessLock,
};
pub use resilient::{CompletionPolicy, ResilientCall, RunOutcome};
pub use retry::{RetryAttempt, RetryExecutor, RetryPolicy};
pub use token::{
    BearerToken, Credential, OAuthRefreshClient, RefreshError, RefreshOutcome, SecretValue,
    TokenCoordinator, TokenGrant, TokenRefresher,
};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

//! Failure classification and the errors surfaced by resilient calls.
//!
//! Every failed upstream attempt is mapped to an [`ErrorClass`]. The class
//! decides whether the attempt is retried, whether it refreshes the bearer
//! token and whether it counts against the circuit breaker.
//!
//! | Class          | Source                      | Retried        | Breaker |
//! |----------------|-----------------------------|----------------|---------|
//! | `AuthExpired`  | 401                         | once, after refresh | no |
//! | `RateLimited`  | 429                         | yes, with penalty   | no |
//! | `ServerError`  | 5xx                         | yes            | yes     |
//! | `NetworkError` | connect / timeout           | yes            | yes     |
//! | `ClientError`  | other 4xx                   | never          | no      |

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::process_lock::LockError;

// ============================================================================
// Error Classification
// ============================================================================

/// Classification of a failed upstream attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Bearer token rejected; recoverable through a token refresh.
    AuthExpired,
    /// Upstream quota exhausted; recoverable by waiting.
    RateLimited,
    /// Upstream failed to serve a valid request.
    ServerError,
    /// The request itself is invalid; never recoverable by retrying.
    ClientError,
    /// The upstream could not be reached or did not answer in time.
    NetworkError,
}

impl ErrorClass {
    /// Classify an HTTP status code.
    ///
    /// Returns `None` for statuses that are not failures (1xx-3xx).
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            401 => Some(Self::AuthExpired),
            429 => Some(Self::RateLimited),
            500..=599 => Some(Self::ServerError),
            400..=499 => Some(Self::ClientError),
            _ => None,
        }
    }

    /// Check if failures of this class are retried with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::ServerError | Self::NetworkError
        )
    }

    /// Check if failures of this class indicate upstream distress.
    ///
    /// Only these classes are recorded as failures by the circuit breaker.
    pub fn counts_toward_circuit(&self) -> bool {
        matches!(self, Self::ServerError | Self::NetworkError)
    }

    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthExpired => "auth_expired",
            Self::RateLimited => "rate_limited",
            Self::ServerError => "server_error",
            Self::ClientError => "client_error",
            Self::NetworkError => "network_error",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Upstream Failures
// ============================================================================

/// Errors that carry enough information to be classified by status code.
pub trait UpstreamFailure {
    /// HTTP status code returned by the upstream, if any.
    fn status_code(&self) -> Option<u16>;

    /// Whether the failure happened before a response was received.
    fn is_connectivity(&self) -> bool;
}

/// General-purpose upstream failure for operations that are not built on
/// `reqwest` directly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamError {
    /// Upstream answered with a non-success status.
    #[error("Upstream returned status {status}: {message}")]
    Status { status: u16, message: String },

    /// Connection could not be established or was dropped.
    #[error("Network error: {message}")]
    Network { message: String },

    /// Upstream did not answer in time.
    #[error("Request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

impl UpstreamError {
    /// Create a status failure.
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    /// Create a network failure.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }
}

impl UpstreamFailure for UpstreamError {
    fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    fn is_connectivity(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Timeout { .. })
    }
}

impl UpstreamFailure for reqwest::Error {
    fn status_code(&self) -> Option<u16> {
        self.status().map(|status| status.as_u16())
    }

    fn is_connectivity(&self) -> bool {
        self.is_connect() || self.is_timeout() || self.is_request()
    }
}

// ============================================================================
// Classifier
// ============================================================================

/// Maps an operation error to an [`ErrorClass`].
///
/// Implemented by [`StatusCodeClassifier`] for any [`UpstreamFailure`] and by
/// plain closures `Fn(&E) -> ErrorClass`.
pub trait Classify<E>: Send + Sync {
    /// Classify a failed attempt.
    fn classify(&self, error: &E) -> ErrorClass;

    /// Status code to report alongside the failure, if known.
    fn status_code(&self, _error: &E) -> Option<u16> {
        None
    }
}

impl<E, F> Classify<E> for F
where
    F: Fn(&E) -> ErrorClass + Send + Sync,
{
    fn classify(&self, error: &E) -> ErrorClass {
        self(error)
    }
}

/// Default classifier using HTTP status-code conventions.
///
/// - 401 → `AuthExpired`
/// - 429 → `RateLimited`
/// - 5xx → `ServerError`
/// - other 4xx → `ClientError`
/// - connection or timeout failures → `NetworkError`
///
/// A failure without status that is not a connectivity failure (for example
/// a dropped body) is treated as `NetworkError`; a non-failure status that was
/// nevertheless reported as an error (3xx) is treated as `ClientError`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusCodeClassifier;

impl<E: UpstreamFailure> Classify<E> for StatusCodeClassifier {
    fn classify(&self, error: &E) -> ErrorClass {
        if error.is_connectivity() {
            return ErrorClass::NetworkError;
        }

        match error.status_code() {
            Some(status) => ErrorClass::from_status(status).unwrap_or(ErrorClass::ClientError),
            None => ErrorClass::NetworkError,
        }
    }

    fn status_code(&self, error: &E) -> Option<u16> {
        error.status_code()
    }
}

// ============================================================================
// Call Errors
// ============================================================================

/// Failure of a single attempt.
#[derive(Debug, Error)]
pub enum AttemptFailure<E> {
    /// The operation returned an error.
    #[error("{0}")]
    Upstream(E),

    /// The operation did not complete within the per-call timeout.
    #[error("Call timed out after {timeout_ms}ms")]
    TimedOut { timeout_ms: u64 },
}

impl<E> AttemptFailure<E> {
    /// Get the operation error, if the attempt did not time out.
    pub fn upstream(&self) -> Option<&E> {
        match self {
            Self::Upstream(error) => Some(error),
            Self::TimedOut { .. } => None,
        }
    }

    /// Take the operation error, if the attempt did not time out.
    pub fn into_upstream(self) -> Option<E> {
        match self {
            Self::Upstream(error) => Some(error),
            Self::TimedOut { .. } => None,
        }
    }
}

/// Error surfaced to the caller of a resilient call.
///
/// Carries the classification, the number of attempts made and the last
/// status code so that callers can log or report with full context.
#[derive(Debug, Error)]
pub enum CallError<E> {
    /// The circuit breaker refused the request; nothing was sent.
    #[error("Circuit breaker is open - request rejected after {attempts} attempt(s)")]
    CircuitOpen { attempts: u32 },

    /// The failure class is not retryable.
    #[error("Non-retryable {class} failure after {attempts} attempt(s): {failure}")]
    NonRetryable {
        class: ErrorClass,
        attempts: u32,
        status: Option<u16>,
        failure: AttemptFailure<E>,
    },

    /// The retry budget was used up.
    #[error("Retries exhausted after {attempts} attempt(s), last {class} failure: {failure}")]
    Exhausted {
        class: ErrorClass,
        attempts: u32,
        status: Option<u16>,
        failure: AttemptFailure<E>,
    },

    /// The token could not be refreshed after an auth failure.
    ///
    /// `failure` is the original auth failure; `reason` describes why the
    /// refresh did not succeed.
    #[error("Authentication failed after {attempts} attempt(s) and token refresh failed ({reason}): {failure}")]
    RefreshFailed {
        attempts: u32,
        status: Option<u16>,
        reason: String,
        failure: AttemptFailure<E>,
    },

    /// The cross-process lock could not be managed.
    #[error("Process lock error: {0}")]
    Lock(#[from] LockError),
}

impl<E> CallError<E> {
    /// Classification of the last failure, if an attempt was made.
    pub fn error_class(&self) -> Option<ErrorClass> {
        match self {
            Self::NonRetryable { class, .. } | Self::Exhausted { class, .. } => Some(*class),
            Self::RefreshFailed { .. } => Some(ErrorClass::AuthExpired),
            Self::CircuitOpen { .. } | Self::Lock(_) => None,
        }
    }

    /// Number of attempts made before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::CircuitOpen { attempts }
            | Self::NonRetryable { attempts, .. }
            | Self::Exhausted { attempts, .. }
            | Self::RefreshFailed { attempts, .. } => *attempts,
            Self::Lock(_) => 0,
        }
    }

    /// Last status code returned by the upstream, if known.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::NonRetryable { status, .. }
            | Self::Exhausted { status, .. }
            | Self::RefreshFailed { status, .. } => *status,
            Self::CircuitOpen { .. } | Self::Lock(_) => None,
        }
    }

    /// Check if a later redelivery of the same work may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::CircuitOpen { .. } => true,
            Self::Exhausted { .. } => true,
            Self::Lock(_) => true,
            Self::NonRetryable { .. } => false,
            Self::RefreshFailed { .. } => false,
        }
    }

    /// Take the last attempt failure, if an attempt was made.
    pub fn into_failure(self) -> Option<AttemptFailure<E>> {
        match self {
            Self::NonRetryable { failure, .. }
            | Self::Exhausted { failure, .. }
            | Self::RefreshFailed { failure, .. } => Some(failure),
            Self::CircuitOpen { .. } | Self::Lock(_) => None,
        }
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;

//! Bearer credential management with single-flight refresh.
//!
//! The [`TokenCoordinator`] owns the OAuth credential for one upstream. All
//! requests read the current access token from it; when a request comes back
//! with 401 the coordinator exchanges the refresh token for a new access
//! token. However many requests notice the expiry at the same time, exactly
//! one exchange is sent and every waiting caller shares its outcome. Upstream
//! OAuth servers typically reject the second use of a refresh token, so a
//! second concurrent exchange would fail even when the first succeeded.
//!
//! The network exchange itself sits behind the [`TokenRefresher`] trait;
//! [`OAuthRefreshClient`] is the `reqwest` implementation.

use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::Timestamp;

mod coordinator;
mod oauth;

pub use coordinator::TokenCoordinator;
pub use oauth::OAuthRefreshClient;

// ============================================================================
// Secret Value
// ============================================================================

/// Secret string that is zeroed on drop and never printed.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop, Deserialize)]
#[serde(transparent)]
pub struct SecretValue(String);

impl SecretValue {
    /// Wrap a secret string.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Get the secret (only for immediate use).
    pub fn expose_secret(&self) -> &str {
        &self.0
    }

    /// Check if the secret is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretValue")
            .field("length", &self.0.len())
            .field("value", &"[REDACTED]")
            .finish()
    }
}

// ============================================================================
// Credential
// ============================================================================

/// OAuth client credential for one upstream.
#[derive(Debug, Clone)]
pub struct Credential {
    pub client_id: String,
    pub client_secret: SecretValue,
    pub refresh_token: SecretValue,
    /// Current access token; `None` until the first refresh.
    pub access_token: Option<SecretValue>,
    /// When the access token expires, if the upstream said so.
    pub expires_at: Option<Timestamp>,
}

impl Credential {
    /// Create a credential without an access token.
    pub fn new(
        client_id: impl Into<String>,
        client_secret: SecretValue,
        refresh_token: SecretValue,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret,
            refresh_token,
            access_token: None,
            expires_at: None,
        }
    }

    /// Set the initial access token.
    pub fn with_access_token(mut self, access_token: SecretValue) -> Self {
        self.access_token = Some(access_token);
        self
    }

    /// Set the access token expiry.
    pub fn with_expires_at(mut self, expires_at: Timestamp) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Check if the access token is missing or expires within `margin`.
    pub fn needs_refresh(&self, margin: Duration) -> bool {
        match (&self.access_token, self.expires_at) {
            (None, _) => true,
            (Some(token), _) if token.is_empty() => true,
            (Some(_), Some(expires_at)) => Timestamp::now() >= expires_at.subtract_duration(margin),
            (Some(_), None) => false,
        }
    }

    /// Apply a successful grant; keeps the refresh token unless rotated.
    pub(crate) fn apply_grant(&mut self, grant: TokenGrant) {
        let TokenGrant {
            access_token,
            refresh_token,
            expires_in,
        } = grant;

        self.access_token = Some(access_token);
        if let Some(rotated) = refresh_token {
            self.refresh_token = rotated;
        }
        self.expires_at = expires_in.map(|ttl| Timestamp::now().add_duration(ttl));
    }
}

// ============================================================================
// Bearer Token
// ============================================================================

/// Access token handed to an operation for one attempt.
///
/// `generation` identifies the refresh generation the token was read in, so
/// that a caller reporting an auth failure with it can be matched to a
/// refresh that already happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerToken {
    value: SecretValue,
    generation: u64,
}

impl BearerToken {
    pub(crate) fn new(value: SecretValue, generation: u64) -> Self {
        Self { value, generation }
    }

    /// Get the raw access token (only for immediate use).
    pub fn expose_secret(&self) -> &str {
        self.value.expose_secret()
    }

    /// Format as an `Authorization` header value.
    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.value.expose_secret())
    }

    /// Refresh generation this token was read in.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

// ============================================================================
// Refresh Types
// ============================================================================

/// Result of a successful token exchange.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: SecretValue,
    /// New refresh token, when the upstream rotates them.
    pub refresh_token: Option<SecretValue>,
    pub expires_in: Option<Duration>,
}

/// Errors from the token refresh exchange.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefreshError {
    /// The circuit breaker refused the request; nothing was sent.
    #[error("Refresh skipped: circuit breaker is open")]
    CircuitOpen,

    /// The endpoint rejected the credential (4xx or an OAuth error body).
    #[error("Refresh endpoint rejected credentials (status {status}): {message}")]
    Rejected { status: u16, message: String },

    /// The endpoint failed to serve the request (5xx).
    #[error("Refresh endpoint server error (status {status}): {message}")]
    ServerError { status: u16, message: String },

    /// The endpoint could not be reached or timed out.
    #[error("Refresh endpoint unreachable: {message}")]
    Network { message: String },

    /// The response body could not be parsed.
    #[error("Malformed refresh response: {message}")]
    MalformedResponse { message: String },

    /// The response parsed but carried no access token.
    #[error("Refresh response did not contain an access_token")]
    MissingAccessToken,
}

impl RefreshError {
    /// Check if this refresh failure is evidence of upstream distress.
    ///
    /// Rejected credentials and malformed bodies are not: they say nothing
    /// about whether the service is healthy.
    pub fn counts_toward_circuit(&self) -> bool {
        matches!(self, Self::ServerError { .. } | Self::Network { .. })
    }
}

/// Outcome of [`TokenCoordinator::ensure_fresh_after_auth_failure`].
///
/// Every caller waiting on the same refresh receives the same outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A fresh token is available in the given generation.
    Refreshed { generation: u64 },

    /// The refresh failed.
    Failed(RefreshError),
}

impl RefreshOutcome {
    /// Check if a fresh token is available.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Refreshed { .. })
    }
}

// ============================================================================
// Token Refresher
// ============================================================================

/// Performs the network exchange of a refresh token for an access token.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Exchange the credential's refresh token for a new access token.
    async fn refresh(&self, credential: &Credential) -> Result<TokenGrant, RefreshError>;
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;

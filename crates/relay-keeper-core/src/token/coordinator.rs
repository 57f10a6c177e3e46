//! Single-flight token refresh coordination.

use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::{BearerToken, Credential, RefreshError, RefreshOutcome, SecretValue, TokenRefresher};
use crate::circuit_breaker::UpstreamCircuitBreaker;

/// Default window before expiry in which a token is refreshed proactively.
pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Default bound on one refresh exchange.
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct TokenState {
    credential: Credential,

    /// Incremented after every refresh exchange, successful or not. A refresh
    /// refused by the circuit breaker is not an exchange.
    generation: u64,
}

/// Holds the bearer credential for one upstream and refreshes it at most
/// once at a time.
///
/// Readers take a [`BearerToken`] snapshot with [`token`](Self::token). A
/// caller whose request failed with 401 passes that snapshot back to
/// [`ensure_fresh_after_auth_failure`](Self::ensure_fresh_after_auth_failure):
///
/// - if a refresh completed since the snapshot was taken, its outcome is
///   returned without another exchange;
/// - if a refresh is in flight, the caller waits for it and shares its
///   outcome;
/// - otherwise the caller performs the exchange while everyone else waits.
pub struct TokenCoordinator {
    state: RwLock<TokenState>,
    refresher: Arc<dyn TokenRefresher>,
    circuit_breaker: Arc<UpstreamCircuitBreaker>,

    /// Serializes refresh attempts; holds the outcome of the latest one
    refresh_gate: Mutex<Option<RefreshOutcome>>,

    refresh_margin: Duration,
    refresh_timeout: Duration,
}

impl TokenCoordinator {
    /// Create a coordinator for a credential.
    pub fn new(
        credential: Credential,
        refresher: Arc<dyn TokenRefresher>,
        circuit_breaker: Arc<UpstreamCircuitBreaker>,
    ) -> Self {
        Self {
            state: RwLock::new(TokenState {
                credential,
                generation: 0,
            }),
            refresher,
            circuit_breaker,
            refresh_gate: Mutex::new(None),
            refresh_margin: DEFAULT_REFRESH_MARGIN,
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
        }
    }

    /// Set the proactive refresh margin.
    pub fn with_refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = margin;
        self
    }

    /// Set the bound on one refresh exchange.
    pub fn with_refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    /// Get the current access token.
    ///
    /// The token value is empty when no access token has been obtained yet.
    pub fn token(&self) -> BearerToken {
        let state = match self.state.read() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };

        let value = state
            .credential
            .access_token
            .clone()
            .unwrap_or_else(|| SecretValue::new(String::new()));

        BearerToken::new(value, state.generation)
    }

    /// Current refresh generation.
    pub fn generation(&self) -> u64 {
        match self.state.read() {
            Ok(state) => state.generation,
            Err(poisoned) => poisoned.into_inner().generation,
        }
    }

    /// Get a token for the next request, refreshing first when the stored
    /// token is missing or about to expire.
    ///
    /// A failed proactive refresh is logged and the current token returned;
    /// the request's own 401 handling takes over from there.
    pub async fn token_for_request(&self) -> BearerToken {
        let token = self.token();

        let needs_refresh = match self.state.read() {
            Ok(state) => state.credential.needs_refresh(self.refresh_margin),
            Err(poisoned) => poisoned.into_inner().credential.needs_refresh(self.refresh_margin),
        };

        if !needs_refresh {
            return token;
        }

        debug!(generation = token.generation(), "Access token missing or near expiry, refreshing");
        match self.refresh_after(&token).await {
            RefreshOutcome::Refreshed { .. } => self.token(),
            RefreshOutcome::Failed(e) => {
                warn!(error = %e, "Proactive token refresh failed, using current token");
                token
            }
        }
    }

    /// Refresh the credential after a request authenticated with `observed`
    /// was rejected.
    pub async fn ensure_fresh_after_auth_failure(&self, observed: &BearerToken) -> RefreshOutcome {
        self.refresh_after(observed).await
    }

    async fn refresh_after(&self, observed: &BearerToken) -> RefreshOutcome {
        let mut last_outcome = self.refresh_gate.lock().await;

        // A refresh completed while this caller was waiting or after it read
        // its token: share that outcome instead of exchanging again.
        if self.generation() != observed.generation() {
            if let Some(outcome) = last_outcome.as_ref() {
                debug!(
                    observed_generation = observed.generation(),
                    "Sharing outcome of completed token refresh"
                );
                return outcome.clone();
            }
        }

        // Refused before any exchange: neither recorded nor shared, so the
        // next caller asks the breaker again.
        if !self.circuit_breaker.can_make_request() {
            warn!("Token refresh skipped: circuit breaker is open");
            return RefreshOutcome::Failed(RefreshError::CircuitOpen);
        }

        let outcome = self.perform_refresh().await;
        *last_outcome = Some(outcome.clone());
        outcome
    }

    /// Runs with the refresh gate held and the breaker's permission taken.
    async fn perform_refresh(&self) -> RefreshOutcome {
        let credential = match self.state.read() {
            Ok(state) => state.credential.clone(),
            Err(poisoned) => poisoned.into_inner().credential.clone(),
        };

        let result = match tokio::time::timeout(
            self.refresh_timeout,
            self.refresher.refresh(&credential),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(RefreshError::Network {
                message: format!(
                    "refresh timed out after {}ms",
                    self.refresh_timeout.as_millis()
                ),
            }),
        };

        match &result {
            Ok(_) => self.circuit_breaker.record_success(),
            Err(e) if e.counts_toward_circuit() => self.circuit_breaker.record_server_failure(),
            Err(_) => self.circuit_breaker.record_neutral_outcome(),
        }

        self.complete(result)
    }

    fn complete(&self, result: Result<super::TokenGrant, RefreshError>) -> RefreshOutcome {
        let mut state = match self.state.write() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.generation += 1;
        let generation = state.generation;

        match result {
            Ok(grant) => {
                state.credential.apply_grant(grant);
                info!(
                    generation,
                    expires_at = ?state.credential.expires_at,
                    "Access token refreshed"
                );
                RefreshOutcome::Refreshed { generation }
            }
            Err(e) => {
                error!(generation, error = %e, "Access token refresh failed");
                RefreshOutcome::Failed(e)
            }
        }
    }
}

impl std::fmt::Debug for TokenCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCoordinator")
            .field("generation", &self.generation())
            .field("refresh_margin", &self.refresh_margin)
            .field("refresh_timeout", &self.refresh_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "coordinator_tests.rs"]
mod tests;

//! Resilient call facade.
//!
//! [`ResilientCall::run`] is the single entry point webhook handlers use to
//! perform an upstream request for an identity:
//!
//! 1. A dedupe hit returns [`RunOutcome::AlreadyHandled`].
//! 2. A busy process lock returns [`RunOutcome::ConcurrentlyHandled`].
//! 3. Otherwise the operation runs through the [`RetryExecutor`].
//! 4. On success the identity is marked handled and the lock released
//!    according to the [`CompletionPolicy`].
//! 5. On failure the lock is released immediately and the classified error
//!    returned; nothing is marked handled, so a redelivery may try again.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::circuit_breaker::UpstreamCircuitBreaker;
use crate::config::{ConfigError, RelayConfig};
use crate::dedupe::{DedupeBatch, DedupeKey, DedupeRegistry};
use crate::error::{CallError, Classify};
use crate::process_lock::{LockAcquisition, LockHandle, ProcessLock};
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::token::{BearerToken, TokenCoordinator, TokenRefresher};
use crate::Identity;

// ============================================================================
// Outcome Types
// ============================================================================

/// What happens to the process lock after a successful call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionPolicy {
    /// Delete the lock file as soon as the call returns.
    ReleaseImmediately,

    /// Keep the lock file and delete it after the given delay, so that late
    /// redeliveries handled by other processes still see it.
    HoldFor(Duration),
}

impl Default for CompletionPolicy {
    fn default() -> Self {
        Self::HoldFor(Duration::from_secs(120))
    }
}

/// Successful result of [`ResilientCall::run`].
///
/// Duplicates are successes: the work is, or is being, done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome<T> {
    /// The operation ran and returned a value.
    Completed(T),

    /// The identity was handled recently; the operation did not run.
    AlreadyHandled,

    /// Another process holds the lock for the identity; the operation did
    /// not run.
    ConcurrentlyHandled,
}

impl<T> RunOutcome<T> {
    /// Check if the operation ran in this call.
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    /// Take the operation's value, if it ran.
    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            Self::AlreadyHandled | Self::ConcurrentlyHandled => None,
        }
    }
}

// ============================================================================
// Resilient Call
// ============================================================================

/// Dedupe, cross-process lock and retry composed around one upstream.
#[derive(Debug)]
pub struct ResilientCall {
    dedupe: Arc<DedupeRegistry>,
    lock: ProcessLock,
    executor: Arc<RetryExecutor>,
    completion: CompletionPolicy,
}

impl ResilientCall {
    /// Compose existing components.
    pub fn new(
        dedupe: Arc<DedupeRegistry>,
        lock: ProcessLock,
        executor: Arc<RetryExecutor>,
    ) -> Self {
        let completion = CompletionPolicy::HoldFor(lock.config().release_delay());
        Self {
            dedupe,
            lock,
            executor,
            completion,
        }
    }

    /// Build every component from configuration.
    ///
    /// # Arguments
    ///
    /// * `config` - Validated before use
    /// * `refresher` - Performs the token exchange for the upstream
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the configuration is invalid.
    pub fn from_config(
        config: &RelayConfig,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let circuit_breaker = Arc::new(UpstreamCircuitBreaker::new(config.circuit_breaker.clone()));
        let tokens = Arc::new(
            TokenCoordinator::new(
                config.credentials.to_credential(),
                refresher,
                circuit_breaker.clone(),
            )
            .with_refresh_margin(config.credentials.refresh_margin())
            .with_refresh_timeout(config.credentials.refresh_timeout()),
        );
        let executor = Arc::new(RetryExecutor::new(
            RetryPolicy::from(&config.retry),
            circuit_breaker,
            tokens,
        ));
        let dedupe = Arc::new(DedupeRegistry::new(config.dedupe.clone()));
        let lock = ProcessLock::new(config.lock.clone());

        info!(
            service = %config.circuit_breaker.service_name,
            lock_directory = %config.lock.directory.display(),
            "Resilient call components initialized"
        );

        Ok(Self::new(dedupe, lock, executor))
    }

    /// Set what happens to the lock after a successful call.
    pub fn with_completion_policy(mut self, completion: CompletionPolicy) -> Self {
        self.completion = completion;
        self
    }

    pub fn dedupe(&self) -> &Arc<DedupeRegistry> {
        &self.dedupe
    }

    pub fn lock(&self) -> &ProcessLock {
        &self.lock
    }

    pub fn executor(&self) -> &Arc<RetryExecutor> {
        &self.executor
    }

    pub fn circuit_breaker(&self) -> &Arc<UpstreamCircuitBreaker> {
        self.executor.circuit_breaker()
    }

    pub fn tokens(&self) -> &Arc<TokenCoordinator> {
        self.executor.tokens()
    }

    pub fn completion_policy(&self) -> CompletionPolicy {
        self.completion
    }

    /// Start a dedupe batch for one inbound payload.
    pub fn begin_batch(&self) -> DedupeBatch {
        self.dedupe.begin_batch()
    }

    /// Run an operation for an identity at most once.
    ///
    /// # Arguments
    ///
    /// * `identity` - What the operation is about; used as dedupe key and
    ///   lock name
    /// * `operation` - Makes one upstream request with the given token
    /// * `classifier` - Maps the operation's error to an error class
    pub async fn run<T, E, F, Fut, C>(
        &self,
        identity: &Identity,
        operation: F,
        classifier: &C,
    ) -> Result<RunOutcome<T>, CallError<E>>
    where
        F: FnMut(BearerToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
        C: Classify<E> + ?Sized,
    {
        let key = DedupeKey::from(identity);
        if self.dedupe.was_handled(&key) {
            info!(identity = %identity, "Already handled, skipping");
            return Ok(RunOutcome::AlreadyHandled);
        }

        self.run_locked(identity, key, operation, classifier).await
    }

    /// Like [`run`](Self::run), but also treats identities seen earlier in
    /// the same batch as handled.
    pub async fn run_in_batch<T, E, F, Fut, C>(
        &self,
        batch: &mut DedupeBatch,
        identity: &Identity,
        operation: F,
        classifier: &C,
    ) -> Result<RunOutcome<T>, CallError<E>>
    where
        F: FnMut(BearerToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
        C: Classify<E> + ?Sized,
    {
        let key = DedupeKey::from(identity);
        if batch.was_handled(&key) {
            info!(identity = %identity, "Already handled or repeated in batch, skipping");
            return Ok(RunOutcome::AlreadyHandled);
        }

        self.run_locked(identity, key, operation, classifier).await
    }

    async fn run_locked<T, E, F, Fut, C>(
        &self,
        identity: &Identity,
        key: DedupeKey,
        operation: F,
        classifier: &C,
    ) -> Result<RunOutcome<T>, CallError<E>>
    where
        F: FnMut(BearerToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
        C: Classify<E> + ?Sized,
    {
        let handle = match self.lock.try_acquire(identity).await? {
            LockAcquisition::Acquired(handle) => handle,
            LockAcquisition::Busy => {
                info!(identity = %identity, "Lock held by another process, skipping");
                return Ok(RunOutcome::ConcurrentlyHandled);
            }
        };

        // A task in this process may have finished between the dedupe check
        // and the lock, releasing immediately
        if self.dedupe.was_handled(&key) {
            self.release_now(handle).await;
            info!(identity = %identity, "Handled while acquiring lock, skipping");
            return Ok(RunOutcome::AlreadyHandled);
        }

        match self.executor.execute(operation, classifier).await {
            Ok(value) => {
                self.dedupe.mark_handled(key);
                match self.completion {
                    CompletionPolicy::ReleaseImmediately => self.release_now(handle).await,
                    CompletionPolicy::HoldFor(delay) => {
                        debug!(
                            identity = %identity,
                            delay_seconds = delay.as_secs(),
                            "Holding lock after success"
                        );
                        self.lock.release_after(handle, delay);
                    }
                }
                Ok(RunOutcome::Completed(value))
            }
            Err(e) => {
                warn!(
                    identity = %identity,
                    error_class = ?e.error_class(),
                    attempts = e.attempts(),
                    status = ?e.status_code(),
                    error = %e,
                    "Resilient call failed"
                );
                self.release_now(handle).await;
                Err(e)
            }
        }
    }

    async fn release_now(&self, handle: LockHandle) {
        let identity = handle.identity().clone();
        if let Err(e) = self.lock.release(handle).await {
            warn!(identity = %identity, error = %e, "Failed to release lock");
        }
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;

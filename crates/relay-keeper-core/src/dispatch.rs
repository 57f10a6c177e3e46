//! Detached execution of resilient calls.
//!
//! Webhook handlers must answer quickly, while an upstream call with retries
//! and backoff can take minutes. [`Dispatcher::dispatch`] runs a
//! [`ResilientCall`] in a spawned task and reports the outcome to a
//! [`CompletionObserver`] once it finishes.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{CallError, Classify, ErrorClass};
use crate::resilient::{ResilientCall, RunOutcome};
use crate::token::BearerToken;
use crate::Identity;

// ============================================================================
// Report
// ============================================================================

/// Final state of a dispatched call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchReport {
    Completed,
    AlreadyHandled,
    ConcurrentlyHandled,
    Failed {
        error_class: Option<ErrorClass>,
        attempts: u32,
        status: Option<u16>,
        /// A later redelivery may succeed
        transient: bool,
        message: String,
    },
}

impl DispatchReport {
    /// Build a report from the result of [`ResilientCall::run`].
    pub fn from_result<T, E: fmt::Display>(result: &Result<RunOutcome<T>, CallError<E>>) -> Self {
        match result {
            Ok(RunOutcome::Completed(_)) => Self::Completed,
            Ok(RunOutcome::AlreadyHandled) => Self::AlreadyHandled,
            Ok(RunOutcome::ConcurrentlyHandled) => Self::ConcurrentlyHandled,
            Err(e) => Self::Failed {
                error_class: e.error_class(),
                attempts: e.attempts(),
                status: e.status_code(),
                transient: e.is_transient(),
                message: e.to_string(),
            },
        }
    }

    /// Check if the call ended without error, including duplicates.
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }
}

// ============================================================================
// Completion Observer
// ============================================================================

/// Receives the outcome of every dispatched call.
#[async_trait]
pub trait CompletionObserver: Send + Sync {
    async fn on_complete(&self, identity: &Identity, report: &DispatchReport);
}

/// Observer writing outcomes to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingCompletionObserver;

#[async_trait]
impl CompletionObserver for TracingCompletionObserver {
    async fn on_complete(&self, identity: &Identity, report: &DispatchReport) {
        match report {
            DispatchReport::Completed => {
                info!(identity = %identity, "Dispatched call completed");
            }
            DispatchReport::AlreadyHandled | DispatchReport::ConcurrentlyHandled => {
                info!(identity = %identity, outcome = ?report, "Dispatched call skipped as duplicate");
            }
            DispatchReport::Failed {
                error_class,
                attempts,
                status,
                transient,
                message,
            } => {
                warn!(
                    identity = %identity,
                    error_class = ?error_class,
                    attempts = attempts,
                    status = ?status,
                    transient = transient,
                    error = %message,
                    "Dispatched call failed"
                );
            }
        }
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Spawns resilient calls so the caller can return immediately.
#[derive(Clone)]
pub struct Dispatcher {
    call: Arc<ResilientCall>,
    observer: Arc<dyn CompletionObserver>,
}

impl Dispatcher {
    /// Create a dispatcher logging outcomes through `tracing`.
    pub fn new(call: Arc<ResilientCall>) -> Self {
        Self::with_observer(call, Arc::new(TracingCompletionObserver))
    }

    pub fn with_observer(call: Arc<ResilientCall>, observer: Arc<dyn CompletionObserver>) -> Self {
        Self { call, observer }
    }

    pub fn call(&self) -> &Arc<ResilientCall> {
        &self.call
    }

    /// Run an operation for an identity in a detached task.
    ///
    /// The returned handle may be dropped; the call still runs to completion
    /// and its outcome reaches the observer.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// // In the webhook handler:
    /// let _ = dispatcher.dispatch(identity, send_sms, StatusCodeClassifier);
    /// Ok(StatusCode::ACCEPTED)
    /// ```
    pub fn dispatch<T, E, F, Fut, C>(
        &self,
        identity: Identity,
        operation: F,
        classifier: C,
    ) -> JoinHandle<DispatchReport>
    where
        T: Send + 'static,
        E: fmt::Display + Send + 'static,
        F: FnMut(BearerToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        C: Classify<E> + 'static,
    {
        let call = self.call.clone();
        let observer = self.observer.clone();

        tokio::spawn(async move {
            info!(identity = %identity, "Starting dispatched call");

            let result = call.run(&identity, operation, &classifier).await;
            let report = DispatchReport::from_result(&result);

            observer.on_complete(&identity, &report).await;
            report
        })
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("call", &self.call)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "dispatch_tests.rs"]
mod tests;

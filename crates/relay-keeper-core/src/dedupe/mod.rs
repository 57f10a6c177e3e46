//! In-memory registry of handled work.
//!
//! Upstream webhook sources redeliver the same logical event, sometimes
//! several times within seconds. The registry remembers which identities
//! were handled successfully so that redeliveries are acknowledged without
//! calling the upstream again.
//!
//! # TTL-based Expiration
//!
//! Entries older than the retention period (default 24 hours) are treated as
//! unhandled on lookup and removed by [`DedupeRegistry::sweep`], which
//! [`DedupeRegistry::spawn_sweeper`] runs periodically (default hourly).
//!
//! The registry is per process and not persisted; cross-process exclusion is
//! the job of [`crate::process_lock`].

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::{Identity, ValidationError};

// ============================================================================
// Dedupe Key
// ============================================================================

/// Key identifying one logical unit of work.
///
/// Built from the fields that stay the same across redeliveries, for example
/// `(campaign, contact, destination)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupeKey(String);

impl DedupeKey {
    /// Create a key from component parts joined with `:`.
    pub fn from_parts<I, S>(parts: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Identity::from_parts(parts).map(|identity| Self::from(&identity))
    }

    /// Get string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&Identity> for DedupeKey {
    fn from(identity: &Identity) -> Self {
        Self(identity.as_str().to_string())
    }
}

impl fmt::Display for DedupeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Retention of dedupe entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupeConfig {
    /// How long a handled key is remembered (seconds)
    pub ttl_seconds: u64,

    /// How often expired keys are swept (seconds)
    pub sweep_interval_seconds: u64,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 24 * 60 * 60,
            sweep_interval_seconds: 60 * 60,
        }
    }
}

impl DedupeConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }
}

// ============================================================================
// Dedupe Registry
// ============================================================================

/// Process-wide set of handled keys with per-entry expiry.
///
/// # Examples
///
/// ```rust
/// use relay_keeper_core::dedupe::{DedupeConfig, DedupeKey, DedupeRegistry};
///
/// # tokio_test::block_on(async {
/// let registry = DedupeRegistry::new(DedupeConfig::default());
/// let key = DedupeKey::from_parts(["spring-campaign", "lead-42"]).unwrap();
///
/// assert!(!registry.was_handled(&key));
/// registry.mark_handled(key.clone());
/// assert!(registry.was_handled(&key));
/// # });
/// ```
#[derive(Debug)]
pub struct DedupeRegistry {
    config: DedupeConfig,
    entries: RwLock<HashMap<DedupeKey, Instant>>,
}

impl DedupeRegistry {
    /// Create an empty registry.
    pub fn new(config: DedupeConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Get registry configuration.
    pub fn config(&self) -> &DedupeConfig {
        &self.config
    }

    /// Check whether the key was handled within the retention period.
    pub fn was_handled(&self, key: &DedupeKey) -> bool {
        let entries = match self.entries.read() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };

        entries
            .get(key)
            .is_some_and(|recorded_at| recorded_at.elapsed() < self.config.ttl())
    }

    /// Record the key as handled now.
    ///
    /// Marking an already handled key restarts its retention period.
    pub fn mark_handled(&self, key: DedupeKey) {
        let mut entries = match self.entries.write() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };

        debug!(key = %key, "Marking key as handled");
        entries.insert(key, Instant::now());
    }

    /// Remove expired entries.
    ///
    /// # Returns
    ///
    /// Number of entries removed
    pub fn sweep(&self) -> usize {
        let mut entries = match self.entries.write() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };

        let ttl = self.config.ttl();
        let before = entries.len();
        entries.retain(|_, recorded_at| recorded_at.elapsed() < ttl);
        let removed = before - entries.len();

        debug!(removed, remaining = entries.len(), "Dedupe sweep complete");
        removed
    }

    /// Number of entries, expired ones not yet swept included.
    pub fn len(&self) -> usize {
        match self.entries.read() {
            Ok(entries) => entries.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start a batch with its own transient seen set.
    pub fn begin_batch(self: &Arc<Self>) -> DedupeBatch {
        DedupeBatch {
            registry: Arc::clone(self),
            seen: HashSet::new(),
        }
    }

    /// Run [`sweep`](Self::sweep) every sweep interval until `shutdown`
    /// turns true or its sender is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let period = registry.config.sweep_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                sweep_interval_seconds = period.as_secs(),
                "Dedupe sweeper started"
            );

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        registry.sweep();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Dedupe sweeper stopped");
        })
    }
}

// ============================================================================
// Dedupe Batch
// ============================================================================

/// Dedupe view for one inbound batch.
///
/// A webhook payload may list the same item twice. Besides the registry, the
/// batch remembers every key it was asked about, so the second occurrence
/// reports as handled even though the first has not completed yet. The seen
/// set is discarded with the batch.
#[derive(Debug)]
pub struct DedupeBatch {
    registry: Arc<DedupeRegistry>,
    seen: HashSet<DedupeKey>,
}

impl DedupeBatch {
    /// Check the key against the registry and this batch, then remember it.
    pub fn was_handled(&mut self, key: &DedupeKey) -> bool {
        if self.registry.was_handled(key) {
            return true;
        }
        !self.seen.insert(key.clone())
    }

    /// Number of distinct keys seen in this batch.
    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    /// End the batch, dropping its seen set.
    pub fn finish(self) -> usize {
        self.seen.len()
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;

//! # Process Lock
//!
//! Filesystem-backed mutual exclusion between processes on one host.
//!
//! Each identity maps to one lock file in a shared directory. Acquisition is
//! an atomic create-if-absent; whoever creates the file holds the lock. A
//! file older than the stale threshold is assumed to belong to a crashed
//! holder and is reclaimed once.
//!
//! The file content is informational (owner pid, acquisition time) except
//! for `lock_id`: a release only deletes the file when the id matches, so a
//! holder whose lock was reclaimed never removes its successor's file.
//!
//! Deleting a lock file, whether by reclaim or release, requires a claim: a
//! sibling `<lock>.claim` file created with create-if-absent. Under the claim
//! the deleter looks at the lock file again before removing it, so a file
//! that was replaced since it was first inspected is never deleted.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{Identity, Timestamp};

/// Maximum length of the readable part of a lock file name.
const MAX_FILE_STEM_LENGTH: usize = 64;

/// A claim file older than this was left by a process that died mid-delete.
const ABANDONED_CLAIM_AGE: Duration = Duration::from_secs(60);

/// How often a release retries taking a claim held by a reclaimer.
const RELEASE_CLAIM_ATTEMPTS: u32 = 5;
const RELEASE_CLAIM_RETRY_DELAY: Duration = Duration::from_millis(20);

// ============================================================================
// Configuration
// ============================================================================

/// Lock directory and timing.
///
/// # Default Configuration
///
/// - Directory: `<temp dir>/relay-keeper-locks`
/// - Stale after: 3600 seconds (60 minutes)
/// - Release delay: 120 seconds (2 minutes)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Directory shared by all processes on the host
    pub directory: PathBuf,

    /// Age after which a lock file is reclaimed (seconds)
    pub stale_after_seconds: u64,

    /// How long a successful holder keeps the lock before deleting it (seconds)
    pub release_delay_seconds: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            directory: std::env::temp_dir().join("relay-keeper-locks"),
            stale_after_seconds: 60 * 60,
            release_delay_seconds: 120,
        }
    }
}

impl LockConfig {
    /// Create configuration for a directory with default timing.
    pub fn in_directory(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Self::default()
        }
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_seconds)
    }

    pub fn release_delay(&self) -> Duration {
        Duration::from_secs(self.release_delay_seconds)
    }
}

// ============================================================================
// Lock Types
// ============================================================================

/// Content of a lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub owner_pid: u32,
    pub acquired_at: Timestamp,
    pub lock_id: Uuid,
    pub identity: String,
}

/// Proof of holding the lock for one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    identity: Identity,
    path: PathBuf,
    lock_id: Uuid,
    acquired_at: Timestamp,
}

impl LockHandle {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_id(&self) -> Uuid {
        self.lock_id
    }

    pub fn acquired_at(&self) -> Timestamp {
        self.acquired_at
    }
}

/// Result of a lock attempt.
///
/// `Busy` is not an error: another process is handling the identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAcquisition {
    Acquired(LockHandle),
    Busy,
}

impl LockAcquisition {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }
}

/// Errors managing the lock directory.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("Failed to create lock directory {path}: {message}")]
    CreateDirectory { path: String, message: String },

    #[error("Lock file I/O failed for {path}: {message}")]
    Io { path: String, message: String },

    #[error("Failed to serialize lock record: {message}")]
    Serialization { message: String },
}

impl LockError {
    fn io(path: &Path, error: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            message: error.to_string(),
        }
    }
}

// ============================================================================
// Process Lock
// ============================================================================

/// Cross-process lock keyed by [`Identity`].
///
/// # Examples
///
/// ```no_run
/// use relay_keeper_core::process_lock::{LockAcquisition, LockConfig, ProcessLock};
/// use relay_keeper_core::Identity;
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let lock = ProcessLock::new(LockConfig::in_directory("/var/lib/relay-keeper/locks"));
/// let identity = Identity::new("campaign-7:lead-42")?;
///
/// if let LockAcquisition::Acquired(handle) = lock.try_acquire(&identity).await? {
///     // ... do the work ...
///     lock.release(handle).await?;
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ProcessLock {
    config: LockConfig,
}

impl ProcessLock {
    pub fn new(config: LockConfig) -> Self {
        Self { config }
    }

    /// Get lock configuration.
    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Try to take the lock for an identity without waiting.
    ///
    /// # Returns
    ///
    /// - `Acquired` when this call created the lock file
    /// - `Busy` when a live lock file exists
    ///
    /// # Errors
    ///
    /// Returns `LockError` when the directory or file cannot be accessed.
    pub async fn try_acquire(&self, identity: &Identity) -> Result<LockAcquisition, LockError> {
        fs::create_dir_all(&self.config.directory)
            .await
            .map_err(|e| LockError::CreateDirectory {
                path: self.config.directory.display().to_string(),
                message: e.to_string(),
            })?;

        let path = self.lock_path(identity);

        if let Some(handle) = create_for(identity, &path).await? {
            return Ok(LockAcquisition::Acquired(handle));
        }

        match file_age(&path).await? {
            Some(age) if age <= self.config.stale_after() => {
                debug!(identity = %identity, age_seconds = age.as_secs(), "Lock busy");
                return Ok(LockAcquisition::Busy);
            }
            Some(_) => return self.reclaim(identity, &path).await,
            None => {
                // Released between our create and the age check
            }
        }

        Ok(create_for(identity, &path)
            .await?
            .map_or(LockAcquisition::Busy, LockAcquisition::Acquired))
    }

    /// Replace a lock file that looked stale.
    async fn reclaim(&self, identity: &Identity, path: &Path) -> Result<LockAcquisition, LockError> {
        let Some(_claim) = DeletionClaim::take(path).await? else {
            debug!(identity = %identity, "Stale lock is being reclaimed elsewhere");
            return Ok(LockAcquisition::Busy);
        };

        // Another reclaimer may have replaced the file before we got the claim
        match file_age(path).await? {
            Some(age) if age <= self.config.stale_after() => {
                debug!(identity = %identity, "Stale lock already reclaimed");
                return Ok(LockAcquisition::Busy);
            }
            Some(age) => {
                warn!(
                    identity = %identity,
                    age_seconds = age.as_secs(),
                    stale_after_seconds = self.config.stale_after_seconds,
                    "Reclaiming stale lock"
                );
                remove_if_present(path).await?;
            }
            None => {}
        }

        Ok(create_for(identity, path)
            .await?
            .map_or(LockAcquisition::Busy, LockAcquisition::Acquired))
    }

    /// Release a lock now.
    ///
    /// # Returns
    ///
    /// `true` if the lock file was deleted, `false` if it was already gone,
    /// now belongs to another holder, or is being reclaimed right now.
    pub async fn release(&self, handle: LockHandle) -> Result<bool, LockError> {
        let mut claim = None;
        for attempt in 1..=RELEASE_CLAIM_ATTEMPTS {
            claim = DeletionClaim::take(&handle.path).await?;
            if claim.is_some() || attempt == RELEASE_CLAIM_ATTEMPTS {
                break;
            }
            tokio::time::sleep(RELEASE_CLAIM_RETRY_DELAY).await;
        }
        let Some(_claim) = claim else {
            warn!(
                identity = %handle.identity,
                lock_id = %handle.lock_id,
                "Lock is being reclaimed, leaving it in place"
            );
            return Ok(false);
        };

        let content = match fs::read(&handle.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(identity = %handle.identity, "Lock already released");
                return Ok(false);
            }
            Err(e) => return Err(LockError::io(&handle.path, e)),
        };

        match serde_json::from_slice::<LockRecord>(&content) {
            Ok(record) if record.lock_id == handle.lock_id => {}
            Ok(record) => {
                warn!(
                    identity = %handle.identity,
                    lock_id = %handle.lock_id,
                    current_lock_id = %record.lock_id,
                    "Lock was reclaimed by another holder, leaving it in place"
                );
                return Ok(false);
            }
            Err(e) => {
                warn!(
                    identity = %handle.identity,
                    error = %e,
                    "Lock file unreadable, leaving it in place"
                );
                return Ok(false);
            }
        }

        let removed = remove_if_present(&handle.path).await?;
        if removed {
            debug!(identity = %handle.identity, lock_id = %handle.lock_id, "Lock released");
        }
        Ok(removed)
    }

    /// Release a lock after a delay in a detached task.
    ///
    /// Keeps late redeliveries of the same work from starting while the
    /// upstream settles. The returned handle may be dropped; the release
    /// still happens.
    pub fn release_after(&self, handle: LockHandle, delay: Duration) -> JoinHandle<()> {
        let lock = self.clone();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let identity = handle.identity.clone();
            match lock.release(handle).await {
                Ok(true) => info!(
                    identity = %identity,
                    delay_seconds = delay.as_secs(),
                    "Delayed lock release complete"
                ),
                Ok(false) => {}
                Err(e) => error!(identity = %identity, error = %e, "Delayed lock release failed"),
            }
        })
    }

    /// Path of the lock file for an identity.
    ///
    /// The readable prefix is the sanitized identity; the hash suffix keeps
    /// identities that sanitize to the same prefix apart.
    pub fn lock_path(&self, identity: &Identity) -> PathBuf {
        let stem: String = identity
            .as_str()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .take(MAX_FILE_STEM_LENGTH)
            .collect();

        let digest = Sha256::digest(identity.as_str().as_bytes());
        let hash = hex::encode(&digest[..8]);

        self.config.directory.join(format!("{}-{}.lock", stem, hash))
    }
}

/// Exclusive right to delete one lock file; the claim file is removed on drop.
#[derive(Debug)]
struct DeletionClaim {
    path: PathBuf,
}

impl DeletionClaim {
    /// Take the claim for a lock file, or `None` if someone else holds it.
    async fn take(lock_path: &Path) -> Result<Option<Self>, LockError> {
        let mut name = lock_path.as_os_str().to_owned();
        name.push(".claim");
        let path = PathBuf::from(name);

        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(_) => Ok(Some(Self { path })),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if file_age(&path).await?.is_some_and(|age| age > ABANDONED_CLAIM_AGE) {
                    warn!(path = %path.display(), "Removing abandoned lock claim");
                    remove_if_present(&path).await?;
                }
                Ok(None)
            }
            Err(e) => Err(LockError::io(&path, e)),
        }
    }
}

impl Drop for DeletionClaim {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                error!(path = %self.path.display(), error = %e, "Failed to remove lock claim");
            }
        }
    }
}

/// Create the lock file for an identity; `None` if it already exists.
async fn create_for(identity: &Identity, path: &Path) -> Result<Option<LockHandle>, LockError> {
    let record = LockRecord {
        owner_pid: std::process::id(),
        acquired_at: Timestamp::now(),
        lock_id: Uuid::new_v4(),
        identity: identity.as_str().to_string(),
    };

    match create_lock_file(path, &record).await {
        Ok(()) => {
            debug!(identity = %identity, lock_id = %record.lock_id, "Lock acquired");
            Ok(Some(LockHandle {
                identity: identity.clone(),
                path: path.to_path_buf(),
                lock_id: record.lock_id,
                acquired_at: record.acquired_at,
            }))
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
        Err(e) => Err(LockError::io(path, e)),
    }
}

async fn create_lock_file(path: &Path, record: &LockRecord) -> std::io::Result<()> {
    let json = serde_json::to_vec(record)
        .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;

    let written = async {
        file.write_all(&json).await?;
        file.flush().await
    }
    .await;
    drop(file);

    if let Err(e) = written {
        // Do not leave a half-written lock behind
        let _ = fs::remove_file(path).await;
        return Err(e);
    }

    Ok(())
}

/// Age of a file by modification time; `None` if it does not exist.
async fn file_age(path: &Path) -> Result<Option<Duration>, LockError> {
    let metadata = match fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(LockError::io(path, e)),
    };

    let modified = metadata.modified().map_err(|e| LockError::io(path, e))?;
    Ok(Some(
        SystemTime::now()
            .duration_since(modified)
            .unwrap_or_default(),
    ))
}

async fn remove_if_present(path: &Path) -> Result<bool, LockError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(LockError::io(path, e)),
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;

//! Isolation lock.
//!
//! An exclusive, time-limited lease on a named lock. While one orchestrator
//! holds `runway:process`, no other instance can start processing; the lease
//! expires on its own if its holder dies without releasing it.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use runway_core::Time;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Interval between acquisition attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Lock failures.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("could not acquire lock '{name}' within {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("lock I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("lock file is corrupt: {0}")]
    Json(#[from] serde_json::Error),
}

/// A held lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Lock name
    pub name: String,
    /// Owner token; only the holder of this token can release the lease
    pub token: String,
    /// When the lease lapses on its own
    pub expires_at: Time,
}

impl Lease {
    fn new(name: &str, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Self {
            name: name.to_string(),
            token: ulid::Ulid::new().to_string(),
            expires_at: Utc::now().checked_add_signed(ttl).unwrap_or(chrono::DateTime::<Utc>::MAX_UTC),
        }
    }

    /// Whether the lease has lapsed.
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// Provides exclusive leases on named locks.
#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Take the lock if it is free or its lease expired.
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<Lease>, LockError>;

    /// Give the lock back. Releasing a lease that was already taken over is a no-op.
    async fn release(&self, lease: &Lease) -> Result<(), LockError>;

    /// Wait up to `timeout` for the lock.
    async fn acquire(&self, name: &str, timeout: Duration, ttl: Duration) -> Result<Lease, LockError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(lease) = self.try_acquire(name, ttl).await? {
                debug!("Acquired lock '{}'", name);
                return Ok(lease);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(LockError::Timeout {
                    name: name.to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }
}

/// Run `body` while holding the lock, releasing it on every exit path.
///
/// A panic inside `body` is re-raised after the lease is released.
pub async fn with_lock<T, F, Fut>(
    provider: &dyn LockProvider,
    name: &str,
    timeout: Duration,
    ttl: Duration,
    body: F,
) -> Result<T, LockError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    let lease = provider.acquire(name, timeout, ttl).await?;
    info!("Holding isolation lock '{}'", name);

    let result = AssertUnwindSafe(body()).catch_unwind().await;

    if let Err(e) = provider.release(&lease).await {
        warn!("Failed to release lock '{}': {}", name, e);
    }
    match result {
        Ok(value) => Ok(value),
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

/// Process-local lock provider.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLockProvider {
    leases: Arc<Mutex<HashMap<String, Lease>>>,
}

impl InMemoryLockProvider {
    /// Create a provider with no locks held.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `name` is currently held by an unexpired lease.
    pub async fn is_held(&self, name: &str) -> bool {
        self.leases
            .lock()
            .await
            .get(name)
            .map(|l| !l.is_expired())
            .unwrap_or(false)
    }
}

#[async_trait]
impl LockProvider for InMemoryLockProvider {
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<Lease>, LockError> {
        let mut leases = self.leases.lock().await;
        if let Some(current) = leases.get(name) {
            if !current.is_expired() {
                return Ok(None);
            }
        }
        let lease = Lease::new(name, ttl);
        leases.insert(name.to_string(), lease.clone());
        Ok(Some(lease))
    }

    async fn release(&self, lease: &Lease) -> Result<(), LockError> {
        let mut leases = self.leases.lock().await;
        if leases.get(&lease.name).map(|l| l.token == lease.token).unwrap_or(false) {
            leases.remove(&lease.name);
        }
        Ok(())
    }
}

/// What a contender found at a lock path.
enum Observed {
    Free,
    Held,
    /// A lapsed lease, or an unreadable file older than the ttl. `key` names
    /// the takeover marker for exactly this content.
    Stale { bytes: Vec<u8>, key: String },
}

/// Lock provider backed by lock files, shared by every process using the
/// same directory.
///
/// A lease is written to a private file and hard-linked into place, so the
/// lock file is never visible half-written. Removing someone else's lock file
/// needs a marker created with `create_new`; the marker is keyed by the lease
/// being removed, so only one contender can replace a given stale lease.
#[derive(Debug, Clone)]
pub struct FileLockProvider {
    dir: PathBuf,
}

/// A takeover marker older than this belongs to a contender that died mid-takeover.
const MARKER_TIMEOUT: Duration = Duration::from_secs(30);

impl FileLockProvider {
    /// Create a provider keeping its lock files in `dir`.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, LockError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", file_safe(name)))
    }

    fn side_path(path: &Path, tag: &str, suffix: &str) -> PathBuf {
        path.with_extension(format!("lock.{}.{}", tag, suffix))
    }

    async fn read_lease(path: &Path) -> Result<Option<Lease>, LockError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_quietly(path: &Path) -> Result<(), LockError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write `lease` to the lock path unless a lock file already exists.
    async fn create(path: &Path, lease: &Lease) -> Result<bool, LockError> {
        let staged = Self::side_path(path, &lease.token, "tmp");
        tokio::fs::write(&staged, serde_json::to_vec_pretty(lease)?).await?;
        let linked = tokio::fs::hard_link(&staged, path).await;
        Self::remove_quietly(&staged).await?;
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn observe(path: &Path, ttl: Duration) -> Result<Observed, LockError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Observed::Free),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<Lease>(&bytes) {
            Ok(current) if current.is_expired() => {
                debug!("Lease on {} lapsed at {}", path.display(), current.expires_at);
                Ok(Observed::Stale {
                    bytes,
                    key: current.token,
                })
            }
            Ok(_) => Ok(Observed::Held),
            Err(_) => {
                let modified = match tokio::fs::metadata(path).await {
                    Ok(meta) => meta.modified()?,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Observed::Free),
                    Err(e) => return Err(e.into()),
                };
                // A future mtime counts as brand new.
                let age = modified.elapsed().unwrap_or_default();
                if age < ttl {
                    return Ok(Observed::Held);
                }
                Ok(Observed::Stale {
                    bytes,
                    key: "unreadable".to_string(),
                })
            }
        }
    }

    /// Create the marker guarding removal of one particular lock file.
    async fn claim(marker: &Path) -> Result<bool, LockError> {
        let created = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(marker)
            .await;
        match created {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let age = tokio::fs::metadata(marker)
                    .await
                    .ok()
                    .and_then(|meta| meta.modified().ok())
                    .and_then(|modified| modified.elapsed().ok());
                if age.map(|age| age >= MARKER_TIMEOUT).unwrap_or(false) {
                    warn!("Clearing abandoned takeover marker {}", marker.display());
                    Self::remove_quietly(marker).await?;
                }
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the stale lock file holding `seen`, under its marker.
    async fn replace_stale(path: &Path, seen: &[u8], lease: &Lease) -> Result<bool, LockError> {
        match tokio::fs::read(path).await {
            Ok(bytes) if bytes == seen => {
                warn!("Taking over stale lock '{}' at {}", lease.name, path.display());
                Self::remove_quietly(path).await?;
            }
            // Someone else replaced it after we looked.
            Ok(_) => return Ok(false),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Self::create(path, lease).await
    }
}

/// Lock and queue names reduced to characters safe in a file name.
pub(crate) fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[async_trait]
impl LockProvider for FileLockProvider {
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<Lease>, LockError> {
        let path = self.lock_path(name);
        let lease = Lease::new(name, ttl);

        if Self::create(&path, &lease).await? {
            return Ok(Some(lease));
        }

        let won = match Self::observe(&path, ttl).await? {
            Observed::Held => false,
            Observed::Free => Self::create(&path, &lease).await?,
            Observed::Stale { bytes, key } => {
                let marker = Self::side_path(&path, &key, "taking");
                if !Self::claim(&marker).await? {
                    return Ok(None);
                }
                let replaced = Self::replace_stale(&path, &bytes, &lease).await;
                Self::remove_quietly(&marker).await?;
                replaced?
            }
        };
        Ok(won.then_some(lease))
    }

    async fn release(&self, lease: &Lease) -> Result<(), LockError> {
        let path = self.lock_path(&lease.name);
        let marker = Self::side_path(&path, &lease.token, "taking");
        if !Self::claim(&marker).await? {
            debug!("Lock '{}' is being taken over, nothing to release", lease.name);
            return Ok(());
        }

        let current = Self::read_lease(&path).await;
        let result = match current {
            Ok(Some(current)) if current.token == lease.token => {
                Self::remove_quietly(&path).await.map(|()| debug!("Released lock '{}'", lease.name))
            }
            Ok(_) | Err(LockError::Json(_)) => {
                debug!("Lock '{}' no longer ours, nothing to release", lease.name);
                Ok(())
            }
            Err(e) => Err(e),
        };
        Self::remove_quietly(&marker).await?;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_in_memory_lock_is_exclusive() {
        let locks = InMemoryLockProvider::new();
        let lease = locks.try_acquire("runway:process", TTL).await.unwrap().unwrap();
        assert!(locks.try_acquire("runway:process", TTL).await.unwrap().is_none());

        locks.release(&lease).await.unwrap();
        assert!(locks.try_acquire("runway:process", TTL).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let locks = InMemoryLockProvider::new();
        let stale = locks.try_acquire("l", Duration::ZERO).await.unwrap().unwrap();
        let fresh = locks.try_acquire("l", TTL).await.unwrap().unwrap();
        assert_ne!(stale.token, fresh.token);

        // The stale holder cannot release the new lease.
        locks.release(&stale).await.unwrap();
        assert!(locks.is_held("l").await);
    }

    #[tokio::test]
    async fn test_acquire_times_out() {
        let locks = InMemoryLockProvider::new();
        let _held = locks.try_acquire("l", TTL).await.unwrap().unwrap();

        let err = locks
            .acquire("l", Duration::from_millis(50), TTL)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_file_lock_is_exclusive_across_providers() {
        let dir = TempDir::new().unwrap();
        let a = FileLockProvider::new(dir.path()).unwrap();
        let b = FileLockProvider::new(dir.path()).unwrap();

        let lease = a.try_acquire("runway:process", TTL).await.unwrap().unwrap();
        assert!(b.try_acquire("runway:process", TTL).await.unwrap().is_none());

        a.release(&lease).await.unwrap();
        assert!(b.try_acquire("runway:process", TTL).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_file_lock_takes_over_expired_lease() {
        let dir = TempDir::new().unwrap();
        let locks = FileLockProvider::new(dir.path()).unwrap();

        let stale = locks.try_acquire("l", Duration::ZERO).await.unwrap().unwrap();
        let fresh = locks.try_acquire("l", TTL).await.unwrap().unwrap();

        locks.release(&stale).await.unwrap();
        assert!(locks.try_acquire("l", TTL).await.unwrap().is_none());
        locks.release(&fresh).await.unwrap();
        assert!(locks.try_acquire("l", TTL).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_file_lock_unreadable_file_is_held_until_ttl() {
        let dir = TempDir::new().unwrap();
        let locks = FileLockProvider::new(dir.path()).unwrap();
        std::fs::write(dir.path().join("l.lock"), b"").unwrap();

        assert!(locks.try_acquire("l", TTL).await.unwrap().is_none());
        let lease = locks.try_acquire("l", Duration::ZERO).await.unwrap().unwrap();

        let on_disk: Lease =
            serde_json::from_slice(&std::fs::read(dir.path().join("l.lock")).unwrap()).unwrap();
        assert_eq!(on_disk.token, lease.token);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_file_lock_expired_lease_has_one_successor() {
        let dir = TempDir::new().unwrap();
        let first = FileLockProvider::new(dir.path()).unwrap();
        first.try_acquire("l", Duration::ZERO).await.unwrap().unwrap();

        let contenders: Vec<_> = (0..8)
            .map(|_| {
                let locks = FileLockProvider::new(dir.path()).unwrap();
                tokio::spawn(async move { locks.try_acquire("l", TTL).await.unwrap() })
            })
            .collect();
        let winners: Vec<Lease> = futures::future::join_all(contenders)
            .await
            .into_iter()
            .filter_map(|joined| joined.unwrap())
            .collect();
        assert_eq!(winners.len(), 1);

        let on_disk = FileLockProvider::read_lease(&dir.path().join("l.lock"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(on_disk.token, winners[0].token);

        // Only the lock file itself is left behind.
        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn test_file_lock_release_skips_marked_takeover() {
        let dir = TempDir::new().unwrap();
        let locks = FileLockProvider::new(dir.path()).unwrap();
        let lease = locks.try_acquire("l", TTL).await.unwrap().unwrap();

        let path = locks.lock_path("l");
        let marker = FileLockProvider::side_path(&path, &lease.token, "taking");
        std::fs::write(&marker, b"").unwrap();
        locks.release(&lease).await.unwrap();
        assert!(path.exists());

        std::fs::remove_file(&marker).unwrap();
        locks.release(&lease).await.unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_file_safe_names() {
        assert_eq!(file_safe("runway:process"), "runway_process");
        assert_eq!(file_safe("../etc"), "___etc");
        assert_eq!(file_safe("reports-2"), "reports-2");
    }

    #[tokio::test]
    async fn test_with_lock_releases_after_body() {
        let locks = InMemoryLockProvider::new();
        let value = with_lock(&locks, "l", Duration::ZERO, TTL, || async { 7 })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert!(!locks.is_held("l").await);
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_panic() {
        let locks = InMemoryLockProvider::new();
        let inner = locks.clone();
        let handle = tokio::spawn(async move {
            with_lock(&inner, "l", Duration::ZERO, TTL, || async {
                panic!("body exploded");
            })
            .await
        });
        assert!(handle.await.is_err());
        assert!(!locks.is_held("l").await);
    }
}

//! Single-writer lease over an environment's remote state.
//!
//! Every mutating command acquires the lease for its environment before it
//! touches remote state, and releases it on every exit path. A lease names
//! its holder and run, and expires if it is not renewed within its
//! duration; an expired lease may be taken over by a new run.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default lease duration.
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(2 * 60 * 60);

/// Errors that can occur during lease operations.
#[derive(Error, Debug)]
pub enum LeaseError {
    /// The lease is held by another run and has not expired.
    #[error("State for '{key}' is locked by {holder} (run {run_id}) until {expires_at}")]
    Held {
        key: String,
        holder: String,
        run_id: String,
        expires_at: DateTime<Utc>,
    },

    /// The caller does not hold the lease it tried to renew or release.
    #[error("Lease '{key}' is not held by run {run_id}")]
    NotHolder { key: String, run_id: String },

    /// The lease record could not be parsed.
    #[error("Lease record '{0}' is corrupt: {1}")]
    Corrupt(String, String),

    /// Filesystem error.
    #[error("Lease I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A persisted lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    /// Lease key (environment state prefix).
    pub key: String,
    /// Holder identity (user@host or pipeline job).
    pub holder: String,
    /// Run that owns the lease.
    pub run_id: String,
    /// When the lease was first acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lease was last renewed.
    pub renewed_at: DateTime<Utc>,
    /// Lease duration from the last renewal.
    pub duration_secs: u64,
}

impl LeaseRecord {
    fn new(key: &str, holder: &str, run_id: &str, duration: Duration) -> Self {
        let now = Utc::now();
        Self {
            key: key.to_string(),
            holder: holder.to_string(),
            run_id: run_id.to_string(),
            acquired_at: now,
            renewed_at: now,
            duration_secs: duration.as_secs(),
        }
    }

    /// When the lease lapses unless renewed.
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        let secs = i64::try_from(self.duration_secs).unwrap_or(i64::MAX);
        self.renewed_at + chrono::Duration::seconds(secs)
    }

    /// Whether the lease has lapsed at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at() < now
    }

    fn held_error(&self) -> LeaseError {
        LeaseError::Held {
            key: self.key.clone(),
            holder: self.holder.clone(),
            run_id: self.run_id.clone(),
            expires_at: self.expires_at(),
        }
    }
}

/// Storage for lease records.
pub trait LeaseStore: Send + Sync {
    /// Acquire `key` for `run_id`, taking over an expired lease.
    ///
    /// # Errors
    ///
    /// Returns `Held` if another run holds an unexpired lease.
    fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        run_id: &str,
        duration: Duration,
    ) -> Result<LeaseRecord, LeaseError>;

    /// Extend a held lease.
    ///
    /// # Errors
    ///
    /// Returns `NotHolder` if the lease belongs to another run.
    fn renew(&self, record: &LeaseRecord) -> Result<LeaseRecord, LeaseError>;

    /// Release a held lease. Releasing an absent lease succeeds.
    ///
    /// # Errors
    ///
    /// Returns `NotHolder` if the lease belongs to another run.
    fn release(&self, key: &str, run_id: &str) -> Result<(), LeaseError>;

    /// Current lease on `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read.
    fn current(&self, key: &str) -> Result<Option<LeaseRecord>, LeaseError>;
}

/// Lease records as files in a shared directory.
///
/// Acquisition relies on exclusive file creation; takeover of an expired
/// lease moves the stale record aside first so that only one contender can
/// win the subsequent create.
#[derive(Debug, Clone)]
pub struct FileLeaseStore {
    dir: PathBuf,
}

impl FileLeaseStore {
    /// Create a store rooted at `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.lease"))
    }

    fn read(path: &Path) -> Result<Option<LeaseRecord>, LeaseError> {
        match fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content)
                .map(Some)
                .map_err(|e| LeaseError::Corrupt(path.display().to_string(), e.to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn create(path: &Path, record: &LeaseRecord) -> Result<bool, LeaseError> {
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let content = serde_json::to_vec_pretty(record)
            .map_err(|e| LeaseError::Corrupt(path.display().to_string(), e.to_string()))?;
        file.write_all(&content)?;
        file.sync_all()?;
        Ok(true)
    }

    fn overwrite(path: &Path, record: &LeaseRecord) -> Result<(), LeaseError> {
        let content = serde_json::to_vec_pretty(record)
            .map_err(|e| LeaseError::Corrupt(path.display().to_string(), e.to_string()))?;
        let tmp = path.with_extension(format!("lease.{}", record.run_id));
        fs::write(&tmp, content)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Move an expired record aside. Returns false if someone else already
    /// replaced it.
    fn retire(path: &Path, stale: &LeaseRecord) -> Result<bool, LeaseError> {
        let tombstone = path.with_extension(format!("stale.{}", uuid::Uuid::new_v4()));
        match fs::rename(path, &tombstone) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        }
        let moved = Self::read(&tombstone)?;
        if moved.as_ref() == Some(stale) {
            let _ = fs::remove_file(&tombstone);
            Ok(true)
        } else {
            // Raced with another takeover; put its fresh lease back.
            fs::rename(&tombstone, path)?;
            Ok(false)
        }
    }
}

impl LeaseStore for FileLeaseStore {
    fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        run_id: &str,
        duration: Duration,
    ) -> Result<LeaseRecord, LeaseError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path(key);
        let record = LeaseRecord::new(key, holder, run_id, duration);

        // Two rounds: the first may find an expired lease to retire.
        for _ in 0..2 {
            if Self::create(&path, &record)? {
                info!(key, holder, run_id, "Acquired state lease");
                return Ok(record);
            }

            let Some(existing) = Self::read(&path)? else {
                continue;
            };

            if existing.run_id == run_id {
                debug!(key, run_id, "Lease already held by this run");
                return Ok(existing);
            }

            if !existing.is_expired_at(Utc::now()) {
                return Err(existing.held_error());
            }

            warn!(
                key,
                previous_holder = %existing.holder,
                previous_run = %existing.run_id,
                expired_at = %existing.expires_at(),
                "Taking over expired state lease"
            );
            if !Self::retire(&path, &existing)? {
                break;
            }
        }

        match Self::read(&path)? {
            Some(existing) => Err(existing.held_error()),
            None => Err(LeaseError::Io(std::io::Error::new(
                ErrorKind::WouldBlock,
                format!("lease '{key}' is contended, retry"),
            ))),
        }
    }

    fn renew(&self, record: &LeaseRecord) -> Result<LeaseRecord, LeaseError> {
        let path = self.path(&record.key);
        match Self::read(&path)? {
            Some(current) if current.run_id == record.run_id => {
                let renewed = LeaseRecord {
                    renewed_at: Utc::now(),
                    ..current
                };
                Self::overwrite(&path, &renewed)?;
                debug!(key = %record.key, "Renewed state lease");
                Ok(renewed)
            }
            _ => Err(LeaseError::NotHolder {
                key: record.key.clone(),
                run_id: record.run_id.clone(),
            }),
        }
    }

    fn release(&self, key: &str, run_id: &str) -> Result<(), LeaseError> {
        let path = self.path(key);
        match Self::read(&path)? {
            None => {
                debug!(key, "Lease already released");
                Ok(())
            }
            Some(current) if current.run_id == run_id => {
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                info!(key, run_id, "Released state lease");
                Ok(())
            }
            Some(_) => Err(LeaseError::NotHolder {
                key: key.to_string(),
                run_id: run_id.to_string(),
            }),
        }
    }

    fn current(&self, key: &str) -> Result<Option<LeaseRecord>, LeaseError> {
        Self::read(&self.path(key))
    }
}

/// A held lease. Released explicitly with [`StateLease::release`], or on drop.
pub struct StateLease {
    store: Arc<dyn LeaseStore>,
    record: LeaseRecord,
    released: bool,
}

impl StateLease {
    /// Acquire the lease on `key` for `run_id`.
    ///
    /// # Errors
    ///
    /// Returns `Held` if another run holds the lease.
    pub fn acquire(
        store: Arc<dyn LeaseStore>,
        key: &str,
        holder: &str,
        run_id: &str,
        duration: Duration,
    ) -> Result<Self, LeaseError> {
        let record = store.try_acquire(key, holder, run_id, duration)?;
        Ok(Self {
            store,
            record,
            released: false,
        })
    }

    /// The lease record.
    #[must_use]
    pub fn record(&self) -> &LeaseRecord {
        &self.record
    }

    /// Extend the lease.
    ///
    /// # Errors
    ///
    /// Returns `NotHolder` if the lease was lost.
    pub fn renew(&mut self) -> Result<(), LeaseError> {
        self.record = self.store.renew(&self.record)?;
        Ok(())
    }

    /// Release the lease.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot remove the record.
    pub fn release(mut self) -> Result<(), LeaseError> {
        self.released = true;
        self.store.release(&self.record.key, &self.record.run_id)
    }
}

impl Drop for StateLease {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.store.release(&self.record.key, &self.record.run_id) {
                warn!(key = %self.record.key, error = %e, "Failed to release state lease on drop");
            }
        }
    }
}

/// Identity recorded as lease holder.
#[must_use]
pub fn default_holder() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".into());
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".into());
    match std::env::var("GITHUB_RUN_ID") {
        Ok(job) => format!("{user}@{host} (ci run {job})"),
        Err(_) => format!("{user}@{host}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, Arc<FileLeaseStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileLeaseStore::new(dir.path().join("leases")));
        (dir, store)
    }

    #[test]
    fn test_acquire_and_release() {
        let (_dir, store) = store();
        let record = store
            .try_acquire("eksprov/dev", "alice@host", "run-1", DEFAULT_LEASE_DURATION)
            .unwrap();
        assert_eq!(record.holder, "alice@host");
        assert!(store.current("eksprov/dev").unwrap().is_some());

        store.release("eksprov/dev", "run-1").unwrap();
        assert!(store.current("eksprov/dev").unwrap().is_none());
        // Releasing twice is harmless.
        store.release("eksprov/dev", "run-1").unwrap();
    }

    #[test]
    fn test_second_writer_is_rejected() {
        let (_dir, store) = store();
        store
            .try_acquire("eksprov/dev", "alice", "run-1", DEFAULT_LEASE_DURATION)
            .unwrap();
        let err = store
            .try_acquire("eksprov/dev", "bob", "run-2", DEFAULT_LEASE_DURATION)
            .unwrap_err();
        match err {
            LeaseError::Held { holder, run_id, .. } => {
                assert_eq!(holder, "alice");
                assert_eq!(run_id, "run-1");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_environments_do_not_contend() {
        let (_dir, store) = store();
        store
            .try_acquire("eksprov/dev", "alice", "run-1", DEFAULT_LEASE_DURATION)
            .unwrap();
        store
            .try_acquire("eksprov/prod", "bob", "run-2", DEFAULT_LEASE_DURATION)
            .unwrap();
    }

    #[test]
    fn test_expired_lease_is_taken_over() {
        let (_dir, store) = store();
        store
            .try_acquire("eksprov/dev", "alice", "run-1", Duration::ZERO)
            .unwrap();
        std::thread::sleep(Duration::from_millis(10));

        let record = store
            .try_acquire("eksprov/dev", "bob", "run-2", DEFAULT_LEASE_DURATION)
            .unwrap();
        assert_eq!(record.run_id, "run-2");
        assert_eq!(store.current("eksprov/dev").unwrap().unwrap().holder, "bob");
    }

    #[test]
    fn test_release_by_non_holder_is_rejected() {
        let (_dir, store) = store();
        store
            .try_acquire("eksprov/dev", "alice", "run-1", DEFAULT_LEASE_DURATION)
            .unwrap();
        assert!(matches!(
            store.release("eksprov/dev", "run-2"),
            Err(LeaseError::NotHolder { .. })
        ));
        assert!(store.current("eksprov/dev").unwrap().is_some());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let (_dir, store) = store();
        {
            let _lease = StateLease::acquire(
                store.clone(),
                "eksprov/dev",
                "alice",
                "run-1",
                DEFAULT_LEASE_DURATION,
            )
            .unwrap();
            assert!(store.current("eksprov/dev").unwrap().is_some());
        }
        assert!(store.current("eksprov/dev").unwrap().is_none());
    }

    #[test]
    fn test_renew_extends_lease() {
        let (_dir, store) = store();
        let mut lease = StateLease::acquire(
            store.clone(),
            "eksprov/dev",
            "alice",
            "run-1",
            DEFAULT_LEASE_DURATION,
        )
        .unwrap();
        let before = lease.record().renewed_at;
        std::thread::sleep(Duration::from_millis(5));
        lease.renew().unwrap();
        assert!(lease.record().renewed_at > before);
        lease.release().unwrap();
        assert!(store.current("eksprov/dev").unwrap().is_none());
    }
}

// SPDX-License-Identifier: MIT

//! Lock Manager (spec.md §4.3): per-name file locks under
//! `locks/<name>.lock`, using O_EXCL create as the only atomic primitive,
//! with PID-liveness-based stale recovery guarded by a TOCTOU double-read.

use kernel_core::lock::is_valid_lock_name;
use kernel_core::{BootId, Clock, LockOwnerId, LockRecord};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock name '{0}' is invalid")]
    InvalidName(String),
    #[error("lock '{0}' is held by another owner")]
    Contention(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Returns `true` if no process with this PID exists on this host.
/// `EPERM` (the process exists but we lack permission to signal it) is
/// treated as conservatively live, per spec.md §4.3.
fn pid_is_dead(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        match kill(Pid::from_raw(pid as i32), None) {
            Ok(()) => false,
            Err(nix::errno::Errno::ESRCH) => true,
            Err(_) => false,
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

pub struct LockManager<C: Clock> {
    locks_dir: PathBuf,
    pid: u32,
    boot_id: BootId,
    max_age_ms: u64,
    clock: Arc<C>,
}

/// A held lock; dropping it does not auto-release. Release is an explicit
/// call rather than RAII since it can fail softly and that failure needs
/// to be observable to the caller.
#[derive(Debug)]
pub struct LockGuard {
    pub name: String,
    pub owner_id: String,
}

impl<C: Clock> LockManager<C> {
    pub fn new(locks_dir: impl Into<PathBuf>, boot_id: BootId, max_age_ms: u64, clock: Arc<C>) -> Self {
        Self { locks_dir: locks_dir.into(), pid: std::process::id(), boot_id, max_age_ms, clock }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.locks_dir.join(format!("{name}.lock"))
    }

    fn read_record(path: &Path) -> Result<LockRecord, LockError> {
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn write_record(path: &Path, record: &LockRecord) -> Result<(), LockError> {
        let mut file = File::create(path)?;
        file.write_all(&serde_json::to_vec(record)?)?;
        file.sync_all()?;
        if let Some(parent) = path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }

    fn is_stale(&self, record: &LockRecord) -> bool {
        let age_ms = self.clock.now_ms().saturating_sub(record.created_at);
        if age_ms > self.max_age_ms {
            return true;
        }
        pid_is_dead(record.pid)
    }

    /// Acquire the named lock. On collision with a stale holder, performs
    /// a TOCTOU-safe re-read-then-unlink before retrying once; a second
    /// collision (even with a stale holder) surfaces contention rather
    /// than looping, so a pathological thrasher can't starve other
    /// callers.
    pub fn acquire(&self, name: &str) -> Result<LockGuard, LockError> {
        if !is_valid_lock_name(name) {
            return Err(LockError::InvalidName(name.to_string()));
        }
        fs::create_dir_all(&self.locks_dir)?;
        let path = self.path_for(name);

        match self.try_create(&path, name) {
            Ok(guard) => Ok(guard),
            Err(LockError::Contention(_)) => {
                self.recover_if_stale(&path, name)?;
                self.try_create(&path, name)
            }
            Err(e) => Err(e),
        }
    }

    fn try_create(&self, path: &Path, name: &str) -> Result<LockGuard, LockError> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                let owner_id = LockOwnerId::new().to_string();
                let record = LockRecord {
                    id: owner_id.clone(),
                    pid: self.pid,
                    boot_id: self.boot_id.to_string(),
                    created_at: self.clock.now_ms(),
                    lock_version: 1,
                };
                let bytes = serde_json::to_vec(&record)?;
                file.write_all(&bytes)?;
                file.sync_all()?;
                if let Some(parent) = path.parent() {
                    if let Ok(dir) = File::open(parent) {
                        let _ = dir.sync_all();
                    }
                }
                Ok(LockGuard { name: name.to_string(), owner_id })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(LockError::Contention(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// If the current holder is stale, remove it — but only if a second
    /// read still shows the same owner `id` as the first (spec.md §8
    /// property 5: a lock whose owner changes between reads is never
    /// removed in that pass).
    fn recover_if_stale(&self, path: &Path, name: &str) -> Result<(), LockError> {
        let first = match Self::read_record(path) {
            Ok(r) => r,
            Err(_) => return Ok(()), // Vanished already; let the retry create() race it.
        };
        if !self.is_stale(&first) {
            return Ok(());
        }
        let second = match Self::read_record(path) {
            Ok(r) => r,
            Err(_) => return Ok(()),
        };
        if second.id != first.id {
            // Someone else already recovered and re-acquired between our reads.
            warn!(lock = name, "stale lock recovery aborted: owner changed mid-check");
            return Ok(());
        }
        info!(lock = name, pid = first.pid, "removing stale lock");
        let _ = fs::remove_file(path);
        Ok(())
    }

    /// Release the lock iff we are still the owner; refusal is logged,
    /// not an error (spec.md §4.3).
    pub fn release(&self, guard: &LockGuard) {
        let path = self.path_for(&guard.name);
        match Self::read_record(&path) {
            Ok(record) if record.id == guard.owner_id && record.pid == self.pid => {
                let _ = fs::remove_file(&path);
            }
            Ok(_) => {
                warn!(lock = %guard.name, "refusing to release lock: no longer the owner");
            }
            Err(_) => {
                warn!(lock = %guard.name, "refusing to release lock: ownership record missing");
            }
        }
    }

    /// Scan the locks directory and recover any stale entries (spec.md
    /// §4.7 step 6, run non-blockingly at boot).
    pub fn recover_stale_locks(&self) -> Result<Vec<String>, LockError> {
        fs::create_dir_all(&self.locks_dir)?;
        let mut recovered = Vec::new();
        for entry in fs::read_dir(&self.locks_dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .filter(|_| path.extension().and_then(|e| e.to_str()) == Some("lock"))
            else {
                continue;
            };
            let name = name.to_string();
            let before = Self::read_record(&path).ok();
            self.recover_if_stale(&path, &name)?;
            if before.is_some() && !path.exists() {
                recovered.push(name);
            }
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_core::FakeClock;

    fn manager(dir: &Path, clock: Arc<FakeClock>, max_age_ms: u64) -> LockManager<FakeClock> {
        LockManager::new(dir, BootId::new(), max_age_ms, clock)
    }

    #[test]
    fn acquire_then_contend() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FakeClock::new(1000));
        let mgr = manager(dir.path(), clock, 5_000);
        let _guard = mgr.acquire("queue-claim").unwrap();
        let err = mgr.acquire("queue-claim").unwrap_err();
        assert!(matches!(err, LockError::Contention(_)));
    }

    #[test]
    fn release_then_reacquire() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FakeClock::new(1000));
        let mgr = manager(dir.path(), clock, 5_000);
        let guard = mgr.acquire("queue-claim").unwrap();
        mgr.release(&guard);
        let guard2 = mgr.acquire("queue-claim");
        assert!(guard2.is_ok());
    }

    #[test]
    fn stale_by_age_is_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FakeClock::new(10_000));
        // Plant a lock file "aged" beyond max_age_ms, owned by our own pid
        // (guaranteed live) so only the age check can make it stale.
        let mgr = manager(dir.path(), clock.clone(), 5_000);
        let record = LockRecord {
            id: "lock-old".into(),
            pid: std::process::id(),
            boot_id: "boot-old".into(),
            created_at: 0,
            lock_version: 1,
        };
        fs::create_dir_all(dir.path()).unwrap();
        let path = dir.path().join("queue-claim.lock");
        fs::write(&path, serde_json::to_vec(&record).unwrap()).unwrap();

        let guard = mgr.acquire("queue-claim").unwrap();
        assert_ne!(guard.owner_id, "lock-old");
    }

    #[test]
    fn invalid_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FakeClock::new(1000));
        let mgr = manager(dir.path(), clock, 5_000);
        let err = mgr.acquire("../escape").unwrap_err();
        assert!(matches!(err, LockError::InvalidName(_)));
    }

    #[test]
    fn recover_stale_locks_scans_directory() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FakeClock::new(10_000));
        let mgr = manager(dir.path(), clock, 5_000);
        let record = LockRecord {
            id: "lock-old".into(),
            pid: 999_999, // Almost certainly dead.
            boot_id: "boot-old".into(),
            created_at: 9_999,
            lock_version: 1,
        };
        fs::create_dir_all(dir.path()).unwrap();
        fs::write(
            dir.path().join("abandoned.lock"),
            serde_json::to_vec(&record).unwrap(),
        )
        .unwrap();

        let recovered = mgr.recover_stale_locks().unwrap();
        assert_eq!(recovered, vec!["abandoned".to_string()]);
    }
}

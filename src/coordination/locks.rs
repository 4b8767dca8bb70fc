//! Per-record advisory locks.
//!
//! Each task record `task_<id>.json` is guarded by a sibling `task_<id>.lock`
//! file created with `create_new`. Because the lock lives next to the record
//! rather than in memory, independent processes sharing the directory exclude
//! each other as well as threads within one process.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use crate::config::StoreSettings;
use crate::error::{Error, Result};
use crate::task::TaskId;

/// A held lock. Released when dropped, on every exit path.
#[derive(Debug)]
pub struct RecordLock {
    path: PathBuf,
    label: String,
}

impl RecordLock {
    /// Name of the locked resource (task id or store-level name).
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Drop for RecordLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path)
            && e.kind() != ErrorKind::NotFound
        {
            log::warn!("Failed to release lock {}: {}", self.path.display(), e);
        }
    }
}

/// Acquires record locks with a bounded wait.
#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
    timeout: Duration,
    retry: Duration,
    /// Zero disables stale-lock recovery.
    stale_after: Duration,
}

impl LockManager {
    /// Create a lock manager for records stored in `dir`.
    pub fn new(dir: impl Into<PathBuf>, settings: &StoreSettings) -> Self {
        Self {
            dir: dir.into(),
            timeout: settings.lock_timeout(),
            retry: settings.lock_retry(),
            stale_after: settings.stale_lock(),
        }
    }

    /// Lock a single task record.
    pub fn acquire(&self, id: &TaskId) -> Result<RecordLock> {
        self.acquire_named(&format!("task_{}", id), id.as_ref())
    }

    /// Lock several records in ascending id order.
    ///
    /// A fixed global order means two multi-record operations can never each
    /// hold a lock the other is waiting for.
    pub fn acquire_many(&self, ids: &[TaskId]) -> Result<Vec<RecordLock>> {
        let mut ordered: Vec<&TaskId> = ids.iter().collect();
        ordered.sort();
        ordered.dedup();

        let mut held = Vec::with_capacity(ordered.len());
        for id in ordered {
            // Locks already taken are released by `held` dropping on error
            held.push(self.acquire(id)?);
        }
        Ok(held)
    }

    /// Whether a record is currently locked by anyone.
    pub fn is_locked(&self, id: &TaskId) -> bool {
        self.lock_path(&format!("task_{}", id)).exists()
    }

    pub(crate) fn acquire_named(&self, stem: &str, label: &str) -> Result<RecordLock> {
        let path = self.lock_path(stem);
        let started = Instant::now();
        let mut contended = false;

        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    // The pid is informational only; ownership is the file's existence
                    let _ = writeln!(file, "{}", std::process::id());
                    if contended {
                        log::debug!("Acquired contended lock {} after {:?}", label, started.elapsed());
                    }
                    return Ok(RecordLock {
                        path,
                        label: label.to_string(),
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    contended = true;

                    if self.is_stale(&path) {
                        log::warn!("Removing stale lock {} (older than {:?})", path.display(), self.stale_after);
                        match fs::remove_file(&path) {
                            Ok(()) => continue,
                            Err(e) if e.kind() == ErrorKind::NotFound => continue,
                            Err(e) => return Err(Error::storage(&path, e)),
                        }
                    }

                    let waited = started.elapsed();
                    if waited >= self.timeout {
                        log::warn!("Timed out waiting for lock {} after {:?}", label, waited);
                        return Err(Error::LockTimeout {
                            id: label.to_string(),
                            waited_ms: waited.as_millis() as u64,
                        });
                    }
                    thread::sleep(self.retry.min(self.timeout - waited));
                }
                Err(e) => return Err(Error::storage(&path, e)),
            }
        }
    }

    fn lock_path(&self, stem: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", stem))
    }

    fn is_stale(&self, path: &Path) -> bool {
        if self.stale_after.is_zero() {
            return false;
        }
        fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .is_some_and(|age| age > self.stale_after)
    }
}

//! Run lock: keeps two sync passes from overlapping and rate-limits reruns.
//!
//! Two files under the configured lock path:
//! * `<path>` holds the epoch-seconds timestamp of the last successful run;
//! * `<path>.lock` is the advisory lock, created with create-new semantics
//!   and removed when the guard drops.
//!
//! The timestamp is only rewritten after an overall-successful pass, so a
//! failed run does not suppress the retry.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use crate::error::{SyncError, SyncResult};

pub struct RunLock {
    state_path: PathBuf,
    min_interval_secs: u64,
}

#[derive(Debug)]
pub enum LockOutcome {
    Acquired(RunLockGuard),
    /// Another process holds the lock file.
    AlreadyRunning,
    /// Last successful run finished less than the minimum interval ago.
    RanRecently { seconds_ago: u64 },
}

#[derive(Debug)]
pub struct RunLockGuard {
    state_path: PathBuf,
    lock_path: PathBuf,
}

impl RunLock {
    pub fn new(state_path: impl Into<PathBuf>, min_interval_secs: u64) -> Self {
        Self {
            state_path: state_path.into(),
            min_interval_secs,
        }
    }

    pub fn acquire(&self) -> SyncResult<LockOutcome> {
        if let Some(parent) = self.state_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| SyncError::io(parent, e))?;
            }
        }

        let now = epoch_secs();
        if let Some(last) = read_timestamp(&self.state_path) {
            let seconds_ago = now.saturating_sub(last);
            if seconds_ago < self.min_interval_secs {
                return Ok(LockOutcome::RanRecently { seconds_ago });
            }
        }

        let lock_path = self.lock_path();
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(_) => {
                info!(lock = %lock_path.display(), "run lock acquired");
                Ok(LockOutcome::Acquired(RunLockGuard {
                    state_path: self.state_path.clone(),
                    lock_path,
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Ok(LockOutcome::AlreadyRunning)
            }
            Err(e) => Err(SyncError::io(lock_path, e)),
        }
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .state_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "run".to_string());
        name.push_str(".lock");
        self.state_path.with_file_name(name)
    }
}

impl RunLockGuard {
    /// Record the current time as the last successful run.
    pub fn mark_success(&self) {
        let result = fs::write(&self.state_path, epoch_secs().to_string());
        if let Err(e) = result {
            warn!(path = %self.state_path.display(), error = %e, "failed writing run timestamp");
        }
    }
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.lock_path) {
            warn!(path = %self.lock_path.display(), error = %e, "failed removing lock file");
        }
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn read_timestamp(path: &Path) -> Option<u64> {
    let content = fs::read_to_string(path).ok()?;
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.parse() {
        Ok(ts) => Some(ts),
        Err(_) => {
            warn!(path = %path.display(), "unparseable run timestamp; assuming no recent run");
            None
        }
    }
}

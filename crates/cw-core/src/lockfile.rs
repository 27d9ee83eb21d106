//! Best-effort daemon lockfile.
//!
//! The running daemon writes `<state_dir>/daemon.lock` (JSON: pid, start
//! time, version) next to the registry's own daemon record.
//!
//! ## Race safety
//!
//! `acquire()` uses `O_CREAT | O_EXCL` to atomically create the lockfile.
//! If two daemons race, exactly one wins the create; the loser gets
//! `AlreadyExists` and checks whether the winner is still alive.
//!
//! ## Stale lockfile recovery
//!
//! A lockfile whose PID is no longer alive (crash, SIGKILL) is removed and
//! the acquire retried once.

use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Contents of the lockfile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonLockfile {
    pub pid: u32,
    /// Epoch seconds.
    pub started_at: i64,
    pub version: String,
}

/// Result of trying to acquire the lockfile.
#[derive(Debug)]
pub enum AcquireResult {
    /// We created the lockfile and own it.
    Acquired,
    /// Another live daemon holds the lockfile.
    AlreadyRunning(DaemonLockfile),
    /// Stale lockfile was cleaned up; retry.
    StaleRemoved,
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("daemon already running (pid={})", .0.pid)]
    AlreadyRunning(DaemonLockfile),
    #[error("lockfile I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to acquire lockfile after stale cleanup")]
    Contended,
}

impl DaemonLockfile {
    /// Lockfile describing the current process.
    pub fn for_current_process(started_at: i64) -> Self {
        Self {
            pid: std::process::id(),
            started_at,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Try to exclusively create and write the lockfile at `path`.
    pub fn acquire(&self, path: &Path) -> std::io::Result<AcquireResult> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        match OpenOptions::new()
            .write(true)
            .create_new(true) // O_CREAT | O_EXCL
            .open(path)
        {
            Ok(mut file) => {
                let json = serde_json::to_string_pretty(self)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
                file.write_all(json.as_bytes())?;
                file.sync_all()?;
                Ok(AcquireResult::Acquired)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => match Self::read(path) {
                Some(existing) if existing.is_alive() => Ok(AcquireResult::AlreadyRunning(existing)),
                _ => {
                    tracing::info!(path = %path.display(), "removing stale daemon lockfile");
                    Self::remove(path);
                    Ok(AcquireResult::StaleRemoved)
                }
            },
            Err(e) => Err(e),
        }
    }

    /// Acquire with one retry after stale cleanup.
    pub fn acquire_or_fail(&self, path: &Path) -> Result<(), LockError> {
        for attempt in 0..2 {
            match self.acquire(path)? {
                AcquireResult::Acquired => return Ok(()),
                AcquireResult::AlreadyRunning(existing) => {
                    return Err(LockError::AlreadyRunning(existing));
                }
                AcquireResult::StaleRemoved if attempt == 0 => {
                    tracing::info!("stale lockfile removed, retrying acquire");
                }
                AcquireResult::StaleRemoved => break,
            }
        }
        Err(LockError::Contended)
    }

    /// Read the lockfile. Returns `None` if missing or unparseable.
    pub fn read(path: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Remove the lockfile.
    pub fn remove(path: &Path) {
        let _ = std::fs::remove_file(path);
    }

    /// Remove the lockfile only if it names `pid`.
    pub fn release(path: &Path, pid: u32) {
        if Self::read(path).is_some_and(|lock| lock.pid == pid) {
            Self::remove(path);
        }
    }

    /// Check if the PID in this lockfile is still alive.
    pub fn is_alive(&self) -> bool {
        pid_alive(self.pid)
    }

    /// Conventional lockfile path inside a state directory.
    pub fn path_in(state_dir: &Path) -> PathBuf {
        state_dir.join("daemon.lock")
    }
}

/// Check if a process with the given PID is alive.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: kill with signal 0 checks existence without sending a signal.
    let rc = unsafe { libc::kill(pid, 0) };
    // EPERM means the process exists but belongs to someone else.
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    // Assume alive so a lockfile is never removed by mistake.
    true
}

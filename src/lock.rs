//! Cross-process mutual exclusion over the shared workflow document.
//!
//! Ownership is a marker file created with `O_EXCL` semantics and carrying
//! the holder's pid, host, and acquisition time. A marker older than the
//! staleness threshold is presumed abandoned and forcibly reclaimed.
//!
//! The staleness reclamation is a heuristic, preserved as designed: a
//! slow-but-alive holder that stops touching the document for longer than
//! the threshold can have its lock seized by another process. This trades
//! a small safety window for liveness after crashes; it is not a
//! linearizable locking protocol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::LockSettings;
use crate::errors::CoordinationError;

/// Ownership metadata stored in the lock marker file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockMarker {
    /// Process ID that created the marker
    pub pid: u32,
    /// Hostname of the process that created the marker
    pub host: String,
    /// Timestamp when the lock was acquired
    pub acquired_at: DateTime<Utc>,
}

impl LockMarker {
    fn current() -> Self {
        Self {
            pid: process::id(),
            host: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string()),
            acquired_at: Utc::now(),
        }
    }

    /// Age of this marker relative to now.
    pub fn age(&self) -> Duration {
        (Utc::now() - self.acquired_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Exclusive ownership of the lock marker.
///
/// Releases on drop as a best effort; callers on the happy path should
/// call [`LockGuard::release`] so removal failures are observable.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    released: bool,
}

impl LockGuard {
    /// Delete the marker. Idempotent: a missing marker is not an error.
    pub fn release(mut self) -> Result<(), CoordinationError> {
        self.released = true;
        remove_marker(&self.path)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = remove_marker(&self.path) {
                warn!(path = %self.path.display(), error = %e, "failed to release lock on drop");
            }
        }
    }
}

fn remove_marker(path: &Path) -> Result<(), CoordinationError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CoordinationError::MarkerRemoveFailed {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Coordinates exclusive access to the workflow document across processes.
#[derive(Debug, Clone)]
pub struct LockCoordinator {
    lock_path: PathBuf,
    settings: LockSettings,
}

impl LockCoordinator {
    pub fn new(lock_path: PathBuf, settings: LockSettings) -> Self {
        Self {
            lock_path,
            settings,
        }
    }

    /// Attempt exclusive ownership, retrying with a fixed backoff.
    ///
    /// A pre-existing marker older than the staleness threshold is removed
    /// and the slot treated as available. Fails with
    /// [`CoordinationError::LockExhausted`] after the configured attempts.
    pub async fn acquire(&self) -> Result<LockGuard, CoordinationError> {
        let mut last_holder: Option<LockMarker> = None;

        for attempt in 1..=self.settings.max_attempts {
            match self.try_create_marker() {
                Ok(()) => {
                    debug!(path = %self.lock_path.display(), attempt, "lock acquired");
                    return Ok(LockGuard {
                        path: self.lock_path.clone(),
                        released: false,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    match self.read_marker() {
                        Some(marker) => {
                            if marker.age().as_secs() >= self.settings.stale_secs {
                                warn!(
                                    holder_pid = marker.pid,
                                    holder_host = %marker.host,
                                    age_secs = marker.age().as_secs(),
                                    "reclaiming stale lock marker"
                                );
                                remove_marker(&self.lock_path)?;
                                // Marker removed; retry immediately without backoff
                                continue;
                            }
                            last_holder = Some(marker);
                        }
                        None => {
                            // Unreadable marker: self-heal rather than wedge forever
                            warn!(path = %self.lock_path.display(), "removing corrupt lock marker");
                            remove_marker(&self.lock_path)?;
                            continue;
                        }
                    }
                }
                Err(e) => {
                    return Err(CoordinationError::MarkerWriteFailed {
                        path: self.lock_path.clone(),
                        source: e,
                    });
                }
            }

            if attempt < self.settings.max_attempts {
                tokio::time::sleep(Duration::from_millis(self.settings.retry_delay_ms)).await;
            }
        }

        let (holder_pid, holder_host) = last_holder
            .map(|m| (m.pid, m.host))
            .unwrap_or((0, "unknown".to_string()));
        Err(CoordinationError::LockExhausted {
            attempts: self.settings.max_attempts,
            holder_pid,
            holder_host,
        })
    }

    /// Delete the marker if present; never errors on a missing marker.
    pub fn release(&self) -> Result<(), CoordinationError> {
        remove_marker(&self.lock_path)
    }

    /// Read the current marker, if one exists and parses.
    pub fn read_marker(&self) -> Option<LockMarker> {
        let content = fs::read_to_string(&self.lock_path).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Atomic `create_new` acquisition; no TOCTOU window between the
    /// existence check and the claim.
    fn try_create_marker(&self) -> io::Result<()> {
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&self.lock_path)?;
        let marker = LockMarker::current();
        let json = serde_json::to_string_pretty(&marker)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

//! Advisory run lock for gpdeploy
//!
//! One lock file per cluster (keyed by coordinator address) prevents two
//! orchestrator runs from mutating the same hosts at once. The lock is
//! advisory: it coordinates gpdeploy processes on this control node only.

use camino::{Utf8Path, Utf8PathBuf};
use fd_lock::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::process;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Default age threshold for considering a lock stale (in seconds)
pub const DEFAULT_STALE_THRESHOLD_SECS: u64 = 3600;

const MAX_ACQUIRE_ATTEMPTS: u32 = 3;

/// Lock information stored in the lock file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Process ID that created the lock
    pub pid: u32,
    /// Seconds since UNIX epoch
    pub created_at: u64,
    /// Coordinator address the lock guards
    pub cluster: String,
    pub gpdeploy_version: String,
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error(
        "Another gpdeploy run holds the lock for '{cluster}' (PID {pid}, created {created_ago} ago)"
    )]
    ConcurrentExecution {
        cluster: String,
        pid: u32,
        created_ago: String,
    },

    #[error(
        "Stale lock detected for '{cluster}' (PID {pid}, age {age_secs}s). Use --force-lock to override"
    )]
    StaleLock {
        cluster: String,
        pid: u32,
        age_secs: u64,
    },

    #[error("Lock file is corrupted or invalid: {reason}")]
    CorruptedLock { reason: String },

    #[error("Failed to acquire lock: {reason}")]
    AcquisitionFailed { reason: String },

    #[error("Failed to release lock: {reason}")]
    ReleaseFailed { reason: String },

    #[error("IO error during lock operation: {0}")]
    Io(#[from] io::Error),
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// File name for a cluster's lock. Anything outside `[A-Za-z0-9._-]` becomes `_`.
#[must_use]
pub fn lock_file_name(cluster: &str) -> String {
    let safe: String = cluster
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{safe}.lock")
}

/// An acquired run lock. Released on drop.
pub struct RunLock {
    lock_path: Utf8PathBuf,
    _fd_lock: Option<Box<RwLock<fs::File>>>,
    lock_info: LockInfo,
}

impl RunLock {
    /// Acquire the lock for `cluster` inside `lock_dir`.
    ///
    /// Creation uses `create_new` so two processes cannot both succeed. An
    /// existing lock is overridden only when `force` is set; otherwise a live
    /// owner yields [`LockError::ConcurrentExecution`] and a dead owner older
    /// than `ttl_seconds` yields [`LockError::StaleLock`].
    pub fn acquire(
        lock_dir: &Utf8Path,
        cluster: &str,
        force: bool,
        ttl_seconds: Option<u64>,
    ) -> Result<Self, LockError> {
        fs::create_dir_all(lock_dir).map_err(|e| LockError::AcquisitionFailed {
            reason: format!("Failed to create lock directory '{lock_dir}': {e}"),
        })?;

        let lock_path = lock_dir.join(lock_file_name(cluster));
        let ttl = ttl_seconds.unwrap_or(DEFAULT_STALE_THRESHOLD_SECS);

        for attempt in 0..MAX_ACQUIRE_ATTEMPTS {
            let lock_info = LockInfo {
                pid: process::id(),
                created_at: now_secs(),
                cluster: cluster.to_string(),
                gpdeploy_version: env!("CARGO_PKG_VERSION").to_string(),
            };

            match fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&lock_path)
            {
                Ok(file) => return Self::finalize(lock_path, file, lock_info),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    Self::check_existing(&lock_path, cluster, force, ttl)?;
                    Self::remove_stale(&lock_path)?;
                    // Back off so two racing overrides do not spin in lockstep
                    let delay = 10u64.saturating_mul(2u64.saturating_pow(attempt));
                    std::thread::sleep(Duration::from_millis(delay.min(100)));
                }
                Err(e) => {
                    return Err(LockError::AcquisitionFailed {
                        reason: format!("Failed to create lock file '{lock_path}': {e}"),
                    });
                }
            }
        }

        Err(LockError::AcquisitionFailed {
            reason: format!(
                "Max attempts ({MAX_ACQUIRE_ATTEMPTS}) exceeded acquiring lock for '{cluster}'"
            ),
        })
    }

    fn finalize(
        lock_path: Utf8PathBuf,
        file: fs::File,
        lock_info: LockInfo,
    ) -> Result<Self, LockError> {
        let json =
            serde_json::to_string_pretty(&lock_info).map_err(|e| LockError::AcquisitionFailed {
                reason: format!("Failed to serialize lock info: {e}"),
            })?;

        let mut rw_lock = Box::new(RwLock::new(file));
        {
            let guard = rw_lock
                .try_write()
                .map_err(|_| LockError::ConcurrentExecution {
                    cluster: lock_info.cluster.clone(),
                    pid: 0,
                    created_ago: "unknown".to_string(),
                })?;
            let mut file_ref = &*guard;
            file_ref.write_all(json.as_bytes())?;
            file_ref.flush()?;
            file_ref.sync_all()?;
        }

        Ok(Self {
            lock_path,
            _fd_lock: Some(rw_lock),
            lock_info,
        })
    }

    fn check_existing(
        lock_path: &Utf8Path,
        cluster: &str,
        force: bool,
        ttl_seconds: u64,
    ) -> Result<(), LockError> {
        let content = match fs::read_to_string(lock_path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(LockError::CorruptedLock {
                    reason: format!("Failed to read existing lock: {e}"),
                });
            }
        };

        let existing: LockInfo = match serde_json::from_str(&content) {
            Ok(info) => info,
            // An unreadable lock can only be cleared deliberately
            Err(_) if force => return Ok(()),
            Err(e) => {
                return Err(LockError::CorruptedLock {
                    reason: format!("Failed to parse existing lock '{lock_path}': {e}"),
                });
            }
        };

        if force {
            return Ok(());
        }

        let age = now_secs().saturating_sub(existing.created_at);
        if !is_process_running(existing.pid) && age > ttl_seconds {
            return Err(LockError::StaleLock {
                cluster: cluster.to_string(),
                pid: existing.pid,
                age_secs: age,
            });
        }

        Err(LockError::ConcurrentExecution {
            cluster: cluster.to_string(),
            pid: existing.pid,
            created_ago: format_age(age),
        })
    }

    fn remove_stale(lock_path: &Utf8Path) -> Result<(), LockError> {
        let stale = lock_path.with_extension(format!("stale.{}", process::id()));
        match fs::rename(lock_path, &stale) {
            Ok(()) => {
                let _ = fs::remove_file(&stale);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LockError::AcquisitionFailed {
                reason: format!("Failed to remove stale lock '{lock_path}': {e}"),
            }),
        }
    }

    /// Read the lock for `cluster` without acquiring it.
    pub fn inspect(lock_dir: &Utf8Path, cluster: &str) -> Result<Option<LockInfo>, LockError> {
        let path = lock_dir.join(lock_file_name(cluster));
        match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)
                .map(Some)
                .map_err(|e| LockError::CorruptedLock {
                    reason: format!("Failed to parse lock file: {e}"),
                }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(LockError::Io(e)),
        }
    }

    /// Release explicitly, surfacing removal errors.
    pub fn release(mut self) -> Result<(), LockError> {
        self._fd_lock.take();
        if self.lock_path.exists() {
            fs::remove_file(&self.lock_path).map_err(|e| LockError::ReleaseFailed {
                reason: format!("Failed to remove lock file: {e}"),
            })?;
        }
        Ok(())
    }

    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.lock_path
    }

    #[must_use]
    pub const fn lock_info(&self) -> &LockInfo {
        &self.lock_info
    }
}

impl std::fmt::Debug for RunLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLock")
            .field("lock_path", &self.lock_path)
            .field("lock_info", &self.lock_info)
            .finish_non_exhaustive()
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        self._fd_lock.take();
        if self.lock_path.exists() {
            let _ = fs::remove_file(&self.lock_path);
        }
    }
}

fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let Ok(pid) = i32::try_from(pid) else {
            return false;
        };
        if pid <= 0 {
            return false;
        }
        // SAFETY: signal 0 performs only the existence/permission check.
        let rc = unsafe { libc::kill(pid, 0) };
        rc == 0
            || matches!(
                io::Error::last_os_error().raw_os_error(),
                Some(code) if code == libc::EPERM
            )
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

fn format_age(secs: u64) -> String {
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else if secs < 86400 {
        format!("{}h", secs / 3600)
    } else {
        format!("{}d", secs / 86400)
    }
}

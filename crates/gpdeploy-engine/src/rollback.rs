//! Backups before destructive steps, restore on failure, run cleanup.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use gpdeploy_utils::{CancelToken, DeployError};
use serde::{Deserialize, Serialize};
use shell_words::quote;

use crate::command::RemoteCommand;
use crate::connection::ConnectionManager;
use crate::credentials::CredentialContext;
use crate::executor::{CommandExecutor, ExecOptions};

/// Copy of a path taken on its own host right before it was changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backup {
    pub id: u64,
    pub host: String,
    pub target_path: String,
    pub snapshot_location: String,
    pub created_at: DateTime<Utc>,
    /// False when the target did not exist; restoring then removes it.
    pub existed: bool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct RollbackManager {
    executor: Arc<dyn CommandExecutor>,
    connections: Option<Arc<ConnectionManager>>,
    credentials: Arc<CredentialContext>,
    cancel: CancelToken,
    opts: ExecOptions,
    backups: Mutex<Vec<Backup>>,
    temp_files: Mutex<Vec<(String, String)>>,
    cleaned: AtomicBool,
    next_id: AtomicU64,
}

impl RollbackManager {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        connections: Option<Arc<ConnectionManager>>,
        credentials: Arc<CredentialContext>,
        cancel: CancelToken,
        opts: ExecOptions,
    ) -> Self {
        Self {
            executor,
            connections,
            credentials,
            cancel,
            opts,
            backups: Mutex::new(Vec::new()),
            temp_files: Mutex::new(Vec::new()),
            cleaned: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        }
    }

    /// Snapshot `target` on `host`. Returns `None` for simulated runs.
    pub fn snapshot(&self, host: &str, target: &str) -> Result<Option<Backup>, DeployError> {
        if self.executor.is_simulated() {
            return Ok(None);
        }

        let created_at = Utc::now();
        let snapshot_location = format!(
            "{}.gpdeploy-bak-{}",
            target.trim_end_matches('/'),
            created_at.format("%Y%m%d%H%M%S%3f")
        );
        let script = format!(
            "if [ -e {t} ]; then cp -a {t} {s} && echo existed; else echo absent; fi",
            t = quote(target),
            s = quote(&snapshot_location),
        );
        let output = self.executor.run(
            host,
            &RemoteCommand::new(format!("back up {target}"), script).idempotent(),
            &self.opts,
        )?;

        let backup = Backup {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            host: host.to_string(),
            target_path: target.to_string(),
            snapshot_location,
            created_at,
            existed: output.stdout_string().trim() == "existed",
        };
        tracing::debug!(host, target, existed = backup.existed, "backup taken");
        lock(&self.backups).push(backup.clone());
        Ok(Some(backup))
    }

    pub fn restore(&self, backup: &Backup) -> Result<(), DeployError> {
        let t = quote(&backup.target_path);
        let script = if backup.existed {
            format!("rm -rf {t} && mv {} {t}", quote(&backup.snapshot_location))
        } else {
            format!("rm -rf {t}")
        };
        tracing::info!(host = %backup.host, target = %backup.target_path, "restoring");
        self.executor
            .run(
                &backup.host,
                &RemoteCommand::new(format!("restore {}", backup.target_path), script),
                &self.opts,
            )
            .map(|_| ())
    }

    pub fn discard(&self, backup: &Backup) -> Result<(), DeployError> {
        if !backup.existed {
            return Ok(());
        }
        let script = format!("rm -rf {}", quote(&backup.snapshot_location));
        self.executor
            .run(
                &backup.host,
                &RemoteCommand::new(format!("discard backup of {}", backup.target_path), script)
                    .idempotent(),
                &self.opts,
            )
            .map(|_| ())
    }

    /// Restore every outstanding backup, newest first. Keeps going past
    /// individual failures and returns them.
    pub fn restore_all(&self) -> Vec<DeployError> {
        let backups = std::mem::take(&mut *lock(&self.backups));
        let mut errors = Vec::new();
        for backup in backups.iter().rev() {
            if let Err(e) = self.restore(backup) {
                tracing::warn!(host = %backup.host, target = %backup.target_path, error = %e, "restore failed");
                errors.push(e);
            }
        }
        errors
    }

    /// Drop every backup after a successful run.
    pub fn discard_all(&self) {
        let backups = std::mem::take(&mut *lock(&self.backups));
        for backup in &backups {
            if let Err(e) = self.discard(backup) {
                tracing::warn!(host = %backup.host, error = %e, "could not remove backup copy");
            }
        }
    }

    #[must_use]
    pub fn outstanding(&self) -> Vec<Backup> {
        lock(&self.backups).clone()
    }

    /// Remote scratch path removed by [`cleanup_run`](Self::cleanup_run).
    pub fn register_temp(&self, host: &str, path: &str) {
        lock(&self.temp_files).push((host.to_string(), path.to_string()));
    }

    /// Remove scratch files, close every channel and wipe credentials.
    /// Re-entrant: only the first call does anything.
    pub fn cleanup_run(&self) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }

        let temps = std::mem::take(&mut *lock(&self.temp_files));
        if self.cancel.is_forced() {
            if !temps.is_empty() {
                tracing::warn!(count = temps.len(), "forced stop; leaving remote scratch files");
            }
        } else {
            for (host, path) in temps {
                let cmd = RemoteCommand::new(format!("remove {path}"), format!("rm -rf {}", quote(&path)))
                    .idempotent();
                if let Err(e) = self.executor.run(&host, &cmd, &self.opts) {
                    tracing::warn!(host = %host, path = %path, error = %e, "scratch cleanup failed");
                }
            }
        }

        if let Some(connections) = &self.connections {
            connections.release_all();
        }
        self.credentials.zero();
        tracing::debug!("run cleanup finished");
    }

    #[must_use]
    pub fn is_cleaned(&self) -> bool {
        self.cleaned.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for RollbackManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollbackManager")
            .field("backups", &lock(&self.backups).len())
            .field("cleaned", &self.is_cleaned())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{DryRunExecutor, RemoteExecutor};
    use crate::test_support::{FakeReply, FakeTransport};
    use crate::trust::RejectHostKeys;
    use gpdeploy_utils::{Backoff, RetryPolicy};

    struct Fixture {
        fake: Arc<FakeTransport>,
        credentials: Arc<CredentialContext>,
        rollback: RollbackManager,
    }

    fn fixture() -> Fixture {
        let fake = Arc::new(FakeTransport::new());
        let credentials = Arc::new(CredentialContext::empty());
        let cancel = CancelToken::new();
        let cm = Arc::new(ConnectionManager::new(
            Arc::clone(&fake) as Arc<dyn crate::transport::Transport>,
            Arc::clone(&credentials),
            Arc::new(RejectHostKeys),
            cancel.clone(),
            "root",
        ));
        let executor = Arc::new(RemoteExecutor::new(Arc::clone(&cm), cancel.clone()));
        let opts = ExecOptions {
            retry: RetryPolicy::new(0, Backoff::None),
            ..ExecOptions::default()
        };
        let rollback = RollbackManager::new(executor, Some(cm), Arc::clone(&credentials), cancel, opts);
        Fixture {
            fake,
            credentials,
            rollback,
        }
    }

    #[test]
    fn restore_all_runs_newest_first() {
        let fx = fixture();
        fx.fake.on_exec(None, "if [ -e", FakeReply::ok("existed\n"));
        fx.rollback.snapshot("sdw1", "/etc/sysctl.d/90-gpdeploy.conf").unwrap();
        fx.rollback.snapshot("sdw2", "/data/primary").unwrap();

        assert!(fx.rollback.restore_all().is_empty());
        let restores: Vec<String> = fx
            .fake
            .exec_commands()
            .into_iter()
            .filter(|(_, cmd)| cmd.contains("&& mv "))
            .map(|(host, _)| host)
            .collect();
        assert_eq!(restores, ["sdw2", "sdw1"]);
        assert!(fx.rollback.outstanding().is_empty());
    }

    #[test]
    fn absent_target_is_removed_on_restore() {
        let fx = fixture();
        fx.fake.on_exec(None, "if [ -e", FakeReply::ok("absent\n"));
        let backup = fx.rollback.snapshot("sdw1", "/data/mirror").unwrap().unwrap();
        assert!(!backup.existed);
        fx.rollback.restore(&backup).unwrap();
        let last = fx.fake.commands_for("sdw1").pop().unwrap();
        assert_eq!(last, "rm -rf /data/mirror");
    }

    #[test]
    fn cleanup_is_reentrant() {
        let fx = fixture();
        fx.rollback.register_temp("sdw1", "/tmp/gpdeploy-run");
        fx.rollback.cleanup_run();
        fx.rollback.cleanup_run();
        assert_eq!(fx.credentials.zero_count(), 1);
        assert_eq!(fx.fake.closes("sdw1"), 1);
        let removals = fx
            .fake
            .commands_for("sdw1")
            .into_iter()
            .filter(|c| c.contains("/tmp/gpdeploy-run"))
            .count();
        assert_eq!(removals, 1);
    }

    #[test]
    fn simulated_runs_take_no_backups() {
        let credentials = Arc::new(CredentialContext::empty());
        let rollback = RollbackManager::new(
            Arc::new(DryRunExecutor::new()),
            None,
            Arc::clone(&credentials),
            CancelToken::new(),
            ExecOptions::default(),
        );
        assert!(rollback.snapshot("mdw", "/data").unwrap().is_none());
        assert!(rollback.outstanding().is_empty());
        rollback.cleanup_run();
        assert_eq!(credentials.zero_count(), 1);
    }
}

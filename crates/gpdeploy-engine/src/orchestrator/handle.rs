//! Stable entry point for the CLI and other embedders.

use camino::Utf8PathBuf;
use gpdeploy_config::DeployConfig;
use gpdeploy_utils::{Backoff, CancelToken, DeployError};

use super::{Collaborators, Orchestrator, RunMode, RunReport, RunRequest};
use crate::registry::HostRegistry;
use crate::state::{InstallationState, StateStore};

/// Runs installs and teardowns against one configured cluster.
///
/// Runs take `&mut self`: one run at a time per handle. Cancellation is
/// requested through [`cancel_token`](Self::cancel_token), typically from a
/// signal handler.
pub struct DeployHandle {
    config: DeployConfig,
    cancel: CancelToken,
    force_lock: bool,
    accept_host_keys: bool,
    backoff: Backoff,
    state_path: Option<Utf8PathBuf>,
    lock_dir: Option<Utf8PathBuf>,
    collaborators: Option<Collaborators>,
}

impl DeployHandle {
    #[must_use]
    pub fn new(config: DeployConfig) -> Self {
        Self {
            config,
            cancel: CancelToken::new(),
            force_lock: false,
            accept_host_keys: false,
            backoff: Backoff::default(),
            state_path: None,
            lock_dir: None,
            collaborators: None,
        }
    }

    #[must_use]
    pub fn with_force_lock(mut self, force: bool) -> Self {
        self.force_lock = force;
        self
    }

    #[must_use]
    pub fn with_accept_host_keys(mut self, accept: bool) -> Self {
        self.accept_host_keys = accept;
        self
    }

    /// Share `cancel` with the caller instead of a fresh token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_state_path(mut self, path: Utf8PathBuf) -> Self {
        self.state_path = Some(path);
        self
    }

    #[must_use]
    pub fn with_lock_dir(mut self, dir: Utf8PathBuf) -> Self {
        self.lock_dir = Some(dir);
        self
    }

    /// Use these collaborators for the next run instead of the terminal ones.
    #[must_use]
    pub fn with_collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = Some(collaborators);
        self
    }

    /// Token observed by every run of this handle.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    #[must_use]
    pub fn config(&self) -> &DeployConfig {
        &self.config
    }

    pub async fn install(&mut self) -> RunReport {
        self.run(RunMode::Install).await
    }

    pub async fn teardown(&mut self, remove_install: bool) -> RunReport {
        self.run(RunMode::Teardown { remove_install }).await
    }

    async fn run(&mut self, mode: RunMode) -> RunReport {
        let request = RunRequest {
            config: self.config.clone(),
            mode,
            force_lock: self.force_lock,
            backoff: self.backoff,
            lock_dir: self.lock_dir.clone(),
            state_path: self.state_path.clone(),
        };
        let collaborators = self
            .collaborators
            .take()
            .unwrap_or_else(|| Collaborators::interactive(self.accept_host_keys));
        Orchestrator::new(request, collaborators, self.cancel.clone())
            .run()
            .await
    }

    /// Last persisted state for the configured coordinator.
    ///
    /// # Errors
    ///
    /// Inventory validation errors, or an unreadable state file.
    pub fn status(&self) -> Result<Option<InstallationState>, DeployError> {
        let store = match &self.state_path {
            Some(path) => StateStore::new(path.clone()),
            None => StateStore::for_coordinator(HostRegistry::load(&self.config)?.coordinator()),
        };
        store.load()
    }
}

impl std::fmt::Debug for DeployHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeployHandle")
            .field("coordinator", &self.config.coordinator_host)
            .field("dry_run", &self.config.dry_run)
            .field("force_lock", &self.force_lock)
            .finish_non_exhaustive()
    }
}

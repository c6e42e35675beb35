//! Run assembly: validate inputs, take the cluster lock, collect credentials,
//! wire transport, channels, executor and rollback together, then hand the
//! phase list to the [`PhaseRunner`].
//!
//! Outside this module use [`DeployHandle`].

mod handle;

pub use self::handle::DeployHandle;

use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use chrono::Utc;
use gpdeploy_config::DeployConfig;
use gpdeploy_lock::RunLock;
use gpdeploy_runner::{NativeRunner, ProcessRunner, SshConfig};
use gpdeploy_utils::error::ConfigError;
use gpdeploy_utils::{Backoff, CancelToken, DeployError, ExitCode, RetryPolicy, paths};

use crate::connection::ConnectionManager;
use crate::credentials::{CollectOptions, CredentialContext, CredentialPrompt, TerminalPrompt};
use crate::executor::{CommandExecutor, DryRunExecutor, ExecOptions, RemoteExecutor};
use crate::packages::{PackageKind, ToolProbe, WhichProbe, ensure_password_automation};
use crate::phase::PhaseContext;
use crate::phases::{install_phases, teardown_phases};
use crate::registry::HostRegistry;
use crate::rollback::RollbackManager;
use crate::runner::PhaseRunner;
use crate::state::{InstallationState, StateStore};
use crate::transport::{SshTransport, Transport};
use crate::trust::{AcceptAllHostKeys, HostKeyPolicy, PromptHostKeys, RejectHostKeys};

/// Which phase sequence a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Install,
    /// `remove_install` also deletes the installation directory.
    Teardown { remove_install: bool },
}

impl RunMode {
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Teardown { .. } => "teardown",
        }
    }
}

/// Everything that parameterizes one run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub config: DeployConfig,
    pub mode: RunMode,
    pub force_lock: bool,
    pub backoff: Backoff,
    /// Defaults to `GPDEPLOY_HOME/locks`.
    pub lock_dir: Option<Utf8PathBuf>,
    /// Defaults to `GPDEPLOY_HOME/state/<coordinator>.json`.
    pub state_path: Option<Utf8PathBuf>,
}

impl RunRequest {
    #[must_use]
    pub fn new(config: DeployConfig, mode: RunMode) -> Self {
        Self {
            config,
            mode,
            force_lock: false,
            backoff: Backoff::default(),
            lock_dir: None,
            state_path: None,
        }
    }
}

/// The orchestrator's seams to the operator and the local machine.
pub struct Collaborators {
    /// Replaces the OpenSSH transport when set.
    pub transport: Option<Arc<dyn Transport>>,
    pub prompt: Arc<dyn CredentialPrompt>,
    pub probe: Arc<dyn ToolProbe>,
    pub host_keys: Arc<dyn HostKeyPolicy>,
    pub local_runner: Arc<dyn ProcessRunner>,
}

impl Collaborators {
    /// Terminal prompts, `PATH` probing and the native process runner.
    ///
    /// Host key warnings are accepted outright with `accept_host_keys`,
    /// asked about on a terminal, and rejected otherwise.
    #[must_use]
    pub fn interactive(accept_host_keys: bool) -> Self {
        let prompt: Arc<dyn CredentialPrompt> = Arc::new(TerminalPrompt);
        let host_keys: Arc<dyn HostKeyPolicy> = if accept_host_keys {
            Arc::new(AcceptAllHostKeys)
        } else if std::io::stdin().is_terminal() {
            Arc::new(PromptHostKeys::new(Arc::clone(&prompt)))
        } else {
            Arc::new(RejectHostKeys)
        };
        Self {
            transport: None,
            prompt,
            probe: Arc::new(WhichProbe),
            host_keys,
            local_runner: Arc::new(NativeRunner::new()),
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("custom_transport", &self.transport.is_some())
            .finish_non_exhaustive()
    }
}

/// Outcome of a run, including what it left behind.
#[derive(Debug)]
pub struct RunReport {
    pub result: Result<(), DeployError>,
    /// `None` when the run stopped before any phase started.
    pub state: Option<InstallationState>,
    /// `None` when the run stopped before credentials were collected.
    pub credentials: Option<Arc<CredentialContext>>,
}

impl RunReport {
    fn stopped(error: DeployError) -> Self {
        Self {
            result: Err(error),
            state: None,
            credentials: None,
        }
    }

    #[must_use]
    pub fn exit_code(&self) -> ExitCode {
        match &self.result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => e.to_exit_code(),
        }
    }

    /// # Errors
    ///
    /// The run's error, if it failed.
    pub fn into_result(self) -> Result<Option<InstallationState>, DeployError> {
        self.result.map(|()| self.state)
    }
}

fn check_package(key: &str, path: &Utf8PathBuf, accept_gppkg: bool) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidValue {
        key: key.to_string(),
        value: path.to_string(),
        reason: reason.to_string(),
    };
    let known = PackageKind::from_path(path.as_str()).is_some()
        || (accept_gppkg && path.extension() == Some("gppkg"));
    if !known {
        return Err(invalid("expected a .rpm or .deb package"));
    }
    if !path.is_file() {
        return Err(invalid("file does not exist"));
    }
    Ok(())
}

/// Local package files an install needs. Dry runs upload nothing.
///
/// # Errors
///
/// A missing installer path (including an enabled extension's), or a
/// package file that is absent or of an unknown kind.
pub fn validate_packages(config: &DeployConfig) -> Result<(), ConfigError> {
    let installer = config
        .installer_path
        .as_ref()
        .ok_or_else(|| ConfigError::MissingRequired("GPDB_INSTALLER_PATH".to_string()))?;
    check_package("GPDB_INSTALLER_PATH", installer, false)?;
    if config.install_pxf {
        let pxf = config
            .pxf_installer_path
            .as_ref()
            .ok_or_else(|| ConfigError::MissingRequired("PXF_INSTALLER_PATH".to_string()))?;
        check_package("PXF_INSTALLER_PATH", pxf, false)?;
    }
    if config.install_madlib {
        let madlib = config
            .madlib_installer_path
            .as_ref()
            .ok_or_else(|| ConfigError::MissingRequired("MADLIB_INSTALLER_PATH".to_string()))?;
        check_package("MADLIB_INSTALLER_PATH", madlib, true)?;
    }
    Ok(())
}

fn new_run_id() -> String {
    format!("{}-{}", Utc::now().format("%Y%m%dT%H%M%S"), std::process::id())
}

pub struct Orchestrator {
    request: RunRequest,
    collaborators: Collaborators,
    cancel: CancelToken,
}

impl Orchestrator {
    #[must_use]
    pub fn new(request: RunRequest, collaborators: Collaborators, cancel: CancelToken) -> Self {
        Self {
            request,
            collaborators,
            cancel,
        }
    }

    /// Execute the run. Never panics on operator or remote errors; they end
    /// up in the report.
    pub async fn run(self) -> RunReport {
        let config = &self.request.config;
        let registry = match HostRegistry::load(config) {
            Ok(registry) => registry,
            Err(e) => return RunReport::stopped(e.into()),
        };
        if self.request.mode == RunMode::Install
            && !config.dry_run
            && let Err(e) = validate_packages(config)
        {
            return RunReport::stopped(e.into());
        }

        let lock_dir = self.request.lock_dir.clone().unwrap_or_else(paths::locks_dir);
        let lock = match RunLock::acquire(&lock_dir, registry.coordinator(), self.request.force_lock, None) {
            Ok(lock) => lock,
            Err(e) => return RunReport::stopped(e.into()),
        };

        let credentials = match self.collect_credentials().await {
            Ok(credentials) => Arc::new(credentials),
            Err(e) => {
                release(lock);
                return RunReport::stopped(e);
            }
        };
        // Every path from here on wipes the credentials, panics included.
        let wipe = scopeguard::guard(Arc::clone(&credentials), |c| c.zero());

        let mut report = RunReport {
            result: Ok(()),
            state: None,
            credentials: Some(Arc::clone(&credentials)),
        };
        report.result = self.drive(registry, credentials, &mut report.state).await;

        drop(wipe);
        release(lock);
        report
    }

    async fn collect_credentials(&self) -> Result<CredentialContext, DeployError> {
        let config = &self.request.config;
        if config.dry_run {
            return Ok(CredentialContext::empty());
        }
        let prompt = Arc::clone(&self.collaborators.prompt);
        let probe = Arc::clone(&self.collaborators.probe);
        let runner = Arc::clone(&self.collaborators.local_runner);
        let key_file = config.ssh_key_file.clone();
        let reuse_default = config.ssh_reuse_password;

        let collected = tokio::task::spawn_blocking(move || {
            let automation_available =
                key_file.is_none() && ensure_password_automation(probe.as_ref(), runner.as_ref());
            CredentialContext::collect(
                prompt.as_ref(),
                &CollectOptions {
                    reuse_default,
                    key_file,
                    automation_available,
                },
            )
        })
        .await
        .map_err(|e| DeployError::Io(std::io::Error::other(format!("prompt worker failed: {e}"))))?;
        Ok(collected?)
    }

    fn transport(&self) -> Result<Arc<dyn Transport>, DeployError> {
        if let Some(transport) = &self.collaborators.transport {
            return Ok(Arc::clone(transport));
        }
        let config = &self.request.config;
        let control_dir = paths::control_socket_dir();
        paths::ensure_private_dir(&control_dir)?;
        let mut ssh = SshConfig::new(
            control_dir.as_std_path(),
            Duration::from_secs(config.connection_idle_timeout_secs),
        );
        ssh.identity_file = config
            .ssh_key_file
            .as_ref()
            .map(|p| p.as_std_path().to_path_buf());
        Ok(Arc::new(SshTransport::new(
            NativeRunner::new(),
            ssh,
            &config.ssh_user,
            config.ssh_port,
        )))
    }

    async fn drive(
        &self,
        registry: HostRegistry,
        credentials: Arc<CredentialContext>,
        state: &mut Option<InstallationState>,
    ) -> Result<(), DeployError> {
        let config = &self.request.config;
        let opts = ExecOptions::from_config(config, self.request.backoff);

        let (executor, connections): (Arc<dyn CommandExecutor>, Option<Arc<ConnectionManager>>) =
            if config.dry_run {
                tracing::info!("dry run: commands are simulated");
                (Arc::new(DryRunExecutor::new()), None)
            } else {
                let connections = Arc::new(
                    ConnectionManager::new(
                        self.transport()?,
                        Arc::clone(&credentials),
                        Arc::clone(&self.collaborators.host_keys),
                        self.cancel.clone(),
                        &config.ssh_user,
                    )
                    .with_idle_timeout(Duration::from_secs(config.connection_idle_timeout_secs))
                    .with_connect_retry(RetryPolicy::new(
                        config.command_max_retries,
                        self.request.backoff,
                    )),
                );
                let executor = RemoteExecutor::new(Arc::clone(&connections), self.cancel.clone());
                (Arc::new(executor), Some(connections))
            };

        let rollback = Arc::new(RollbackManager::new(
            Arc::clone(&executor),
            connections,
            credentials,
            self.cancel.clone(),
            opts.clone(),
        ));
        let _cleanup = scopeguard::guard(Arc::clone(&rollback), |r| r.cleanup_run());

        let (phases, remove_install) = match self.request.mode {
            RunMode::Install => (install_phases(config), false),
            RunMode::Teardown { remove_install } => (teardown_phases(), remove_install),
        };
        let store = StateStore::new(
            self.request
                .state_path
                .clone()
                .unwrap_or_else(|| paths::state_file(registry.coordinator())),
        );
        let run_id = new_run_id();
        tracing::info!(
            run_id = %run_id,
            mode = self.request.mode.label(),
            hosts = registry.hosts().len(),
            single_node = registry.is_single_node(),
            "starting run"
        );

        let ctx = Arc::new(PhaseContext::new(
            config.clone(),
            &run_id,
            registry,
            executor,
            rollback,
            self.cancel.clone(),
            opts,
            remove_install,
        ));
        let mut runner = PhaseRunner::new(ctx, self.request.mode.label(), Some(store));
        let result = runner.run(&phases).await;
        *state = Some(runner.into_state());
        result
    }
}

fn release(lock: RunLock) {
    if let Err(e) = lock.release() {
        tracing::warn!(error = %e, "could not release run lock");
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("mode", &self.request.mode)
            .field("dry_run", &self.request.config.dry_run)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DeployConfig {
        let mut config = DeployConfig::default();
        config.coordinator_host = Some("mdw".to_string());
        config.segment_hosts = vec!["sdw1".to_string()];
        config
    }

    #[test]
    fn install_requires_an_installer() {
        let err = validate_packages(&config()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired(ref k) if k == "GPDB_INSTALLER_PATH"));
    }

    #[test]
    fn installer_must_be_a_known_package_that_exists() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config();

        config.installer_path = Some(Utf8PathBuf::from("/nonexistent/greenplum.rpm"));
        let err = validate_packages(&config).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref reason, .. } if reason == "file does not exist"));

        let tarball = dir.path().join("greenplum.tar.gz");
        std::fs::write(&tarball, b"x").unwrap();
        config.installer_path = Some(Utf8PathBuf::from_path_buf(tarball).unwrap());
        let err = validate_packages(&config).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "GPDB_INSTALLER_PATH"));

        let rpm = dir.path().join("greenplum.rpm");
        std::fs::write(&rpm, b"x").unwrap();
        config.installer_path = Some(Utf8PathBuf::from_path_buf(rpm).unwrap());
        validate_packages(&config).unwrap();
    }

    #[test]
    fn enabled_extensions_need_their_installers() {
        let dir = tempfile::tempdir().unwrap();
        let rpm = dir.path().join("greenplum.rpm");
        std::fs::write(&rpm, b"x").unwrap();
        let mut config = config();
        config.installer_path = Some(Utf8PathBuf::from_path_buf(rpm).unwrap());

        config.install_pxf = true;
        let err = validate_packages(&config).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired(ref k) if k == "PXF_INSTALLER_PATH"));

        let pxf = dir.path().join("pxf.rpm");
        std::fs::write(&pxf, b"x").unwrap();
        config.pxf_installer_path = Some(Utf8PathBuf::from_path_buf(pxf).unwrap());
        validate_packages(&config).unwrap();

        config.install_madlib = true;
        let err = validate_packages(&config).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired(ref k) if k == "MADLIB_INSTALLER_PATH"));

        config.install_pxf = false;
        config.pxf_installer_path = None;
        let err = validate_packages(&config).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired(ref k) if k == "MADLIB_INSTALLER_PATH"));
    }

    #[tokio::test]
    async fn invalid_inventory_stops_before_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        let lock_dir = Utf8PathBuf::from_path_buf(dir.path().join("locks")).unwrap();
        let mut request = RunRequest::new(DeployConfig::default(), RunMode::Install);
        request.lock_dir = Some(lock_dir.clone());
        let report = Orchestrator::new(request, Collaborators::interactive(false), CancelToken::new())
            .run()
            .await;
        assert_eq!(report.exit_code(), ExitCode::VALIDATION);
        assert!(report.credentials.is_none());
        assert!(!lock_dir.exists());
    }
}

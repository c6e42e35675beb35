//! Process plumbing behind the connection manager.
//!
//! A [`Transport`] opens, uses and closes one channel per host. The
//! production implementation drives OpenSSH control masters; loopback
//! addresses run locally through `bash -c` without any socket.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use gpdeploy_runner::{
    CommandSpec, HostKeyMode, MasterAuth, ProcessOutput, ProcessRunner, RunnerError, SshConfig,
    SshFailure, SshTarget, classify_exec_failure, classify_master_failure,
};
use gpdeploy_utils::DeployError;
use gpdeploy_utils::error::AuthFailureCause;
use thiserror::Error;

const INTERACTIVE_OPEN_TIMEOUT: Duration = Duration::from_secs(300);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// OpenSSH control master addressed through a socket.
    ControlMaster,
    /// The control node itself; no socket.
    Loopback,
}

/// An authenticated channel to one host. Owned by the connection manager.
#[derive(Debug, Clone)]
pub struct Channel {
    /// Unique per run; a reopened channel gets a new id.
    pub id: u64,
    pub host: String,
    pub socket: Option<PathBuf>,
    pub kind: ChannelKind,
    pub opened_at: Instant,
    pub expires_at: Instant,
    pub authenticated: bool,
}

impl Channel {
    /// A freshly opened channel; the manager sets `id` and the expiry.
    #[must_use]
    pub fn opened(host: &str, kind: ChannelKind, socket: Option<PathBuf>) -> Self {
        let now = Instant::now();
        Self {
            id: 0,
            host: host.to_string(),
            socket,
            kind,
            opened_at: now,
            expires_at: now,
            authenticated: true,
        }
    }

    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    pub fn extend(&mut self, idle: Duration) {
        self.expires_at = Instant::now() + idle;
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{failure}: {stderr}")]
    Ssh { failure: SshFailure, stderr: String },

    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("transfer failed with exit code {exit_code:?}: {stderr}")]
    Failed {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error(transparent)]
    Local(#[from] RunnerError),
}

impl TransportError {
    #[must_use]
    pub fn is_channel_lost(&self) -> bool {
        matches!(
            self,
            Self::Ssh {
                failure: SshFailure::ChannelLost,
                ..
            }
        )
    }

    /// Attach host, login user and command to build the run-level error,
    /// scrubbing captured output with `redact`.
    #[must_use]
    pub fn into_deploy_with(
        self,
        host: &str,
        user: &str,
        command: &str,
        redact: impl Fn(&str) -> String,
    ) -> DeployError {
        match self {
            Self::Ssh { failure, stderr } => match failure {
                SshFailure::AuthRejected(rejection) => DeployError::Authentication {
                    host: host.to_string(),
                    user: user.to_string(),
                    cause: AuthFailureCause::from_rejection(rejection, user),
                },
                SshFailure::HostKeyUnknown => DeployError::HostKeyRejected {
                    host: host.to_string(),
                    changed: false,
                },
                SshFailure::HostKeyChanged => DeployError::HostKeyRejected {
                    host: host.to_string(),
                    changed: true,
                },
                SshFailure::Unreachable | SshFailure::ChannelLost => {
                    let detail = redact(stderr.trim());
                    DeployError::Connectivity {
                        host: host.to_string(),
                        reason: if detail.is_empty() {
                            failure.to_string()
                        } else {
                            format!("{failure}: {detail}")
                        },
                    }
                }
            },
            Self::Timeout(after) => DeployError::Timeout {
                host: host.to_string(),
                command: command.to_string(),
                timeout_secs: after.as_secs(),
            },
            Self::Failed { exit_code, stderr } => DeployError::CommandFailure {
                host: host.to_string(),
                command: command.to_string(),
                exit_code,
                stderr: redact(stderr.trim()),
            },
            Self::Local(e) => DeployError::Runner(e),
        }
    }
}

/// Channel operations. Implementations are blocking and are only called
/// with the host's channel lock held.
pub trait Transport: Send + Sync {
    fn open(
        &self,
        host: &str,
        auth: MasterAuth<'_>,
        host_keys: HostKeyMode,
    ) -> Result<Channel, TransportError>;

    /// Whether the channel still answers.
    fn check(&self, channel: &Channel) -> bool;

    fn exec(
        &self,
        channel: &Channel,
        command: &str,
        timeout: Duration,
    ) -> Result<ProcessOutput, TransportError>;

    fn upload(
        &self,
        channel: &Channel,
        local: &Path,
        remote: &str,
        timeout: Duration,
    ) -> Result<(), TransportError>;

    /// Best effort; never fails.
    fn close(&self, channel: &Channel);

    fn forget_host_key(&self, host: &str) -> Result<(), TransportError>;
}

/// Whether `host` names the control node itself.
#[must_use]
pub fn is_loopback_address(host: &str) -> bool {
    let host = host.trim().trim_end_matches('.');
    if host.eq_ignore_ascii_case("localhost") || host.eq_ignore_ascii_case("localhost.localdomain") {
        return true;
    }
    if let Ok(ip) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
        return ip.is_loopback();
    }
    local_hostname().is_some_and(|name| {
        name.eq_ignore_ascii_case(host)
            || name
                .split('.')
                .next()
                .is_some_and(|short| short.eq_ignore_ascii_case(host))
    })
}

#[cfg(unix)]
fn local_hostname() -> Option<String> {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
}

#[cfg(not(unix))]
fn local_hostname() -> Option<String> {
    None
}

/// OpenSSH-backed transport.
pub struct SshTransport<R: ProcessRunner> {
    runner: R,
    ssh: SshConfig,
    user: String,
    port: u16,
}

impl<R: ProcessRunner> SshTransport<R> {
    pub fn new(runner: R, ssh: SshConfig, user: impl Into<String>, port: u16) -> Self {
        Self {
            runner,
            ssh,
            user: user.into(),
            port,
        }
    }

    fn target(&self, host: &str) -> SshTarget {
        SshTarget::new(&self.user, host, self.port)
    }

    fn run(&self, spec: &CommandSpec, timeout: Duration) -> Result<ProcessOutput, TransportError> {
        self.runner.run(spec, timeout).map_err(|e| match e {
            RunnerError::Timeout { .. } => TransportError::Timeout(timeout),
            other => TransportError::Local(other),
        })
    }
}

impl<R: ProcessRunner> Transport for SshTransport<R> {
    fn open(
        &self,
        host: &str,
        auth: MasterAuth<'_>,
        host_keys: HostKeyMode,
    ) -> Result<Channel, TransportError> {
        if is_loopback_address(host) {
            tracing::debug!(host, "using loopback channel");
            return Ok(Channel::opened(host, ChannelKind::Loopback, None));
        }

        gpdeploy_utils::paths::ensure_dir_all(&self.ssh.control_dir).map_err(|e| {
            RunnerError::ExecutionFailed {
                reason: format!("cannot create control socket directory: {e}"),
            }
        })?;
        let target = self.target(host);
        let timeout = match auth {
            MasterAuth::Interactive => INTERACTIVE_OPEN_TIMEOUT,
            MasterAuth::Password(_) | MasterAuth::Key => self.ssh.connect_timeout * 3,
        };

        let output = match self.run(&self.ssh.master_spec(&target, auth, host_keys), timeout) {
            Ok(output) => output,
            Err(TransportError::Timeout(_)) => {
                return Err(TransportError::Ssh {
                    failure: SshFailure::Unreachable,
                    stderr: format!("no answer within {}s", timeout.as_secs()),
                });
            }
            Err(e) => return Err(e),
        };
        if output.success() {
            return Ok(Channel::opened(
                host,
                ChannelKind::ControlMaster,
                Some(self.ssh.control_path(&target)),
            ));
        }

        let stderr = output.stderr_string();
        let failure = classify_master_failure(output.exit_code, &stderr, auth)
            .unwrap_or(SshFailure::Unreachable);
        Err(TransportError::Ssh { failure, stderr })
    }

    fn check(&self, channel: &Channel) -> bool {
        match channel.kind {
            ChannelKind::Loopback => true,
            ChannelKind::ControlMaster => self
                .run(&self.ssh.check_spec(&self.target(&channel.host)), CLOSE_TIMEOUT)
                .is_ok_and(|o| o.success()),
        }
    }

    fn exec(
        &self,
        channel: &Channel,
        command: &str,
        timeout: Duration,
    ) -> Result<ProcessOutput, TransportError> {
        let spec = match channel.kind {
            ChannelKind::Loopback => CommandSpec::new("bash").arg("-c").arg(command),
            ChannelKind::ControlMaster => self.ssh.exec_spec(&self.target(&channel.host), command),
        };
        let output = self.run(&spec, timeout)?;
        if channel.kind == ChannelKind::ControlMaster
            && let Some(failure) = classify_exec_failure(output.exit_code, &output.stderr_string())
        {
            return Err(TransportError::Ssh {
                failure,
                stderr: output.stderr_string(),
            });
        }
        Ok(output)
    }

    fn upload(
        &self,
        channel: &Channel,
        local: &Path,
        remote: &str,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let spec = match channel.kind {
            ChannelKind::Loopback => CommandSpec::new("cp").arg(local.as_os_str()).arg(remote),
            ChannelKind::ControlMaster => {
                self.ssh
                    .scp_spec(&self.target(&channel.host), local, remote)
            }
        };
        let output = self.run(&spec, timeout)?;
        if output.success() {
            return Ok(());
        }
        let stderr = output.stderr_string();
        if channel.kind == ChannelKind::ControlMaster
            && let Some(failure) = classify_exec_failure(output.exit_code, &stderr)
        {
            return Err(TransportError::Ssh { failure, stderr });
        }
        Err(TransportError::Failed {
            exit_code: output.exit_code,
            stderr,
        })
    }

    fn close(&self, channel: &Channel) {
        if channel.kind == ChannelKind::Loopback {
            return;
        }
        let target = self.target(&channel.host);
        if let Err(e) = self.run(&self.ssh.exit_spec(&target), CLOSE_TIMEOUT) {
            tracing::debug!(host = %channel.host, error = %e, "control master exit failed");
        }
        if let Some(socket) = &channel.socket {
            let _ = std::fs::remove_file(socket);
        }
    }

    fn forget_host_key(&self, host: &str) -> Result<(), TransportError> {
        // A missing entry makes ssh-keygen exit non-zero; that is fine.
        self.run(&self.ssh.forget_host_key_spec(&self.target(host)), CLOSE_TIMEOUT)
            .map(|_| ())
    }
}

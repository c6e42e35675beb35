//! OpenSSH control-master argv builders and failure classification.
//!
//! One control master per host carries every command and copy for the run.
//! The master is started once (optionally under `sshpass -e`), later
//! invocations attach to its socket with `ControlMaster=no` and `BatchMode=yes`
//! so they can never fall back to prompting, and `-O exit` tears it down.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::CommandSpec;

/// Environment variable `sshpass -e` reads the password from.
pub const SSHPASS_ENV: &str = "SSHPASS";

/// Exit status OpenSSH uses for its own (transport) errors.
pub const SSH_TRANSPORT_EXIT: i32 = 255;

/// A remote login: user, address and port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SshTarget {
    pub user: String,
    pub host: String,
    pub port: u16,
}

impl SshTarget {
    #[must_use]
    pub fn new(user: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            port,
        }
    }

    /// `user@host`, with IPv6 literals left bare (ssh takes the port via `-p`).
    #[must_use]
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Destination prefix for scp, which needs IPv6 literals bracketed.
    fn scp_destination(&self) -> String {
        if self.host.contains(':') {
            format!("{}@[{}]", self.user, self.host)
        } else {
            self.destination()
        }
    }

    /// Key under which `known_hosts` stores this host.
    #[must_use]
    pub fn known_hosts_key(&self) -> String {
        if self.port == 22 {
            self.host.clone()
        } else {
            format!("[{}]:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// How the control master authenticates.
#[derive(Clone, Copy)]
pub enum MasterAuth<'a> {
    /// Automated password entry through `sshpass -e`.
    Password(&'a str),
    /// ssh prompts the operator on the inherited terminal.
    Interactive,
    /// Public key only; never prompts.
    Key,
}

impl fmt::Debug for MasterAuth<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(***)"),
            Self::Interactive => f.write_str("Interactive"),
            Self::Key => f.write_str("Key"),
        }
    }
}

impl MasterAuth<'_> {
    fn uses_password(&self) -> bool {
        !matches!(self, Self::Key)
    }
}

/// Host key checking applied when a master is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyMode {
    /// Unknown or changed keys abort the connection.
    Strict,
    /// Unknown keys are recorded; changed keys still abort.
    AcceptNew,
}

impl HostKeyMode {
    fn as_option(self) -> &'static str {
        match self {
            Self::Strict => "yes",
            Self::AcceptNew => "accept-new",
        }
    }
}

/// Why ssh refused the credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRejection {
    PasswordRejected,
    /// The server offered no password-based method.
    PasswordAuthDisabled,
    KeyRejected,
    Unknown,
}

/// Classified transport-level failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SshFailure {
    #[error("host unreachable")]
    Unreachable,

    #[error("authentication rejected ({0:?})")]
    AuthRejected(AuthRejection),

    #[error("host key is not known")]
    HostKeyUnknown,

    #[error("host key has changed")]
    HostKeyChanged,

    #[error("control channel lost")]
    ChannelLost,
}

/// Settings shared by every ssh invocation of a run.
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Directory holding control sockets.
    pub control_dir: PathBuf,
    /// `ControlPersist` idle window.
    pub persist: Duration,
    pub connect_timeout: Duration,
    pub identity_file: Option<PathBuf>,
    /// Alternate `known_hosts` file, used by tests.
    pub known_hosts: Option<PathBuf>,
}

impl SshConfig {
    #[must_use]
    pub fn new(control_dir: impl Into<PathBuf>, persist: Duration) -> Self {
        Self {
            control_dir: control_dir.into(),
            persist,
            connect_timeout: Duration::from_secs(10),
            identity_file: None,
            known_hosts: None,
        }
    }

    /// Socket path for `target`. Characters outside `[A-Za-z0-9._@-]` become `_`.
    #[must_use]
    pub fn control_path(&self, target: &SshTarget) -> PathBuf {
        let raw = format!("{}@{}-{}", target.user, target.host, target.port);
        let name: String = raw
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '@' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.control_dir.join(name)
    }

    fn with_common_options(&self, mut cmd: CommandSpec, target: &SshTarget) -> CommandSpec {
        cmd = cmd
            .ssh_option("ControlPath", self.control_path(target).display())
            .ssh_option("ConnectTimeout", self.connect_timeout.as_secs().max(1))
            .ssh_option("ServerAliveInterval", 30);
        if let Some(ref known_hosts) = self.known_hosts {
            cmd = cmd.ssh_option("UserKnownHostsFile", known_hosts.display());
        }
        if let Some(ref identity) = self.identity_file {
            cmd = cmd.arg("-i").arg(identity.as_os_str());
        }
        cmd
    }

    /// Start a backgrounded control master for `target`.
    ///
    /// With [`MasterAuth::Password`] the whole invocation runs under
    /// `sshpass -e` and the password is placed in the child environment.
    #[must_use]
    pub fn master_spec(
        &self,
        target: &SshTarget,
        auth: MasterAuth<'_>,
        host_keys: HostKeyMode,
    ) -> CommandSpec {
        let mut cmd = match auth {
            MasterAuth::Password(password) => CommandSpec::new("sshpass")
                .arg("-e")
                .arg("ssh")
                .env(SSHPASS_ENV, password),
            MasterAuth::Interactive | MasterAuth::Key => CommandSpec::new("ssh"),
        };

        cmd = cmd
            .args(["-M", "-N", "-f"])
            .arg("-p")
            .arg(target.port.to_string())
            .ssh_option("ControlMaster", "yes")
            .ssh_option("ControlPersist", format!("{}s", self.persist.as_secs()))
            .ssh_option("StrictHostKeyChecking", host_keys.as_option());
        cmd = self.with_common_options(cmd, target);

        cmd = match auth {
            MasterAuth::Password(_) => cmd
                .ssh_option("PreferredAuthentications", "password,keyboard-interactive")
                .ssh_option("PubkeyAuthentication", "no")
                .ssh_option("NumberOfPasswordPrompts", 1),
            MasterAuth::Interactive => cmd.ssh_option("NumberOfPasswordPrompts", 3).interactive(),
            MasterAuth::Key => cmd.ssh_option("BatchMode", "yes"),
        };

        cmd.arg(target.destination())
    }

    /// Ask the master whether it is alive (`-O check`).
    #[must_use]
    pub fn check_spec(&self, target: &SshTarget) -> CommandSpec {
        let cmd = CommandSpec::new("ssh").args(["-O", "check"]);
        self.with_common_options(cmd, target)
            .arg(target.destination())
    }

    /// Stop the master (`-O exit`).
    #[must_use]
    pub fn exit_spec(&self, target: &SshTarget) -> CommandSpec {
        let cmd = CommandSpec::new("ssh").args(["-O", "exit"]);
        self.with_common_options(cmd, target)
            .arg(target.destination())
    }

    /// Run `remote_command` through the master socket.
    #[must_use]
    pub fn exec_spec(&self, target: &SshTarget, remote_command: &str) -> CommandSpec {
        let cmd = CommandSpec::new("ssh")
            .arg("-p")
            .arg(target.port.to_string())
            .ssh_option("ControlMaster", "no")
            .ssh_option("BatchMode", "yes");
        self.with_common_options(cmd, target)
            .arg(target.destination())
            .arg("--")
            .arg(remote_command)
    }

    /// Copy a local file to `remote_path` through the master socket.
    #[must_use]
    pub fn scp_spec(&self, target: &SshTarget, local: &Path, remote_path: &str) -> CommandSpec {
        let cmd = CommandSpec::new("scp")
            .arg("-q")
            .arg("-P")
            .arg(target.port.to_string())
            .ssh_option("ControlMaster", "no")
            .ssh_option("BatchMode", "yes");
        self.with_common_options(cmd, target)
            .arg(local.as_os_str())
            .arg(format!("{}:{}", target.scp_destination(), remote_path))
    }

    /// Drop any stored key for `target` (`ssh-keygen -R`).
    #[must_use]
    pub fn forget_host_key_spec(&self, target: &SshTarget) -> CommandSpec {
        let mut cmd = CommandSpec::new("ssh-keygen")
            .arg("-R")
            .arg(target.known_hosts_key());
        if let Some(ref known_hosts) = self.known_hosts {
            cmd = cmd.arg("-f").arg(known_hosts.as_os_str());
        }
        cmd
    }
}

// sshpass(1) exit statuses
const SSHPASS_BAD_PASSWORD: i32 = 5;
const SSHPASS_HOST_KEY_UNKNOWN: i32 = 6;
const SSHPASS_HOST_KEY_CHANGED: i32 = 7;

/// Classify a failed master start.
///
/// Returns `None` when the failure does not look like a transport problem.
#[must_use]
pub fn classify_master_failure(
    exit_code: Option<i32>,
    stderr: &str,
    auth: MasterAuth<'_>,
) -> Option<SshFailure> {
    if matches!(auth, MasterAuth::Password(_)) {
        match exit_code {
            Some(SSHPASS_BAD_PASSWORD) => {
                return Some(SshFailure::AuthRejected(classify_auth(stderr, true)));
            }
            Some(SSHPASS_HOST_KEY_UNKNOWN) => return Some(SshFailure::HostKeyUnknown),
            Some(SSHPASS_HOST_KEY_CHANGED) => return Some(SshFailure::HostKeyChanged),
            _ => {}
        }
    }

    match classify_stderr(stderr, auth.uses_password()) {
        Some(failure) => Some(failure),
        None if exit_code == Some(SSH_TRANSPORT_EXIT) => Some(SshFailure::Unreachable),
        None => None,
    }
}

/// Classify a failed command run through an existing master.
///
/// Only exit 255 is considered; any other status belongs to the remote command.
/// An unrecognized 255 returns `None` so the caller can treat it as transient.
#[must_use]
pub fn classify_exec_failure(exit_code: Option<i32>, stderr: &str) -> Option<SshFailure> {
    if exit_code != Some(SSH_TRANSPORT_EXIT) {
        return None;
    }
    classify_stderr(stderr, false)
}

fn classify_stderr(stderr: &str, used_password: bool) -> Option<SshFailure> {
    let lower = stderr.to_ascii_lowercase();

    if lower.contains("remote host identification has changed") {
        return Some(SshFailure::HostKeyChanged);
    }
    if lower.contains("host key verification failed") || lower.contains("host key is known for") {
        return Some(SshFailure::HostKeyUnknown);
    }
    if lower.contains("permission denied") || lower.contains("too many authentication failures") {
        return Some(SshFailure::AuthRejected(classify_auth(&lower, used_password)));
    }

    const UNREACHABLE: &[&str] = &[
        "connection refused",
        "no route to host",
        "could not resolve hostname",
        "name or service not known",
        "connection timed out",
        "operation timed out",
        "network is unreachable",
    ];
    if UNREACHABLE.iter().any(|needle| lower.contains(needle)) {
        return Some(SshFailure::Unreachable);
    }

    const LOST: &[&str] = &[
        "control socket connect",
        "master is not running",
        "mux_client",
        "broken pipe",
        "connection reset",
        "connection closed by",
    ];
    if LOST.iter().any(|needle| lower.contains(needle)) {
        return Some(SshFailure::ChannelLost);
    }

    None
}

/// Inspect `Permission denied (method,method).` for the offered methods.
fn classify_auth(stderr: &str, used_password: bool) -> AuthRejection {
    let lower = stderr.to_ascii_lowercase();
    let methods = lower
        .split("permission denied (")
        .nth(1)
        .and_then(|rest| rest.split(')').next());

    if !used_password {
        return AuthRejection::KeyRejected;
    }
    match methods {
        Some(list) if !list.contains("password") && !list.contains("keyboard-interactive") => {
            AuthRejection::PasswordAuthDisabled
        }
        Some(_) => AuthRejection::PasswordRejected,
        None if lower.is_empty() => AuthRejection::PasswordRejected,
        None => AuthRejection::Unknown,
    }
}

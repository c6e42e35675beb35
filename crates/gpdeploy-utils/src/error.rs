use std::fmt;
use std::io;
use thiserror::Error;

pub use gpdeploy_lock::LockError;
pub use gpdeploy_runner::RunnerError;
use gpdeploy_runner::AuthRejection;

use crate::exit_codes::ExitCode;
use crate::types::{ErrorKind, HostRole, PhaseId, RunState};

/// Library-level error type for gpdeploy.
///
/// Variants follow the orchestrator's failure taxonomy:
///
/// | Variant | Meaning | Retried? |
/// |---------|---------|----------|
/// | `Config`, `Validation`, `Credential` | bad or incomplete input | never |
/// | `Connectivity` | host unreachable | with backoff, up to a bound |
/// | `Authentication` | credential rejected | never |
/// | `HostKeyRejected` | host key warning not acknowledged | never |
/// | `Timeout` | command exceeded its bound | one replay if idempotent |
/// | `CommandFailure` | remote command failed | only for retryable exit codes |
/// | `PartialInstall` | a phase barrier failed; triggers rollback | never |
///
/// Library code returns `DeployError` and does NOT call `std::process::exit()`;
/// the CLI maps it through [`DeployError::to_exit_code`].
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Host {host} is unreachable: {reason}")]
    Connectivity { host: String, reason: String },

    #[error("Authentication to {host} as {user} was rejected ({cause})")]
    Authentication {
        host: String,
        user: String,
        cause: AuthFailureCause,
    },

    #[error("Host key for {host} {} and was not accepted", key_state(.changed))]
    HostKeyRejected { host: String, changed: bool },

    #[error("Command on {host} timed out after {timeout_secs}s: {command}")]
    Timeout {
        host: String,
        command: String,
        timeout_secs: u64,
    },

    #[error("Command on {host} failed with exit code {}: {command}", fmt_exit(.exit_code))]
    CommandFailure {
        host: String,
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Phase {phase} failed on {host} at step '{step}': {source}")]
    PartialInstall {
        host: String,
        phase: PhaseId,
        step: String,
        #[source]
        source: Box<DeployError>,
    },

    #[error("Phase error: {0}")]
    Phase(#[from] PhaseError),

    #[error("Interrupted by operator")]
    Interrupted,

    #[error("Run lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Local process error: {0}")]
    Runner(#[from] RunnerError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

fn key_state(changed: &bool) -> &'static str {
    if *changed { "has changed" } else { "is unknown" }
}

fn fmt_exit(code: &Option<i32>) -> String {
    code.map_or_else(|| "none (killed by signal)".to_string(), |c| c.to_string())
}

impl DeployError {
    /// Follow `PartialInstall` wrappers down to the error that started it.
    #[must_use]
    pub fn root_cause(&self) -> &DeployError {
        match self {
            Self::PartialInstall { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Host the error is attributed to, if any.
    #[must_use]
    pub fn host(&self) -> Option<&str> {
        match self {
            Self::Connectivity { host, .. }
            | Self::Authentication { host, .. }
            | Self::HostKeyRejected { host, .. }
            | Self::Timeout { host, .. }
            | Self::CommandFailure { host, .. }
            | Self::PartialInstall { host, .. } => Some(host),
            _ => None,
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        crate::exit_codes::error_to_exit_code_and_kind(self).1
    }

    #[must_use]
    pub fn to_exit_code(&self) -> ExitCode {
        crate::exit_codes::error_to_exit_code_and_kind(self).0
    }

    /// Authentication and validation problems never improve by retrying.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connectivity { .. })
    }

    /// Multi-line rendering with context and suggestions.
    #[must_use]
    pub fn display_for_user(&self) -> String {
        let mut out = format!("Error: {}", self.user_message());
        if let Some(context) = self.context() {
            out.push_str(&format!("\n\n{context}"));
        }
        let suggestions = self.suggestions();
        if !suggestions.is_empty() {
            out.push_str("\n\nSuggestions:");
            for suggestion in suggestions {
                out.push_str(&format!("\n  - {suggestion}"));
            }
        }
        out
    }
}

/// Trait for providing user-friendly error reporting with context and suggestions
pub trait UserFriendlyError {
    /// Get a user-friendly error message
    fn user_message(&self) -> String;

    /// Get contextual information about the error
    fn context(&self) -> Option<String>;

    /// Get suggested actions to resolve the error
    fn suggestions(&self) -> Vec<String>;

    /// Get the error category for grouping similar errors
    fn category(&self) -> ErrorCategory;
}

/// Error categories for grouping similar errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Validation,
    Connectivity,
    Authentication,
    Security,
    RemoteExecution,
    Concurrency,
    FileSystem,
    Interrupted,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "Configuration"),
            Self::Validation => write!(f, "Validation"),
            Self::Connectivity => write!(f, "Connectivity"),
            Self::Authentication => write!(f, "Authentication"),
            Self::Security => write!(f, "Security"),
            Self::RemoteExecution => write!(f, "Remote Execution"),
            Self::Concurrency => write!(f, "Concurrency"),
            Self::FileSystem => write!(f, "File System"),
            Self::Interrupted => write!(f, "Interrupted"),
        }
    }
}

/// Why authentication was refused, refined with what we know about the login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailureCause {
    PasswordRejected,
    PasswordAuthDisabled,
    KeyRejected,
    /// Password rejected for `root`; typically `PermitRootLogin` forbids it.
    RootLoginDenied,
    Unknown,
}

impl AuthFailureCause {
    /// Refine the transport classification with the login user.
    #[must_use]
    pub fn from_rejection(rejection: AuthRejection, user: &str) -> Self {
        match rejection {
            AuthRejection::PasswordRejected if user == "root" => Self::RootLoginDenied,
            AuthRejection::PasswordRejected => Self::PasswordRejected,
            AuthRejection::PasswordAuthDisabled => Self::PasswordAuthDisabled,
            AuthRejection::KeyRejected => Self::KeyRejected,
            AuthRejection::Unknown => Self::Unknown,
        }
    }
}

impl fmt::Display for AuthFailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::PasswordRejected => "password rejected",
            Self::PasswordAuthDisabled => "password authentication disabled on the server",
            Self::KeyRejected => "public key rejected",
            Self::RootLoginDenied => "password rejected for root (root login may be disabled)",
            Self::Unknown => "reason unknown",
        };
        f.write_str(text)
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found at {path}")]
    NotFound { path: String },

    #[error("{path}:{line}: {reason}")]
    Parse {
        path: String,
        line: usize,
        reason: String,
    },

    #[error("Invalid configuration value for {key}: '{value}' ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Missing required configuration: {0}")]
    MissingRequired(String),
}

impl UserFriendlyError for ConfigError {
    fn user_message(&self) -> String {
        match self {
            Self::NotFound { path } => format!("Configuration file not found: {path}"),
            Self::Parse { path, line, reason } => {
                format!("Configuration file {path} could not be parsed at line {line}: {reason}")
            }
            Self::InvalidValue { key, value, reason } => {
                format!("Configuration '{key}' has invalid value '{value}': {reason}")
            }
            Self::MissingRequired(key) => format!("Required configuration '{key}' is missing"),
        }
    }

    fn context(&self) -> Option<String> {
        match self {
            Self::NotFound { .. } => Some(
                "gpdeploy looks for --config, then $GPDEPLOY_CONFIG, then ./gpdeploy.conf."
                    .to_string(),
            ),
            Self::Parse { .. } => Some(
                "The file uses shell-style KEY=value lines; arrays are written KEY=(a b c)."
                    .to_string(),
            ),
            Self::InvalidValue { .. } | Self::MissingRequired(_) => None,
        }
    }

    fn suggestions(&self) -> Vec<String> {
        match self {
            Self::NotFound { .. } => vec![
                "Pass the file explicitly with --config <path>".to_string(),
                "Run 'gpdeploy config' to see which settings are in effect".to_string(),
            ],
            Self::Parse { .. } => vec![
                "Quote values containing spaces: KEY=\"a value\"".to_string(),
                "Close every array with ')'".to_string(),
            ],
            Self::InvalidValue { key, .. } => {
                vec![format!("Fix the value of {key} in the configuration file")]
            }
            Self::MissingRequired(key) => vec![format!("Add {key}=... to the configuration file")],
        }
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Configuration
    }
}

/// Host inventory validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("coordinator host is not configured")]
    MissingCoordinator,

    #[error("no {0} hosts are configured")]
    MissingRole(HostRole),

    #[error("host '{address}' is listed as both {first} and {second}")]
    DuplicateHost {
        address: String,
        first: HostRole,
        second: HostRole,
    },

    #[error("host address '{address}' is invalid: {reason}")]
    InvalidAddress { address: String, reason: String },
}

impl UserFriendlyError for ValidationError {
    fn user_message(&self) -> String {
        format!("Host inventory is invalid: {self}")
    }

    fn context(&self) -> Option<String> {
        match self {
            Self::DuplicateHost { .. } => Some(
                "Addresses are compared after trimming, lowercasing and dropping a trailing dot."
                    .to_string(),
            ),
            _ => None,
        }
    }

    fn suggestions(&self) -> Vec<String> {
        match self {
            Self::MissingCoordinator => {
                vec!["Set GPDB_COORDINATOR_HOST or pass --host for a single-node install".to_string()]
            }
            Self::MissingRole(_) => vec!["Set GPDB_SEGMENT_HOSTS=(host1 host2 ...)".to_string()],
            Self::DuplicateHost { .. } => vec![
                "List each host once; for a single node set GPDB_SEGMENT_HOSTS to the coordinator only"
                    .to_string(),
            ],
            Self::InvalidAddress { .. } => {
                vec!["Use a plain hostname or IP address without user or port".to_string()]
            }
        }
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Validation
    }
}

/// Credential collection errors (input errors)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("passwords do not match")]
    Mismatch,

    #[error("password must not be empty")]
    Empty,

    #[error("password must be at least {min} characters")]
    TooShort { min: usize },

    #[error("could not read from terminal: {0}")]
    PromptFailed(String),

    #[error("identity file '{0}' does not exist")]
    MissingKeyFile(String),
}

impl UserFriendlyError for CredentialError {
    fn user_message(&self) -> String {
        format!("Credential input rejected: {self}")
    }

    fn context(&self) -> Option<String> {
        None
    }

    fn suggestions(&self) -> Vec<String> {
        match self {
            Self::PromptFailed(_) => vec![
                "Run gpdeploy from an interactive terminal".to_string(),
                "Or configure SSH_KEY_FILE to use key-based login".to_string(),
            ],
            Self::MissingKeyFile(_) => vec!["Check the SSH_KEY_FILE path".to_string()],
            _ => vec!["Re-run and enter the same password twice".to_string()],
        }
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Validation
    }
}

/// Phase sequencing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PhaseError {
    #[error("invalid run state transition {from} -> {to}")]
    InvalidTransition { from: RunState, to: RunState },

    #[error("phase {phase} cannot start: {dependency} is not done on {}", .pending_hosts.join(", "))]
    DependencyNotSatisfied {
        phase: PhaseId,
        dependency: PhaseId,
        pending_hosts: Vec<String>,
    },
}

impl UserFriendlyError for PhaseError {
    fn user_message(&self) -> String {
        self.to_string()
    }

    fn context(&self) -> Option<String> {
        Some("Phases run in a fixed order and each waits for its predecessor on every host.".to_string())
    }

    fn suggestions(&self) -> Vec<String> {
        vec!["This indicates an internal sequencing bug; re-run with --verbose and report it".to_string()]
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::RemoteExecution
    }
}

impl UserFriendlyError for LockError {
    fn user_message(&self) -> String {
        match self {
            Self::ConcurrentExecution {
                cluster,
                pid,
                created_ago,
            } => format!(
                "Another gpdeploy run is already working on '{cluster}' (PID {pid}, started {created_ago} ago)"
            ),
            Self::StaleLock {
                cluster, age_secs, ..
            } => format!("A stale run lock exists for '{cluster}' (age {age_secs}s)"),
            other => other.to_string(),
        }
    }

    fn context(&self) -> Option<String> {
        Some(
            "gpdeploy holds an advisory lock per coordinator so two runs never change the same hosts at once."
                .to_string(),
        )
    }

    fn suggestions(&self) -> Vec<String> {
        match self {
            Self::ConcurrentExecution { pid, .. } => vec![
                format!("Wait for process {pid} to finish"),
                "If that process is gone, re-run with --force-lock".to_string(),
            ],
            Self::StaleLock { .. } | Self::CorruptedLock { .. } => {
                vec!["Re-run with --force-lock to replace the lock".to_string()]
            }
            _ => vec!["Check permissions on the gpdeploy home directory".to_string()],
        }
    }

    fn category(&self) -> ErrorCategory {
        ErrorCategory::Concurrency
    }
}

impl UserFriendlyError for DeployError {
    fn user_message(&self) -> String {
        match self {
            Self::Config(e) => e.user_message(),
            Self::Validation(e) => e.user_message(),
            Self::Credential(e) => e.user_message(),
            Self::Phase(e) => e.user_message(),
            Self::Lock(e) => e.user_message(),
            Self::CommandFailure {
                host,
                command,
                exit_code,
                stderr,
            } => {
                let mut msg = format!(
                    "Command failed on {host} (exit code {}): {command}",
                    fmt_exit(exit_code)
                );
                let trimmed = stderr.trim();
                if !trimmed.is_empty() {
                    msg.push_str(&format!("\n{trimmed}"));
                }
                msg
            }
            Self::PartialInstall {
                host,
                phase,
                step,
                source,
            } => format!(
                "Installation failed during {phase} on {host} (step '{step}'): {}",
                source.user_message()
            ),
            other => other.to_string(),
        }
    }

    fn context(&self) -> Option<String> {
        match self {
            Self::Config(e) => e.context(),
            Self::Validation(e) => e.context(),
            Self::Credential(e) => e.context(),
            Self::Phase(e) => e.context(),
            Self::Lock(e) => e.context(),
            Self::PartialInstall { source, .. } => {
                let mut context = String::from(
                    "The run was stopped and backups taken before destructive steps were restored.",
                );
                if let Some(inner) = source.context() {
                    context.push(' ');
                    context.push_str(&inner);
                }
                Some(context)
            }
            Self::Timeout { .. } => Some(
                "Timed-out commands may have partly changed the host; they are replayed only when safe to repeat."
                    .to_string(),
            ),
            Self::HostKeyRejected { .. } => Some(
                "gpdeploy never trusts an unknown or changed host key without acknowledgement."
                    .to_string(),
            ),
            _ => None,
        }
    }

    fn suggestions(&self) -> Vec<String> {
        match self {
            Self::Config(e) => e.suggestions(),
            Self::Validation(e) => e.suggestions(),
            Self::Credential(e) => e.suggestions(),
            Self::Phase(e) => e.suggestions(),
            Self::Lock(e) => e.suggestions(),
            Self::Connectivity { host, .. } => vec![
                format!("Check that {host} resolves and that sshd is listening"),
                "Verify SSH_PORT and any firewall between this node and the host".to_string(),
            ],
            Self::Authentication { host, cause, .. } => match cause {
                AuthFailureCause::RootLoginDenied => vec![
                    format!("Enable root SSH login on {host}: set 'PermitRootLogin yes' in /etc/ssh/sshd_config and restart sshd"),
                    "Or set SSH_USER to an account with sudo rights".to_string(),
                ],
                AuthFailureCause::PasswordAuthDisabled => vec![
                    format!("Enable password login on {host}: set 'PasswordAuthentication yes' in /etc/ssh/sshd_config"),
                    "Or configure SSH_KEY_FILE to use key-based login".to_string(),
                ],
                AuthFailureCause::KeyRejected => vec![
                    format!("Append the public key of SSH_KEY_FILE to ~/.ssh/authorized_keys on {host}"),
                ],
                _ => vec!["Check the password; repeated failures may lock the account".to_string()],
            },
            Self::HostKeyRejected { host, changed } => {
                let mut out = vec!["Re-run with --accept-host-keys to trust new keys".to_string()];
                if *changed {
                    out.insert(
                        0,
                        format!("Confirm that {host} was legitimately reinstalled before accepting its new key"),
                    );
                }
                out
            }
            Self::Timeout { .. } => vec![
                "Raise COMMAND_TIMEOUT_SECS for slow hosts".to_string(),
                "Inspect the host before re-running".to_string(),
            ],
            Self::CommandFailure { .. } => {
                vec!["Re-run with --verbose to see every command and its output".to_string()]
            }
            Self::PartialInstall { source, .. } => source.suggestions(),
            Self::Interrupted => vec!["Re-run the same command to start over".to_string()],
            Self::Runner(RunnerError::ToolNotFound { tool }) => {
                vec![format!("Install '{tool}' on this control node")]
            }
            Self::Runner(_) | Self::Io(_) => Vec::new(),
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Validation(_) | Self::Credential(_) => ErrorCategory::Validation,
            Self::Connectivity { .. } => ErrorCategory::Connectivity,
            Self::Authentication { .. } => ErrorCategory::Authentication,
            Self::HostKeyRejected { .. } => ErrorCategory::Security,
            Self::Timeout { .. } | Self::CommandFailure { .. } | Self::Phase(_) => {
                ErrorCategory::RemoteExecution
            }
            Self::PartialInstall { source, .. } => source.category(),
            Self::Interrupted => ErrorCategory::Interrupted,
            Self::Lock(_) => ErrorCategory::Concurrency,
            Self::Runner(_) | Self::Io(_) => ErrorCategory::FileSystem,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth_error(cause: AuthFailureCause) -> DeployError {
        DeployError::Authentication {
            host: "sdw2".to_string(),
            user: "root".to_string(),
            cause,
        }
    }

    #[test]
    fn root_password_rejection_suggests_enabling_root_login() {
        let cause = AuthFailureCause::from_rejection(AuthRejection::PasswordRejected, "root");
        assert_eq!(cause, AuthFailureCause::RootLoginDenied);
        let suggestions = auth_error(cause).suggestions();
        assert!(suggestions[0].contains("PermitRootLogin"));
        assert!(suggestions[0].contains("sdw2"));
    }

    #[test]
    fn non_root_rejection_stays_password_rejected() {
        assert_eq!(
            AuthFailureCause::from_rejection(AuthRejection::PasswordRejected, "gpadmin"),
            AuthFailureCause::PasswordRejected
        );
    }

    #[test]
    fn partial_install_reports_root_cause() {
        let err = DeployError::PartialInstall {
            host: "sdw2".to_string(),
            phase: PhaseId::HostSetup,
            step: "connect".to_string(),
            source: Box::new(auth_error(AuthFailureCause::PasswordRejected)),
        };
        assert!(matches!(err.root_cause(), DeployError::Authentication { .. }));
        assert_eq!(err.category(), ErrorCategory::Authentication);
        assert_eq!(err.host(), Some("sdw2"));

        let rendered = err.display_for_user();
        assert!(rendered.contains("host_setup"));
        assert!(rendered.contains("Suggestions:"));
    }

    #[test]
    fn command_failure_message_includes_stderr() {
        let err = DeployError::CommandFailure {
            host: "mdw".to_string(),
            command: "gpstart -a".to_string(),
            exit_code: Some(2),
            stderr: "  gpstart: cannot find data directory\n".to_string(),
        };
        let msg = err.user_message();
        assert!(msg.contains("exit code 2"));
        assert!(msg.ends_with("gpstart: cannot find data directory"));
    }

    #[test]
    fn host_key_message_distinguishes_changed() {
        let err = DeployError::HostKeyRejected {
            host: "sdw1".to_string(),
            changed: true,
        };
        assert!(err.to_string().contains("has changed"));
        assert_eq!(err.suggestions().len(), 2);
    }

    #[test]
    fn only_connectivity_is_retryable() {
        assert!(
            DeployError::Connectivity {
                host: "h".to_string(),
                reason: "refused".to_string()
            }
            .is_retryable()
        );
        assert!(!auth_error(AuthFailureCause::Unknown).is_retryable());
        assert!(!DeployError::Interrupted.is_retryable());
    }
}

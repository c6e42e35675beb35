//! Exit code constants and error kind mapping for gpdeploy.
//!
//! # Exit Code Table
//!
//! | Code | Constant | Description |
//! |------|----------|-------------|
//! | 0 | `SUCCESS` | Run reached `COMPLETE` |
//! | 1 | `INTERNAL` | Internal failure |
//! | 2 | `VALIDATION` | Configuration, CLI, inventory or credential input error |
//! | 9 | `LOCK_HELD` | Another run holds the cluster lock |
//! | 20 | `CONNECTIVITY` | Host unreachable |
//! | 21 | `AUTHENTICATION` | Credential rejected |
//! | 22 | `HOST_KEY_REJECTED` | Host key warning not acknowledged |
//! | 70 | `COMMAND_FAILURE` | Remote command failed |
//! | 71 | `TIMEOUT` | Remote command exceeded its bound |
//! | 130 | `INTERRUPTED` | Cancelled by the operator |
//!
//! Ranges: 2-9 input problems, 20-29 connection and authentication, 70-79
//! run failures. A `PartialInstall` exits with the code of its root cause.

use crate::error::{DeployError, RunnerError};
use crate::types::ErrorKind;

/// Exit codes matching the documented exit code table.
///
/// ```rust
/// use gpdeploy_utils::ExitCode;
///
/// assert_eq!(ExitCode::AUTHENTICATION.as_i32(), 21);
/// assert_eq!(ExitCode::SUCCESS, ExitCode::from_i32(0));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCode(i32);

impl ExitCode {
    pub const SUCCESS: ExitCode = ExitCode(0);

    pub const INTERNAL: ExitCode = ExitCode(1);

    /// Invalid configuration, CLI arguments, inventory, or credential input
    pub const VALIDATION: ExitCode = ExitCode(2);

    pub const LOCK_HELD: ExitCode = ExitCode(9);

    pub const CONNECTIVITY: ExitCode = ExitCode(20);

    pub const AUTHENTICATION: ExitCode = ExitCode(21);

    pub const HOST_KEY_REJECTED: ExitCode = ExitCode(22);

    pub const COMMAND_FAILURE: ExitCode = ExitCode(70);

    pub const TIMEOUT: ExitCode = ExitCode(71);

    /// 128 + SIGINT
    pub const INTERRUPTED: ExitCode = ExitCode(130);

    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    #[must_use]
    pub const fn from_i32(code: i32) -> Self {
        ExitCode(code)
    }
}

impl From<i32> for ExitCode {
    fn from(code: i32) -> Self {
        ExitCode(code)
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code.0
    }
}

/// Convert a `DeployError` to its (`ExitCode`, `ErrorKind`) pair.
#[must_use]
pub fn error_to_exit_code_and_kind(error: &DeployError) -> (ExitCode, ErrorKind) {
    match error {
        DeployError::Config(_)
        | DeployError::Validation(_)
        | DeployError::Credential(_) => (ExitCode::VALIDATION, ErrorKind::Validation),

        DeployError::Lock(_) => (ExitCode::LOCK_HELD, ErrorKind::LockHeld),

        DeployError::Connectivity { .. } => (ExitCode::CONNECTIVITY, ErrorKind::Connectivity),
        DeployError::Authentication { .. } => {
            (ExitCode::AUTHENTICATION, ErrorKind::Authentication)
        }
        DeployError::HostKeyRejected { .. } => {
            (ExitCode::HOST_KEY_REJECTED, ErrorKind::HostKeyRejected)
        }

        DeployError::CommandFailure { .. } => {
            (ExitCode::COMMAND_FAILURE, ErrorKind::CommandFailure)
        }
        DeployError::Timeout { .. } => (ExitCode::TIMEOUT, ErrorKind::Timeout),

        DeployError::PartialInstall { source, .. } => error_to_exit_code_and_kind(source),

        DeployError::Interrupted => (ExitCode::INTERRUPTED, ErrorKind::Interrupted),

        // A missing ssh/scp binary is an environment problem the operator must fix
        DeployError::Runner(RunnerError::ToolNotFound { .. }) => {
            (ExitCode::VALIDATION, ErrorKind::Validation)
        }

        DeployError::Phase(_) | DeployError::Runner(_) | DeployError::Io(_) => {
            (ExitCode::INTERNAL, ErrorKind::Internal)
        }
    }
}

impl From<&DeployError> for (ExitCode, ErrorKind) {
    fn from(err: &DeployError) -> (ExitCode, ErrorKind) {
        error_to_exit_code_and_kind(err)
    }
}

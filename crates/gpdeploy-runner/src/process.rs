use crate::error::RunnerError;
use std::time::Duration;

use super::CommandSpec;

/// Captured result of one local process: ssh, scp, a package manager or a
/// loopback shell. Nothing is streamed.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// `None` when the process died from a signal.
    pub exit_code: Option<i32>,
}

impl ProcessOutput {
    #[must_use]
    pub fn new(stdout: Vec<u8>, stderr: Vec<u8>, exit_code: Option<i32>) -> Self {
        Self {
            stdout,
            stderr,
            exit_code,
        }
    }

    #[must_use]
    pub fn ok(stdout: impl Into<Vec<u8>>) -> Self {
        Self::new(stdout.into(), Vec::new(), Some(0))
    }

    /// Remote scripts may print anything; invalid UTF-8 is replaced.
    #[must_use]
    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    #[must_use]
    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Trait for process execution.
///
/// Implementations MUST use argv-style APIs only. The interface is
/// synchronous: the orchestrator runs blocking operations on dedicated
/// workers and observes cancellation between calls, never mid-command.
///
/// # Example
///
/// ```rust
/// use gpdeploy_runner::{CommandSpec, ProcessOutput, ProcessRunner, RunnerError};
/// use std::time::Duration;
///
/// struct EchoRunner;
///
/// impl ProcessRunner for EchoRunner {
///     fn run(&self, cmd: &CommandSpec, _timeout: Duration) -> Result<ProcessOutput, RunnerError> {
///         Ok(ProcessOutput::ok(cmd.display_line()))
///     }
/// }
///
/// let output = EchoRunner.run(&CommandSpec::new("uname"), Duration::from_secs(5)).unwrap();
/// assert_eq!(output.stdout_string(), "uname");
/// ```
pub trait ProcessRunner: Send + Sync {
    /// Run `cmd` to completion or until `timeout` elapses.
    ///
    /// # Errors
    ///
    /// A non-zero exit is not an error. `Timeout` means the process was
    /// killed; other variants mean it never ran.
    fn run(&self, cmd: &CommandSpec, timeout: Duration) -> Result<ProcessOutput, RunnerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_death_is_not_success() {
        assert!(ProcessOutput::ok("").success());
        assert!(!ProcessOutput::new(Vec::new(), b"Permission denied".to_vec(), Some(255)).success());
        assert!(!ProcessOutput::new(Vec::new(), Vec::new(), None).success());
    }

    #[test]
    fn garbled_remote_output_is_still_readable() {
        let mut raw = b"gpadmin ".to_vec();
        raw.extend_from_slice(&[0xff, 0xfe]);
        let output = ProcessOutput::new(raw.clone(), raw, Some(0));
        assert!(output.stdout_string().starts_with("gpadmin "));
        assert!(output.stderr_string().contains('\u{fffd}'));
    }

    #[test]
    fn runners_report_the_bound_they_were_given() {
        struct Hung;

        impl ProcessRunner for Hung {
            fn run(&self, _cmd: &CommandSpec, timeout: Duration) -> Result<ProcessOutput, RunnerError> {
                Err(RunnerError::Timeout {
                    timeout_seconds: timeout.as_secs(),
                })
            }
        }

        let cmd = CommandSpec::new("ssh").arg("mdw").arg("gpstate -s");
        match Hung.run(&cmd, Duration::from_secs(600)) {
            Err(RunnerError::Timeout { timeout_seconds }) => assert_eq!(timeout_seconds, 600),
            other => panic!("expected a timeout, got {other:?}"),
        }
    }
}

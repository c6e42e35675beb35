use crate::error::RunnerError;
use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;

use super::{CommandSpec, ProcessOutput, ProcessRunner};

/// Native process runner using `std::process::Command`.
///
/// Every ssh, scp, sshpass and loopback `bash` invocation goes through this
/// type. Arguments are passed as discrete `OsString` elements; nothing is
/// interpreted by a local shell.
///
/// # Threading
///
/// `NativeRunner` is synchronous. A helper thread waits on the child so the
/// caller can stop waiting after `timeout`; on expiry the child is sent
/// `SIGKILL` and [`RunnerError::Timeout`] is returned.
///
/// # Example
///
/// ```rust,no_run
/// use gpdeploy_runner::{CommandSpec, NativeRunner, ProcessRunner};
/// use std::time::Duration;
///
/// let runner = NativeRunner::new();
/// let cmd = CommandSpec::new("echo").arg("hello");
///
/// let output = runner.run(&cmd, Duration::from_secs(30)).unwrap();
/// assert!(output.success());
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeRunner;

impl NativeRunner {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn terminate_process(pid: u32) {
        #[cfg(unix)]
        {
            // SAFETY: pid came from a child we spawned and have not reaped.
            unsafe {
                libc::kill(pid as i32, libc::SIGKILL);
            }
        }

        #[cfg(not(unix))]
        {
            let _ = pid;
        }
    }
}

impl ProcessRunner for NativeRunner {
    fn run(&self, cmd: &CommandSpec, timeout: Duration) -> Result<ProcessOutput, RunnerError> {
        use std::sync::mpsc;
        use std::thread;

        // stdin wiring comes from the CommandSpec
        let mut command = cmd.to_command();
        command.stdout(Stdio::piped()).stderr(Stdio::piped());

        let child = command.spawn().map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                RunnerError::ToolNotFound {
                    tool: cmd.program.to_string_lossy().into_owned(),
                }
            } else {
                RunnerError::SpawnFailed {
                    program: cmd.program.to_string_lossy().into_owned(),
                    reason: e.to_string(),
                }
            }
        })?;

        let (tx, rx) = mpsc::channel();
        let child_id = child.id();

        let handle = thread::spawn(move || {
            let output = child.wait_with_output();
            let _ = tx.send(output);
        });

        match rx.recv_timeout(timeout) {
            Ok(output_result) => {
                let _ = handle.join();

                let output = output_result.map_err(|e| RunnerError::ExecutionFailed {
                    reason: format!("Failed to wait for process: {e}"),
                })?;

                Ok(ProcessOutput::new(
                    output.stdout,
                    output.stderr,
                    output.status.code(),
                ))
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                Self::terminate_process(child_id);
                let _ = handle.join();

                Err(RunnerError::Timeout {
                    timeout_seconds: timeout.as_secs(),
                })
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(RunnerError::ExecutionFailed {
                reason: "Process monitoring thread terminated unexpectedly".to_string(),
            }),
        }
    }
}

//! Running commands through channels with timeout and bounded retry.
//!
//! Accounting rules:
//! - an exit code listed in `retryable_exit_codes`, or a host dropping off
//!   mid-command, consumes one retry (with backoff);
//! - a channel that cannot be opened is retried by the connection manager's
//!   own policy only, never again at this layer;
//! - a channel found dead mid-command triggers one re-acquire and replay
//!   that does not consume a retry;
//! - a timeout never consumes a retry: the channel is marked suspect and the
//!   command is replayed once only if it is idempotent.

use std::cell::Cell;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gpdeploy_config::DeployConfig;
use gpdeploy_runner::ProcessOutput;
use gpdeploy_runner::ssh::SSH_TRANSPORT_EXIT;
use gpdeploy_utils::retry::retry_with;
use gpdeploy_utils::{Backoff, CancelToken, DeployError, RetryPolicy};

use crate::command::RemoteCommand;
use crate::connection::ConnectionManager;
use crate::transport::TransportError;

/// Per-call execution settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOptions {
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub retryable_exit_codes: Vec<i32>,
    pub success_codes: Vec<i32>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(gpdeploy_config::model::DEFAULT_COMMAND_TIMEOUT_SECS),
            retry: RetryPolicy::new(
                gpdeploy_config::model::DEFAULT_COMMAND_MAX_RETRIES,
                Backoff::default(),
            ),
            retryable_exit_codes: vec![SSH_TRANSPORT_EXIT],
            success_codes: vec![0],
        }
    }
}

impl ExecOptions {
    #[must_use]
    pub fn from_config(config: &DeployConfig, backoff: Backoff) -> Self {
        Self {
            timeout: Duration::from_secs(config.command_timeout_secs),
            retry: RetryPolicy::new(config.command_max_retries, backoff),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_success_codes(mut self, codes: &[i32]) -> Self {
        self.success_codes = codes.to_vec();
        self
    }

    fn is_retryable(&self, err: &DeployError) -> bool {
        match err {
            DeployError::CommandFailure {
                exit_code: Some(code),
                ..
            } => self.retryable_exit_codes.contains(code),
            other => other.is_retryable(),
        }
    }
}

/// Executes remote operations for the phase runner.
pub trait CommandExecutor: Send + Sync {
    /// Make sure the host has a live channel.
    fn connect(&self, host: &str) -> Result<(), DeployError>;

    /// Run a command; exit codes outside `success_codes` are failures.
    fn run(
        &self,
        host: &str,
        command: &RemoteCommand,
        opts: &ExecOptions,
    ) -> Result<ProcessOutput, DeployError>;

    /// Run an inspection command and return its output whatever the exit code.
    fn probe(
        &self,
        host: &str,
        command: &RemoteCommand,
        opts: &ExecOptions,
    ) -> Result<ProcessOutput, DeployError>;

    fn upload(
        &self,
        host: &str,
        local: &Path,
        remote: &str,
        opts: &ExecOptions,
    ) -> Result<(), DeployError>;

    /// Dry-run executors never touch a host.
    fn is_simulated(&self) -> bool {
        false
    }
}

/// Executor backed by the connection manager.
#[derive(Debug)]
pub struct RemoteExecutor {
    connections: Arc<ConnectionManager>,
    cancel: CancelToken,
}

impl RemoteExecutor {
    pub fn new(connections: Arc<ConnectionManager>, cancel: CancelToken) -> Self {
        Self {
            connections,
            cancel,
        }
    }

    fn execute(
        &self,
        host: &str,
        command: &RemoteCommand,
        opts: &ExecOptions,
        accept: impl Fn(Option<i32>) -> bool,
    ) -> Result<ProcessOutput, DeployError> {
        let rendered = command.render();
        let label = command.label();
        let mut reacquired = false;
        let mut replayed = false;
        // Opening a channel already retries under the connection policy.
        let connect_failed = Cell::new(false);

        retry_with(
            opts.retry,
            &self.cancel,
            |e: &DeployError| !connect_failed.get() && opts.is_retryable(e),
            |attempt| loop {
                tracing::debug!(host, command = %label, attempt, "exec");
                let result = self
                    .connections
                    .with_channel(host, |t, ch| t.exec(ch, &rendered, opts.timeout))
                    .inspect_err(|_| connect_failed.set(true))?;

                match result {
                    Ok(output) => {
                        self.connections.refresh(host);
                        if accept(output.exit_code) {
                            return Ok(output);
                        }
                        return Err(DeployError::CommandFailure {
                            host: host.to_string(),
                            command: label.clone(),
                            exit_code: output.exit_code,
                            stderr: self.connections.redact(output.stderr_string().trim()),
                        });
                    }
                    Err(e) if e.is_channel_lost() && !reacquired => {
                        tracing::warn!(host, "channel lost mid-command; reconnecting once");
                        reacquired = true;
                        self.connections.invalidate(host);
                    }
                    Err(TransportError::Timeout(after)) => {
                        self.connections.mark_suspect(host);
                        if command.idempotent && !replayed {
                            tracing::warn!(host, command = %label, "timed out; replaying idempotent command");
                            replayed = true;
                            continue;
                        }
                        return Err(DeployError::Timeout {
                            host: host.to_string(),
                            command: label.clone(),
                            timeout_secs: after.as_secs(),
                        });
                    }
                    Err(e) => return Err(self.connections.transport_error(e, host, &label)),
                }
            },
        )
    }
}

impl CommandExecutor for RemoteExecutor {
    fn connect(&self, host: &str) -> Result<(), DeployError> {
        self.connections.acquire(host).map(|_| ())
    }

    fn run(
        &self,
        host: &str,
        command: &RemoteCommand,
        opts: &ExecOptions,
    ) -> Result<ProcessOutput, DeployError> {
        self.execute(host, command, opts, |code| {
            code.is_some_and(|c| opts.success_codes.contains(&c))
        })
    }

    fn probe(
        &self,
        host: &str,
        command: &RemoteCommand,
        opts: &ExecOptions,
    ) -> Result<ProcessOutput, DeployError> {
        self.execute(host, command, opts, |code| {
            !code.is_some_and(|c| opts.retryable_exit_codes.contains(&c))
        })
    }

    fn upload(
        &self,
        host: &str,
        local: &Path,
        remote: &str,
        opts: &ExecOptions,
    ) -> Result<(), DeployError> {
        let label = format!("copy {} to {remote}", local.display());
        let connect_failed = Cell::new(false);
        retry_with(
            opts.retry,
            &self.cancel,
            |e: &DeployError| !connect_failed.get() && opts.is_retryable(e),
            |_| {
                let result = self
                    .connections
                    .with_channel(host, |t, ch| t.upload(ch, local, remote, opts.timeout))
                    .inspect_err(|_| connect_failed.set(true))?;
                match result {
                    Ok(()) => {
                        self.connections.refresh(host);
                        Ok(())
                    }
                    Err(e) => {
                        if matches!(e, TransportError::Timeout(_)) {
                            self.connections.mark_suspect(host);
                        } else if e.is_channel_lost() {
                            self.connections.invalidate(host);
                        }
                        Err(self.connections.transport_error(e, host, &label))
                    }
                }
            },
        )
    }
}

/// What a dry run would have done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimulatedCall {
    Connect { host: String },
    Run { host: String, description: String },
    Probe { host: String, description: String },
    Upload { host: String, remote: String },
}

/// Executor for `--dry-run`: records calls and reports success.
#[derive(Debug, Default)]
pub struct DryRunExecutor {
    calls: Mutex<Vec<SimulatedCall>>,
}

impl DryRunExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn calls(&self) -> Vec<SimulatedCall> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn record(&self, call: SimulatedCall) {
        tracing::info!(?call, "dry-run");
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(call);
    }
}

impl CommandExecutor for DryRunExecutor {
    fn connect(&self, host: &str) -> Result<(), DeployError> {
        self.record(SimulatedCall::Connect {
            host: host.to_string(),
        });
        Ok(())
    }

    fn run(
        &self,
        host: &str,
        command: &RemoteCommand,
        _opts: &ExecOptions,
    ) -> Result<ProcessOutput, DeployError> {
        self.record(SimulatedCall::Run {
            host: host.to_string(),
            description: command.label(),
        });
        Ok(ProcessOutput::ok(command.simulated.clone().unwrap_or_default()))
    }

    fn probe(
        &self,
        host: &str,
        command: &RemoteCommand,
        _opts: &ExecOptions,
    ) -> Result<ProcessOutput, DeployError> {
        self.record(SimulatedCall::Probe {
            host: host.to_string(),
            description: command.label(),
        });
        Ok(ProcessOutput::ok(command.simulated.clone().unwrap_or_default()))
    }

    fn upload(
        &self,
        host: &str,
        _local: &Path,
        remote: &str,
        _opts: &ExecOptions,
    ) -> Result<(), DeployError> {
        self.record(SimulatedCall::Upload {
            host: host.to_string(),
            remote: remote.to_string(),
        });
        Ok(())
    }

    fn is_simulated(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{CollectOptions, CredentialContext};
    use crate::test_support::{FakePrompt, FakeReply, FakeTransport};
    use crate::trust::RejectHostKeys;
    use gpdeploy_runner::SshFailure;
    use proptest::prelude::*;

    fn executor(fake: &Arc<FakeTransport>) -> RemoteExecutor {
        let cm = ConnectionManager::new(
            Arc::clone(fake) as Arc<dyn crate::transport::Transport>,
            Arc::new(CredentialContext::empty()),
            Arc::new(RejectHostKeys),
            CancelToken::new(),
            "root",
        )
        .with_connect_retry(RetryPolicy::new(1, Backoff::None));
        RemoteExecutor::new(Arc::new(cm), CancelToken::new())
    }

    fn opts(retries: u32) -> ExecOptions {
        ExecOptions {
            timeout: Duration::from_secs(5),
            retry: RetryPolicy::new(retries, Backoff::None),
            ..ExecOptions::default()
        }
    }

    #[test]
    fn non_retryable_failure_surfaces_immediately() {
        let fake = Arc::new(FakeTransport::new());
        fake.on_exec(None, "groupadd", FakeReply::exit(9, "groupadd: permission denied"));
        let exec = executor(&fake);
        let err = exec
            .run("sdw1", &RemoteCommand::new("create group", "groupadd gpadmin"), &opts(3))
            .unwrap_err();
        match err {
            DeployError::CommandFailure {
                exit_code, stderr, command, ..
            } => {
                assert_eq!(exit_code, Some(9));
                assert_eq!(stderr, "groupadd: permission denied");
                assert_eq!(command, "create group");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(fake.exec_count("sdw1", "groupadd"), 1);
    }

    #[test]
    fn transient_exit_code_is_retried_until_success() {
        let fake = Arc::new(FakeTransport::new());
        fake.on_exec(None, "uptime", FakeReply::exit(255, ""));
        fake.on_exec(None, "uptime", FakeReply::ok("up"));
        let exec = executor(&fake);
        let out = exec
            .run("sdw1", &RemoteCommand::new("", "uptime"), &opts(2))
            .unwrap();
        assert_eq!(out.stdout_string(), "up");
        assert_eq!(fake.exec_count("sdw1", "uptime"), 2);
    }

    #[test]
    fn lost_channel_is_reacquired_once_without_using_retries() {
        let fake = Arc::new(FakeTransport::new());
        fake.on_exec(None, "hostname", FakeReply::ChannelLost);
        fake.on_exec(None, "hostname", FakeReply::ok("sdw1"));
        let exec = executor(&fake);
        let out = exec
            .run("sdw1", &RemoteCommand::new("", "hostname"), &opts(0))
            .unwrap();
        assert_eq!(out.stdout_string(), "sdw1");
        assert_eq!(fake.opens("sdw1"), 2);
        assert_eq!(fake.max_live("sdw1"), 1);
    }

    #[test]
    fn timeout_fails_without_retry_unless_idempotent() {
        let fake = Arc::new(FakeTransport::new());
        fake.on_exec(None, "gpinitsystem", FakeReply::Timeout);
        let exec = executor(&fake);
        let err = exec
            .run("mdw", &RemoteCommand::new("init", "gpinitsystem -a"), &opts(3))
            .unwrap_err();
        assert!(matches!(err, DeployError::Timeout { .. }));
        assert_eq!(fake.exec_count("mdw", "gpinitsystem"), 1);

        fake.on_exec(None, "gpstate", FakeReply::Timeout);
        let err = exec
            .run("mdw", &RemoteCommand::new("state", "gpstate -s").idempotent(), &opts(3))
            .unwrap_err();
        assert!(matches!(err, DeployError::Timeout { .. }));
        assert_eq!(fake.exec_count("mdw", "gpstate"), 2);
    }

    #[test]
    fn probe_accepts_any_remote_exit_code() {
        let fake = Arc::new(FakeTransport::new());
        fake.on_exec(None, "pgrep", FakeReply::exit(1, ""));
        let exec = executor(&fake);
        let out = exec
            .probe("mdw", &RemoteCommand::new("", "pgrep pxf"), &opts(0))
            .unwrap();
        assert_eq!(out.exit_code, Some(1));
    }

    #[test]
    fn success_codes_are_configurable() {
        let fake = Arc::new(FakeTransport::new());
        fake.on_exec(None, "gpinitsystem", FakeReply::exit(1, "warnings"));
        let exec = executor(&fake);
        exec.run(
            "mdw",
            &RemoteCommand::new("", "gpinitsystem -a"),
            &opts(0).with_success_codes(&[0, 1]),
        )
        .unwrap();
    }

    #[test]
    fn dry_run_records_and_simulates() {
        let exec = DryRunExecutor::new();
        let out = exec
            .run("mdw", &RemoteCommand::new("os", "uname -s").simulated("Linux"), &opts(0))
            .unwrap();
        assert_eq!(out.stdout_string(), "Linux");
        assert!(exec.is_simulated());
        assert_eq!(exec.calls().len(), 1);
    }

    #[test]
    fn command_stderr_is_scrubbed_with_the_run_password() {
        let fake = Arc::new(FakeTransport::new());
        fake.on_exec(None, "chpasswd", FakeReply::exit(1, "chpasswd: rejected correct-horse-9"));
        let collect = CollectOptions {
            reuse_default: true,
            automation_available: true,
            ..Default::default()
        };
        let creds =
            CredentialContext::collect(&FakePrompt::with_password("correct-horse-9"), &collect).unwrap();
        let cm = ConnectionManager::new(
            Arc::clone(&fake) as Arc<dyn crate::transport::Transport>,
            Arc::new(creds),
            Arc::new(RejectHostKeys),
            CancelToken::new(),
            "root",
        );
        let exec = RemoteExecutor::new(Arc::new(cm), CancelToken::new());
        let err = exec
            .run("sdw1", &RemoteCommand::new("set password", "chpasswd"), &opts(0))
            .unwrap_err();
        match err {
            DeployError::CommandFailure { stderr, .. } => {
                assert_eq!(stderr, "chpasswd: rejected ***");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unreachable_host_is_opened_once_per_connection_retry() {
        let fake = Arc::new(FakeTransport::new());
        fake.fail_open("sdw1", SshFailure::Unreachable);
        let exec = executor(&fake);
        let err = exec
            .run("sdw1", &RemoteCommand::new("", "uptime"), &opts(3))
            .unwrap_err();
        assert!(matches!(err, DeployError::Connectivity { .. }));
        assert_eq!(fake.opens("sdw1"), 2);

        let err = exec
            .upload("sdw1", Path::new("/tmp/pkg.rpm"), "/tmp/pkg.rpm", &opts(3))
            .unwrap_err();
        assert!(matches!(err, DeployError::Connectivity { .. }));
        assert_eq!(fake.opens("sdw1"), 4);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn always_failing_command_is_attempted_n_plus_one_times(n in 0u32..6) {
            let fake = Arc::new(FakeTransport::new());
            fake.on_exec(None, "flaky", FakeReply::exit(255, "transient"));
            let exec = executor(&fake);
            let err = exec
                .run("sdw1", &RemoteCommand::new("", "flaky"), &opts(n))
                .unwrap_err();
            let is_failure = matches!(err, DeployError::CommandFailure { .. });
            prop_assert!(is_failure);
            prop_assert_eq!(fake.exec_count("sdw1", "flaky"), (n + 1) as usize);
        }
    }
}

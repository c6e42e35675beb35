//! In-memory stand-ins for the orchestrator's collaborators.
//!
//! Nothing here starts a process or touches the network. [`FakeTransport`]
//! answers remote commands from scripted replies and records every channel
//! and command it sees; [`ScriptedRunner`] does the same for local processes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use camino::Utf8PathBuf;
use gpdeploy_config::DeployConfig;
use gpdeploy_runner::{
    CommandSpec, HostKeyMode, MasterAuth, ProcessOutput, ProcessRunner, RunnerError, SshFailure,
};
use gpdeploy_utils::error::CredentialError;
use zeroize::Zeroizing;

use crate::credentials::CredentialPrompt;
use crate::packages::ToolProbe;
use crate::transport::{Channel, ChannelKind, Transport, TransportError, is_loopback_address};

/// Returned for `cat ~/.ssh/id_rsa.pub` unless a test scripts otherwise.
pub const FAKE_PUBLIC_KEY: &str = "ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABAQfake gpadmin@mdw";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Scripted answer to one remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeReply {
    Output {
        exit: i32,
        stdout: String,
        stderr: String,
        delay: Duration,
    },
    Timeout,
    ChannelLost,
    /// The transport itself fails, e.g. the login is rejected.
    Fail(SshFailure),
}

impl FakeReply {
    #[must_use]
    pub fn ok(stdout: &str) -> Self {
        Self::Output {
            exit: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
            delay: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn exit(code: i32, stderr: &str) -> Self {
        Self::Output {
            exit: code,
            stdout: String::new(),
            stderr: stderr.to_string(),
            delay: Duration::ZERO,
        }
    }

    /// Hold the command for `delay` before answering.
    #[must_use]
    pub fn after(self, delay: Duration) -> Self {
        match self {
            Self::Output {
                exit,
                stdout,
                stderr,
                ..
            } => Self::Output {
                exit,
                stdout,
                stderr,
                delay,
            },
            other => other,
        }
    }
}

#[derive(Debug)]
struct Rule {
    host: Option<String>,
    needle: String,
    /// Consumed front to back; the last reply repeats.
    replies: VecDeque<FakeReply>,
}

#[derive(Debug, Default)]
struct FakeState {
    rules: Vec<Rule>,
    open_failures: HashMap<String, SshFailure>,
    unknown_keys: HashSet<String>,
    forgotten: Vec<String>,
    check_fails: bool,
    opens: HashMap<String, usize>,
    closes: HashMap<String, usize>,
    live: HashMap<String, usize>,
    max_live: HashMap<String, usize>,
    running: HashMap<String, usize>,
    max_running: HashMap<String, usize>,
    kinds: Vec<(String, ChannelKind)>,
    execs: Vec<(String, String)>,
    uploads: Vec<(String, String)>,
}

impl FakeState {
    fn reply_for(&mut self, host: &str, command: &str) -> FakeReply {
        let rule = self.rules.iter_mut().find(|r| {
            r.host.as_deref().is_none_or(|h| h == host) && command.contains(r.needle.as_str())
        });
        match rule {
            Some(rule) if rule.replies.len() > 1 => rule.replies.pop_front().unwrap_or_else(|| FakeReply::ok("")),
            Some(rule) => rule.replies.front().cloned().unwrap_or_else(|| FakeReply::ok("")),
            None if command.contains("id_rsa.pub") => FakeReply::ok(FAKE_PUBLIC_KEY),
            None => FakeReply::ok(""),
        }
    }
}

/// Transport whose hosts exist only in memory.
#[derive(Debug, Default)]
pub struct FakeTransport {
    state: Mutex<FakeState>,
}

impl FakeTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands containing `needle` (on `host`, or anywhere) with
    /// `reply`. Repeated calls for the same rule queue replies.
    pub fn on_exec(&self, host: Option<&str>, needle: &str, reply: FakeReply) {
        let mut state = lock(&self.state);
        let host = host.map(str::to_string);
        if let Some(rule) = state
            .rules
            .iter_mut()
            .find(|r| r.host == host && r.needle == needle)
        {
            rule.replies.push_back(reply);
            return;
        }
        state.rules.push(Rule {
            host,
            needle: needle.to_string(),
            replies: VecDeque::from([reply]),
        });
    }

    /// Every open of `host` fails with `failure`.
    pub fn fail_open(&self, host: &str, failure: SshFailure) {
        lock(&self.state)
            .open_failures
            .insert(host.to_string(), failure);
    }

    /// Strict opens of `host` report an unknown host key.
    pub fn require_known_host_key(&self, host: &str) {
        lock(&self.state).unknown_keys.insert(host.to_string());
    }

    /// What `check` answers for live channels.
    pub fn set_check_result(&self, alive: bool) {
        lock(&self.state).check_fails = !alive;
    }

    #[must_use]
    pub fn opens(&self, host: &str) -> usize {
        lock(&self.state).opens.get(host).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn closes(&self, host: &str) -> usize {
        lock(&self.state).closes.get(host).copied().unwrap_or(0)
    }

    /// Channels currently open across all hosts.
    #[must_use]
    pub fn live_count(&self) -> usize {
        lock(&self.state).live.values().sum()
    }

    /// Most channels ever open at once to `host`.
    #[must_use]
    pub fn max_live(&self, host: &str) -> usize {
        lock(&self.state).max_live.get(host).copied().unwrap_or(0)
    }

    /// Most commands ever running at once on `host`.
    #[must_use]
    pub fn max_concurrent_exec(&self, host: &str) -> usize {
        lock(&self.state).max_running.get(host).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn forgotten_keys(&self) -> Vec<String> {
        lock(&self.state).forgotten.clone()
    }

    /// Kinds of the channels opened to `host`, in order.
    #[must_use]
    pub fn channel_kinds(&self, host: &str) -> Vec<ChannelKind> {
        lock(&self.state)
            .kinds
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, k)| *k)
            .collect()
    }

    /// Every executed command as `(host, command)`, in order.
    #[must_use]
    pub fn exec_commands(&self) -> Vec<(String, String)> {
        lock(&self.state).execs.clone()
    }

    #[must_use]
    pub fn commands_for(&self, host: &str) -> Vec<String> {
        lock(&self.state)
            .execs
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, c)| c.clone())
            .collect()
    }

    /// Attempts on `host` of commands containing `needle`.
    #[must_use]
    pub fn exec_count(&self, host: &str, needle: &str) -> usize {
        lock(&self.state)
            .execs
            .iter()
            .filter(|(h, c)| h == host && c.contains(needle))
            .count()
    }

    /// Uploads as `(host, remote path)`.
    #[must_use]
    pub fn uploads(&self) -> Vec<(String, String)> {
        lock(&self.state).uploads.clone()
    }

    /// Hosts that saw at least one open attempt.
    #[must_use]
    pub fn contacted_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = lock(&self.state).opens.keys().cloned().collect();
        hosts.sort();
        hosts
    }
}

impl Transport for FakeTransport {
    fn open(
        &self,
        host: &str,
        _auth: MasterAuth<'_>,
        host_keys: HostKeyMode,
    ) -> Result<Channel, TransportError> {
        let mut state = lock(&self.state);
        *state.opens.entry(host.to_string()).or_default() += 1;

        if let Some(failure) = state.open_failures.get(host).cloned() {
            return Err(TransportError::Ssh {
                failure,
                stderr: String::new(),
            });
        }
        if host_keys == HostKeyMode::Strict && state.unknown_keys.contains(host) {
            return Err(TransportError::Ssh {
                failure: SshFailure::HostKeyUnknown,
                stderr: "Host key verification failed.".to_string(),
            });
        }

        let kind = if is_loopback_address(host) {
            ChannelKind::Loopback
        } else {
            ChannelKind::ControlMaster
        };
        let live = {
            let live = state.live.entry(host.to_string()).or_default();
            *live += 1;
            *live
        };
        let max = state.max_live.entry(host.to_string()).or_default();
        *max = (*max).max(live);
        state.kinds.push((host.to_string(), kind));
        Ok(Channel::opened(host, kind, None))
    }

    fn check(&self, _channel: &Channel) -> bool {
        !lock(&self.state).check_fails
    }

    fn exec(
        &self,
        channel: &Channel,
        command: &str,
        timeout: Duration,
    ) -> Result<ProcessOutput, TransportError> {
        let host = channel.host.clone();
        let reply = {
            let mut state = lock(&self.state);
            state.execs.push((host.clone(), command.to_string()));
            let running = {
                let running = state.running.entry(host.clone()).or_default();
                *running += 1;
                *running
            };
            let max = state.max_running.entry(host.clone()).or_default();
            *max = (*max).max(running);
            state.reply_for(&host, command)
        };

        let result = match reply {
            FakeReply::Output {
                exit,
                stdout,
                stderr,
                delay,
            } => {
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
                Ok(ProcessOutput::new(stdout.into_bytes(), stderr.into_bytes(), Some(exit)))
            }
            FakeReply::Timeout => Err(TransportError::Timeout(timeout)),
            FakeReply::ChannelLost => Err(TransportError::Ssh {
                failure: SshFailure::ChannelLost,
                stderr: "mux_client_request_session: master is not running".to_string(),
            }),
            FakeReply::Fail(failure) => Err(TransportError::Ssh {
                failure,
                stderr: String::new(),
            }),
        };

        let mut state = lock(&self.state);
        if let Some(running) = state.running.get_mut(&host) {
            *running = running.saturating_sub(1);
        }
        result
    }

    fn upload(
        &self,
        channel: &Channel,
        _local: &Path,
        remote: &str,
        _timeout: Duration,
    ) -> Result<(), TransportError> {
        lock(&self.state)
            .uploads
            .push((channel.host.clone(), remote.to_string()));
        Ok(())
    }

    fn close(&self, channel: &Channel) {
        let mut state = lock(&self.state);
        *state.closes.entry(channel.host.clone()).or_default() += 1;
        if let Some(live) = state.live.get_mut(&channel.host) {
            *live = live.saturating_sub(1);
        }
    }

    fn forget_host_key(&self, host: &str) -> Result<(), TransportError> {
        lock(&self.state).forgotten.push(host.to_string());
        Ok(())
    }
}

#[derive(Debug, Default)]
struct RunnerScript {
    calls: Vec<String>,
    replies: Vec<(String, i32, String, String)>,
    timeouts: Vec<String>,
}

/// Local process runner answering from a script. Clones share the script.
#[derive(Debug, Clone, Default)]
pub struct ScriptedRunner {
    inner: Arc<Mutex<RunnerScript>>,
}

impl ScriptedRunner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands whose display line contains `needle` exit with `exit`.
    pub fn reply(&self, needle: &str, exit: i32, stdout: &str, stderr: &str) {
        lock(&self.inner).replies.push((
            needle.to_string(),
            exit,
            stdout.to_string(),
            stderr.to_string(),
        ));
    }

    /// Commands whose display line contains `needle` time out.
    pub fn time_out(&self, needle: &str) {
        lock(&self.inner).timeouts.push(needle.to_string());
    }

    /// Display lines of every command run so far.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        lock(&self.inner).calls.clone()
    }
}

impl ProcessRunner for ScriptedRunner {
    fn run(&self, cmd: &CommandSpec, timeout: Duration) -> Result<ProcessOutput, RunnerError> {
        let line = cmd.display_line();
        let mut script = lock(&self.inner);
        script.calls.push(line.clone());
        if script.timeouts.iter().any(|n| line.contains(n.as_str())) {
            return Err(RunnerError::Timeout {
                timeout_seconds: timeout.as_secs(),
            });
        }
        let output = script
            .replies
            .iter()
            .find(|(needle, ..)| line.contains(needle.as_str()))
            .map_or_else(
                || ProcessOutput::ok(String::new()),
                |(_, exit, stdout, stderr)| {
                    ProcessOutput::new(
                        stdout.clone().into_bytes(),
                        stderr.clone().into_bytes(),
                        Some(*exit),
                    )
                },
            );
        Ok(output)
    }
}

/// Operator input from a queue.
#[derive(Debug, Default)]
pub struct FakePrompt {
    secrets: Mutex<VecDeque<String>>,
    answer: bool,
    asked: Mutex<Vec<String>>,
}

impl FakePrompt {
    /// Answers every yes/no question with `answer` and hands out `secrets`
    /// in order.
    #[must_use]
    pub fn new(answer: bool, secrets: &[&str]) -> Self {
        Self {
            secrets: Mutex::new(secrets.iter().map(|s| (*s).to_string()).collect()),
            answer,
            asked: Mutex::new(Vec::new()),
        }
    }

    /// The same password twice, reused for every host.
    #[must_use]
    pub fn with_password(password: &str) -> Self {
        Self::new(true, &[password, password])
    }

    #[must_use]
    pub fn questions(&self) -> Vec<String> {
        lock(&self.asked).clone()
    }
}

impl CredentialPrompt for FakePrompt {
    fn read_secret(&self, prompt: &str) -> Result<Zeroizing<String>, CredentialError> {
        lock(&self.asked).push(prompt.to_string());
        lock(&self.secrets)
            .pop_front()
            .map(Zeroizing::new)
            .ok_or_else(|| CredentialError::PromptFailed("no scripted input left".to_string()))
    }

    fn confirm(&self, question: &str, _default: bool) -> Result<bool, CredentialError> {
        lock(&self.asked).push(question.to_string());
        Ok(self.answer)
    }
}

/// `PATH` lookups answered from a fixed set of tool names.
#[derive(Debug, Default, Clone)]
pub struct FakeProbe {
    tools: HashSet<String>,
}

impl FakeProbe {
    #[must_use]
    pub fn with(tools: &[&str]) -> Self {
        Self {
            tools: tools.iter().map(|t| (*t).to_string()).collect(),
        }
    }
}

impl ToolProbe for FakeProbe {
    fn find(&self, tool: &str) -> Option<std::path::PathBuf> {
        self.tools
            .contains(tool)
            .then(|| std::path::PathBuf::from(format!("/usr/bin/{tool}")))
    }
}

/// A cluster config with a real (empty) installer file in `dir`.
///
/// `hosts[0]` is the coordinator; the rest are segment hosts. A single entry
/// describes a single-node deployment.
#[must_use]
pub fn cluster_config(dir: &Path, hosts: &[&str]) -> DeployConfig {
    let installer = dir.join("greenplum-db-7.1.0-el8-x86_64.rpm");
    if let Err(e) = std::fs::write(&installer, b"rpm") {
        panic!("could not write fake installer: {e}");
    }
    let mut config = DeployConfig::default();
    config.coordinator_host = hosts.first().map(|h| (*h).to_string());
    config.segment_hosts = if hosts.len() == 1 {
        vec![hosts[0].to_string()]
    } else {
        hosts[1..].iter().map(|h| (*h).to_string()).collect()
    };
    config.installer_path = Utf8PathBuf::from_path_buf(installer).ok();
    config
}

/// A scratch directory kept alive by the returned guard.
#[must_use]
pub fn scratch() -> tempfile::TempDir {
    match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(e) => panic!("could not create scratch dir: {e}"),
    }
}

#![allow(dead_code)]

use std::sync::Arc;

use camino::Utf8PathBuf;
use gpdeploy_config::DeployConfig;
use gpdeploy_engine::state::{InstallationState, JournalEntry, StepEvent};
use gpdeploy_engine::test_support::{
    FakePrompt, FakeProbe, FakeTransport, ScriptedRunner, cluster_config, scratch,
};
use gpdeploy_engine::transport::Transport;
use gpdeploy_engine::trust::AcceptAllHostKeys;
use gpdeploy_engine::{Collaborators, Orchestrator, RunMode, RunReport, RunRequest};
use gpdeploy_utils::{Backoff, CancelToken, PhaseId};
use tempfile::TempDir;

pub const PASSWORD: &str = "correct-horse-battery";

/// One scripted cluster: fake hosts, a scripted operator and a private
/// lock and state location.
pub struct Rig {
    pub dir: TempDir,
    pub fake: Arc<FakeTransport>,
    pub prompt: Arc<FakePrompt>,
    pub cancel: CancelToken,
}

impl Rig {
    pub fn new() -> Self {
        Self::with_prompt(FakePrompt::with_password(PASSWORD))
    }

    pub fn with_prompt(prompt: FakePrompt) -> Self {
        Self {
            dir: scratch(),
            fake: Arc::new(FakeTransport::new()),
            prompt: Arc::new(prompt),
            cancel: CancelToken::new(),
        }
    }

    pub fn config(&self, hosts: &[&str]) -> DeployConfig {
        cluster_config(self.dir.path(), hosts)
    }

    /// `config` with PXF enabled and its package in place.
    pub fn with_pxf(&self, mut config: DeployConfig) -> DeployConfig {
        let package = self.path("pxf-gp7-6.10.0-el8.x86_64.rpm");
        std::fs::write(&package, b"rpm").unwrap();
        config.install_pxf = true;
        config.pxf_installer_path = Some(package);
        config
    }

    pub fn path(&self, name: &str) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(self.dir.path().join(name)).unwrap()
    }

    pub fn lock_dir(&self) -> Utf8PathBuf {
        self.path("locks")
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            transport: Some(Arc::clone(&self.fake) as Arc<dyn Transport>),
            prompt: self.prompt.clone(),
            probe: Arc::new(FakeProbe::with(&["sshpass", "ssh", "scp"])),
            host_keys: Arc::new(AcceptAllHostKeys),
            local_runner: Arc::new(ScriptedRunner::new()),
        }
    }

    pub async fn run(&self, config: DeployConfig, mode: RunMode) -> RunReport {
        let mut request = RunRequest::new(config, mode);
        request.backoff = Backoff::None;
        request.lock_dir = Some(self.lock_dir());
        request.state_path = Some(self.path("state.json"));
        Orchestrator::new(request, self.collaborators(), self.cancel.clone())
            .run()
            .await
    }

    pub async fn install(&self, config: DeployConfig) -> RunReport {
        self.run(config, RunMode::Install).await
    }
}

pub fn state(report: &RunReport) -> &InstallationState {
    report.state.as_ref().expect("run reached the phase runner")
}

pub fn entries<'a>(
    state: &'a InstallationState,
    phase: PhaseId,
) -> impl Iterator<Item = &'a JournalEntry> + 'a {
    state.journal.iter().filter(move |e| e.phase == phase)
}

/// Step names started in `phase`, in journal order.
pub fn started_steps(state: &InstallationState, phase: PhaseId) -> Vec<String> {
    entries(state, phase)
        .filter(|e| e.event == StepEvent::Started)
        .map(|e| e.step.clone())
        .collect()
}

pub fn seq_of(
    state: &InstallationState,
    host: &str,
    step: &str,
    event: StepEvent,
) -> Option<u64> {
    state
        .journal
        .iter()
        .find(|e| e.host == host && e.step == step && e.event == event)
        .map(|e| e.seq)
}

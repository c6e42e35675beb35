//! Phase trait and the machinery phases use to run steps across hosts.
//!
//! A phase is a static definition: the steps each governed host runs, plus
//! optional coordinated stages that carry data between hosts. Steps on one
//! host run in program order on a blocking worker; independent hosts run in
//! parallel up to `max_parallel_hosts`.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use gpdeploy_config::DeployConfig;
use gpdeploy_runner::ProcessOutput;
use gpdeploy_utils::logging::host_step_span;
use gpdeploy_utils::{CancelLevel, CancelToken, DeployError, HostStatus, PhaseId};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::command::RemoteCommand;
use crate::executor::{CommandExecutor, ExecOptions};
use crate::registry::{Host, HostRegistry};
use crate::rollback::RollbackManager;
use crate::state::{ExtensionRecord, Journal, StepEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepKind {
    /// Read-only check; it still has to succeed.
    Probe,
    Mutating,
    /// Changes `targets` in a way that may collide with existing state; each
    /// is backed up first.
    Destructive { targets: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAction {
    Connect,
    Run(RemoteCommand),
    Upload { local: PathBuf, remote: String },
}

/// One remote operation on one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub name: String,
    pub kind: StepKind,
    pub action: StepAction,
    pub success_codes: Option<Vec<i32>>,
}

impl Step {
    fn build(name: &str, kind: StepKind, action: StepAction) -> Self {
        Self {
            name: name.to_string(),
            kind,
            action,
            success_codes: None,
        }
    }

    #[must_use]
    pub fn connect() -> Self {
        Self::build("connect", StepKind::Probe, StepAction::Connect)
    }

    #[must_use]
    pub fn probe(name: &str, command: RemoteCommand) -> Self {
        Self::build(name, StepKind::Probe, StepAction::Run(command))
    }

    #[must_use]
    pub fn mutating(name: &str, command: RemoteCommand) -> Self {
        Self::build(name, StepKind::Mutating, StepAction::Run(command))
    }

    #[must_use]
    pub fn destructive(name: &str, target: &str, command: RemoteCommand) -> Self {
        Self::destructive_paths(name, [target.to_string()], command)
    }

    /// A destructive step touching several paths. Only the paths the command
    /// writes belong here, never a parent it merely creates them under.
    #[must_use]
    pub fn destructive_paths(
        name: &str,
        targets: impl IntoIterator<Item = String>,
        command: RemoteCommand,
    ) -> Self {
        Self::build(
            name,
            StepKind::Destructive {
                targets: targets.into_iter().collect(),
            },
            StepAction::Run(command),
        )
    }

    /// Paths backed up before the step runs.
    #[must_use]
    pub fn backup_targets(&self) -> &[String] {
        match &self.kind {
            StepKind::Destructive { targets } => targets,
            _ => &[],
        }
    }

    #[must_use]
    pub fn upload(name: &str, local: impl Into<PathBuf>, remote: &str) -> Self {
        Self::build(
            name,
            StepKind::Mutating,
            StepAction::Upload {
                local: local.into(),
                remote: remote.to_string(),
            },
        )
    }

    #[must_use]
    pub fn with_success_codes(mut self, codes: &[i32]) -> Self {
        self.success_codes = Some(codes.to_vec());
        self
    }
}

/// A step that failed, with where it failed.
#[derive(Debug)]
pub struct StepFailure {
    pub host: String,
    pub step: String,
    pub error: DeployError,
}

impl StepFailure {
    pub fn new(host: &str, step: &str, error: DeployError) -> Self {
        Self {
            host: host.to_string(),
            step: step.to_string(),
            error,
        }
    }

    fn interrupted(step: &str) -> Self {
        Self::new("-", step, DeployError::Interrupted)
    }

    /// Run-level error. Interruption passes through unwrapped.
    #[must_use]
    pub fn into_error(self, phase: PhaseId) -> DeployError {
        match self.error {
            DeployError::Interrupted => DeployError::Interrupted,
            error => DeployError::PartialInstall {
                host: self.host,
                phase,
                step: self.step,
                source: Box::new(error),
            },
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Everything a phase needs, shared across workers.
pub struct PhaseContext {
    pub config: DeployConfig,
    pub run_id: String,
    pub single_node: bool,
    pub executor: Arc<dyn CommandExecutor>,
    pub rollback: Arc<RollbackManager>,
    pub cancel: CancelToken,
    pub opts: ExecOptions,
    pub journal: Arc<Journal>,
    /// Teardown also removes the installation directory.
    pub remove_install: bool,
    registry: Mutex<HostRegistry>,
    extensions: Mutex<BTreeMap<String, ExtensionRecord>>,
}

impl PhaseContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: DeployConfig,
        run_id: &str,
        registry: HostRegistry,
        executor: Arc<dyn CommandExecutor>,
        rollback: Arc<RollbackManager>,
        cancel: CancelToken,
        opts: ExecOptions,
        remove_install: bool,
    ) -> Self {
        Self {
            single_node: registry.is_single_node(),
            config,
            run_id: run_id.to_string(),
            executor,
            rollback,
            cancel,
            opts,
            journal: Arc::new(Journal::new()),
            remove_install,
            registry: Mutex::new(registry),
            extensions: Mutex::new(BTreeMap::new()),
        }
    }

    /// Copy of the registry as it stands.
    #[must_use]
    pub fn registry(&self) -> HostRegistry {
        lock(&self.registry).clone()
    }

    #[must_use]
    pub fn coordinator(&self) -> String {
        lock(&self.registry).coordinator().to_string()
    }

    pub fn mark(&self, host: &str, phase: PhaseId, status: HostStatus) {
        lock(&self.registry).mark(host, phase, status);
    }

    /// Apply `f` to the registry under its lock.
    pub fn with_registry<T>(&self, f: impl FnOnce(&mut HostRegistry) -> T) -> T {
        f(&mut lock(&self.registry))
    }

    pub fn record_extension(&self, name: &str, record: ExtensionRecord) {
        lock(&self.extensions).insert(name.to_string(), record);
    }

    #[must_use]
    pub fn extensions(&self) -> BTreeMap<String, ExtensionRecord> {
        lock(&self.extensions).clone()
    }

    /// Command run as the admin user with the database environment loaded.
    #[must_use]
    pub fn admin_command(&self, description: &str, script: &str) -> RemoteCommand {
        RemoteCommand::new(
            description,
            format!(
                "source {}/greenplum_path.sh && {script}",
                shell_words::quote(self.config.install_dir.trim_end_matches('/'))
            ),
        )
        .as_user(&self.config.admin_user)
    }

    /// Home directory of the admin user.
    #[must_use]
    pub fn admin_home(&self) -> String {
        format!("/home/{}", self.config.admin_user)
    }

    /// Coordinator data directory as `gpinitsystem` lays it out.
    #[must_use]
    pub fn coordinator_data_dir(&self) -> String {
        format!("{}/coordinator/gpseg-1", self.config.data_dir.trim_end_matches('/'))
    }

    /// Run one step on one host and return its output.
    pub fn execute_step(
        &self,
        phase: PhaseId,
        host: &str,
        step: &Step,
    ) -> Result<ProcessOutput, StepFailure> {
        let fail = |error| StepFailure::new(host, &step.name, error);
        self.cancel.check().map_err(fail)?;

        let span = host_step_span(host, phase, &step.name);
        let _entered = span.enter();
        lock(&self.registry).set_cursor(host, &step.name);
        self.journal.record(host, phase, &step.name, StepEvent::Started);

        let connecting = step.action == StepAction::Connect;
        if connecting {
            self.mark(host, phase, HostStatus::Connecting);
        }
        let result = self.perform(host, step);
        if connecting && result.is_ok() {
            self.mark(host, phase, HostStatus::InProgress);
        }
        match &result {
            Ok(_) => {
                self.journal.record(host, phase, &step.name, StepEvent::Finished);
                tracing::debug!("step done");
            }
            Err(e) => {
                self.journal.record(host, phase, &step.name, StepEvent::Failed);
                tracing::warn!(error = %e, "step failed");
            }
        }
        result.map_err(fail)
    }

    fn perform(&self, host: &str, step: &Step) -> Result<ProcessOutput, DeployError> {
        for target in step.backup_targets() {
            self.rollback.snapshot(host, target)?;
        }
        let opts = match &step.success_codes {
            Some(codes) => self.opts.clone().with_success_codes(codes),
            None => self.opts.clone(),
        };
        match &step.action {
            StepAction::Connect => self
                .executor
                .connect(host)
                .map(|()| ProcessOutput::ok(String::new())),
            StepAction::Run(command) => self.executor.run(host, command, &opts),
            StepAction::Upload { local, remote } => self
                .executor
                .upload(host, local, remote, &opts)
                .map(|()| ProcessOutput::ok(String::new())),
        }
    }

    /// Run `steps` on `host` in order, stopping at the first failure.
    pub fn run_steps(&self, phase: PhaseId, host: &str, steps: &[Step]) -> Result<(), StepFailure> {
        for step in steps {
            self.execute_step(phase, host, step)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for PhaseContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseContext")
            .field("run_id", &self.run_id)
            .field("single_node", &self.single_node)
            .finish_non_exhaustive()
    }
}

/// Handle a running phase uses to schedule work.
#[derive(Debug, Clone)]
pub struct PhaseScope {
    ctx: Arc<PhaseContext>,
    phase: PhaseId,
    max_parallel: usize,
}

impl PhaseScope {
    pub fn new(ctx: Arc<PhaseContext>, phase: PhaseId) -> Self {
        let max_parallel = ctx.config.max_parallel_hosts.max(1);
        Self {
            ctx,
            phase,
            max_parallel,
        }
    }

    #[must_use]
    pub fn ctx(&self) -> &PhaseContext {
        &self.ctx
    }

    #[must_use]
    pub fn phase(&self) -> PhaseId {
        self.phase
    }

    /// Hosts this phase governs, in registry order.
    #[must_use]
    pub fn governed_hosts(&self) -> Vec<Host> {
        self.ctx
            .registry()
            .hosts_for_phase(self.phase)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Run each host's steps on a bounded pool of blocking workers.
    ///
    /// Once any host fails no further host is started; hosts already running
    /// finish their current step sequence. A forced cancellation returns
    /// without waiting for them.
    pub async fn run_parallel(
        &self,
        stage: &str,
        work: Vec<(String, Vec<Step>)>,
    ) -> Result<(), StepFailure> {
        let permits = Arc::new(Semaphore::new(self.max_parallel));
        let halt = Arc::new(AtomicBool::new(false));
        let mut set = JoinSet::new();
        let mut hosts_by_task = HashMap::new();
        let mut skipped = false;
        tracing::debug!(stage, hosts = work.len(), width = self.max_parallel, "fan out");

        for (host, steps) in work {
            let permit = tokio::select! {
                permit = Arc::clone(&permits).acquire_owned() => permit,
                () = self.ctx.cancel.reached(CancelLevel::Forced) => {
                    return Err(StepFailure::interrupted(stage));
                }
            };
            let Ok(permit) = permit else {
                break;
            };
            if halt.load(Ordering::SeqCst) || self.ctx.cancel.is_cancelled() {
                tracing::info!(host = %host, stage, "not started");
                self.ctx.mark(&host, self.phase, HostStatus::Skipped);
                skipped = true;
                continue;
            }

            self.ctx.mark(&host, self.phase, HostStatus::InProgress);
            let ctx = Arc::clone(&self.ctx);
            let halt = Arc::clone(&halt);
            let phase = self.phase;
            let task_host = host.clone();
            let handle = set.spawn_blocking(move || {
                let result = ctx.run_steps(phase, &task_host, &steps);
                let status = if result.is_ok() {
                    HostStatus::Done
                } else {
                    halt.store(true, Ordering::SeqCst);
                    HostStatus::Failed
                };
                ctx.mark(&task_host, phase, status);
                drop(permit);
                result
            });
            hosts_by_task.insert(handle.id(), host);
        }

        let mut failure: Option<StepFailure> = None;
        loop {
            let joined = tokio::select! {
                joined = set.join_next_with_id() => joined,
                () = self.ctx.cancel.reached(CancelLevel::Forced) => {
                    set.detach_all();
                    return Err(StepFailure::interrupted(stage));
                }
            };
            let Some(joined) = joined else { break };
            let outcome = match joined {
                Ok((_, result)) => result,
                Err(join_err) => {
                    let host = hosts_by_task
                        .get(&join_err.id())
                        .cloned()
                        .unwrap_or_default();
                    self.ctx.mark(&host, self.phase, HostStatus::Failed);
                    Err(StepFailure::new(
                        &host,
                        stage,
                        DeployError::Io(std::io::Error::other(format!("worker failed: {join_err}"))),
                    ))
                }
            };
            if let Err(f) = outcome {
                let replace = match &failure {
                    None => true,
                    Some(existing) => matches!(existing.error, DeployError::Interrupted)
                        && !matches!(f.error, DeployError::Interrupted),
                };
                if replace {
                    failure = Some(f);
                }
            }
        }

        match failure {
            Some(f) => Err(f),
            None if skipped => Err(StepFailure::interrupted(stage)),
            None => Ok(()),
        }
    }

    /// Run one step on one host off the async runtime and return its output.
    /// The host counts as done for the phase once the step succeeds.
    pub async fn run_on(&self, host: &str, step: Step) -> Result<ProcessOutput, StepFailure> {
        let phase = self.phase;
        let name = step.name.clone();
        let task_host = host.to_string();
        self.ctx.mark(host, phase, HostStatus::InProgress);
        let output = self
            .blocking(host, &name, move |ctx| {
                ctx.execute_step(phase, &task_host, &step)
            })
            .await?;
        self.ctx.mark(host, phase, HostStatus::Done);
        Ok(output)
    }

    /// Run `f` on a blocking worker, giving up on a forced cancellation.
    pub async fn blocking<T, F>(&self, host: &str, step: &str, f: F) -> Result<T, StepFailure>
    where
        T: Send + 'static,
        F: FnOnce(&PhaseContext) -> Result<T, StepFailure> + Send + 'static,
    {
        let ctx = Arc::clone(&self.ctx);
        let handle = tokio::task::spawn_blocking(move || f(&ctx));
        tokio::select! {
            joined = handle => joined.unwrap_or_else(|e| {
                Err(StepFailure::new(
                    host,
                    step,
                    DeployError::Io(std::io::Error::other(format!("worker failed: {e}"))),
                ))
            }),
            () = self.ctx.cancel.reached(CancelLevel::Forced) => Err(StepFailure::interrupted(step)),
        }
    }
}

/// An installation phase.
#[async_trait]
pub trait Phase: Send + Sync {
    fn id(&self) -> PhaseId;

    /// Steps `host` runs in program order. Empty for hosts with nothing to do.
    fn host_steps(&self, _ctx: &PhaseContext, _host: &Host) -> Vec<Step> {
        Vec::new()
    }

    /// Run the phase. The default fans `host_steps` out over every governed host.
    async fn execute(&self, scope: &PhaseScope) -> Result<(), StepFailure> {
        let work = scope
            .governed_hosts()
            .iter()
            .map(|host| (host.address.clone(), self.host_steps(scope.ctx(), host)))
            .collect();
        scope.run_parallel(self.id().as_str(), work).await
    }
}

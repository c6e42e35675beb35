//! Drives the ordered phase list through the run-state machine.
//!
//! Each phase starts only when its dependency is done on every host. Every
//! transition is persisted. A failure anywhere moves the run to `FAILED`,
//! restores outstanding backups and releases the run's resources.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use gpdeploy_utils::error::PhaseError;
use gpdeploy_utils::logging::{log_phase_complete, log_phase_error, log_phase_start, phase_span};
use gpdeploy_utils::{DeployError, HostStatus, PhaseId, RunState};
use tracing::Instrument;

use crate::phase::{Phase, PhaseContext, PhaseScope};
use crate::state::{ErrorRecord, InstallationState, StateStore};

pub struct PhaseRunner {
    ctx: Arc<PhaseContext>,
    store: Option<StateStore>,
    state: InstallationState,
}

impl PhaseRunner {
    pub fn new(ctx: Arc<PhaseContext>, mode: &str, store: Option<StateStore>) -> Self {
        let mut state = InstallationState::new(
            &ctx.run_id,
            mode,
            &ctx.coordinator(),
            ctx.executor.is_simulated(),
        );
        state.single_node = ctx.single_node;
        state.hosts = ctx.registry().hosts().to_vec();
        Self { ctx, store, state }
    }

    #[must_use]
    pub fn state(&self) -> &InstallationState {
        &self.state
    }

    #[must_use]
    pub fn into_state(self) -> InstallationState {
        self.state
    }

    #[must_use]
    pub fn context(&self) -> &Arc<PhaseContext> {
        &self.ctx
    }

    /// Run `phases` in order, then settle the run either way.
    pub async fn run(&mut self, phases: &[Arc<dyn Phase>]) -> Result<(), DeployError> {
        self.persist();
        let result = match self.run_phases(phases).await {
            Ok(()) => self.transition(RunState::Complete),
            Err(e) => Err(e),
        };
        match &result {
            Ok(()) => self.complete().await,
            Err(e) => self.fail(e).await,
        }
        result
    }

    async fn run_phases(&mut self, phases: &[Arc<dyn Phase>]) -> Result<(), DeployError> {
        for phase in phases {
            let id = phase.id();
            self.ctx.cancel.check()?;
            self.check_dependency(id)?;
            self.transition(id.run_state())?;
            self.state.phase = Some(id);
            self.persist();

            let hosts = self.ctx.registry().hosts_for_phase(id).len();
            log_phase_start(id, hosts);
            let started = Instant::now();
            let scope = PhaseScope::new(Arc::clone(&self.ctx), id);
            let outcome = phase.execute(&scope).instrument(phase_span(id, hosts)).await;

            match outcome {
                Ok(()) => {
                    // Hosts the phase never finished stay pending; the next
                    // phase's barrier refuses to start over them.
                    let pending = self.ctx.registry().pending_for(id);
                    if !pending.is_empty() {
                        tracing::warn!(phase = %id, ?pending, "phase returned with hosts unfinished");
                    }
                    log_phase_complete(id, started.elapsed());
                    self.persist();
                }
                Err(failure) => {
                    if self.ctx.registry().get(&failure.host).is_some() {
                        self.ctx.mark(&failure.host, id, HostStatus::Failed);
                    }
                    log_phase_error(
                        id,
                        Some(failure.host.as_str()),
                        &failure.error.to_string(),
                        started.elapsed(),
                    );
                    return Err(failure.into_error(id));
                }
            }
        }
        Ok(())
    }

    fn check_dependency(&self, phase: PhaseId) -> Result<(), DeployError> {
        let Some(dependency) = phase.dependency() else {
            return Ok(());
        };
        let pending = self.ctx.registry().pending_for(dependency);
        if pending.is_empty() {
            return Ok(());
        }
        Err(PhaseError::DependencyNotSatisfied {
            phase,
            dependency,
            pending_hosts: pending,
        }
        .into())
    }

    fn transition(&mut self, to: RunState) -> Result<(), DeployError> {
        let from = self.state.state;
        if !from.can_transition_to(to) {
            return Err(PhaseError::InvalidTransition { from, to }.into());
        }
        tracing::info!(%from, %to, "run state");
        self.state.state = to;
        self.persist();
        Ok(())
    }

    async fn complete(&mut self) {
        let rollback = Arc::clone(&self.ctx.rollback);
        let settled = tokio::task::spawn_blocking(move || {
            rollback.discard_all();
            rollback.cleanup_run();
        })
        .await;
        if let Err(e) = settled {
            tracing::error!(error = %e, "cleanup worker failed");
        }
        self.persist();
    }

    async fn fail(&mut self, error: &DeployError) {
        self.state.error = Some(ErrorRecord::from_error(error));
        if let Err(e) = self.transition(RunState::Failed) {
            tracing::error!(error = %e, "could not record failure");
        }

        let rollback = Arc::clone(&self.ctx.rollback);
        let forced = self.ctx.cancel.is_forced();
        let settled = tokio::task::spawn_blocking(move || {
            if forced {
                let left = rollback.outstanding().len();
                if left > 0 {
                    tracing::warn!(backups = left, "forced stop; backups left in place");
                }
            } else {
                for e in rollback.restore_all() {
                    tracing::error!(error = %e, "restore failed");
                }
            }
            rollback.cleanup_run();
        })
        .await;
        if let Err(e) = settled {
            tracing::error!(error = %e, "rollback worker failed");
        }
        self.persist();
    }

    /// Write the snapshot. A store failure is logged, never fatal.
    fn persist(&mut self) {
        self.state.hosts = self.ctx.registry().hosts().to_vec();
        self.state.extensions = self.ctx.extensions();
        self.state.journal = self.ctx.journal.entries();
        self.state.updated_at = Utc::now();
        if let Some(store) = &self.store
            && let Err(e) = store.save(&self.state)
        {
            tracing::warn!(path = %store.path(), error = %e, "could not save run state");
        }
    }
}

impl std::fmt::Debug for PhaseRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseRunner")
            .field("run_id", &self.state.run_id)
            .field("state", &self.state.state)
            .finish_non_exhaustive()
    }
}

//! Extension lifecycle:
//!
//! ```text
//! NOT_PREPARED → PREPARED → INITIALIZED → REGISTERED → SYNCED → STARTED
//! ```
//!
//! Re-running against a host where an extension is half set up is expected.
//! The current state is inferred by inspection (service running, cluster
//! directory present), not read from a record, so it can be wrong for a host
//! that was interrupted mid-step. Whatever was assumed is recorded in the run
//! state.

use std::sync::Arc;

use async_trait::async_trait;
use gpdeploy_config::DeployConfig;
use gpdeploy_utils::{DeployError, HostStatus, PhaseId};
use shell_words::quote;

use crate::command::RemoteCommand;
use crate::phase::{Phase, PhaseContext, PhaseScope, Step, StepFailure};
use crate::phases::binary_install::{package_steps, staging_dir};
use crate::state::ExtensionRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, strum::Display, strum::EnumIter)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    NotPrepared,
    Prepared,
    Initialized,
    Registered,
    Synced,
    Started,
}

/// What inspection concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assessment {
    /// Already at its final state.
    Complete,
    /// Set up up to the given state; try the final transition directly.
    Resumable(LifecycleState),
    Fresh,
}

/// An extension driven through the lifecycle from the coordinator.
pub trait Extension: Send + Sync {
    fn name(&self) -> &'static str;

    /// Last state this extension has. Extensions without a service stop early.
    fn final_state(&self) -> LifecycleState;

    /// Read-only command whose output `assess` understands. Must exit 0.
    fn inspect(&self, ctx: &PhaseContext) -> RemoteCommand;

    fn assess(&self, stdout: &str) -> Assessment;

    /// Steps that move the extension into `to`. Empty when `to` does not apply.
    fn transition(&self, ctx: &PhaseContext, to: LifecycleState) -> Vec<Step>;

    /// Wipe partial state so the full sequence can start over.
    fn reset(&self, ctx: &PhaseContext) -> Step;

    /// Stop command used by teardown, if the extension runs a service.
    fn stop(&self, _ctx: &PhaseContext) -> Option<Step> {
        None
    }
}

/// Parse `key=yes|no` pairs.
fn flag(stdout: &str, key: &str) -> bool {
    stdout
        .split_whitespace()
        .filter_map(|pair| pair.split_once('='))
        .any(|(k, v)| k == key && v == "yes")
}

/// Platform Extension Framework.
#[derive(Debug, Default, Clone, Copy)]
pub struct Pxf;

impl Pxf {
    fn cluster(ctx: &PhaseContext, verb: &str) -> RemoteCommand {
        ctx.admin_command(&format!("pxf cluster {verb}"), &format!("pxf cluster {verb}"))
            .env("PXF_BASE", ctx.config.pxf_base.clone())
    }
}

impl Extension for Pxf {
    fn name(&self) -> &'static str {
        "pxf"
    }

    fn final_state(&self) -> LifecycleState {
        LifecycleState::Started
    }

    fn inspect(&self, ctx: &PhaseContext) -> RemoteCommand {
        let script = format!(
            "r=no; c=no; i=no; \
             command -v pxf >/dev/null 2>&1 && i=yes; \
             [ -n \"$(ls -A {base} 2>/dev/null)\" ] && c=yes; \
             pxf cluster status >/dev/null 2>&1 && r=yes; \
             echo \"running=$r cluster_dir=$c installed=$i\"",
            base = quote(&ctx.config.pxf_base)
        );
        ctx.admin_command("inspect pxf", &script)
            .env("PXF_BASE", ctx.config.pxf_base.clone())
            .idempotent()
            .simulated("running=no cluster_dir=no installed=yes")
    }

    fn assess(&self, stdout: &str) -> Assessment {
        if flag(stdout, "running") {
            Assessment::Complete
        } else if flag(stdout, "cluster_dir") {
            Assessment::Resumable(LifecycleState::Registered)
        } else {
            Assessment::Fresh
        }
    }

    fn transition(&self, ctx: &PhaseContext, to: LifecycleState) -> Vec<Step> {
        let (name, verb) = match to {
            LifecycleState::NotPrepared => return Vec::new(),
            LifecycleState::Prepared => ("pxf_prepare", "prepare"),
            LifecycleState::Initialized => ("pxf_init", "init"),
            LifecycleState::Registered => ("pxf_register", "register"),
            LifecycleState::Synced => ("pxf_sync", "sync"),
            LifecycleState::Started => ("pxf_start", "start"),
        };
        vec![Step::mutating(name, Self::cluster(ctx, verb))]
    }

    fn reset(&self, ctx: &PhaseContext) -> Step {
        Step::destructive("pxf_reset", &ctx.config.pxf_base, Self::cluster(ctx, "reset"))
    }

    fn stop(&self, ctx: &PhaseContext) -> Option<Step> {
        Some(Step::mutating("pxf_stop", Self::cluster(ctx, "stop")))
    }
}

/// In-database analytics library; no service, so it ends at `Initialized`.
#[derive(Debug, Default, Clone)]
pub struct Madlib {
    installer: Option<std::path::PathBuf>,
}

impl Madlib {
    #[must_use]
    pub fn new(installer: Option<std::path::PathBuf>) -> Self {
        Self { installer }
    }

    fn madpack(ctx: &PhaseContext, action: &str) -> RemoteCommand {
        let conn = format!(
            "{}@{}:{}/postgres",
            ctx.config.admin_user,
            ctx.coordinator(),
            ctx.config.coordinator_port
        );
        ctx.admin_command(
            &format!("madpack {action}"),
            &format!("madpack -s madlib -p greenplum -c {} {action}", quote(&conn)),
        )
    }
}

impl Extension for Madlib {
    fn name(&self) -> &'static str {
        "madlib"
    }

    fn final_state(&self) -> LifecycleState {
        LifecycleState::Initialized
    }

    fn inspect(&self, ctx: &PhaseContext) -> RemoteCommand {
        let script = format!(
            "p=no; s=no; \
             command -v madpack >/dev/null 2>&1 && p=yes; \
             [ \"$(psql -p {port} -d postgres -Atc \"select 1 from pg_namespace where nspname = 'madlib'\" 2>/dev/null)\" = 1 ] && s=yes; \
             echo \"installed=$p schema=$s\"",
            port = ctx.config.coordinator_port
        );
        ctx.admin_command("inspect madlib", &script)
            .idempotent()
            .simulated("installed=no schema=no")
    }

    fn assess(&self, stdout: &str) -> Assessment {
        if flag(stdout, "schema") {
            Assessment::Complete
        } else if flag(stdout, "installed") {
            Assessment::Resumable(LifecycleState::Prepared)
        } else {
            Assessment::Fresh
        }
    }

    fn transition(&self, ctx: &PhaseContext, to: LifecycleState) -> Vec<Step> {
        match to {
            LifecycleState::Prepared => {
                let staging = staging_dir(&ctx.run_id);
                let local = self
                    .installer
                    .clone()
                    .unwrap_or_else(|| std::path::PathBuf::from("madlib.gppkg"));
                let mut steps = vec![Step::mutating(
                    "madlib_staging_dir",
                    RemoteCommand::new("create staging directory", format!("mkdir -p -m 700 {}", quote(&staging)))
                        .idempotent(),
                )];
                let is_gppkg = local.extension().is_some_and(|e| e == "gppkg");
                if is_gppkg {
                    let remote = format!(
                        "{staging}/{}",
                        local.file_name().map_or_else(|| "madlib.gppkg".into(), |n| n.to_string_lossy())
                    );
                    steps.push(Step::upload("upload_madlib", &local, &remote));
                    steps.push(Step::mutating(
                        "install_madlib",
                        ctx.admin_command("install madlib package", &format!("gppkg -i {}", quote(&remote))),
                    ));
                } else {
                    steps.extend(package_steps("madlib", &local, &staging));
                }
                steps
            }
            LifecycleState::Initialized => vec![Step::mutating("madlib_install", Self::madpack(ctx, "install"))],
            _ => Vec::new(),
        }
    }

    fn reset(&self, ctx: &PhaseContext) -> Step {
        Step::mutating("madlib_reset", Self::madpack(ctx, "uninstall"))
    }
}

/// Runs every enabled extension's machine on the coordinator.
pub struct ExtensionInit {
    extensions: Vec<Arc<dyn Extension>>,
}

impl ExtensionInit {
    #[must_use]
    pub fn new(extensions: Vec<Arc<dyn Extension>>) -> Self {
        Self { extensions }
    }

    #[must_use]
    pub fn from_config(config: &DeployConfig) -> Self {
        Self::new(enabled_extensions(config))
    }

    async fn drive(
        &self,
        scope: &PhaseScope,
        host: &str,
        ext: &dyn Extension,
    ) -> Result<ExtensionRecord, StepFailure> {
        let ctx = scope.ctx();
        let inspect = Step::probe(&format!("{}_inspect", ext.name()), ext.inspect(ctx));
        let output = scope.run_on(host, inspect).await?;
        let assessment = ext.assess(&output.stdout_string());
        let target = ext.final_state();
        tracing::info!(extension = ext.name(), ?assessment, "extension inspected");

        match assessment {
            Assessment::Complete => {
                return Ok(ExtensionRecord {
                    assumed: target.to_string(),
                    reached: target.to_string(),
                    recovered: false,
                });
            }
            Assessment::Resumable(assumed) => {
                let mut attempt = Ok(());
                for step in ext.transition(ctx, target) {
                    attempt = scope.run_on(host, step).await.map(|_| ());
                    if attempt.is_err() {
                        break;
                    }
                }
                match attempt {
                    Ok(()) => {
                        return Ok(ExtensionRecord {
                            assumed: assumed.to_string(),
                            reached: target.to_string(),
                            recovered: true,
                        });
                    }
                    Err(f) if matches!(f.error, DeployError::Interrupted) => return Err(f),
                    Err(f) => {
                        tracing::warn!(
                            extension = ext.name(),
                            error = %f.error,
                            "direct start failed; resetting"
                        );
                    }
                }
                scope.run_on(host, ext.reset(ctx)).await?;
                self.full_sequence(scope, host, ext).await?;
                Ok(ExtensionRecord {
                    assumed: assumed.to_string(),
                    reached: target.to_string(),
                    recovered: true,
                })
            }
            Assessment::Fresh => {
                self.full_sequence(scope, host, ext).await?;
                Ok(ExtensionRecord {
                    assumed: LifecycleState::NotPrepared.to_string(),
                    reached: target.to_string(),
                    recovered: false,
                })
            }
        }
    }

    async fn full_sequence(
        &self,
        scope: &PhaseScope,
        host: &str,
        ext: &dyn Extension,
    ) -> Result<(), StepFailure> {
        use strum::IntoEnumIterator;
        let target = ext.final_state();
        for state in LifecycleState::iter().filter(|s| *s > LifecycleState::NotPrepared && *s <= target) {
            for step in ext.transition(scope.ctx(), state) {
                scope.run_on(host, step).await?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for ExtensionInit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.extensions.iter().map(|e| e.name()).collect();
        f.debug_struct("ExtensionInit").field("extensions", &names).finish()
    }
}

/// Extensions switched on in `config`, in lifecycle order.
#[must_use]
pub fn enabled_extensions(config: &DeployConfig) -> Vec<Arc<dyn Extension>> {
    let mut extensions: Vec<Arc<dyn Extension>> = Vec::new();
    if config.install_pxf {
        extensions.push(Arc::new(Pxf));
    }
    if config.install_madlib {
        extensions.push(Arc::new(Madlib::new(
            config
                .madlib_installer_path
                .as_ref()
                .map(|p| p.as_std_path().to_path_buf()),
        )));
    }
    extensions
}

#[async_trait]
impl Phase for ExtensionInit {
    fn id(&self) -> PhaseId {
        PhaseId::ExtensionInit
    }

    async fn execute(&self, scope: &PhaseScope) -> Result<(), StepFailure> {
        let coordinator = scope.ctx().coordinator();
        for ext in &self.extensions {
            let record = self.drive(scope, &coordinator, ext.as_ref()).await?;
            tracing::info!(
                extension = ext.name(),
                assumed = %record.assumed,
                recovered = record.recovered,
                "extension ready"
            );
            scope.ctx().record_extension(ext.name(), record);
        }
        scope.ctx().mark(&coordinator, PhaseId::ExtensionInit, HostStatus::Done);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pxf_assessment_follows_inspection() {
        let pxf = Pxf;
        assert_eq!(
            pxf.assess("running=yes cluster_dir=yes installed=yes"),
            Assessment::Complete
        );
        assert_eq!(
            pxf.assess("running=no cluster_dir=yes installed=yes\n"),
            Assessment::Resumable(LifecycleState::Registered)
        );
        assert_eq!(pxf.assess("running=no cluster_dir=no installed=no"), Assessment::Fresh);
        assert_eq!(pxf.assess(""), Assessment::Fresh);
    }

    #[test]
    fn madlib_resumes_from_installed_package() {
        let madlib = Madlib::default();
        assert_eq!(
            madlib.assess("installed=yes schema=no"),
            Assessment::Resumable(LifecycleState::Prepared)
        );
        assert_eq!(madlib.final_state(), LifecycleState::Initialized);
    }

    #[test]
    fn states_render_in_screaming_case() {
        assert_eq!(LifecycleState::NotPrepared.to_string(), "NOT_PREPARED");
    }
}

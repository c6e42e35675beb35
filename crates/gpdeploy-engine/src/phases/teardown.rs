use async_trait::async_trait;
use gpdeploy_utils::PhaseId;
use shell_words::quote;

use crate::command::RemoteCommand;
use crate::phase::{Phase, PhaseContext, PhaseScope, Step, StepFailure};
use crate::phases::extension::enabled_extensions;
use crate::phases::host_setup::{LIMITS_DROP_IN, SYSCTL_DROP_IN};
use crate::registry::Host;

/// `gpstop` exits 1 when it stopped the cluster with warnings.
const GPSTOP_OK: &[i32] = &[0, 1];

/// Stop everything and remove what installation created.
#[derive(Debug, Default, Clone, Copy)]
pub struct Teardown;

impl Teardown {
    fn stop_cluster(ctx: &PhaseContext) -> Step {
        let conf = format!("{}/postgresql.conf", ctx.coordinator_data_dir());
        let script = format!(
            "if pgrep -u {u} -x postgres >/dev/null 2>&1; then gpstop -a -M fast; fi",
            u = quote(&ctx.config.admin_user)
        );
        Step::destructive(
            "stop_cluster",
            &conf,
            ctx.admin_command("gpstop", &script)
                .env("COORDINATOR_DATA_DIRECTORY", ctx.coordinator_data_dir()),
        )
        .with_success_codes(GPSTOP_OK)
    }
}

#[async_trait]
impl Phase for Teardown {
    fn id(&self) -> PhaseId {
        PhaseId::Teardown
    }

    fn host_steps(&self, ctx: &PhaseContext, _host: &Host) -> Vec<Step> {
        let data = ctx.config.data_dir.trim_end_matches('/');
        let dirs = ["coordinator", "primary", "mirror"]
            .iter()
            .map(|d| quote(&format!("{data}/{d}")).into_owned())
            .collect::<Vec<_>>()
            .join(" ");

        let mut steps = vec![
            Step::mutating(
                "remove_data_dirs",
                RemoteCommand::new("remove data directories", format!("rm -rf {dirs}")).idempotent(),
            ),
            Step::destructive(
                "remove_sysctl",
                SYSCTL_DROP_IN,
                RemoteCommand::new(
                    "remove kernel settings",
                    format!("rm -f {} && (sysctl --system >/dev/null 2>&1 || true)", SYSCTL_DROP_IN),
                ),
            ),
            Step::destructive(
                "remove_limits",
                LIMITS_DROP_IN,
                RemoteCommand::new("remove resource limits", format!("rm -f {LIMITS_DROP_IN}")),
            ),
        ];
        if ctx.remove_install {
            steps.push(Step::mutating(
                "remove_install_dir",
                RemoteCommand::new(
                    "remove installation directory",
                    format!("rm -rf {}", quote(ctx.config.install_dir.trim_end_matches('/'))),
                )
                .idempotent(),
            ));
        }
        steps
    }

    async fn execute(&self, scope: &PhaseScope) -> Result<(), StepFailure> {
        let ctx = scope.ctx();
        let coordinator = ctx.coordinator();

        for ext in enabled_extensions(&ctx.config) {
            if let Some(stop) = ext.stop(ctx) {
                if let Err(f) = scope.run_on(&coordinator, stop).await {
                    if matches!(f.error, gpdeploy_utils::DeployError::Interrupted) {
                        return Err(f);
                    }
                    tracing::warn!(extension = ext.name(), error = %f.error, "extension did not stop cleanly");
                }
            }
        }
        scope.run_on(&coordinator, Self::stop_cluster(ctx)).await?;

        let work = scope
            .governed_hosts()
            .iter()
            .map(|host| (host.address.clone(), self.host_steps(ctx, host)))
            .collect();
        scope.run_parallel("teardown", work).await
    }
}

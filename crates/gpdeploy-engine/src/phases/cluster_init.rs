//! Cluster bring-up as a nested machine:
//!
//! ```text
//! GENERATE_CONFIG → INIT_COORDINATOR → INIT_SEGMENTS (parallel) → INIT_STANDBY? → VERIFY
//! ```
//!
//! `gpinitsystem` on the coordinator creates the segment instances; the
//! per-segment stage starts only once it has returned and checks each
//! segment host's instance directories.

use async_trait::async_trait;
use gpdeploy_utils::{HostRole, HostStatus, PhaseId};
use shell_words::quote;

use crate::command::RemoteCommand;
use crate::phase::{Phase, PhaseContext, PhaseScope, Step, StepFailure};

/// `gpinitsystem` exits 1 when it finished with warnings.
const GPINITSYSTEM_OK: &[i32] = &[0, 1];

fn config_dir(ctx: &PhaseContext) -> String {
    format!("{}/gpconfigs", ctx.admin_home())
}

fn init_config_path(ctx: &PhaseContext) -> String {
    format!("{}/gpinitsystem_config", config_dir(ctx))
}

fn hostfile_path(ctx: &PhaseContext) -> String {
    format!("{}/hostfile_gpinitsystem", config_dir(ctx))
}

/// Lines of `gpinitsystem_config`.
fn init_config_lines(ctx: &PhaseContext, coordinator: &str) -> Vec<String> {
    let cfg = &ctx.config;
    let data = cfg.data_dir.trim_end_matches('/');
    let primaries = vec![format!("{data}/primary"); cfg.segments_per_host as usize].join(" ");
    vec![
        format!("ARRAY_NAME=\"{}\"", cfg.array_name),
        "SEG_PREFIX=gpseg".to_string(),
        format!("PORT_BASE={}", cfg.port_base),
        format!("declare -a DATA_DIRECTORY=({primaries})"),
        format!("COORDINATOR_HOSTNAME={coordinator}"),
        format!("COORDINATOR_DIRECTORY={data}/coordinator"),
        format!("COORDINATOR_PORT={}", cfg.coordinator_port),
        "TRUSTED_SHELL=ssh".to_string(),
        "ENCODING=UNICODE".to_string(),
        format!("MACHINE_LIST_FILE={}", hostfile_path(ctx)),
    ]
}

fn write_lines(path: &str, lines: &[String]) -> String {
    let quoted: Vec<String> = lines.iter().map(|l| quote(l).into_owned()).collect();
    format!("printf '%s\\n' {} > {}", quoted.join(" "), quote(path))
}

/// Initialize the database cluster from the coordinator.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClusterInit;

impl ClusterInit {
    fn generate_config(ctx: &PhaseContext, coordinator: &str, segments: &[String]) -> Step {
        let script = format!(
            "mkdir -p {dir} && {config} && {hosts}",
            dir = quote(&config_dir(ctx)),
            config = write_lines(&init_config_path(ctx), &init_config_lines(ctx, coordinator)),
            hosts = write_lines(&hostfile_path(ctx), segments),
        );
        Step::destructive(
            "generate_config",
            &config_dir(ctx),
            RemoteCommand::new("write cluster configuration", script).as_user(&ctx.config.admin_user),
        )
    }

    fn init_coordinator(ctx: &PhaseContext) -> Step {
        Step::mutating(
            "init_coordinator",
            ctx.admin_command(
                "gpinitsystem",
                &format!(
                    "gpinitsystem -a -c {} -h {}",
                    quote(&init_config_path(ctx)),
                    quote(&hostfile_path(ctx))
                ),
            ),
        )
        .with_success_codes(GPINITSYSTEM_OK)
    }

    fn init_segment(ctx: &PhaseContext) -> Step {
        let primary = format!("{}/primary", ctx.config.data_dir.trim_end_matches('/'));
        Step::probe(
            "init_segment",
            RemoteCommand::new(
                "segment instances present",
                format!("ls -d {}/gpseg* >/dev/null 2>&1", quote(&primary)),
            )
            .idempotent(),
        )
    }

    fn init_standby(ctx: &PhaseContext, standby: &str) -> Step {
        Step::mutating(
            "init_standby",
            ctx.admin_command("gpinitstandby", &format!("gpinitstandby -a -s {}", quote(standby)))
                .env("COORDINATOR_DATA_DIRECTORY", ctx.coordinator_data_dir()),
        )
    }

    fn verify(ctx: &PhaseContext) -> Step {
        Step::probe(
            "verify",
            ctx.admin_command("gpstate", "gpstate -s")
                .env("COORDINATOR_DATA_DIRECTORY", ctx.coordinator_data_dir())
                .env("PGPORT", ctx.config.coordinator_port.to_string())
                .idempotent(),
        )
    }
}

#[async_trait]
impl Phase for ClusterInit {
    fn id(&self) -> PhaseId {
        PhaseId::ClusterInit
    }

    async fn execute(&self, scope: &PhaseScope) -> Result<(), StepFailure> {
        let ctx = scope.ctx();
        let registry = ctx.registry();
        let coordinator = registry.coordinator().to_string();
        let segments: Vec<String> = registry
            .hosts_for_role(HostRole::Segment)
            .iter()
            .map(|h| h.address.clone())
            .collect();

        scope
            .run_on(&coordinator, Self::generate_config(ctx, &coordinator, &segments))
            .await?;
        scope.run_on(&coordinator, Self::init_coordinator(ctx)).await?;

        let work = segments
            .iter()
            .map(|s| (s.clone(), vec![Self::init_segment(ctx)]))
            .collect();
        scope.run_parallel("init_segments", work).await?;

        // A collapsed single node has nowhere separate to put a standby.
        if let Some(standby) = registry.standby().filter(|_| !ctx.single_node) {
            scope.run_on(&coordinator, Self::init_standby(ctx, standby)).await?;
            // gpinitstandby runs from the coordinator; the standby finishes with it.
            ctx.mark(standby, PhaseId::ClusterInit, HostStatus::Done);
        }

        scope.run_on(&coordinator, Self::verify(ctx)).await?;
        Ok(())
    }
}

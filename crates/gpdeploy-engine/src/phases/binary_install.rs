use std::path::{Path, PathBuf};

use async_trait::async_trait;
use gpdeploy_utils::PhaseId;
use shell_words::quote;

use crate::command::RemoteCommand;
use crate::packages::PackageKind;
use crate::phase::{Phase, PhaseContext, PhaseScope, Step, StepFailure};
use crate::registry::Host;

const PLACEHOLDER_INSTALLER: &str = "greenplum-db.rpm";

/// Run-scoped scratch directory on every host.
#[must_use]
pub fn staging_dir(run_id: &str) -> String {
    format!("/tmp/gpdeploy-{run_id}")
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| PLACEHOLDER_INSTALLER.to_string(), |n| n.to_string_lossy().into_owned())
}

/// Upload and install a package file, as two steps.
pub(crate) fn package_steps(name: &str, local: &Path, staging: &str) -> Vec<Step> {
    let remote = format!("{staging}/{}", file_name(local));
    let kind = PackageKind::from_path(&remote).unwrap_or(PackageKind::Rpm);
    vec![
        Step::upload(&format!("upload_{name}"), local, &remote),
        Step::mutating(
            &format!("install_{name}"),
            RemoteCommand::new(format!("install {}", file_name(local)), kind.install_script(&remote)),
        ),
    ]
}

/// Copy the database package to every host and install it.
#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryInstall;

#[async_trait]
impl Phase for BinaryInstall {
    fn id(&self) -> PhaseId {
        PhaseId::BinaryInstall
    }

    fn host_steps(&self, ctx: &PhaseContext, _host: &Host) -> Vec<Step> {
        let staging = staging_dir(&ctx.run_id);
        let installer = ctx
            .config
            .installer_path
            .as_ref()
            .map_or_else(|| PathBuf::from(PLACEHOLDER_INSTALLER), |p| p.as_std_path().to_path_buf());

        let mut steps = vec![Step::mutating(
            "create_staging_dir",
            RemoteCommand::new("create staging directory", format!("mkdir -p -m 700 {}", quote(&staging)))
                .idempotent(),
        )];
        steps.extend(package_steps("database", &installer, &staging));
        steps.push(Step::mutating(
            "chown_install_dir",
            RemoteCommand::new(
                "hand install directory to admin user",
                format!(
                    "chown -R {}:{} {}/",
                    quote(&ctx.config.admin_user),
                    quote(&ctx.config.admin_group),
                    quote(ctx.config.install_dir.trim_end_matches('/')),
                ),
            )
            .idempotent(),
        ));

        if ctx.config.install_pxf
            && let Some(pxf) = &ctx.config.pxf_installer_path
        {
            steps.extend(package_steps("pxf", pxf.as_std_path(), &staging));
        }
        steps
    }

    async fn execute(&self, scope: &PhaseScope) -> Result<(), StepFailure> {
        let ctx = scope.ctx();
        let hosts = scope.governed_hosts();
        if !ctx.executor.is_simulated() {
            let staging = staging_dir(&ctx.run_id);
            for host in &hosts {
                ctx.rollback.register_temp(&host.address, &staging);
            }
        }
        let work = hosts
            .iter()
            .map(|host| (host.address.clone(), self.host_steps(ctx, host)))
            .collect();
        scope.run_parallel("binary_install", work).await
    }
}

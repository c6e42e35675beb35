use gpdeploy_utils::PhaseId;
use shell_words::quote;

use crate::command::RemoteCommand;
use crate::phase::{Phase, PhaseContext, Step};
use crate::registry::Host;

/// Free space required under the data directory's parent, in KiB.
const MIN_FREE_KIB: u64 = 1024 * 1024;

/// Connect to every host and check it can take an installation.
#[derive(Debug, Default, Clone, Copy)]
pub struct Preflight;

impl Phase for Preflight {
    fn id(&self) -> PhaseId {
        PhaseId::Preflight
    }

    fn host_steps(&self, ctx: &PhaseContext, _host: &Host) -> Vec<Step> {
        let data_dir = ctx.config.data_dir.trim_end_matches('/');
        let parent = match data_dir.rsplit_once('/') {
            Some(("", _)) | None => "/",
            Some((parent, _)) => parent,
        };
        vec![
            Step::connect(),
            Step::probe(
                "check_os",
                RemoteCommand::new("operating system is Linux", "uname -s | grep -qx Linux")
                    .idempotent(),
            ),
            Step::probe(
                "check_privileges",
                RemoteCommand::new(
                    "root or passwordless sudo",
                    r#"[ "$(id -u)" -eq 0 ] || sudo -n true"#,
                )
                .idempotent(),
            ),
            Step::probe(
                "check_disk_space",
                RemoteCommand::new(
                    format!("at least {} GiB free under {parent}", MIN_FREE_KIB / (1024 * 1024)),
                    format!(
                        "test \"$(df -Pk {} | awk 'NR==2 {{print $4}}')\" -ge {MIN_FREE_KIB}",
                        quote(parent)
                    ),
                )
                .idempotent(),
            ),
        ]
    }
}

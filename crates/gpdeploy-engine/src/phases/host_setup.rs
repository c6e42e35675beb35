use async_trait::async_trait;
use gpdeploy_utils::{DeployError, HostRole, PhaseId};
use shell_words::quote;

use crate::command::RemoteCommand;
use crate::phase::{Phase, PhaseContext, PhaseScope, Step, StepFailure};
use crate::registry::Host;

pub const SYSCTL_DROP_IN: &str = "/etc/sysctl.d/90-gpdeploy.conf";
pub const LIMITS_DROP_IN: &str = "/etc/security/limits.d/90-gpdeploy.conf";

const SYSCTL_SETTINGS: &[&str] = &[
    "kernel.shmmni = 4096",
    "kernel.sem = 250 2048000 200 8192",
    "kernel.msgmnb = 65536",
    "kernel.msgmax = 65536",
    "vm.overcommit_memory = 2",
    "vm.overcommit_ratio = 95",
    "net.ipv4.ip_local_port_range = 10000 65535",
];

const LIMITS_SETTINGS: &[&str] = &[
    "* soft nofile 524288",
    "* hard nofile 524288",
    "* soft nproc 131072",
    "* hard nproc 131072",
];

/// Shell snippet writing `lines` to `path`.
fn write_file_script(path: &str, lines: &[&str]) -> String {
    let quoted: Vec<String> = lines.iter().map(|l| quote(l).into_owned()).collect();
    format!("printf '%s\\n' {} > {}", quoted.join(" "), quote(path))
}

fn append_key_script(key: &str) -> String {
    format!(
        "mkdir -p -m 700 ~/.ssh && touch ~/.ssh/authorized_keys && \
         (grep -qxF {k} ~/.ssh/authorized_keys || echo {k} >> ~/.ssh/authorized_keys) && \
         chmod 600 ~/.ssh/authorized_keys",
        k = quote(key)
    )
}

/// Admin account, kernel settings, data directories and key exchange.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostSetup;

impl HostSetup {
    fn ssh_file(ctx: &PhaseContext, name: &str) -> String {
        format!("{}/.ssh/{name}", ctx.admin_home())
    }

    fn generate_key(ctx: &PhaseContext) -> Step {
        Step::destructive_paths(
            "generate_key",
            [Self::ssh_file(ctx, "id_rsa"), Self::ssh_file(ctx, "id_rsa.pub")],
            RemoteCommand::new(
                "generate admin ssh key",
                "test -f ~/.ssh/id_rsa || ssh-keygen -q -t rsa -b 4096 -N '' -f ~/.ssh/id_rsa",
            )
            .as_user(&ctx.config.admin_user),
        )
    }

    fn authorize_key(ctx: &PhaseContext, name: &str, description: String, key: &str) -> Step {
        Step::destructive(
            name,
            &Self::ssh_file(ctx, "authorized_keys"),
            RemoteCommand::new(description, append_key_script(key))
                .as_user(&ctx.config.admin_user)
                .idempotent(),
        )
    }

    fn scan_host_keys(ctx: &PhaseContext, names: &[String]) -> Step {
        Step::destructive(
            "scan_host_keys",
            &Self::ssh_file(ctx, "known_hosts"),
            RemoteCommand::new(
                "record cluster host keys",
                format!(
                    "ssh-keyscan -H {} >> ~/.ssh/known_hosts 2>/dev/null && chmod 600 ~/.ssh/known_hosts",
                    names.join(" ")
                ),
            )
            .as_user(&ctx.config.admin_user)
            .idempotent(),
        )
    }

    fn data_dirs(ctx: &PhaseContext, host: &Host) -> Vec<String> {
        let root = ctx.config.data_dir.trim_end_matches('/');
        let mut dirs = Vec::new();
        if host.has_role(HostRole::Coordinator) || host.has_role(HostRole::Standby) {
            dirs.push(format!("{root}/coordinator"));
        }
        if host.has_role(HostRole::Segment) {
            dirs.push(format!("{root}/primary"));
            dirs.push(format!("{root}/mirror"));
        }
        dirs
    }
}

#[async_trait]
impl Phase for HostSetup {
    fn id(&self) -> PhaseId {
        PhaseId::HostSetup
    }

    fn host_steps(&self, ctx: &PhaseContext, host: &Host) -> Vec<Step> {
        let user = &ctx.config.admin_user;
        let group = &ctx.config.admin_group;
        let home = ctx.admin_home();
        let owner = format!("{user}:{group}");
        let targets = Self::data_dirs(ctx, host);
        let dirs: Vec<String> = targets.iter().map(|d| quote(d).into_owned()).collect();

        vec![
            Step::mutating(
                "create_admin_group",
                RemoteCommand::new(
                    format!("create group {group}"),
                    format!("getent group {g} >/dev/null || groupadd {g}", g = quote(group)),
                )
                .idempotent(),
            ),
            Step::mutating(
                "create_admin_user",
                RemoteCommand::new(
                    format!("create user {user}"),
                    format!(
                        "id -u {u} >/dev/null 2>&1 || useradd -m -d {h} -g {g} -s /bin/bash {u}",
                        u = quote(user),
                        g = quote(group),
                        h = quote(&home),
                    ),
                ),
            ),
            Step::destructive(
                "write_sysctl",
                SYSCTL_DROP_IN,
                RemoteCommand::new(
                    "write kernel settings",
                    format!(
                        "{} && (sysctl --system >/dev/null 2>&1 || true)",
                        write_file_script(SYSCTL_DROP_IN, SYSCTL_SETTINGS)
                    ),
                ),
            ),
            Step::destructive(
                "write_limits",
                LIMITS_DROP_IN,
                RemoteCommand::new(
                    "write resource limits",
                    write_file_script(LIMITS_DROP_IN, LIMITS_SETTINGS),
                ),
            ),
            Step::destructive_paths(
                "create_data_dirs",
                targets,
                RemoteCommand::new(
                    "create data directories",
                    format!(
                        "mkdir -p {d} && chown {o} {d} && chmod 700 {d}",
                        d = dirs.join(" "),
                        o = quote(&owner),
                    ),
                ),
            ),
            Step::mutating(
                "prepare_ssh_dir",
                RemoteCommand::new(
                    "prepare admin .ssh",
                    format!(
                        "install -d -m 700 -o {u} -g {g} {h}/.ssh",
                        u = quote(user),
                        g = quote(group),
                        h = quote(&home),
                    ),
                )
                .idempotent(),
            ),
        ]
    }

    async fn execute(&self, scope: &PhaseScope) -> Result<(), StepFailure> {
        let ctx = scope.ctx();
        let work = scope
            .governed_hosts()
            .iter()
            .map(|host| (host.address.clone(), self.host_steps(ctx, host)))
            .collect();
        scope.run_parallel("host_setup", work).await?;

        // Key exchange: the coordinator's key must exist before anyone trusts it.
        let coordinator = ctx.coordinator();
        let admin = ctx.config.admin_user.clone();
        scope.run_on(&coordinator, Self::generate_key(ctx)).await?;

        let output = scope
            .run_on(
                &coordinator,
                Step::probe(
                    "read_public_key",
                    RemoteCommand::new("read admin public key", "cat ~/.ssh/id_rsa.pub")
                        .as_user(&admin)
                        .idempotent()
                        .simulated(format!("ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABAQ {admin}@dry-run")),
                ),
            )
            .await?;
        let key = output.stdout_string().trim().to_string();
        if key.is_empty() {
            return Err(StepFailure::new(
                &coordinator,
                "read_public_key",
                DeployError::CommandFailure {
                    host: coordinator.clone(),
                    command: "cat ~/.ssh/id_rsa.pub".to_string(),
                    exit_code: Some(0),
                    stderr: "public key is empty".to_string(),
                },
            ));
        }

        // A node never copies its key to itself over ssh; it appends locally.
        scope
            .run_on(
                &coordinator,
                Self::authorize_key(ctx, "authorize_local_key", "authorize key locally".to_string(), &key),
            )
            .await?;

        let registry = ctx.registry();
        if !ctx.single_node {
            let work = registry
                .hosts_for_phase(PhaseId::HostSetup)
                .into_iter()
                .filter(|h| h.address != coordinator)
                .map(|h| {
                    let step = Self::authorize_key(
                        ctx,
                        "distribute_key",
                        format!("authorize coordinator key on {}", h.address),
                        &key,
                    );
                    (h.address.clone(), vec![step])
                })
                .collect();
            scope.run_parallel("distribute_key", work).await?;
        }

        let mut names: Vec<String> = registry
            .hosts()
            .iter()
            .map(|h| quote(&h.address).into_owned())
            .collect();
        if ctx.single_node {
            names.push("localhost".to_string());
        }
        scope
            .run_on(&coordinator, Self::scan_host_keys(ctx, &names))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use gpdeploy_config::DeployConfig;
    use gpdeploy_utils::CancelToken;

    use crate::credentials::CredentialContext;
    use crate::executor::{CommandExecutor, DryRunExecutor, ExecOptions};
    use crate::registry::HostRegistry;
    use crate::rollback::RollbackManager;

    fn context() -> PhaseContext {
        let mut config = DeployConfig::default();
        config.coordinator_host = Some("mdw".to_string());
        config.segment_hosts = vec!["sdw1".to_string()];
        config.data_dir = "/data/".to_string();
        let registry = HostRegistry::load(&config).unwrap();
        let executor: Arc<dyn CommandExecutor> = Arc::new(DryRunExecutor::new());
        let rollback = Arc::new(RollbackManager::new(
            Arc::clone(&executor),
            None,
            Arc::new(CredentialContext::empty()),
            CancelToken::new(),
            ExecOptions::default(),
        ));
        PhaseContext::new(
            config,
            "r1",
            registry,
            executor,
            rollback,
            CancelToken::new(),
            ExecOptions::default(),
            false,
        )
    }

    fn backed_up(ctx: &PhaseContext, address: &str) -> Vec<String> {
        let registry = ctx.registry();
        let host = registry.get(address).unwrap();
        HostSetup
            .host_steps(ctx, host)
            .iter()
            .flat_map(|step| step.backup_targets().to_vec())
            .collect()
    }

    #[test]
    fn backups_cover_only_the_paths_setup_writes() {
        let ctx = context();
        assert_eq!(
            backed_up(&ctx, "mdw"),
            vec![SYSCTL_DROP_IN, LIMITS_DROP_IN, "/data/coordinator"]
        );
        assert_eq!(
            backed_up(&ctx, "sdw1"),
            vec![SYSCTL_DROP_IN, LIMITS_DROP_IN, "/data/primary", "/data/mirror"]
        );

        let home = ctx.admin_home();
        for address in ["mdw", "sdw1"] {
            let targets = backed_up(&ctx, address);
            assert!(!targets.iter().any(|t| t == "/data" || t == "/data/"));
            assert!(!targets.contains(&home));
        }
    }

    #[test]
    fn key_exchange_backs_up_single_ssh_files() {
        let ctx = context();
        let home = ctx.admin_home();
        assert_eq!(
            HostSetup::generate_key(&ctx).backup_targets(),
            [format!("{home}/.ssh/id_rsa"), format!("{home}/.ssh/id_rsa.pub")]
        );
        assert_eq!(
            HostSetup::authorize_key(&ctx, "distribute_key", String::new(), "ssh-rsa AAA")
                .backup_targets(),
            [format!("{home}/.ssh/authorized_keys")]
        );
        assert_eq!(
            HostSetup::scan_host_keys(&ctx, &["mdw".to_string()]).backup_targets(),
            [format!("{home}/.ssh/known_hosts")]
        );
    }

    #[test]
    fn drop_in_script_quotes_each_line() {
        let script = write_file_script("/etc/x.conf", &["a = 1", "b"]);
        assert_eq!(script, "printf '%s\\n' 'a = 1' b > /etc/x.conf");
    }

    #[test]
    fn key_append_is_guarded() {
        let script = append_key_script("ssh-rsa AAA user@h");
        assert!(script.contains("grep -qxF 'ssh-rsa AAA user@h'"));
        assert!(script.contains(">> ~/.ssh/authorized_keys"));
    }
}

//! Doctor command for local readiness checks
//!
//! Checks the tools an installation shells out to, the package manager used
//! to fetch missing ones, the configuration and its package files, and that
//! the state directory is writable. Nothing here contacts a remote host.

use chrono::{DateTime, Utc};
use gpdeploy_config::DeployConfig;
use gpdeploy_engine::HostRegistry;
use gpdeploy_engine::orchestrator::validate_packages;
use gpdeploy_engine::packages::{PASSWORD_HELPER, PackageManager, ToolProbe, WhichProbe};
use gpdeploy_utils::error::ConfigError;
use gpdeploy_utils::{DeployError, UserFriendlyError, paths};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Clone, Serialize)]
pub struct DoctorCheck {
    pub name: String,
    pub status: CheckStatus,
    pub details: String,
}

impl DoctorCheck {
    fn new(name: &str, status: CheckStatus, details: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            details: details.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DoctorOutput {
    pub schema_version: String,
    pub emitted_at: DateTime<Utc>,
    pub ok: bool,
    pub checks: Vec<DoctorCheck>,
}

/// Run every check. `config` is the discovery result so a broken
/// configuration is reported rather than aborting the command.
#[must_use]
pub fn run_checks(probe: &dyn ToolProbe, config: &Result<DeployConfig, DeployError>) -> DoctorOutput {
    let mut checks = vec![
        check_tool(probe, "ssh", CheckStatus::Fail),
        check_tool(probe, "scp", CheckStatus::Fail),
        check_password_helper(probe),
        check_package_manager(probe),
        check_state_dir(),
    ];
    checks.extend(check_config(config));

    checks.sort_by(|a, b| a.name.cmp(&b.name));
    let ok = checks.iter().all(|c| c.status != CheckStatus::Fail);
    DoctorOutput {
        schema_version: "1".to_string(),
        emitted_at: Utc::now(),
        ok,
        checks,
    }
}

fn check_tool(probe: &dyn ToolProbe, tool: &str, missing: CheckStatus) -> DoctorCheck {
    match probe.find(tool) {
        Some(path) => DoctorCheck::new(tool, CheckStatus::Pass, path.display().to_string()),
        None => DoctorCheck::new(tool, missing, format!("{tool} was not found on PATH")),
    }
}

fn check_password_helper(probe: &dyn ToolProbe) -> DoctorCheck {
    if let Some(path) = probe.find(PASSWORD_HELPER) {
        return DoctorCheck::new(PASSWORD_HELPER, CheckStatus::Pass, path.display().to_string());
    }
    let details = match PackageManager::detect(probe) {
        Some(pm) => format!("not installed; {pm} will be offered to install it at run start"),
        None => "not installed; password logins will prompt once per host".to_string(),
    };
    DoctorCheck::new(PASSWORD_HELPER, CheckStatus::Warn, details)
}

fn check_package_manager(probe: &dyn ToolProbe) -> DoctorCheck {
    match PackageManager::detect(probe) {
        Some(pm) => DoctorCheck::new("package_manager", CheckStatus::Pass, pm.binary()),
        None => DoctorCheck::new(
            "package_manager",
            CheckStatus::Warn,
            "no yum, dnf, apt-get or brew found",
        ),
    }
}

fn check_state_dir() -> DoctorCheck {
    let home = paths::gpdeploy_home();
    match paths::ensure_dir_all(&home) {
        Ok(()) => DoctorCheck::new("state_dir", CheckStatus::Pass, home.to_string()),
        Err(e) => DoctorCheck::new("state_dir", CheckStatus::Fail, format!("{home}: {e}")),
    }
}

fn check_config(config: &Result<DeployConfig, DeployError>) -> Vec<DoctorCheck> {
    let config = match config {
        Ok(config) => config,
        Err(e) => return vec![DoctorCheck::new("config", CheckStatus::Fail, e.user_message())],
    };

    let inventory = match HostRegistry::load(config) {
        Ok(registry) => {
            let layout = if registry.is_single_node() {
                "single node".to_string()
            } else {
                format!("{} hosts", registry.hosts().len())
            };
            let source = config
                .config_path
                .as_ref()
                .map_or_else(|| "defaults".to_string(), ToString::to_string);
            DoctorCheck::new(
                "config",
                CheckStatus::Pass,
                format!("{source}: coordinator {}, {layout}", registry.coordinator()),
            )
        }
        Err(e) => DoctorCheck::new("config", CheckStatus::Fail, e.to_string()),
    };

    let packages = match validate_packages(config) {
        Ok(()) => DoctorCheck::new("packages", CheckStatus::Pass, "installer files present"),
        // A dry run uploads nothing, so missing files only matter for real installs.
        Err(e @ (ConfigError::MissingRequired(_) | ConfigError::InvalidValue { .. })) => {
            DoctorCheck::new("packages", CheckStatus::Warn, e.to_string())
        }
        Err(e) => DoctorCheck::new("packages", CheckStatus::Fail, e.to_string()),
    };
    vec![inventory, packages]
}

/// # Errors
///
/// A validation error when any check failed, so the exit code reflects it.
pub fn execute_doctor_command(
    json: bool,
    config: &Result<DeployConfig, DeployError>,
) -> Result<(), DeployError> {
    let output = run_checks(&WhichProbe, config);

    if json {
        let text = serde_json::to_string_pretty(&output)
            .map_err(|e| DeployError::Io(std::io::Error::other(e)))?;
        println!("{text}");
    } else {
        for check in &output.checks {
            let mark = match check.status {
                CheckStatus::Pass => "✓",
                CheckStatus::Warn => "!",
                CheckStatus::Fail => "✗",
            };
            println!("{mark} {:<16} {}", check.name, check.details);
        }
        if !output.ok {
            println!();
            println!("Some checks failed. Please address the issues above before installing.");
        }
    }

    if output.ok {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            key: "doctor".to_string(),
            value: output
                .checks
                .iter()
                .filter(|c| c.status == CheckStatus::Fail)
                .map(|c| c.name.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            reason: "readiness checks failed".to_string(),
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpdeploy_engine::test_support::FakeProbe;

    fn config() -> DeployConfig {
        let mut config = DeployConfig::default();
        config.coordinator_host = Some("mdw".to_string());
        config.segment_hosts = vec!["sdw1".to_string(), "sdw2".to_string()];
        config
    }

    fn status(output: &DoctorOutput, name: &str) -> CheckStatus {
        output
            .checks
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.status)
            .unwrap()
    }

    #[test]
    fn missing_ssh_fails() {
        let _home = paths::with_isolated_home().unwrap();
        let output = run_checks(&FakeProbe::with(&["scp", "yum"]), &Ok(config()));
        assert!(!output.ok);
        assert_eq!(status(&output, "ssh"), CheckStatus::Fail);
        assert_eq!(status(&output, "sshpass"), CheckStatus::Warn);
        assert_eq!(status(&output, "package_manager"), CheckStatus::Pass);
    }

    #[test]
    fn missing_installer_only_warns() {
        let _home = paths::with_isolated_home().unwrap();
        let output = run_checks(&FakeProbe::with(&["ssh", "scp", "sshpass"]), &Ok(config()));
        assert!(output.ok);
        assert_eq!(status(&output, "config"), CheckStatus::Pass);
        assert_eq!(status(&output, "packages"), CheckStatus::Warn);
    }

    #[test]
    fn broken_config_is_reported() {
        let _home = paths::with_isolated_home().unwrap();
        let err: Result<DeployConfig, DeployError> = Err(ConfigError::NotFound {
            path: "/nope/gpdeploy.conf".to_string(),
        }
        .into());
        let output = run_checks(&FakeProbe::with(&["ssh", "scp"]), &err);
        assert!(!output.ok);
        assert_eq!(status(&output, "config"), CheckStatus::Fail);
        assert!(output.checks.iter().all(|c| c.name != "packages"));
    }
}

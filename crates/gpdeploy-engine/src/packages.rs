//! Local package-manager capability and the password-automation helper.
//!
//! The package manager is probed once at startup; callers hold the selected
//! [`PackageManager`] rather than re-probing per call.

use std::path::PathBuf;
use std::time::Duration;

use gpdeploy_runner::{CommandSpec, ProcessRunner};

/// Binary that automates password entry for ssh.
pub const PASSWORD_HELPER: &str = "sshpass";

const INSTALL_TIMEOUT: Duration = Duration::from_secs(300);

/// Looks up executables on the local machine.
pub trait ToolProbe: Send + Sync {
    fn find(&self, tool: &str) -> Option<PathBuf>;

    fn has(&self, tool: &str) -> bool {
        self.find(tool).is_some()
    }
}

/// `$PATH` lookup through the `which` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct WhichProbe;

impl ToolProbe for WhichProbe {
    fn find(&self, tool: &str) -> Option<PathBuf> {
        which::which(tool).ok()
    }
}

/// Local package managers, in preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Yum,
    Dnf,
    Apt,
    Brew,
}

impl std::fmt::Display for PackageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.binary())
    }
}

impl PackageManager {
    pub const PREFERENCE: [PackageManager; 4] = [Self::Yum, Self::Dnf, Self::Apt, Self::Brew];

    #[must_use]
    pub const fn binary(&self) -> &'static str {
        match self {
            Self::Yum => "yum",
            Self::Dnf => "dnf",
            Self::Apt => "apt-get",
            Self::Brew => "brew",
        }
    }

    /// First manager present on this machine.
    #[must_use]
    pub fn detect(probe: &dyn ToolProbe) -> Option<Self> {
        Self::PREFERENCE
            .into_iter()
            .find(|pm| probe.has(pm.binary()))
    }

    /// Non-interactive install of `package`.
    #[must_use]
    pub fn install_spec(&self, package: &str) -> CommandSpec {
        match self {
            Self::Yum | Self::Dnf | Self::Apt => CommandSpec::new(self.binary())
                .args(["install", "-y"])
                .arg(package),
            Self::Brew => CommandSpec::new("brew").arg("install").arg(package),
        }
    }
}

/// Make sure the password helper exists, installing it at most once.
///
/// Returns whether automation is available afterwards. Installation failure
/// is logged and reported as `false`; callers fall back to interactive auth.
pub fn ensure_password_automation(probe: &dyn ToolProbe, runner: &dyn ProcessRunner) -> bool {
    if probe.has(PASSWORD_HELPER) {
        return true;
    }
    let Some(manager) = PackageManager::detect(probe) else {
        tracing::warn!("{PASSWORD_HELPER} not found and no package manager available; hosts will prompt for passwords");
        return false;
    };

    tracing::info!(manager = %manager, "installing {PASSWORD_HELPER}");
    match runner.run(&manager.install_spec(PASSWORD_HELPER), INSTALL_TIMEOUT) {
        Ok(output) if output.success() && probe.has(PASSWORD_HELPER) => true,
        Ok(output) => {
            tracing::warn!(
                manager = %manager,
                exit_code = ?output.exit_code,
                stderr = %gpdeploy_redaction::redact_user_string(output.stderr_string().trim()),
                "could not install {PASSWORD_HELPER}; hosts will prompt for passwords"
            );
            false
        }
        Err(e) => {
            tracing::warn!(manager = %manager, error = %e, "could not install {PASSWORD_HELPER}");
            false
        }
    }
}

/// Remote package format, chosen by the installer's extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageKind {
    Rpm,
    Deb,
}

impl PackageKind {
    #[must_use]
    pub fn from_path(path: &str) -> Option<Self> {
        let lower = path.to_ascii_lowercase();
        if lower.ends_with(".rpm") {
            Some(Self::Rpm)
        } else if lower.ends_with(".deb") {
            Some(Self::Deb)
        } else {
            None
        }
    }

    /// Shell script installing the uploaded package at `remote_path`.
    #[must_use]
    pub fn install_script(&self, remote_path: &str) -> String {
        let quoted = shell_words::quote(remote_path);
        match self {
            Self::Rpm => format!(
                "if command -v yum >/dev/null 2>&1; then yum install -y {quoted}; else rpm -Uvh --replacepkgs {quoted}; fi"
            ),
            Self::Deb => format!("DEBIAN_FRONTEND=noninteractive apt-get install -y {quoted}"),
        }
    }
}

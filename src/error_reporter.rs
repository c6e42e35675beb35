//! Error reporting for the terminal.
//!
//! Builds on [`DeployError::display_for_user`] and adds the operation that
//! failed, the error category and the exit code. Everything passes through
//! the secret redactor before it is printed.

use gpdeploy_redaction::redact_user_string;
use gpdeploy_utils::{DeployError, UserFriendlyError};

/// Full report for an error raised while running `operation`.
#[must_use]
pub fn create_contextual_report(error: &DeployError, operation: &str) -> String {
    let mut out = format!(
        "✗ {operation} failed [{}]\n\n{}",
        error.category(),
        error.display_for_user()
    );

    if let DeployError::PartialInstall { host, phase, step, .. } = error {
        out.push_str(&format!(
            "\n\nStopped at {phase}/{step} on {host}. Changes made before the failure were rolled back."
        ));
    }
    out.push_str(&format!("\n\n(exit code {})", error.to_exit_code().as_i32()));
    redact_user_string(&out)
}

/// Fallback for errors that never became a [`DeployError`].
#[must_use]
pub fn create_unexpected_report(error: &anyhow::Error) -> String {
    let mut out = format!("✗ Unexpected error: {}", redact_user_string(&error.to_string()));
    out.push_str("\n\n  General troubleshooting:");
    out.push_str("\n    - Run with --verbose for more detailed output");
    out.push_str("\n    - Run `gpdeploy doctor` to check this machine");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpdeploy_utils::PhaseId;
    use gpdeploy_utils::error::ConfigError;

    #[test]
    fn partial_install_names_host_and_step() {
        let err = DeployError::PartialInstall {
            host: "sdw1".to_string(),
            phase: PhaseId::HostSetup,
            step: "write_sysctl".to_string(),
            source: Box::new(DeployError::CommandFailure {
                host: "sdw1".to_string(),
                command: "sysctl --system".to_string(),
                exit_code: Some(1),
                stderr: "read-only file system".to_string(),
            }),
        };
        let report = create_contextual_report(&err, "install");
        assert!(report.starts_with("✗ install failed"));
        assert!(report.contains("host_setup/write_sysctl on sdw1"));
        assert!(report.contains("(exit code 70)"));
    }

    #[test]
    fn config_errors_exit_with_validation_code() {
        let err = DeployError::Config(ConfigError::MissingRequired("GPDB_SEGMENT_HOSTS".to_string()));
        let report = create_contextual_report(&err, "install");
        assert!(report.contains("GPDB_SEGMENT_HOSTS"));
        assert!(report.ends_with("(exit code 2)"));
    }
}

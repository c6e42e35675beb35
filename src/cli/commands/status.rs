//! Status command implementation
//!
//! Handles `gpdeploy status` and `gpdeploy status --json`.

use gpdeploy_config::DeployConfig;
use gpdeploy_engine::{DeployHandle, InstallationState};
use gpdeploy_utils::{DeployError, PhaseId};

/// Print the last recorded run for the configured coordinator.
///
/// # Errors
///
/// An invalid inventory or an unreadable state file.
pub fn execute_status_command(json: bool, config: DeployConfig) -> Result<(), DeployError> {
    let coordinator = config.coordinator_host.clone().unwrap_or_default();
    let handle = DeployHandle::new(config);

    match handle.status()? {
        None if json => println!("{{}}"),
        None => {
            println!("Status for cluster: {coordinator}");
            println!("  No recorded run");
        }
        Some(state) if json => {
            let text = serde_json::to_string_pretty(&state)
                .map_err(|e| DeployError::Io(std::io::Error::other(e)))?;
            println!("{text}");
        }
        Some(state) => print!("{}", render_status(&state)),
    }
    Ok(())
}

/// Human-readable view of a recorded run.
#[must_use]
pub fn render_status(state: &InstallationState) -> String {
    let mut out = format!("Status for cluster: {}\n", state.coordinator);
    out.push_str(&format!("  Run:      {} ({})\n", state.run_id, state.mode));
    out.push_str(&format!("  State:    {}\n", state.state));
    if let Some(phase) = state.phase {
        out.push_str(&format!("  Phase:    {phase}\n"));
    }
    out.push_str(&format!(
        "  Updated:  {}\n",
        state.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    if state.dry_run {
        out.push_str("  Dry run:  yes\n");
    }

    out.push_str("\n  Hosts:\n");
    for host in &state.hosts {
        let roles: Vec<String> = host.roles.iter().map(ToString::to_string).collect();
        let phase = state.phase.unwrap_or(PhaseId::Preflight);
        out.push_str(&format!(
            "    {:<24} {:<28} {}\n",
            host.address,
            roles.join(","),
            host.phase_status(phase)
        ));
    }

    if !state.extensions.is_empty() {
        out.push_str("\n  Extensions:\n");
        for (name, ext) in &state.extensions {
            out.push_str(&format!("    {name:<10} {}", ext.reached));
            if ext.recovered {
                out.push_str(&format!(" (recovered from {})", ext.assumed));
            }
            out.push('\n');
        }
    }

    if let Some(error) = &state.error {
        out.push_str("\n  Error:\n");
        out.push_str(&format!("    kind:  {}\n", error.kind));
        if let Some(host) = &error.host {
            out.push_str(&format!("    host:  {host}\n"));
        }
        if let (Some(phase), Some(step)) = (error.phase, &error.step) {
            out.push_str(&format!("    step:  {phase}/{step}\n"));
        }
        out.push_str(&format!("    {}\n", error.message));
    }
    out
}

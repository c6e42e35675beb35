//! `gpdeploy install`, and teardown through `--clean`, `--remove` or `--force`.

use std::io::IsTerminal;

use gpdeploy_config::DeployConfig;
use gpdeploy_engine::credentials::{CredentialPrompt, TerminalPrompt};
use gpdeploy_engine::{DeployHandle, RunReport};
use gpdeploy_utils::error::CredentialError;
use gpdeploy_utils::{CancelLevel, CancelToken, DeployError, RunState};

use crate::cli::args::InstallArgs;

/// Run an install or teardown to completion and print its summary.
///
/// # Errors
///
/// The run's error; the caller maps it to an exit code.
pub async fn execute_install_command(
    args: &InstallArgs,
    config: DeployConfig,
    cancel: CancelToken,
) -> Result<(), DeployError> {
    if args.is_teardown() && !args.skip_confirmation() {
        confirm_teardown(&config, args.remove).await?;
    }

    let mut handle = DeployHandle::new(config)
        .with_cancel(cancel)
        .with_force_lock(args.force_lock)
        .with_accept_host_keys(args.accept_host_keys);
    let signals = tokio::spawn(watch_interrupts(handle.cancel_token()));

    let report = if args.is_teardown() {
        handle.teardown(args.remove).await
    } else {
        handle.install().await
    };
    signals.abort();

    if let Some(summary) = run_summary(&report) {
        println!("{summary}");
    }
    report.into_result().map(|_| ())
}

/// First Ctrl-C drains and rolls back; the second stops at once. The
/// listener stays up until the run returns so later presses are not lost.
async fn watch_interrupts(cancel: CancelToken) {
    while tokio::signal::ctrl_c().await.is_ok() {
        let level = cancel.escalate();
        tracing::warn!(?level, "interrupt requested");
        eprintln!("\n{}", interrupt_notice(level));
    }
}

fn interrupt_notice(level: CancelLevel) -> &'static str {
    match level {
        CancelLevel::Forced => "Stopping now. Backups are left in place.",
        _ => {
            "Interrupt received: finishing in-flight steps, then rolling back. \
             Press Ctrl-C again to stop immediately."
        }
    }
}

async fn confirm_teardown(config: &DeployConfig, remove_install: bool) -> Result<(), DeployError> {
    if !std::io::stdin().is_terminal() {
        return Err(CredentialError::PromptFailed(
            "teardown needs confirmation on a terminal; pass --yes or --force".to_string(),
        )
        .into());
    }

    let hosts = config.segment_hosts.len()
        + usize::from(config.coordinator_host.is_some())
        + usize::from(config.standby_host.is_some());
    let mut question = format!(
        "Stop the cluster and delete its data directories under {} on up to {hosts} hosts?",
        config.data_dir
    );
    if remove_install {
        question.push_str(&format!(" {} will also be removed.", config.install_dir));
    }

    let confirmed = tokio::task::spawn_blocking(move || TerminalPrompt.confirm(&question, false))
        .await
        .map_err(|e| DeployError::Io(std::io::Error::other(format!("prompt worker failed: {e}"))))??;
    if confirmed {
        Ok(())
    } else {
        Err(CredentialError::PromptFailed("teardown was not confirmed".to_string()).into())
    }
}

/// One-paragraph outcome of a run, or `None` when it never started.
#[must_use]
pub fn run_summary(report: &RunReport) -> Option<String> {
    let state = report.state.as_ref()?;
    let mut out = format!(
        "{} {} on {} hosts: {}",
        state.mode,
        state.run_id,
        state.hosts.len(),
        state.state
    );
    if state.dry_run {
        out.push_str("\nDry run: no host was contacted and nothing was changed.");
    }
    for (name, ext) in &state.extensions {
        out.push_str(&format!("\n  {name}: {}", ext.reached));
        if ext.recovered {
            out.push_str(&format!(" (recovered from {})", ext.assumed));
        }
    }
    if state.state == RunState::Failed {
        out.push_str("\nBackups taken before the failure were restored. See `gpdeploy status` for details.");
    }
    Some(out)
}

//! CLI entry point and dispatch logic
//!
//! This module owns the `run()` function which:
//! - Parses CLI arguments and installs logging
//! - Discovers the configuration
//! - Creates the tokio runtime
//! - Dispatches to command handlers
//! - Handles all error output

use camino::Utf8PathBuf;
use clap::Parser;
use gpdeploy_config::{CliOverrides, DeployConfig};
use gpdeploy_utils::error::ConfigError;
use gpdeploy_utils::{CancelToken, DeployError, ExitCode, logging};
use tokio::runtime::Runtime;

use super::args::{Cli, Commands};
use super::commands;
use crate::error_reporter::{create_contextual_report, create_unexpected_report};

/// Main CLI execution function.
///
/// Handles ALL output including errors and returns the exit code on
/// failure. `main` only maps it to the process exit status.
pub fn run() -> Result<(), ExitCode> {
    let cli = Cli::parse();

    if let Err(e) = logging::init_tracing(cli.verbose) {
        eprintln!("warning: logging is unavailable: {e}");
    }

    let operation = match &cli.command {
        Commands::Install(args) if args.is_teardown() => "teardown",
        Commands::Install(_) => "install",
        Commands::Status { .. } => "status",
        Commands::Doctor { .. } => "doctor",
        Commands::Config => "config",
    };

    let rt = match Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}", create_unexpected_report(&anyhow::Error::new(e).context("failed to create async runtime")));
            return Err(ExitCode::INTERNAL);
        }
    };

    let cancel = CancelToken::new();
    let result = rt.block_on(dispatch(cli, cancel.clone()));
    let forced = settle_runtime(rt, &cancel);
    if let Err(error) = result {
        eprintln!("{}", create_contextual_report(&error, operation));
        return Err(if forced {
            ExitCode::INTERRUPTED
        } else {
            error.to_exit_code()
        });
    }
    if forced {
        return Err(ExitCode::INTERRUPTED);
    }
    Ok(())
}

/// Shut the runtime down. After a forced stop, workers still blocked on a
/// remote command are abandoned instead of joined. Returns whether the stop
/// was forced.
fn settle_runtime(rt: Runtime, cancel: &CancelToken) -> bool {
    if cancel.is_forced() {
        tracing::debug!("abandoning blocked workers");
        rt.shutdown_background();
        true
    } else {
        drop(rt);
        false
    }
}

async fn dispatch(cli: Cli, cancel: CancelToken) -> Result<(), DeployError> {
    let config_path = cli.config.map(utf8_path).transpose()?;

    match cli.command {
        Commands::Install(args) => {
            let overrides = CliOverrides {
                config_path,
                host: args.host.clone(),
                dry_run: args.dry_run,
                parallel: args.parallel,
            };
            let config = discover(&overrides)?;
            commands::execute_install_command(&args, config, cancel).await
        }
        Commands::Status { json } => {
            let config = discover(&CliOverrides {
                config_path,
                ..CliOverrides::default()
            })?;
            commands::execute_status_command(json, config)
        }
        Commands::Doctor { json } => {
            let config = discover(&CliOverrides {
                config_path,
                ..CliOverrides::default()
            });
            commands::execute_doctor_command(json, &config)
        }
        Commands::Config => {
            let config = discover(&CliOverrides {
                config_path,
                ..CliOverrides::default()
            })?;
            commands::execute_config_command(&config);
            Ok(())
        }
    }
}

fn discover(overrides: &CliOverrides) -> Result<DeployConfig, DeployError> {
    Ok(DeployConfig::discover(overrides)?)
}

fn utf8_path(path: std::path::PathBuf) -> Result<Utf8PathBuf, DeployError> {
    Utf8PathBuf::from_path_buf(path).map_err(|p| {
        ConfigError::InvalidValue {
            key: "--config".to_string(),
            value: p.display().to_string(),
            reason: "path is not valid UTF-8".to_string(),
        }
        .into()
    })
}

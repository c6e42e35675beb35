//! CLI argument definitions and parsing structures

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// gpdeploy - install and initialize a Greenplum-compatible cluster
#[derive(Parser, Debug)]
#[command(name = "gpdeploy")]
#[command(about = "Install and initialize a Greenplum-compatible cluster across many hosts")]
#[command(long_about = r#"
gpdeploy installs the database packages on every host of a cluster, prepares
the operating system, initializes the coordinator, segments and standby, and
brings up optional extensions. It works from one control node over ssh.

EXAMPLES:
  # See every step that would run, without touching any host
  gpdeploy install --dry-run

  # Install and initialize the cluster described in ./gpdeploy.conf
  gpdeploy install

  # Collapse the deployment onto one machine
  gpdeploy install --host localhost

  # Stop the cluster and remove its data directories and packages
  gpdeploy install --remove

  # Show the last recorded run
  gpdeploy status --json

CONFIGURATION:
  Configuration is loaded with precedence: CLI flags > environment > config file > defaults
  The config file is --config, then $GPDEPLOY_CONFIG, then ./gpdeploy.conf
  Use `gpdeploy config` to see every effective value and where it came from

EXIT CODES:
  0 success, 2 invalid input, 9 lock held, 20-22 connection or authentication,
  70 remote command failure, 71 timeout, 130 interrupted
"#)]
#[command(version)]
pub struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Install and initialize the cluster, or tear it down
    Install(InstallArgs),

    /// Show the last recorded run for the configured coordinator
    Status {
        /// Output the recorded state as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check that this machine can drive an installation
    Doctor {
        /// Output results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the effective configuration and where each value came from
    Config,
}

#[derive(Args, Debug, Default, Clone)]
pub struct InstallArgs {
    /// Run every phase against simulated hosts; nothing is contacted or changed
    #[arg(long)]
    pub dry_run: bool,

    /// Tear the cluster down instead of installing it
    #[arg(long)]
    pub clean: bool,

    /// Tear down and also remove the installation directory
    #[arg(long)]
    pub remove: bool,

    /// Tear down without asking for confirmation
    #[arg(long)]
    pub force: bool,

    /// Deploy everything onto this single host
    #[arg(long, value_name = "HOST")]
    pub host: Option<String>,

    /// Trust unknown or changed host keys for this run without asking
    #[arg(long)]
    pub accept_host_keys: bool,

    /// Maximum number of hosts worked on at once (1-64)
    #[arg(long, value_name = "N")]
    pub parallel: Option<usize>,

    /// Take over a lock left behind by another run
    #[arg(long)]
    pub force_lock: bool,

    /// Assume yes to confirmation prompts
    #[arg(short = 'y', long)]
    pub yes: bool,
}

impl InstallArgs {
    /// Any of `--clean`, `--remove` or `--force` selects teardown.
    #[must_use]
    pub fn is_teardown(&self) -> bool {
        self.clean || self.remove || self.force
    }

    #[must_use]
    pub fn skip_confirmation(&self) -> bool {
        self.force || self.yes || self.dry_run
    }
}

/// Build the clap command, for help rendering and flag inspection in tests.
#[must_use]
pub fn build_cli() -> clap::Command {
    <Cli as clap::CommandFactory>::command()
}

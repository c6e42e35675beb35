//! gpdeploy - install and initialize a Greenplum-compatible cluster from one
//! control node.
//!
//! gpdeploy can be used in two ways:
//! - **CLI**: run `gpdeploy install`, `gpdeploy status`, `gpdeploy doctor`
//!   or `gpdeploy config`
//! - **Library**: drive runs through [`DeployHandle`]
//!
//! # Quick Start (CLI)
//!
//! ```bash
//! # Check this machine first
//! gpdeploy doctor
//!
//! # Walk every phase without contacting a host
//! gpdeploy install --dry-run
//!
//! # Install for real, then look at the recorded run
//! gpdeploy install
//! gpdeploy status --json
//! ```
//!
//! # Quick Start (Library)
//!
//! ```no_run
//! use gpdeploy::{DeployConfig, DeployHandle};
//!
//! # async fn example() -> Result<(), gpdeploy::DeployError> {
//! let config = DeployConfig::discover(&Default::default())?;
//! let mut handle = DeployHandle::new(config);
//! let report = handle.install().await;
//! let state = report.into_result()?;
//! println!("{:?}", state.map(|s| s.state));
//! # Ok(())
//! # }
//! ```
//!
//! # Stable Public API
//!
//! - [`DeployHandle`] and [`RunReport`] - running installs and teardowns
//! - [`DeployConfig`] - configuration discovery and values
//! - [`DeployError`] and [`UserFriendlyError`] - error taxonomy
//! - [`ExitCode`] - CLI exit codes
//! - [`InstallationState`] - the persisted run snapshot

pub use gpdeploy_config::DeployConfig;
pub use gpdeploy_engine::{DeployHandle, InstallationState, RunReport};
pub use gpdeploy_utils::{DeployError, ErrorCategory, ExitCode, PhaseId, RunState, UserFriendlyError};

pub mod cli;
pub mod error_reporter;

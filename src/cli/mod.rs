//! Command-line interface for gpdeploy
//!
//! ## Module Structure
//!
//! - `args`: CLI argument definitions (clap)
//! - `run`: Main entry point and command dispatch
//! - `commands`: Command implementations

pub mod args;
pub mod commands;
mod run;

#[cfg(test)]
mod tests;

pub use args::{Cli, Commands, InstallArgs, build_cli};
pub use run::run;

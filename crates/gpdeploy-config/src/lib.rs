//! Configuration for gpdeploy.
//!
//! A shell-style `KEY=value` file (see [`parser`]) layered under environment
//! and command-line overrides. Each effective value remembers where it came
//! from so `gpdeploy config` can explain it.

pub mod discovery;
pub mod model;
pub mod parser;
pub mod sources;

pub use discovery::{CONFIG_ENV, CliOverrides, DEFAULT_CONFIG_FILE, DRY_RUN_ENV};
pub use model::DeployConfig;
pub use sources::EffectiveValue;

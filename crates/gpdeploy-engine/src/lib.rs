//! Multi-host installation engine.
//!
//! Leaf first: [`credentials`] holds the run's secrets, [`transport`] and
//! [`connection`] keep one authenticated channel per host, [`executor`]
//! runs commands over them with timeout and bounded retry, [`registry`]
//! tracks hosts and their progress, [`rollback`] backs up before
//! destructive steps, and [`runner`] drives the [`phases`] through the run
//! state machine. [`orchestrator`] assembles all of it for one run.

pub mod command;
pub mod connection;
pub mod credentials;
pub mod executor;
pub mod orchestrator;
pub mod packages;
pub mod phase;
pub mod phases;
pub mod registry;
pub mod rollback;
pub mod runner;
pub mod state;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_support;
pub mod transport;
pub mod trust;

pub use orchestrator::{Collaborators, DeployHandle, Orchestrator, RunMode, RunReport, RunRequest};
pub use registry::{Host, HostRegistry};
pub use state::{InstallationState, StateStore};

//! Concrete phases.
//!
//! ```text
//! install:  Preflight → HostSetup → BinaryInstall → ClusterInit → ExtensionInit?
//! teardown: Preflight → Teardown
//! ```

mod binary_install;
mod cluster_init;
mod extension;
mod host_setup;
mod preflight;
mod teardown;

use std::sync::Arc;

use gpdeploy_config::DeployConfig;

pub use binary_install::BinaryInstall;
pub use cluster_init::ClusterInit;
pub use extension::{Assessment, Extension, ExtensionInit, LifecycleState, Madlib, Pxf};
pub use host_setup::{HostSetup, LIMITS_DROP_IN, SYSCTL_DROP_IN};
pub use preflight::Preflight;
pub use teardown::Teardown;

use crate::phase::Phase;

/// Bring-up sequence for `config`.
#[must_use]
pub fn install_phases(config: &DeployConfig) -> Vec<Arc<dyn Phase>> {
    let mut phases: Vec<Arc<dyn Phase>> = vec![
        Arc::new(Preflight),
        Arc::new(HostSetup),
        Arc::new(BinaryInstall),
        Arc::new(ClusterInit),
    ];
    if config.extensions_enabled() {
        phases.push(Arc::new(ExtensionInit::from_config(config)));
    }
    phases
}

/// Teardown sequence.
#[must_use]
pub fn teardown_phases() -> Vec<Arc<dyn Phase>> {
    vec![Arc::new(Preflight), Arc::new(Teardown)]
}

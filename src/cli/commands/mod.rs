//! Command implementations.

mod config;
mod doctor;
mod install;
mod status;

pub use config::{execute_config_command, render_effective_config};
pub use doctor::{CheckStatus, DoctorCheck, DoctorOutput, execute_doctor_command, run_checks};
pub use install::{execute_install_command, run_summary};
pub use status::{execute_status_command, render_status};

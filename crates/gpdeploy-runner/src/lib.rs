//! Process execution for gpdeploy
//!
//! Every local process the orchestrator starts (ssh, scp, sshpass, package
//! managers, loopback shells) goes through [`CommandSpec`] and a
//! [`ProcessRunner`]. The [`ssh`] module builds the argv for OpenSSH control
//! masters and classifies transport failures from their exit code and stderr.
//!
//! # Security Model
//!
//! Arguments cross process boundaries as discrete elements. Secrets such as
//! the automation password travel in the child environment, never in argv,
//! and [`CommandSpec`]'s `Debug` output masks environment values.

pub mod command_spec;
pub mod error;
pub mod native;
pub mod process;
pub mod ssh;

pub use command_spec::{CommandSpec, StdinMode};
pub use error::RunnerError;
pub use native::NativeRunner;
pub use process::{ProcessOutput, ProcessRunner};
pub use ssh::{
    AuthRejection, HostKeyMode, MasterAuth, SshConfig, SshFailure, SshTarget,
    classify_exec_failure, classify_master_failure,
};

//! Foundation crate for gpdeploy: shared vocabulary (roles, statuses, phase
//! and run states), the error taxonomy with exit-code mapping, the retry
//! combinator, cancellation, paths, atomic writes and logging setup.

pub mod atomic_write;
pub mod cancel;
pub mod error;
pub mod exit_codes;
pub mod logging;
pub mod paths;
pub mod retry;
pub mod types;

pub use cancel::{CancelLevel, CancelToken};
pub use error::{DeployError, ErrorCategory, UserFriendlyError};
pub use exit_codes::ExitCode;
pub use retry::{Backoff, RetryPolicy};
pub use types::{ConfigSource, ErrorKind, HostRole, HostStatus, PhaseId, RunState};

//! Error types for runner module

use thiserror::Error;

/// Local process execution errors
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Failed to spawn '{program}': {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("Process execution failed: {reason}")]
    ExecutionFailed { reason: String },

    #[error("Required tool not found: {tool}")]
    ToolNotFound { tool: String },

    #[error("Execution timed out after {timeout_seconds} seconds")]
    Timeout { timeout_seconds: u64 },
}

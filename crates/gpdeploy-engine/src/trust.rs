//! Host key acknowledgement.

use std::sync::Arc;

use crate::credentials::CredentialPrompt;

/// An unknown or changed host key met during channel setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustWarning {
    pub host: String,
    /// The stored key differs from the one offered (possible interception).
    pub changed: bool,
}

impl TrustWarning {
    #[must_use]
    pub fn message(&self) -> String {
        if self.changed {
            format!(
                "WARNING: the host key for {} has CHANGED since it was recorded",
                self.host
            )
        } else {
            format!("The host key for {} is not known yet", self.host)
        }
    }
}

/// Decides whether to trust a host key. Asked at most once per host per run.
pub trait HostKeyPolicy: Send + Sync {
    fn acknowledge(&self, warning: &TrustWarning) -> bool;
}

/// `--accept-host-keys`.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllHostKeys;

impl HostKeyPolicy for AcceptAllHostKeys {
    fn acknowledge(&self, warning: &TrustWarning) -> bool {
        tracing::warn!(host = %warning.host, changed = warning.changed, "accepting host key");
        true
    }
}

/// Non-interactive default.
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectHostKeys;

impl HostKeyPolicy for RejectHostKeys {
    fn acknowledge(&self, _warning: &TrustWarning) -> bool {
        false
    }
}

/// Ask the operator.
pub struct PromptHostKeys {
    prompt: Arc<dyn CredentialPrompt>,
}

impl PromptHostKeys {
    pub fn new(prompt: Arc<dyn CredentialPrompt>) -> Self {
        Self { prompt }
    }
}

impl HostKeyPolicy for PromptHostKeys {
    fn acknowledge(&self, warning: &TrustWarning) -> bool {
        let question = format!("{}. Trust it for this run?", warning.message());
        self.prompt.confirm(&question, false).unwrap_or(false)
    }
}

//! Remote command model.

use gpdeploy_redaction::redact_user_string;

/// One remote operation, rendered to a single shell string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    pub script: String,
    /// Run through `su - <user> -c` instead of as the login user.
    pub run_as: Option<String>,
    pub env: Vec<(String, String)>,
    /// Safe to replay after a timeout.
    pub idempotent: bool,
    pub description: String,
    /// Stdout reported by the dry-run executor.
    pub simulated: Option<String>,
}

impl RemoteCommand {
    pub fn new(description: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            run_as: None,
            env: Vec::new(),
            idempotent: false,
            description: description.into(),
            simulated: None,
        }
    }

    #[must_use]
    pub fn as_user(mut self, user: impl Into<String>) -> Self {
        self.run_as = Some(user.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    #[must_use]
    pub fn simulated(mut self, stdout: impl Into<String>) -> Self {
        self.simulated = Some(stdout.into());
        self
    }

    /// Shell string sent to the host.
    #[must_use]
    pub fn render(&self) -> String {
        let mut inner = String::new();
        for (key, value) in &self.env {
            inner.push_str(&format!("export {key}={}; ", shell_words::quote(value)));
        }
        inner.push_str(&self.script);

        match &self.run_as {
            Some(user) => format!(
                "su - {} -c {}",
                shell_words::quote(user),
                shell_words::quote(&inner)
            ),
            None => inner,
        }
    }

    /// Text used in errors and logs.
    #[must_use]
    pub fn label(&self) -> String {
        if self.description.is_empty() {
            redact_user_string(&self.script)
        } else {
            self.description.clone()
        }
    }
}

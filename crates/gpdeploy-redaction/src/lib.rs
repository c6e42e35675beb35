//! Secret redaction for gpdeploy
//!
//! Captured remote stderr, log lines and persisted state can all carry
//! credentials: the automation password echoed back by a misbehaving script,
//! a private key dumped by `cat`, a `password=` line in a generated config.
//! Everything user-visible passes through a [`SecretRedactor`] first.
//!
//! Two mechanisms are combined:
//! - regex patterns from [`DEFAULT_SECRET_PATTERNS`] plus any extras, and
//! - exact-match secrets registered at runtime (the collected password),
//!   held in zeroizing buffers and wiped by [`SecretRedactor::forget_secrets`].

use anyhow::{Context, Result};
use regex::{Regex, RegexSet};
use std::sync::{LazyLock, RwLock};
use zeroize::Zeroizing;

/// Replacement marker for redacted values.
pub const REDACTED: &str = "***";

/// Definition of a built-in secret pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecretPatternDef {
    /// Unique identifier for the pattern (e.g., "ssh_private_key_block")
    pub id: &'static str,
    /// The regex pattern string
    pub regex: &'static str,
    /// Replacement template; capture groups keep the non-secret context
    pub replacement: &'static str,
    pub description: &'static str,
}

/// Canonical list of default secret patterns.
pub static DEFAULT_SECRET_PATTERNS: &[SecretPatternDef] = &[
    SecretPatternDef {
        id: "ssh_private_key_block",
        regex: r"(?s)-----BEGIN [A-Z ]*PRIVATE KEY-----.*?-----END [A-Z ]*PRIVATE KEY-----",
        replacement: "***",
        description: "Complete PEM/OpenSSH private key blocks",
    },
    SecretPatternDef {
        id: "ssh_private_key_marker",
        regex: r"-----BEGIN [A-Z ]*PRIVATE KEY-----[A-Za-z0-9+/=\s]*",
        replacement: "***",
        description: "Truncated private key output without an END marker",
    },
    SecretPatternDef {
        id: "password_assignment",
        regex: r"(?i)\b((?:password|passwd|sshpass|pgpassword|secret)\s*[=:]\s*)[^\s'\x22]+",
        replacement: "${1}***",
        description: "password=, SSHPASS= and similar assignments",
    },
    SecretPatternDef {
        id: "quoted_password_assignment",
        regex: r#"(?i)\b((?:password|passwd|sshpass|pgpassword|secret)\s*[=:]\s*)(?:'[^']*'|"[^"]*")"#,
        replacement: "${1}***",
        description: "Quoted password assignments",
    },
    SecretPatternDef {
        id: "postgres_url",
        regex: r"(postgres(?:ql)?://[^:/\s]+:)[^@\s]+(@)",
        replacement: "${1}***${2}",
        description: "PostgreSQL URLs with inline credentials",
    },
    SecretPatternDef {
        id: "jdbc_url_password",
        regex: r"(?i)(jdbc:[^\s]*[?&;]password=)[^&;\s]+",
        replacement: "${1}***",
        description: "JDBC URLs with a password parameter",
    },
];

#[derive(Debug, Clone)]
struct CompiledPattern {
    id: String,
    regex: Regex,
    replacement: String,
}

/// Secret redactor with regex patterns and runtime-registered literals.
///
/// Literal secrets sit behind a lock so a shared redactor can learn the
/// password after credential collection and forget it at teardown.
#[derive(Debug)]
pub struct SecretRedactor {
    patterns: Vec<CompiledPattern>,
    // RegexSet prefilter, indices match `patterns`
    regex_set: RegexSet,
    literals: RwLock<Vec<Zeroizing<String>>>,
}

impl SecretRedactor {
    /// Create a redactor with the built-in patterns.
    #[must_use]
    pub fn new() -> Self {
        let patterns: Vec<CompiledPattern> = DEFAULT_SECRET_PATTERNS
            .iter()
            .filter_map(|def| {
                Regex::new(def.regex).ok().map(|regex| CompiledPattern {
                    id: def.id.to_string(),
                    regex,
                    replacement: def.replacement.to_string(),
                })
            })
            .collect();
        let regex_set = RegexSet::new(patterns.iter().map(|p| p.regex.as_str()))
            .unwrap_or_else(|_| RegexSet::empty());

        Self {
            patterns,
            regex_set,
            literals: RwLock::new(Vec::new()),
        }
    }

    /// Add an extra pattern whose whole match is replaced with `***`.
    pub fn add_extra_pattern(&mut self, pattern_id: &str, pattern: &str) -> Result<()> {
        let regex = Regex::new(pattern).with_context(|| {
            format!("Failed to compile extra pattern '{pattern_id}': {pattern}")
        })?;
        self.patterns.push(CompiledPattern {
            id: pattern_id.to_string(),
            regex,
            replacement: REDACTED.to_string(),
        });
        self.regex_set = RegexSet::new(self.patterns.iter().map(|p| p.regex.as_str()))
            .context("Failed to compile RegexSet for secret redaction")?;
        Ok(())
    }

    /// Register an exact secret value. Empty values are ignored.
    pub fn register_secret(&self, secret: &str) {
        if secret.is_empty() {
            return;
        }
        let mut literals = self
            .literals
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if literals.iter().any(|known| known.as_str() == secret) {
            return;
        }
        literals.push(Zeroizing::new(secret.to_string()));
        // Longest first so a secret containing another is replaced whole
        literals.sort_by_key(|s| std::cmp::Reverse(s.len()));
    }

    /// Wipe and drop one registered literal.
    pub fn forget_secret(&self, secret: &str) {
        self.literals
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|known| known.as_str() != secret);
    }

    /// Wipe and drop every registered literal secret.
    pub fn forget_secrets(&self) {
        self.literals
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    #[must_use]
    pub fn registered_secret_count(&self) -> usize {
        self.literals
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Redact secrets from `text`.
    #[must_use]
    pub fn redact_string(&self, text: &str) -> String {
        let mut redacted = {
            let literals = self
                .literals
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let mut out = text.to_string();
            for secret in literals.iter() {
                if out.contains(secret.as_str()) {
                    out = out.replace(secret.as_str(), REDACTED);
                }
            }
            out
        };

        let matches = self.regex_set.matches(&redacted);
        if !matches.matched_any() {
            return redacted;
        }
        for index in matches.iter() {
            if let Some(pattern) = self.patterns.get(index) {
                redacted = pattern
                    .regex
                    .replace_all(&redacted, pattern.replacement.as_str())
                    .into_owned();
            }
        }
        redacted
    }

    #[must_use]
    pub fn pattern_ids(&self) -> Vec<&str> {
        self.patterns.iter().map(|p| p.id.as_str()).collect()
    }
}

impl Default for SecretRedactor {
    fn default() -> Self {
        Self::new()
    }
}

static DEFAULT_REDACTOR: LazyLock<SecretRedactor> = LazyLock::new(SecretRedactor::new);

/// Process-global redactor used by logging and error reporting.
///
/// It carries only the built-in patterns. Run passwords live in a redactor
/// owned by the run's credentials.
#[must_use]
pub fn default_redactor() -> &'static SecretRedactor {
    &DEFAULT_REDACTOR
}

/// Redact with the global redactor.
///
/// ```
/// use gpdeploy_redaction::redact_user_string;
///
/// let safe = redact_user_string("gpinitsystem failed: PGPASSWORD=hunter2hunter2");
/// assert!(safe.contains("PGPASSWORD=***"));
/// assert!(!safe.contains("hunter2hunter2"));
/// ```
#[must_use]
pub fn redact_user_string(text: &str) -> String {
    default_redactor().redact_string(text)
}

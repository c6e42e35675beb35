//! Transient run credentials.
//!
//! A [`CredentialContext`] is built once per run and passed by reference to
//! everything that authenticates. It is read-only after [`CredentialContext::collect`]
//! and wiped by [`CredentialContext::zero`] during run cleanup, on every exit path.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use camino::Utf8PathBuf;
use gpdeploy_redaction::SecretRedactor;
use gpdeploy_runner::MasterAuth;
use gpdeploy_utils::error::CredentialError;
use zeroize::Zeroizing;

/// Minimum accepted password length.
pub const MIN_PASSWORD_LEN: usize = 8;

/// Source of operator input.
pub trait CredentialPrompt: Send + Sync {
    /// Read a secret without echo.
    fn read_secret(&self, prompt: &str) -> Result<Zeroizing<String>, CredentialError>;

    /// Yes/no question; an empty answer picks `default`.
    fn confirm(&self, question: &str, default: bool) -> Result<bool, CredentialError>;
}

/// Prompts on the controlling terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompt;

impl TerminalPrompt {
    #[cfg(unix)]
    fn read_line_without_echo() -> Result<String, CredentialError> {
        use nix::sys::termios::{LocalFlags, SetArg, tcgetattr, tcsetattr};

        let stdin = std::io::stdin();
        let original = tcgetattr(&stdin).map_err(|e| CredentialError::PromptFailed(e.to_string()))?;
        let mut silent = original.clone();
        silent.local_flags.remove(LocalFlags::ECHO);
        silent.local_flags.insert(LocalFlags::ECHONL);
        tcsetattr(&stdin, SetArg::TCSANOW, &silent)
            .map_err(|e| CredentialError::PromptFailed(e.to_string()))?;

        let restore = scopeguard::guard(original, |original| {
            let _ = tcsetattr(&std::io::stdin(), SetArg::TCSANOW, &original);
        });
        let mut line = String::new();
        let read = stdin.lock().read_line(&mut line);
        drop(restore);

        read.map_err(|e| CredentialError::PromptFailed(e.to_string()))?;
        Ok(line)
    }

    #[cfg(not(unix))]
    fn read_line_without_echo() -> Result<String, CredentialError> {
        let mut line = String::new();
        std::io::stdin()
            .lock()
            .read_line(&mut line)
            .map_err(|e| CredentialError::PromptFailed(e.to_string()))?;
        Ok(line)
    }
}

impl CredentialPrompt for TerminalPrompt {
    fn read_secret(&self, prompt: &str) -> Result<Zeroizing<String>, CredentialError> {
        let mut stderr = std::io::stderr();
        write!(stderr, "{prompt}").map_err(|e| CredentialError::PromptFailed(e.to_string()))?;
        stderr
            .flush()
            .map_err(|e| CredentialError::PromptFailed(e.to_string()))?;

        let mut line = Zeroizing::new(Self::read_line_without_echo()?);
        let trimmed_len = line.trim_end_matches(['\r', '\n']).len();
        line.truncate(trimmed_len);
        Ok(line)
    }

    fn confirm(&self, question: &str, default: bool) -> Result<bool, CredentialError> {
        let hint = if default { "[Y/n]" } else { "[y/N]" };
        let mut stderr = std::io::stderr();
        write!(stderr, "{question} {hint} ").map_err(|e| CredentialError::PromptFailed(e.to_string()))?;
        stderr
            .flush()
            .map_err(|e| CredentialError::PromptFailed(e.to_string()))?;

        let mut answer = String::new();
        std::io::stdin()
            .lock()
            .read_line(&mut answer)
            .map_err(|e| CredentialError::PromptFailed(e.to_string()))?;
        Ok(match answer.trim().to_ascii_lowercase().as_str() {
            "" => default,
            "y" | "yes" => true,
            _ => false,
        })
    }
}

/// Inputs to [`CredentialContext::collect`].
#[derive(Debug, Clone, Default)]
pub struct CollectOptions {
    /// Default answer for "reuse one password for every host?".
    pub reuse_default: bool,
    /// Key-based login; no password is collected.
    pub key_file: Option<Utf8PathBuf>,
    /// Whether a password-automation helper (`sshpass`) is available.
    pub automation_available: bool,
}

/// Secrets for one run.
pub struct CredentialContext {
    reuse_enabled: bool,
    automation_available: bool,
    key_file: Option<PathBuf>,
    secret: Mutex<Option<Zeroizing<String>>>,
    // Knows this run's password until `zero`
    redactor: SecretRedactor,
    zeroed: AtomicBool,
    wipes: AtomicUsize,
}

impl CredentialContext {
    /// Ask the operator for credentials.
    ///
    /// # Errors
    ///
    /// `Mismatch` when the confirmation differs, `Empty`/`TooShort` when the
    /// password violates the policy, `MissingKeyFile` for a bad `SSH_KEY_FILE`.
    pub fn collect(
        prompt: &dyn CredentialPrompt,
        opts: &CollectOptions,
    ) -> Result<Self, CredentialError> {
        if let Some(key) = &opts.key_file {
            if !key.is_file() {
                return Err(CredentialError::MissingKeyFile(key.to_string()));
            }
            tracing::debug!(key_file = %key, "using key-based authentication");
            return Ok(Self::build(false, opts.automation_available, Some(key.clone().into()), None));
        }

        let reuse = prompt.confirm(
            "Use the same root password for every host?",
            opts.reuse_default,
        )?;
        if !reuse {
            tracing::debug!("no shared password; each host authenticates interactively");
            return Ok(Self::build(false, opts.automation_available, None, None));
        }

        let password = prompt.read_secret("Password: ")?;
        let confirmation = prompt.read_secret("Confirm password: ")?;
        if password.as_str() != confirmation.as_str() {
            return Err(CredentialError::Mismatch);
        }
        validate_password(&password)?;

        let ctx = Self::build(true, opts.automation_available, None, None);
        ctx.redactor.register_secret(&password);
        *ctx.secret.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(password);
        Ok(ctx)
    }

    /// Context holding no secret, used by dry runs.
    #[must_use]
    pub fn empty() -> Self {
        Self::build(false, false, None, None)
    }

    fn build(
        reuse_enabled: bool,
        automation_available: bool,
        key_file: Option<PathBuf>,
        secret: Option<Zeroizing<String>>,
    ) -> Self {
        Self {
            reuse_enabled,
            automation_available,
            key_file,
            secret: Mutex::new(secret),
            redactor: SecretRedactor::new(),
            zeroed: AtomicBool::new(false),
            wipes: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn reuse_enabled(&self) -> bool {
        self.reuse_enabled
    }

    #[must_use]
    pub fn automation_available(&self) -> bool {
        self.automation_available
    }

    #[must_use]
    pub fn key_file(&self) -> Option<&PathBuf> {
        self.key_file.as_ref()
    }

    #[must_use]
    pub fn has_secret(&self) -> bool {
        self.secret
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }

    /// Run `f` with the authentication mode for a control master.
    ///
    /// Key login wins; a shared password is used only when `sshpass` is
    /// available, otherwise ssh prompts the operator.
    pub fn with_master_auth<T>(&self, f: impl FnOnce(MasterAuth<'_>) -> T) -> T {
        if self.key_file.is_some() {
            return f(MasterAuth::Key);
        }
        let guard = self
            .secret
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match guard.as_ref() {
            Some(secret) if self.automation_available => f(MasterAuth::Password(secret.as_str())),
            _ => f(MasterAuth::Interactive),
        }
    }

    /// Whether opening a channel needs the operator at the terminal.
    #[must_use]
    pub fn needs_terminal(&self) -> bool {
        self.with_master_auth(|auth| matches!(auth, MasterAuth::Interactive))
    }

    /// Scrub `text` of this run's password and of anything that looks like a
    /// credential.
    #[must_use]
    pub fn redact(&self, text: &str) -> String {
        self.redactor.redact_string(text)
    }

    /// Wipe the secret. Idempotent; only the first call counts as a wipe.
    pub fn zero(&self) {
        if self.zeroed.swap(true, Ordering::SeqCst) {
            return;
        }
        let taken = self
            .secret
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        drop(taken);
        self.redactor.forget_secrets();
        self.wipes.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("credentials zeroed");
    }

    #[must_use]
    pub fn is_zeroed(&self) -> bool {
        self.zeroed.load(Ordering::SeqCst)
    }

    /// Number of effective wipes; exactly one after any completed run.
    #[must_use]
    pub fn zero_count(&self) -> usize {
        self.wipes.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for CredentialContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialContext")
            .field("reuse_enabled", &self.reuse_enabled)
            .field("automation_available", &self.automation_available)
            .field("key_file", &self.key_file)
            .field("has_secret", &self.has_secret())
            .field("zeroed", &self.is_zeroed())
            .finish_non_exhaustive()
    }
}

fn validate_password(password: &str) -> Result<(), CredentialError> {
    if password.is_empty() {
        return Err(CredentialError::Empty);
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(CredentialError::TooShort {
            min: MIN_PASSWORD_LEN,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct Scripted {
        secrets: Mutex<VecDeque<&'static str>>,
        reuse: bool,
    }

    impl Scripted {
        fn new(reuse: bool, secrets: &[&'static str]) -> Self {
            Self {
                secrets: Mutex::new(secrets.iter().copied().collect()),
                reuse,
            }
        }
    }

    impl CredentialPrompt for Scripted {
        fn read_secret(&self, _prompt: &str) -> Result<Zeroizing<String>, CredentialError> {
            self.secrets
                .lock()
                .unwrap()
                .pop_front()
                .map(|s| Zeroizing::new(s.to_string()))
                .ok_or_else(|| CredentialError::PromptFailed("no input".into()))
        }

        fn confirm(&self, _question: &str, _default: bool) -> Result<bool, CredentialError> {
            Ok(self.reuse)
        }
    }

    fn automated() -> CollectOptions {
        CollectOptions {
            reuse_default: true,
            automation_available: true,
            ..Default::default()
        }
    }

    #[test]
    fn matching_passwords_are_collected_and_redacted() {
        let prompt = Scripted::new(true, &["correct horse 1", "correct horse 1"]);
        let ctx = CredentialContext::collect(&prompt, &automated()).unwrap();
        assert!(ctx.reuse_enabled());
        assert!(ctx.has_secret());
        assert!(ctx.with_master_auth(|a| matches!(a, MasterAuth::Password("correct horse 1"))));
        assert_eq!(ctx.redact("su: correct horse 1"), "su: ***");
        assert_eq!(
            gpdeploy_redaction::redact_user_string("su: correct horse 1"),
            "su: correct horse 1"
        );
        assert!(!format!("{ctx:?}").contains("correct horse 1"));
        ctx.zero();
    }

    #[test]
    fn mismatch_and_policy_violations_are_input_errors() {
        let mismatch = Scripted::new(true, &["longenough1", "longenough2"]);
        assert!(matches!(
            CredentialContext::collect(&mismatch, &automated()),
            Err(CredentialError::Mismatch)
        ));

        let empty = Scripted::new(true, &["", ""]);
        assert!(matches!(
            CredentialContext::collect(&empty, &automated()),
            Err(CredentialError::Empty)
        ));

        let short = Scripted::new(true, &["abc", "abc"]);
        assert!(matches!(
            CredentialContext::collect(&short, &automated()),
            Err(CredentialError::TooShort { min: MIN_PASSWORD_LEN })
        ));
    }

    #[test]
    fn declining_reuse_holds_no_secret() {
        let prompt = Scripted::new(false, &[]);
        let ctx = CredentialContext::collect(&prompt, &automated()).unwrap();
        assert!(!ctx.reuse_enabled());
        assert!(ctx.needs_terminal());
    }

    #[test]
    fn missing_automation_degrades_to_interactive() {
        let prompt = Scripted::new(true, &["s3cret-value", "s3cret-value"]);
        let opts = CollectOptions {
            reuse_default: true,
            ..Default::default()
        };
        let ctx = CredentialContext::collect(&prompt, &opts).unwrap();
        assert!(ctx.has_secret());
        assert!(ctx.needs_terminal());
        ctx.zero();
    }

    #[test]
    fn key_file_skips_password_prompts() {
        let key = tempfile::NamedTempFile::new().unwrap();
        let prompt = Scripted::new(true, &[]);
        let opts = CollectOptions {
            key_file: Some(Utf8PathBuf::from_path_buf(key.path().to_path_buf()).unwrap()),
            ..automated()
        };
        let ctx = CredentialContext::collect(&prompt, &opts).unwrap();
        assert!(!ctx.has_secret());
        assert!(ctx.with_master_auth(|a| matches!(a, MasterAuth::Key)));

        let missing = CollectOptions {
            key_file: Some(Utf8PathBuf::from("/nonexistent/id_rsa")),
            ..automated()
        };
        assert!(matches!(
            CredentialContext::collect(&prompt, &missing),
            Err(CredentialError::MissingKeyFile(_))
        ));
    }

    #[test]
    fn zero_is_idempotent_and_counted_once() {
        let prompt = Scripted::new(true, &["zero-me-please", "zero-me-please"]);
        let ctx = CredentialContext::collect(&prompt, &automated()).unwrap();
        ctx.zero();
        ctx.zero();
        assert!(ctx.is_zeroed());
        assert!(!ctx.has_secret());
        assert_eq!(ctx.zero_count(), 1);
        assert_eq!(ctx.redact("zero-me-please"), "zero-me-please");
        assert_eq!(gpdeploy_redaction::default_redactor().registered_secret_count(), 0);
    }

    #[test]
    fn password_never_reaches_the_process_wide_redactor() {
        let prompt = Scripted::new(true, &["only-this-run", "only-this-run"]);
        let ctx = CredentialContext::collect(&prompt, &automated()).unwrap();
        assert_eq!(gpdeploy_redaction::default_redactor().registered_secret_count(), 0);
        assert_eq!(ctx.redact("denied for only-this-run"), "denied for ***");
        assert!(!ctx.redact("PGPASSWORD=hunter2hunter2").contains("hunter2hunter2"));
        ctx.zero();
        assert_eq!(ctx.redact("denied for only-this-run"), "denied for only-this-run");
    }
}

use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::process::{Command, Stdio};

/// How the child's standard input is wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StdinMode {
    /// Stdin is `/dev/null` (default; nothing can block on input).
    #[default]
    Null,
    /// Stdin is inherited from the orchestrator so the child can prompt
    /// the operator (interactive ssh authentication).
    Inherit,
}

/// Specification for a command to execute.
///
/// All process execution goes through this type to ensure argv-style invocation.
/// Arguments are stored as `Vec<OsString>`, not shell strings, so metacharacters
/// in host names or paths are never interpreted locally.
///
/// Remote commands are still shell strings on the far side of ssh; they are
/// passed here as a single discrete argument after `--`.
///
/// # Example
///
/// ```rust
/// use gpdeploy_runner::CommandSpec;
/// use std::ffi::OsString;
///
/// let cmd = CommandSpec::new("ssh")
///     .arg("-O")
///     .arg("check")
///     .arg("root@sdw1");
///
/// assert_eq!(cmd.program, OsString::from("ssh"));
/// assert_eq!(cmd.args.len(), 3);
/// ```
#[derive(Clone, Default)]
pub struct CommandSpec {
    /// The program to execute
    pub program: OsString,
    /// Arguments as discrete elements (NOT shell strings)
    pub args: Vec<OsString>,
    /// Optional environment overrides
    pub env: Option<HashMap<OsString, OsString>>,
    /// Stdin wiring for the child
    pub stdin: StdinMode,
}

impl CommandSpec {
    #[must_use]
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments to the command.
    ///
    /// # Example
    ///
    /// ```rust
    /// use gpdeploy_runner::CommandSpec;
    ///
    /// let cmd = CommandSpec::new("ssh").args(["-o", "BatchMode=yes"]);
    /// assert_eq!(cmd.args.len(), 2);
    /// ```
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add an `-o Key=Value` ssh option pair.
    #[must_use]
    pub fn ssh_option(self, key: &str, value: impl fmt::Display) -> Self {
        self.arg("-o").arg(format!("{key}={value}"))
    }

    /// Set an environment variable for the command.
    ///
    /// Values never appear in `Debug` output, which makes this the channel
    /// for secrets such as `SSHPASS`.
    #[must_use]
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Inherit stdin from the orchestrator process.
    #[must_use]
    pub fn interactive(mut self) -> Self {
        self.stdin = StdinMode::Inherit;
        self
    }

    /// Program and arguments joined for logs. Environment is omitted.
    #[must_use]
    pub fn display_line(&self) -> String {
        let mut line = self.program.to_string_lossy().into_owned();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }

    /// Convert this `CommandSpec` into a `std::process::Command`.
    ///
    /// Stdout and stderr are left unconfigured; runners decide how to capture.
    #[must_use]
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);

        if let Some(ref env) = self.env {
            for (key, value) in env {
                cmd.env(key, value);
            }
        }

        match self.stdin {
            StdinMode::Null => cmd.stdin(Stdio::null()),
            StdinMode::Inherit => cmd.stdin(Stdio::inherit()),
        };

        cmd
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let env_keys: Vec<String> = self
            .env
            .as_ref()
            .map(|env| {
                let mut keys: Vec<String> =
                    env.keys().map(|k| k.to_string_lossy().into_owned()).collect();
                keys.sort();
                keys
            })
            .unwrap_or_default();

        f.debug_struct("CommandSpec")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env_keys", &env_keys)
            .field("stdin", &self.stdin)
            .finish()
    }
}

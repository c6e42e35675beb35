use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use gpdeploy_utils::ConfigSource;
use gpdeploy_utils::error::ConfigError;

use crate::model::DeployConfig;
use crate::parser::{parse_bool, parse_str};

/// Default file name looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "gpdeploy.conf";
pub const CONFIG_ENV: &str = "GPDEPLOY_CONFIG";
pub const DRY_RUN_ENV: &str = "DRY_RUN";

/// Values supplied on the command line. They take precedence over everything.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<Utf8PathBuf>,
    /// `--host`: collapse the deployment onto one machine.
    pub host: Option<String>,
    pub dry_run: bool,
    pub parallel: Option<usize>,
}

impl DeployConfig {
    /// Discover and load configuration with precedence CLI > env > file > defaults.
    pub fn discover(cli: &CliOverrides) -> Result<Self, ConfigError> {
        let cwd = std::env::current_dir().map_err(|e| ConfigError::NotFound {
            path: format!("<current directory> ({e})"),
        })?;
        Self::discover_from(&cwd, cli, |key| std::env::var(key).ok())
    }

    /// Path-driven variant used by tests to avoid process-global state.
    pub fn discover_from<F>(start_dir: &Path, cli: &CliOverrides, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = DeployConfig::default();

        if let Some(path) = Self::locate(start_dir, cli, &env)? {
            let text = std::fs::read_to_string(&path).map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ConfigError::NotFound {
                    path: path.to_string(),
                },
                _ => ConfigError::Parse {
                    path: path.to_string(),
                    line: 0,
                    reason: e.to_string(),
                },
            })?;
            let entries = parse_str(&text, path.as_str())?;
            config.apply_entries(&entries)?;
            config.config_path = Some(path);
        }

        if let Some(value) = env(DRY_RUN_ENV).filter(|v| !v.trim().is_empty()) {
            let dry_run = parse_bool(&value).ok_or_else(|| ConfigError::InvalidValue {
                key: DRY_RUN_ENV.to_string(),
                value: value.clone(),
                reason: "expected true or false".to_string(),
            })?;
            config.dry_run = dry_run;
            config.mark(DRY_RUN_ENV, ConfigSource::Env);
        }

        if cli.dry_run {
            config.dry_run = true;
            config.mark(DRY_RUN_ENV, ConfigSource::Cli);
        }
        if let Some(parallel) = cli.parallel {
            config.set("MAX_PARALLEL_HOSTS", &parallel.to_string(), ConfigSource::Cli)?;
        }
        if let Some(host) = cli.host.as_deref().filter(|h| !h.trim().is_empty()) {
            config.apply_host_override(host);
        }

        config.finish_derived();
        tracing::debug!(
            config_path = config.config_path.as_deref().map(Utf8Path::as_str),
            dry_run = config.dry_run,
            max_parallel_hosts = config.max_parallel_hosts,
            "configuration loaded"
        );
        Ok(config)
    }

    /// `--config` > `$GPDEPLOY_CONFIG` > `./gpdeploy.conf` if present.
    ///
    /// A missing explicit file is an error; a missing default file is not.
    fn locate<F>(
        start_dir: &Path,
        cli: &CliOverrides,
        env: &F,
    ) -> Result<Option<Utf8PathBuf>, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let explicit = cli.config_path.clone().or_else(|| {
            env(CONFIG_ENV)
                .filter(|v| !v.trim().is_empty())
                .map(Utf8PathBuf::from)
        });
        if let Some(path) = explicit {
            if !path.is_file() {
                return Err(ConfigError::NotFound {
                    path: path.to_string(),
                });
            }
            return Ok(Some(path));
        }

        let candidate = start_dir.join(DEFAULT_CONFIG_FILE);
        if candidate.is_file() {
            let utf8 = Utf8PathBuf::from_path_buf(candidate).map_err(|p| ConfigError::NotFound {
                path: p.display().to_string(),
            })?;
            return Ok(Some(utf8));
        }
        Ok(None)
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, text: &str) -> Utf8PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, text).unwrap();
        Utf8PathBuf::from_path_buf(path).unwrap()
    }

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn loaded_file_is_recorded_as_the_config_path() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "site.conf", "GPDB_COORDINATOR_HOST=mdw\n");
        let cli = CliOverrides {
            config_path: Some(path.clone()),
            ..Default::default()
        };
        let cfg = DeployConfig::discover_from(dir.path(), &cli, |_| None).unwrap();
        assert_eq!(cfg.config_path.as_deref(), Some(path.as_path()));
        assert_eq!(cfg.config_path.as_deref().map(Utf8Path::as_str), Some(path.as_str()));

        let cfg = DeployConfig::discover_from(dir.path(), &CliOverrides::default(), |_| None).unwrap();
        assert_eq!(cfg.config_path, None);
    }

    #[test]
    fn finds_default_file_in_start_dir() {
        let dir = TempDir::new().unwrap();
        write(&dir, DEFAULT_CONFIG_FILE, "GPDB_COORDINATOR_HOST=mdw\n");
        let cfg = DeployConfig::discover_from(dir.path(), &CliOverrides::default(), |_| None).unwrap();
        assert_eq!(cfg.coordinator_host.as_deref(), Some("mdw"));
        assert!(cfg.config_path.is_some());
    }

    #[test]
    fn missing_default_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = DeployConfig::discover_from(dir.path(), &CliOverrides::default(), |_| None).unwrap();
        assert!(cfg.coordinator_host.is_none());
        assert!(cfg.config_path.is_none());
    }

    #[test]
    fn missing_explicit_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let cli = CliOverrides {
            config_path: Some(Utf8PathBuf::from("/nonexistent/gpdeploy.conf")),
            ..Default::default()
        };
        let err = DeployConfig::discover_from(dir.path(), &cli, |_| None).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound { .. }));
    }

    #[test]
    fn env_config_path_beats_working_directory() {
        let dir = TempDir::new().unwrap();
        write(&dir, DEFAULT_CONFIG_FILE, "GPDB_COORDINATOR_HOST=cwd\n");
        let other = write(&dir, "other.conf", "GPDB_COORDINATOR_HOST=env\n");
        let cfg = DeployConfig::discover_from(
            dir.path(),
            &CliOverrides::default(),
            env_of(&[(CONFIG_ENV, other.as_str())]),
        )
        .unwrap();
        assert_eq!(cfg.coordinator_host.as_deref(), Some("env"));
    }

    #[test]
    fn precedence_cli_over_env_over_file() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            DEFAULT_CONFIG_FILE,
            "DRY_RUN=false\nMAX_PARALLEL_HOSTS=4\nGPDB_COORDINATOR_HOST=mdw\n",
        );

        let cfg = DeployConfig::discover_from(
            dir.path(),
            &CliOverrides::default(),
            env_of(&[(DRY_RUN_ENV, "1")]),
        )
        .unwrap();
        assert!(cfg.dry_run);
        assert_eq!(cfg.source_of(DRY_RUN_ENV), ConfigSource::Env);
        assert_eq!(cfg.max_parallel_hosts, 4);
        assert_eq!(cfg.source_of("MAX_PARALLEL_HOSTS"), ConfigSource::Config);

        let cli = CliOverrides {
            dry_run: true,
            parallel: Some(16),
            host: Some("node1".into()),
            ..Default::default()
        };
        let cfg = DeployConfig::discover_from(dir.path(), &cli, |_| None).unwrap();
        assert!(cfg.dry_run);
        assert_eq!(cfg.source_of(DRY_RUN_ENV), ConfigSource::Cli);
        assert_eq!(cfg.max_parallel_hosts, 16);
        assert_eq!(cfg.coordinator_host.as_deref(), Some("node1"));
    }

    #[test]
    fn invalid_dry_run_env_is_rejected() {
        let dir = TempDir::new().unwrap();
        let err = DeployConfig::discover_from(
            dir.path(),
            &CliOverrides::default(),
            env_of(&[(DRY_RUN_ENV, "perhaps")]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}

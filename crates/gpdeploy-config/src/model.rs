use std::collections::BTreeMap;

use camino::Utf8PathBuf;
use gpdeploy_utils::ConfigSource;
use gpdeploy_utils::error::ConfigError;
use serde::Serialize;

use crate::parser::{RawEntry, RawValue, parse_bool};

pub const DEFAULT_INSTALL_DIR: &str = "/usr/local/greenplum-db";
pub const DEFAULT_DATA_DIR: &str = "/data";
pub const DEFAULT_ADMIN_USER: &str = "gpadmin";
pub const DEFAULT_COORDINATOR_PORT: u16 = 5432;
pub const DEFAULT_PORT_BASE: u16 = 6000;
pub const DEFAULT_SEGMENTS_PER_HOST: u32 = 2;
pub const DEFAULT_ARRAY_NAME: &str = "gpdeploy";
pub const DEFAULT_SSH_USER: &str = "root";
pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_MAX_PARALLEL_HOSTS: usize = 8;
pub const MAX_PARALLEL_HOSTS_LIMIT: usize = 64;
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 600;
pub const MIN_COMMAND_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_COMMAND_MAX_RETRIES: u32 = 2;
pub const DEFAULT_CONNECTION_IDLE_TIMEOUT_SECS: u64 = 1800;

/// Effective configuration for one run.
///
/// Host fields are kept as written; inventory validation (coordinator
/// present, no duplicates) belongs to the host registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeployConfig {
    pub coordinator_host: Option<String>,
    pub standby_host: Option<String>,
    pub segment_hosts: Vec<String>,

    pub install_dir: String,
    pub data_dir: String,
    pub admin_user: String,
    pub admin_group: String,
    pub installer_path: Option<Utf8PathBuf>,
    pub coordinator_port: u16,
    pub port_base: u16,
    pub segments_per_host: u32,
    pub array_name: String,

    pub ssh_user: String,
    pub ssh_port: u16,
    pub ssh_key_file: Option<Utf8PathBuf>,
    pub ssh_reuse_password: bool,

    pub install_pxf: bool,
    pub install_madlib: bool,
    pub pxf_installer_path: Option<Utf8PathBuf>,
    pub madlib_installer_path: Option<Utf8PathBuf>,
    pub pxf_base: String,

    pub max_parallel_hosts: usize,
    pub command_timeout_secs: u64,
    pub command_max_retries: u32,
    pub connection_idle_timeout_secs: u64,

    pub dry_run: bool,

    /// File the values were loaded from, if any.
    pub config_path: Option<Utf8PathBuf>,
    /// Keys this version does not interpret, kept verbatim.
    pub extra: BTreeMap<String, String>,
    #[serde(skip)]
    pub(crate) source_attribution: BTreeMap<String, ConfigSource>,
    #[serde(skip)]
    pxf_base_explicit: bool,
    #[serde(skip)]
    admin_group_explicit: bool,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            coordinator_host: None,
            standby_host: None,
            segment_hosts: Vec::new(),
            install_dir: DEFAULT_INSTALL_DIR.to_string(),
            data_dir: DEFAULT_DATA_DIR.to_string(),
            admin_user: DEFAULT_ADMIN_USER.to_string(),
            admin_group: DEFAULT_ADMIN_USER.to_string(),
            installer_path: None,
            coordinator_port: DEFAULT_COORDINATOR_PORT,
            port_base: DEFAULT_PORT_BASE,
            segments_per_host: DEFAULT_SEGMENTS_PER_HOST,
            array_name: DEFAULT_ARRAY_NAME.to_string(),
            ssh_user: DEFAULT_SSH_USER.to_string(),
            ssh_port: DEFAULT_SSH_PORT,
            ssh_key_file: None,
            ssh_reuse_password: true,
            install_pxf: false,
            install_madlib: false,
            pxf_installer_path: None,
            madlib_installer_path: None,
            pxf_base: format!("/home/{DEFAULT_ADMIN_USER}/pxf-base"),
            max_parallel_hosts: DEFAULT_MAX_PARALLEL_HOSTS,
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
            command_max_retries: DEFAULT_COMMAND_MAX_RETRIES,
            connection_idle_timeout_secs: DEFAULT_CONNECTION_IDLE_TIMEOUT_SECS,
            dry_run: false,
            config_path: None,
            extra: BTreeMap::new(),
            source_attribution: BTreeMap::new(),
            pxf_base_explicit: false,
            admin_group_explicit: false,
        }
    }
}

fn invalid(key: &str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(key, value, "expected a non-negative integer"))
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigError> {
    parse_bool(value).ok_or_else(|| invalid(key, value, "expected true or false"))
}

fn non_empty(value: &str) -> Option<String> {
    let v = value.trim();
    (!v.is_empty()).then(|| v.to_string())
}

impl DeployConfig {
    /// Apply parsed file entries on top of the current values.
    ///
    /// Later assignments win, as in a shell.
    pub fn apply_entries(&mut self, entries: &[RawEntry]) -> Result<(), ConfigError> {
        for entry in entries {
            match &entry.value {
                RawValue::Scalar(value) => self.set(&entry.key, value, ConfigSource::Config)?,
                RawValue::Array(items) if entry.key == "GPDB_SEGMENT_HOSTS" => {
                    self.segment_hosts = items.iter().filter_map(|h| non_empty(h)).collect();
                    self.mark(&entry.key, ConfigSource::Config);
                }
                RawValue::Array(items) => {
                    return Err(invalid(&entry.key, &items.join(" "), "array not allowed here"));
                }
            }
        }
        self.finish_derived();
        Ok(())
    }

    /// Set one key from a string value and record its source.
    pub fn set(&mut self, key: &str, value: &str, source: ConfigSource) -> Result<(), ConfigError> {
        match key {
            "GPDB_COORDINATOR_HOST" => self.coordinator_host = non_empty(value),
            "GPDB_STANDBY_HOST" => self.standby_host = non_empty(value),
            "GPDB_SEGMENT_HOSTS" => {
                self.segment_hosts = value.split_whitespace().map(str::to_string).collect();
            }
            "GPDB_INSTALL_DIR" => self.install_dir = required_path(key, value)?,
            "GPDB_DATA_DIR" => self.data_dir = required_path(key, value)?,
            "GPDB_ADMIN_USER" => {
                self.admin_user = non_empty(value).ok_or_else(|| invalid(key, value, "empty"))?;
            }
            "GPDB_ADMIN_GROUP" => {
                self.admin_group = non_empty(value).ok_or_else(|| invalid(key, value, "empty"))?;
                self.admin_group_explicit = true;
            }
            "GPDB_INSTALLER_PATH" => self.installer_path = non_empty(value).map(Utf8PathBuf::from),
            "GPDB_COORDINATOR_PORT" => self.coordinator_port = parse_num(key, value)?,
            "GPDB_PORT_BASE" => self.port_base = parse_num(key, value)?,
            "GPDB_SEGMENTS_PER_HOST" => {
                let n: u32 = parse_num(key, value)?;
                if n == 0 {
                    return Err(invalid(key, value, "must be at least 1"));
                }
                self.segments_per_host = n;
            }
            "GPDB_ARRAY_NAME" => {
                self.array_name = non_empty(value).ok_or_else(|| invalid(key, value, "empty"))?;
            }
            "SSH_USER" => {
                self.ssh_user = non_empty(value).ok_or_else(|| invalid(key, value, "empty"))?;
            }
            "SSH_PORT" => {
                let port: u16 = parse_num(key, value)?;
                if port == 0 {
                    return Err(invalid(key, value, "port 0 is not valid"));
                }
                self.ssh_port = port;
            }
            "SSH_KEY_FILE" => self.ssh_key_file = non_empty(value).map(Utf8PathBuf::from),
            "SSH_REUSE_PASSWORD" => self.ssh_reuse_password = parse_flag(key, value)?,
            "INSTALL_PXF" => self.install_pxf = parse_flag(key, value)?,
            "INSTALL_MADLIB" => self.install_madlib = parse_flag(key, value)?,
            "PXF_INSTALLER_PATH" => {
                self.pxf_installer_path = non_empty(value).map(Utf8PathBuf::from);
            }
            "MADLIB_INSTALLER_PATH" => {
                self.madlib_installer_path = non_empty(value).map(Utf8PathBuf::from);
            }
            "PXF_BASE" => {
                self.pxf_base = required_path(key, value)?;
                self.pxf_base_explicit = true;
            }
            "MAX_PARALLEL_HOSTS" => {
                let n: usize = parse_num(key, value)?;
                if !(1..=MAX_PARALLEL_HOSTS_LIMIT).contains(&n) {
                    return Err(invalid(
                        key,
                        value,
                        format!("must be between 1 and {MAX_PARALLEL_HOSTS_LIMIT}"),
                    ));
                }
                self.max_parallel_hosts = n;
            }
            "COMMAND_TIMEOUT_SECS" => {
                let n: u64 = parse_num(key, value)?;
                if n < MIN_COMMAND_TIMEOUT_SECS {
                    return Err(invalid(
                        key,
                        value,
                        format!("must be at least {MIN_COMMAND_TIMEOUT_SECS}"),
                    ));
                }
                self.command_timeout_secs = n;
            }
            "COMMAND_MAX_RETRIES" => self.command_max_retries = parse_num(key, value)?,
            "CONNECTION_IDLE_TIMEOUT_SECS" => {
                let n: u64 = parse_num(key, value)?;
                if n == 0 {
                    return Err(invalid(key, value, "must be positive"));
                }
                self.connection_idle_timeout_secs = n;
            }
            "DRY_RUN" => self.dry_run = parse_flag(key, value)?,
            _ => {
                tracing::debug!(key, "keeping unrecognized configuration key");
                self.extra.insert(key.to_string(), value.to_string());
            }
        }
        self.mark(key, source);
        Ok(())
    }

    /// Collapse the deployment onto one host: coordinator and the only
    /// segment host become `host`, standby is cleared.
    pub fn apply_host_override(&mut self, host: &str) {
        let host = host.trim().to_string();
        self.coordinator_host = Some(host.clone());
        self.segment_hosts = vec![host];
        self.standby_host = None;
        for key in ["GPDB_COORDINATOR_HOST", "GPDB_SEGMENT_HOSTS", "GPDB_STANDBY_HOST"] {
            self.mark(key, ConfigSource::Cli);
        }
    }

    pub(crate) fn mark(&mut self, key: &str, source: ConfigSource) {
        self.source_attribution.insert(key.to_string(), source);
    }

    /// Values derived from the admin user unless set explicitly.
    pub(crate) fn finish_derived(&mut self) {
        if !self.admin_group_explicit {
            self.admin_group = self.admin_user.clone();
        }
        if !self.pxf_base_explicit {
            self.pxf_base = format!("/home/{}/pxf-base", self.admin_user);
        }
    }

    /// Where `key`'s effective value came from.
    #[must_use]
    pub fn source_of(&self, key: &str) -> ConfigSource {
        self.source_attribution
            .get(key)
            .copied()
            .unwrap_or(ConfigSource::Default)
    }

    /// Either an extension is enabled.
    #[must_use]
    pub fn extensions_enabled(&self) -> bool {
        self.install_pxf || self.install_madlib
    }
}

fn required_path(key: &str, value: &str) -> Result<String, ConfigError> {
    let v = non_empty(value).ok_or_else(|| invalid(key, value, "empty"))?;
    if !v.starts_with('/') {
        return Err(invalid(key, value, "must be an absolute path"));
    }
    let trimmed = v.trim_end_matches('/');
    Ok(if trimmed.is_empty() { "/".to_string() } else { trimmed.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_str;

    fn load(text: &str) -> Result<DeployConfig, ConfigError> {
        let mut cfg = DeployConfig::default();
        cfg.apply_entries(&parse_str(text, "t")?)?;
        Ok(cfg)
    }

    #[test]
    fn defaults_are_documented_values() {
        let cfg = DeployConfig::default();
        assert_eq!(cfg.ssh_user, "root");
        assert_eq!(cfg.max_parallel_hosts, 8);
        assert_eq!(cfg.command_timeout_secs, 600);
        assert_eq!(cfg.connection_idle_timeout_secs, 1800);
        assert!(cfg.ssh_reuse_password);
        assert_eq!(cfg.source_of("SSH_USER"), ConfigSource::Default);
    }

    #[test]
    fn file_values_override_defaults_and_derive_group() {
        let cfg = load(
            "GPDB_COORDINATOR_HOST=mdw\nGPDB_SEGMENT_HOSTS=(sdw1 sdw2)\nGPDB_ADMIN_USER=gpdb\nINSTALL_PXF=yes\nGPDB_DATA_DIR=/data/gp/\n",
        )
        .unwrap();
        assert_eq!(cfg.coordinator_host.as_deref(), Some("mdw"));
        assert_eq!(cfg.segment_hosts, vec!["sdw1", "sdw2"]);
        assert_eq!(cfg.admin_group, "gpdb");
        assert_eq!(cfg.pxf_base, "/home/gpdb/pxf-base");
        assert_eq!(cfg.data_dir, "/data/gp");
        assert!(cfg.install_pxf);
        assert_eq!(cfg.source_of("INSTALL_PXF"), ConfigSource::Config);
    }

    #[test]
    fn explicit_group_survives_admin_change() {
        let cfg = load("GPDB_ADMIN_GROUP=dba\nGPDB_ADMIN_USER=gpdb\n").unwrap();
        assert_eq!(cfg.admin_group, "dba");
    }

    #[test]
    fn bounds_are_enforced() {
        assert!(load("MAX_PARALLEL_HOSTS=0").is_err());
        assert!(load("MAX_PARALLEL_HOSTS=65").is_err());
        assert!(load("COMMAND_TIMEOUT_SECS=4").is_err());
        assert!(load("SSH_PORT=70000").is_err());
        assert!(load("INSTALL_MADLIB=sometimes").is_err());
        assert!(load("GPDB_INSTALL_DIR=relative/path").is_err());
        assert!(load("SSH_USER=(a b)").is_err());
    }

    #[test]
    fn unknown_keys_are_kept() {
        let cfg = load("GPDB_ENCODING=UTF8\n").unwrap();
        assert_eq!(cfg.extra.get("GPDB_ENCODING").map(String::as_str), Some("UTF8"));
    }

    #[test]
    fn host_override_collapses_roles() {
        let mut cfg = load("GPDB_COORDINATOR_HOST=mdw\nGPDB_STANDBY_HOST=smdw\nGPDB_SEGMENT_HOSTS=(a b)\n").unwrap();
        cfg.apply_host_override("node1");
        assert_eq!(cfg.coordinator_host.as_deref(), Some("node1"));
        assert_eq!(cfg.segment_hosts, vec!["node1"]);
        assert!(cfg.standby_host.is_none());
        assert_eq!(cfg.source_of("GPDB_SEGMENT_HOSTS"), ConfigSource::Cli);
    }
}

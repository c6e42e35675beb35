use gpdeploy_utils::ConfigSource;
use serde::Serialize;

use crate::model::DeployConfig;

/// One line of `gpdeploy config` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectiveValue {
    pub key: String,
    pub value: String,
    pub source: ConfigSource,
}

fn opt<T: ToString>(value: Option<&T>) -> String {
    value.map(ToString::to_string).unwrap_or_default()
}

impl DeployConfig {
    /// Effective configuration with source attribution, in a stable order.
    #[must_use]
    pub fn effective_config(&self) -> Vec<EffectiveValue> {
        let known: Vec<(&str, String)> = vec![
            ("GPDB_COORDINATOR_HOST", opt(self.coordinator_host.as_ref())),
            ("GPDB_STANDBY_HOST", opt(self.standby_host.as_ref())),
            ("GPDB_SEGMENT_HOSTS", self.segment_hosts.join(" ")),
            ("GPDB_INSTALL_DIR", self.install_dir.clone()),
            ("GPDB_DATA_DIR", self.data_dir.clone()),
            ("GPDB_ADMIN_USER", self.admin_user.clone()),
            ("GPDB_ADMIN_GROUP", self.admin_group.clone()),
            ("GPDB_INSTALLER_PATH", opt(self.installer_path.as_ref())),
            ("GPDB_COORDINATOR_PORT", self.coordinator_port.to_string()),
            ("GPDB_PORT_BASE", self.port_base.to_string()),
            ("GPDB_SEGMENTS_PER_HOST", self.segments_per_host.to_string()),
            ("GPDB_ARRAY_NAME", self.array_name.clone()),
            ("SSH_USER", self.ssh_user.clone()),
            ("SSH_PORT", self.ssh_port.to_string()),
            ("SSH_KEY_FILE", opt(self.ssh_key_file.as_ref())),
            ("SSH_REUSE_PASSWORD", self.ssh_reuse_password.to_string()),
            ("INSTALL_PXF", self.install_pxf.to_string()),
            ("INSTALL_MADLIB", self.install_madlib.to_string()),
            ("PXF_INSTALLER_PATH", opt(self.pxf_installer_path.as_ref())),
            ("MADLIB_INSTALLER_PATH", opt(self.madlib_installer_path.as_ref())),
            ("PXF_BASE", self.pxf_base.clone()),
            ("MAX_PARALLEL_HOSTS", self.max_parallel_hosts.to_string()),
            ("COMMAND_TIMEOUT_SECS", self.command_timeout_secs.to_string()),
            ("COMMAND_MAX_RETRIES", self.command_max_retries.to_string()),
            (
                "CONNECTION_IDLE_TIMEOUT_SECS",
                self.connection_idle_timeout_secs.to_string(),
            ),
            ("DRY_RUN", self.dry_run.to_string()),
        ];

        let mut out: Vec<EffectiveValue> = known
            .into_iter()
            .map(|(key, value)| EffectiveValue {
                key: key.to_string(),
                value,
                source: self.source_of(key),
            })
            .collect();

        out.extend(self.extra.iter().map(|(key, value)| EffectiveValue {
            key: key.clone(),
            value: value.clone(),
            source: self.source_of(key),
        }));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_str;

    #[test]
    fn attribution_covers_defaults_file_and_extras() {
        let mut cfg = DeployConfig::default();
        cfg.apply_entries(&parse_str("SSH_PORT=2222\nGPDB_LOCALE=C\n", "t").unwrap())
            .unwrap();
        let values = cfg.effective_config();

        let port = values.iter().find(|v| v.key == "SSH_PORT").unwrap();
        assert_eq!(port.value, "2222");
        assert_eq!(port.source, ConfigSource::Config);

        let user = values.iter().find(|v| v.key == "SSH_USER").unwrap();
        assert_eq!(user.source, ConfigSource::Default);

        let extra = values.last().unwrap();
        assert_eq!(extra.key, "GPDB_LOCALE");

        let json = serde_json::to_value(port).unwrap();
        assert_eq!(json["source"], "config");
    }
}

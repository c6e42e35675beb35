//! `gpdeploy config`: effective values with their source.

use gpdeploy_config::DeployConfig;

pub fn execute_config_command(config: &DeployConfig) {
    print!("{}", render_effective_config(config));
}

#[must_use]
pub fn render_effective_config(config: &DeployConfig) -> String {
    let mut out = match &config.config_path {
        Some(path) => format!("Configuration file: {path}\n\n"),
        None => "Configuration file: (none, using defaults)\n\n".to_string(),
    };
    let values = config.effective_config();
    let width = values.iter().map(|v| v.key.len()).max().unwrap_or(0);
    for value in values {
        let shown = if value.value.is_empty() { "-" } else { value.value.as_str() };
        out.push_str(&format!(
            "  {:<width$}  {:<40} [{}]\n",
            value.key, shown, value.source
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_attributed() {
        let text = render_effective_config(&DeployConfig::default());
        assert!(text.contains("(none, using defaults)"));
        let install = text
            .lines()
            .find(|l| l.trim_start().starts_with("GPDB_INSTALL_DIR"))
            .unwrap();
        assert!(install.contains("/usr/local/greenplum-db"));
        assert!(install.ends_with("[default]"));
    }
}

//! Canonical host list with roles and per-phase progress.

use std::collections::{BTreeMap, BTreeSet};

use gpdeploy_config::DeployConfig;
use gpdeploy_utils::error::ValidationError;
use gpdeploy_utils::{HostRole, HostStatus, PhaseId};
use serde::{Deserialize, Serialize};

/// One cluster host. Unique by normalized address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub address: String,
    /// Fixed at load. A single-node deployment carries every role.
    pub roles: BTreeSet<HostRole>,
    /// Status in the phase currently running.
    pub status: HostStatus,
    pub phases: BTreeMap<PhaseId, HostStatus>,
    /// Last step started on this host.
    pub cursor: Option<String>,
}

impl Host {
    fn new(address: String, role: HostRole) -> Self {
        Self {
            address,
            roles: BTreeSet::from([role]),
            status: HostStatus::Pending,
            phases: BTreeMap::new(),
            cursor: None,
        }
    }

    #[must_use]
    pub fn has_role(&self, role: HostRole) -> bool {
        self.roles.contains(&role)
    }

    #[must_use]
    pub fn phase_status(&self, phase: PhaseId) -> HostStatus {
        self.phases.get(&phase).copied().unwrap_or_default()
    }

    fn governed_by(&self, phase: PhaseId) -> bool {
        phase
            .applicable_roles()
            .iter()
            .any(|role| self.roles.contains(role))
    }
}

/// Lowercase, trim, drop a trailing root dot.
pub fn normalize_address(raw: &str) -> Result<String, ValidationError> {
    let trimmed = raw.trim();
    let normalized = trimmed.trim_end_matches('.').to_ascii_lowercase();
    if normalized.is_empty() {
        return Err(ValidationError::InvalidAddress {
            address: raw.to_string(),
            reason: "empty host address".to_string(),
        });
    }
    if normalized.chars().any(char::is_whitespace) {
        return Err(ValidationError::InvalidAddress {
            address: raw.to_string(),
            reason: "host address contains whitespace".to_string(),
        });
    }
    Ok(normalized)
}

/// Hosts in execution order: coordinator, segments, standby.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRegistry {
    hosts: Vec<Host>,
    single_node: bool,
}

impl HostRegistry {
    /// Build and validate the inventory.
    ///
    /// When every configured address normalizes to the same host the roles
    /// collapse onto one entry and the registry is flagged single-node.
    pub fn load(config: &DeployConfig) -> Result<Self, ValidationError> {
        let coordinator = config
            .coordinator_host
            .as_deref()
            .filter(|h| !h.trim().is_empty())
            .ok_or(ValidationError::MissingCoordinator)?;
        if config.segment_hosts.is_empty() {
            return Err(ValidationError::MissingRole(HostRole::Segment));
        }

        let mut declared = vec![(normalize_address(coordinator)?, HostRole::Coordinator)];
        for segment in &config.segment_hosts {
            declared.push((normalize_address(segment)?, HostRole::Segment));
        }
        if let Some(standby) = config.standby_host.as_deref().filter(|h| !h.trim().is_empty()) {
            declared.push((normalize_address(standby)?, HostRole::Standby));
        }

        let distinct: BTreeSet<&str> = declared.iter().map(|(a, _)| a.as_str()).collect();
        if distinct.len() == 1 {
            let address = declared[0].0.clone();
            let mut host = Host::new(address, HostRole::Coordinator);
            host.roles.extend(declared.iter().map(|(_, role)| *role));
            tracing::info!(host = %host.address, "single-node deployment");
            return Ok(Self {
                hosts: vec![host],
                single_node: true,
            });
        }

        let mut seen: BTreeMap<String, HostRole> = BTreeMap::new();
        let mut hosts = Vec::with_capacity(declared.len());
        for (address, role) in declared {
            if let Some(first) = seen.get(&address) {
                return Err(ValidationError::DuplicateHost {
                    address,
                    first: *first,
                    second: role,
                });
            }
            seen.insert(address.clone(), role);
            hosts.push(Host::new(address, role));
        }

        Ok(Self {
            hosts,
            single_node: false,
        })
    }

    #[must_use]
    pub fn is_single_node(&self) -> bool {
        self.single_node
    }

    #[must_use]
    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    #[must_use]
    pub fn get(&self, address: &str) -> Option<&Host> {
        self.hosts.iter().find(|h| h.address == address)
    }

    /// Address of the coordinator. `load` guarantees there is one.
    #[must_use]
    pub fn coordinator(&self) -> &str {
        self.hosts
            .iter()
            .find(|h| h.has_role(HostRole::Coordinator))
            .map_or("", |h| h.address.as_str())
    }

    #[must_use]
    pub fn standby(&self) -> Option<&str> {
        self.hosts
            .iter()
            .find(|h| h.has_role(HostRole::Standby))
            .map(|h| h.address.as_str())
    }

    #[must_use]
    pub fn hosts_for_role(&self, role: HostRole) -> Vec<&Host> {
        self.hosts.iter().filter(|h| h.has_role(role)).collect()
    }

    #[must_use]
    pub fn hosts_for_phase(&self, phase: PhaseId) -> Vec<&Host> {
        self.hosts.iter().filter(|h| h.governed_by(phase)).collect()
    }

    /// Record `status` for `address` in `phase`. Unknown addresses are ignored.
    pub fn mark(&mut self, address: &str, phase: PhaseId, status: HostStatus) {
        if let Some(host) = self.hosts.iter_mut().find(|h| h.address == address) {
            tracing::debug!(host = %address, %phase, %status, "host status");
            host.status = status;
            host.phases.insert(phase, status);
        }
    }

    pub fn set_cursor(&mut self, address: &str, step: &str) {
        if let Some(host) = self.hosts.iter_mut().find(|h| h.address == address) {
            host.cursor = Some(step.to_string());
        }
    }

    /// Barrier: every host `phase` governs is done.
    #[must_use]
    pub fn all_done(&self, phase: PhaseId) -> bool {
        self.pending_for(phase).is_empty()
    }

    /// Governed hosts that have not finished `phase`.
    #[must_use]
    pub fn pending_for(&self, phase: PhaseId) -> Vec<String> {
        self.hosts_for_phase(phase)
            .into_iter()
            .filter(|h| h.phase_status(phase) != HostStatus::Done)
            .map(|h| h.address.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(coordinator: &str, segments: &[&str], standby: Option<&str>) -> DeployConfig {
        let mut config = DeployConfig::default();
        config.coordinator_host = Some(coordinator.to_string());
        config.segment_hosts = segments.iter().map(|s| (*s).to_string()).collect();
        config.standby_host = standby.map(str::to_string);
        config
    }

    #[test]
    fn orders_coordinator_segments_standby() {
        let reg = HostRegistry::load(&config("mdw", &["sdw1", "sdw2"], Some("smdw"))).unwrap();
        let order: Vec<_> = reg.hosts().iter().map(|h| h.address.as_str()).collect();
        assert_eq!(order, ["mdw", "sdw1", "sdw2", "smdw"]);
        assert_eq!(reg.coordinator(), "mdw");
        assert_eq!(reg.standby(), Some("smdw"));
        assert!(!reg.is_single_node());
    }

    #[test]
    fn missing_coordinator_is_rejected() {
        let mut cfg = config("", &["sdw1"], None);
        assert_eq!(
            HostRegistry::load(&cfg).unwrap_err(),
            ValidationError::MissingCoordinator
        );
        cfg.coordinator_host = None;
        assert_eq!(
            HostRegistry::load(&cfg).unwrap_err(),
            ValidationError::MissingCoordinator
        );
    }

    #[test]
    fn segments_are_required() {
        assert_eq!(
            HostRegistry::load(&config("mdw", &[], None)).unwrap_err(),
            ValidationError::MissingRole(HostRole::Segment)
        );
    }

    #[test]
    fn collisions_after_normalization_are_rejected() {
        let err = HostRegistry::load(&config("mdw", &["SDW1.", "sdw1"], None)).unwrap_err();
        assert_eq!(
            err,
            ValidationError::DuplicateHost {
                address: "sdw1".to_string(),
                first: HostRole::Segment,
                second: HostRole::Segment,
            }
        );

        let err = HostRegistry::load(&config("mdw", &["sdw1"], Some(" MDW "))).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::DuplicateHost {
                first: HostRole::Coordinator,
                second: HostRole::Standby,
                ..
            }
        ));
    }

    #[test]
    fn single_host_collapses_roles() {
        let reg = HostRegistry::load(&config("localhost", &["LOCALHOST"], None)).unwrap();
        assert!(reg.is_single_node());
        assert_eq!(reg.hosts().len(), 1);
        let host = &reg.hosts()[0];
        assert!(host.has_role(HostRole::Coordinator));
        assert!(host.has_role(HostRole::Segment));
        assert_eq!(reg.hosts_for_phase(PhaseId::ExtensionInit).len(), 1);
    }

    #[test]
    fn whitespace_inside_address_is_invalid() {
        assert!(matches!(
            HostRegistry::load(&config("md w", &["sdw1"], None)),
            Err(ValidationError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn barrier_tracks_only_governed_hosts() {
        let mut reg = HostRegistry::load(&config("mdw", &["sdw1", "sdw2"], None)).unwrap();
        assert!(!reg.all_done(PhaseId::ExtensionInit));
        reg.mark("mdw", PhaseId::ExtensionInit, HostStatus::Done);
        assert!(reg.all_done(PhaseId::ExtensionInit));

        reg.mark("mdw", PhaseId::Preflight, HostStatus::Done);
        reg.mark("sdw1", PhaseId::Preflight, HostStatus::Done);
        assert_eq!(reg.pending_for(PhaseId::Preflight), vec!["sdw2".to_string()]);
        reg.mark("sdw2", PhaseId::Preflight, HostStatus::Failed);
        assert!(!reg.all_done(PhaseId::Preflight));
        assert_eq!(reg.get("sdw2").unwrap().status, HostStatus::Failed);
    }
}

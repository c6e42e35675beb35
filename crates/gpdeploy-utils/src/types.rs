use serde::{Deserialize, Serialize};

/// Role a host plays in the cluster. Assigned at load, immutable afterwards.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HostRole {
    Coordinator,
    Segment,
    Standby,
}
/// Per-host progress within a phase, recorded as the host's steps run.
/// Per-host progress. Only the phase runner mutates it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HostStatus {
    #[default]
    Pending,
    Connecting,
    InProgress,
    Done,
    Failed,
    Skipped,
}

/// Installation phases.
///
/// ```text
/// Preflight → HostSetup → BinaryInstall → ClusterInit → ExtensionInit
/// Preflight → Teardown
/// ```
///
/// Every phase except `Preflight` depends on exactly one earlier phase and may
/// not start on any host until that phase is done on every host it governs.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PhaseId {
    Preflight,
    HostSetup,
    BinaryInstall,
    ClusterInit,
    ExtensionInit,
    Teardown,
}

const ALL_ROLES: &[HostRole] = &[HostRole::Coordinator, HostRole::Segment, HostRole::Standby];
const COORDINATOR_ONLY: &[HostRole] = &[HostRole::Coordinator];

impl PhaseId {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Preflight => "preflight",
            Self::HostSetup => "host_setup",
            Self::BinaryInstall => "binary_install",
            Self::ClusterInit => "cluster_init",
            Self::ExtensionInit => "extension_init",
            Self::Teardown => "teardown",
        }
    }

    #[must_use]
    pub const fn dependency(&self) -> Option<PhaseId> {
        match self {
            Self::Preflight => None,
            Self::HostSetup | Self::Teardown => Some(Self::Preflight),
            Self::BinaryInstall => Some(Self::HostSetup),
            Self::ClusterInit => Some(Self::BinaryInstall),
            Self::ExtensionInit => Some(Self::ClusterInit),
        }
    }

    /// Roles whose hosts this phase governs (and whose completion its barrier awaits).
    ///
    /// Extension lifecycle commands fan out from the coordinator, so only the
    /// coordinator's progress is tracked for that phase.
    #[must_use]
    pub const fn applicable_roles(&self) -> &'static [HostRole] {
        match self {
            Self::ExtensionInit => COORDINATOR_ONLY,
            _ => ALL_ROLES,
        }
    }

    /// Run state entered when this phase starts.
    #[must_use]
    pub const fn run_state(&self) -> RunState {
        match self {
            Self::Preflight => RunState::Preflight,
            Self::HostSetup => RunState::HostSetup,
            Self::BinaryInstall => RunState::BinaryInstall,
            Self::ClusterInit => RunState::ClusterInit,
            Self::ExtensionInit => RunState::ExtensionInit,
            Self::Teardown => RunState::Teardown,
        }
    }
}

/// Top-level run state machine.
///
/// `Complete` and `Failed` are terminal; `Failed` is reachable from every
/// non-terminal state.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default, strum::Display,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    #[default]
    Init,
    Preflight,
    HostSetup,
    BinaryInstall,
    ClusterInit,
    ExtensionInit,
    Teardown,
    Complete,
    Failed,
}

impl RunState {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Legal successors, excluding the universal `Failed` edge.
    #[must_use]
    pub const fn allowed_transitions(&self) -> &'static [RunState] {
        match self {
            Self::Init => &[Self::Preflight],
            Self::Preflight => &[Self::HostSetup, Self::Teardown],
            Self::HostSetup => &[Self::BinaryInstall],
            Self::BinaryInstall => &[Self::ClusterInit],
            Self::ClusterInit => &[Self::ExtensionInit, Self::Complete],
            Self::ExtensionInit | Self::Teardown => &[Self::Complete],
            Self::Complete | Self::Failed => &[],
        }
    }

    #[must_use]
    pub fn can_transition_to(&self, target: RunState) -> bool {
        if self.is_terminal() {
            return false;
        }
        target == Self::Failed || self.allowed_transitions().contains(&target)
    }
}

/// Where an effective configuration value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConfigSource {
    Cli,
    Env,
    Config,
    Default,
}

/// Coarse error kind recorded in persisted state and used for exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    LockHeld,
    Connectivity,
    Authentication,
    HostKeyRejected,
    CommandFailure,
    Timeout,
    Interrupted,
    Internal,
}

//! Serializable run snapshot and step journal.
//!
//! The snapshot is rewritten atomically on every run-state transition so
//! `gpdeploy status` can report the last run. Nothing reads it back to
//! resume a run.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use gpdeploy_redaction::redact_user_string;
use gpdeploy_utils::atomic_write::write_file_atomic;
use gpdeploy_utils::{DeployError, ErrorKind, PhaseId, RunState};
use serde::{Deserialize, Serialize};

use crate::registry::Host;

pub const STATE_VERSION: u32 = 1;

/// What the extension machine assumed about an extension before acting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionRecord {
    pub assumed: String,
    pub reached: String,
    pub recovered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub host: Option<String>,
    pub phase: Option<PhaseId>,
    pub step: Option<String>,
    /// Redacted.
    pub message: String,
}

impl ErrorRecord {
    #[must_use]
    pub fn from_error(err: &DeployError) -> Self {
        let (phase, step) = match err {
            DeployError::PartialInstall { phase, step, .. } => (Some(*phase), Some(step.clone())),
            _ => (None, None),
        };
        Self {
            kind: err.kind(),
            host: err.host().map(str::to_string),
            phase,
            step,
            message: redact_user_string(&err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StepEvent {
    Started,
    Finished,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Global order across hosts.
    pub seq: u64,
    pub host: String,
    pub phase: PhaseId,
    pub step: String,
    pub event: StepEvent,
    pub at: DateTime<Utc>,
}

/// Append-only record of step starts and ends across all workers.
#[derive(Debug, Default)]
pub struct Journal {
    seq: AtomicU64,
    entries: Mutex<Vec<JournalEntry>>,
}

impl Journal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, host: &str, phase: PhaseId, step: &str, event: StepEvent) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // seq is taken under the lock so entries stay sorted
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        entries.push(JournalEntry {
            seq,
            host: host.to_string(),
            phase,
            step: step.to_string(),
            event,
            at: Utc::now(),
        });
    }

    #[must_use]
    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Sequence number of the first matching event.
    #[must_use]
    pub fn first(&self, host: &str, step: &str, event: StepEvent) -> Option<u64> {
        self.entries()
            .into_iter()
            .find(|e| e.host == host && e.step == step && e.event == event)
            .map(|e| e.seq)
    }
}

/// Snapshot of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallationState {
    pub version: u32,
    pub run_id: String,
    pub mode: String,
    pub coordinator: String,
    pub state: RunState,
    pub phase: Option<PhaseId>,
    pub dry_run: bool,
    pub single_node: bool,
    pub hosts: Vec<Host>,
    #[serde(default)]
    pub extensions: BTreeMap<String, ExtensionRecord>,
    pub error: Option<ErrorRecord>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub journal: Vec<JournalEntry>,
}

impl InstallationState {
    #[must_use]
    pub fn new(run_id: &str, mode: &str, coordinator: &str, dry_run: bool) -> Self {
        let now = Utc::now();
        Self {
            version: STATE_VERSION,
            run_id: run_id.to_string(),
            mode: mode.to_string(),
            coordinator: coordinator.to_string(),
            state: RunState::Init,
            phase: None,
            dry_run,
            single_node: false,
            hosts: Vec::new(),
            extensions: BTreeMap::new(),
            error: None,
            started_at: now,
            updated_at: now,
            journal: Vec::new(),
        }
    }
}

/// Where the snapshot lives.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: Utf8PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at the default location for `coordinator`.
    #[must_use]
    pub fn for_coordinator(coordinator: &str) -> Self {
        Self::new(gpdeploy_utils::paths::state_file(coordinator))
    }

    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn save(&self, state: &InstallationState) -> Result<(), DeployError> {
        if let Some(parent) = self.path.parent() {
            gpdeploy_utils::paths::ensure_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| DeployError::Io(std::io::Error::other(e)))?;
        write_file_atomic(&self.path, &json)?;
        Ok(())
    }

    /// `Ok(None)` when no run has been recorded.
    pub fn load(&self) -> Result<Option<InstallationState>, DeployError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let state = serde_json::from_str(&text).map_err(|e| {
            DeployError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        Ok(Some(state))
    }
}

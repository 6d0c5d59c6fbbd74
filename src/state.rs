//! Summaries of past runs, kept in `state.toml` under the state directory

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use declarative::ReconcileReport;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use teardown::TeardownReport;

use crate::paths;

const STATE_FILE: &str = "state.toml";

// ============================================================================
// State Structures
// ============================================================================

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct StackState {
    /// Last time the state was updated
    pub last_updated: Option<DateTime<Utc>>,

    /// Last reconcile per scope
    #[serde(default)]
    pub reconcile: BTreeMap<String, RunSummary>,

    /// Last teardown per target set
    #[serde(default)]
    pub teardown: BTreeMap<String, RunSummary>,
}

/// Outcome counts of one run
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub finished_at: DateTime<Utc>,
    /// Manifest root or target set id
    pub subject: String,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    #[serde(default)]
    pub dry_run: bool,
    pub success: bool,
    #[serde(default)]
    pub duration_ms: u64,
}

impl RunSummary {
    pub fn from_reconcile(subject: &str, report: &ReconcileReport, elapsed: Duration) -> Self {
        Self {
            finished_at: Utc::now(),
            subject: subject.to_string(),
            succeeded: report.total_changes(),
            failed: report.failed(),
            skipped: report.skipped(),
            dry_run: report.dry_run,
            success: report.is_success(),
            duration_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn from_teardown(subject: &str, report: &TeardownReport, elapsed: Duration) -> Self {
        Self {
            finished_at: Utc::now(),
            subject: subject.to_string(),
            succeeded: report.succeeded(),
            failed: report.failed(),
            skipped: report.skipped(),
            dry_run: report.dry_run,
            success: report.is_success(),
            duration_ms: elapsed.as_millis() as u64,
        }
    }

    /// Short status word for listings
    pub fn status_label(&self) -> &'static str {
        match (self.success, self.dry_run) {
            (_, true) => "dry run",
            (true, false) => "ok",
            (false, false) => "failed",
        }
    }
}

// ============================================================================
// Load / Save
// ============================================================================

impl StackState {
    fn state_file(dir: &Path) -> PathBuf {
        dir.join(STATE_FILE)
    }

    /// Load from the default state directory
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::state_dir()?)
    }

    /// Save to the default state directory
    pub fn save(&self) -> Result<()> {
        self.save_to(&paths::state_dir()?)
    }

    /// Load state from `dir`, or return default if the file doesn't exist
    pub fn load_from(dir: &Path) -> Result<Self> {
        let path = Self::state_file(dir);

        if !path.exists() {
            log::debug!("State file does not exist, using default state");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read state file: {}", path.display()))?;

        let state: StackState = toml::from_str(&content)
            .with_context(|| format!("Failed to parse state file: {}", path.display()))?;

        log::debug!("Loaded state from {}", path.display());
        Ok(state)
    }

    pub fn save_to(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create state directory: {}", dir.display()))?;

        let path = Self::state_file(dir);
        let content = toml::to_string_pretty(&self).context("Failed to serialize state to TOML")?;

        fs::write(&path, &content)
            .with_context(|| format!("Failed to write state file: {}", path.display()))?;

        log::debug!("Saved state to {}", path.display());
        Ok(())
    }

    pub fn record_reconcile(&mut self, scope: &str, summary: RunSummary) {
        self.last_updated = Some(summary.finished_at);
        self.reconcile.insert(scope.to_string(), summary);
    }

    pub fn record_teardown(&mut self, set_id: &str, summary: RunSummary) {
        self.last_updated = Some(summary.finished_at);
        self.teardown.insert(set_id.to_string(), summary);
    }
}

/// Record a reconcile run in the default state directory
///
/// Failing to write state never fails the run itself.
pub fn remember_reconcile(scope: &str, summary: RunSummary) {
    let result = StackState::load().and_then(|mut state| {
        state.record_reconcile(scope, summary);
        state.save()
    });
    if let Err(e) = result {
        log::warn!("Could not record run state: {e:#}");
    }
}

/// Record a teardown run in the default state directory
pub fn remember_teardown(set_id: &str, summary: RunSummary) {
    let result = StackState::load().and_then(|mut state| {
        state.record_teardown(set_id, summary);
        state.save()
    });
    if let Err(e) = result {
        log::warn!("Could not record run state: {e:#}");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use declarative::{Action, Kind, OperationRecord, Outcome, ResourceKey};
    use teardown::{ActionOutcome, ActionRecord};
    use tempfile::TempDir;

    fn reconcile_report() -> ReconcileReport {
        let record = |name: &str, outcome| OperationRecord {
            action: Action::Create,
            key: ResourceKey::new(Kind::ConfigMap, Some("media"), name),
            outcome,
        };
        ReconcileReport {
            records: vec![
                record("a", Outcome::Succeeded { attempts: 1 }),
                record("b", Outcome::Succeeded { attempts: 2 }),
                record("c", Outcome::skipped("Namespace/media did not succeed")),
            ],
            dry_run: false,
        }
    }

    #[test]
    fn test_default_state() {
        let state = StackState::default();
        assert!(state.last_updated.is_none());
        assert!(state.reconcile.is_empty());
        assert!(state.teardown.is_empty());
    }

    #[test]
    fn test_summary_from_reconcile() {
        let summary =
            RunSummary::from_reconcile("deploy", &reconcile_report(), Duration::from_millis(1500));
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 0);
        assert!(!summary.success);
        assert_eq!(summary.duration_ms, 1500);
        assert_eq!(summary.status_label(), "failed");
    }

    #[test]
    fn test_summary_from_teardown() {
        let report = TeardownReport {
            records: vec![ActionRecord {
                action: "delete-interface cni0".into(),
                target: "delete-interface cni0".into(),
                outcome: ActionOutcome::succeeded("already absent"),
            }],
            dry_run: true,
        };
        let summary = RunSummary::from_teardown("k3s", &report, Duration::ZERO);
        assert_eq!(summary.succeeded, 1);
        assert!(summary.success);
        assert_eq!(summary.status_label(), "dry run");
    }

    #[test]
    fn test_missing_state_file_is_default() {
        let dir = TempDir::new().unwrap();
        let state = StackState::load_from(dir.path()).unwrap();
        assert!(state.reconcile.is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let state_dir = dir.path().join("nested");

        let mut state = StackState::default();
        let summary = RunSummary::from_reconcile("deploy", &reconcile_report(), Duration::ZERO);
        state.record_reconcile("default", summary.clone());
        state.save_to(&state_dir).unwrap();

        let loaded = StackState::load_from(&state_dir).unwrap();
        assert_eq!(loaded.reconcile.get("default"), Some(&summary));
        assert_eq!(loaded.last_updated, Some(summary.finished_at));
        assert!(loaded.teardown.is_empty());
    }

    #[test]
    fn test_record_replaces_previous_run() {
        let mut state = StackState::default();
        let first = RunSummary::from_reconcile("a", &reconcile_report(), Duration::ZERO);
        let mut second = first.clone();
        second.subject = "b".into();
        state.record_reconcile("default", first);
        state.record_reconcile("default", second);
        assert_eq!(state.reconcile.len(), 1);
        assert_eq!(state.reconcile["default"].subject, "b");
    }
}

//! Core types for teardown

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Stage a target runs in; stages run in declaration order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    StopServices,
    KillProcesses,
    Network,
    Unmount,
    RemoveData,
    RestartServices,
}

impl Stage {
    pub fn label(&self) -> &'static str {
        match self {
            Stage::StopServices => "stop services",
            Stage::KillProcesses => "kill processes",
            Stage::Network => "network",
            Stage::Unmount => "unmount",
            Stage::RemoveData => "remove data",
            Stage::RestartServices => "restart services",
        }
    }
}

/// A class of residue to remove
///
/// Pattern targets (`delete-interfaces`, `delete-netns`, `unmount`) are
/// resolved against the live host when the teardown runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TeardownTarget {
    /// Stop a system service
    StopService { name: String },
    /// Terminate processes whose command line matches `pattern`
    KillProcesses { pattern: String },
    /// Delete one network interface
    DeleteInterface { name: String },
    /// Delete every interface whose name matches the regex `pattern`
    DeleteInterfaces { pattern: String },
    /// Delete every network namespace whose name starts with `prefix`
    DeleteNetns { prefix: String },
    /// Unmount everything mounted under `prefix`, deepest first
    Unmount { prefix: PathBuf },
    /// Remove a file or directory tree
    RemovePath { path: PathBuf },
    /// Restart a system service
    RestartService { name: String },
}

impl TeardownTarget {
    pub fn stage(&self) -> Stage {
        match self {
            Self::StopService { .. } => Stage::StopServices,
            Self::KillProcesses { .. } => Stage::KillProcesses,
            Self::DeleteInterface { .. } | Self::DeleteInterfaces { .. } | Self::DeleteNetns { .. } => {
                Stage::Network
            }
            Self::Unmount { .. } => Stage::Unmount,
            Self::RemovePath { .. } => Stage::RemoveData,
            Self::RestartService { .. } => Stage::RestartServices,
        }
    }

    /// Whether the target expands to a host-dependent set of actions
    pub fn is_pattern(&self) -> bool {
        matches!(
            self,
            Self::DeleteInterfaces { .. } | Self::DeleteNetns { .. } | Self::Unmount { .. }
        )
    }
}

impl fmt::Display for TeardownTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StopService { name } => write!(f, "stop-service {name}"),
            Self::KillProcesses { pattern } => write!(f, "kill-processes {pattern}"),
            Self::DeleteInterface { name } => write!(f, "delete-interface {name}"),
            Self::DeleteInterfaces { pattern } => write!(f, "delete-interfaces {pattern}"),
            Self::DeleteNetns { prefix } => write!(f, "delete-netns {prefix}*"),
            Self::Unmount { prefix } => write!(f, "unmount {}", prefix.display()),
            Self::RemovePath { path } => write!(f, "remove-path {}", path.display()),
            Self::RestartService { name } => write!(f, "restart-service {name}"),
        }
    }
}

/// A single concrete host action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostAction {
    StopService(String),
    KillProcesses(String),
    DeleteInterface(String),
    DeleteNetns(String),
    Unmount(PathBuf),
    RemovePath(PathBuf),
    RestartService(String),
}

impl fmt::Display for HostAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StopService(name) => write!(f, "stop-service {name}"),
            Self::KillProcesses(pattern) => write!(f, "kill-processes {pattern}"),
            Self::DeleteInterface(name) => write!(f, "delete-interface {name}"),
            Self::DeleteNetns(name) => write!(f, "delete-netns {name}"),
            Self::Unmount(path) => write!(f, "unmount {}", path.display()),
            Self::RemovePath(path) => write!(f, "remove-path {}", path.display()),
            Self::RestartService(name) => write!(f, "restart-service {name}"),
        }
    }
}

/// Outcome of one action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionOutcome {
    /// Done, or nothing to do; `detail` says which
    Succeeded { detail: Option<String> },
    /// Failed for a reason other than absence
    Failed { error: String },
    /// Not attempted
    Skipped { reason: String },
}

impl ActionOutcome {
    pub fn done() -> Self {
        Self::Succeeded { detail: None }
    }

    pub fn succeeded(detail: impl Into<String>) -> Self {
        Self::Succeeded {
            detail: Some(detail.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Succeeded { .. } => "succeeded",
            Self::Failed { .. } => "failed",
            Self::Skipped { .. } => "skipped",
        }
    }
}

/// One line of a teardown report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    /// Concrete action, e.g. `delete-interface veth1a2b`
    pub action: String,
    /// Target the action came from
    pub target: String,
    pub outcome: ActionOutcome,
}

/// Aggregated results of a teardown run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TeardownReport {
    pub records: Vec<ActionRecord>,
    pub dry_run: bool,
}

impl TeardownReport {
    fn count(&self, label: &str) -> usize {
        self.records
            .iter()
            .filter(|r| r.outcome.label() == label)
            .count()
    }

    pub fn succeeded(&self) -> usize {
        self.count("succeeded")
    }

    pub fn failed(&self) -> usize {
        self.count("failed")
    }

    pub fn skipped(&self) -> usize {
        self.count("skipped")
    }

    /// No action failed; skipped actions count as failures unless this was
    /// a dry run
    pub fn is_success(&self) -> bool {
        self.failed() == 0 && (self.dry_run || self.skipped() == 0)
    }
}

/// Options for a teardown run
#[derive(Debug, Clone)]
pub struct TeardownOptions {
    /// Deadline for each host command
    pub timeout: Duration,
    /// Discover and report, but change nothing
    pub dry_run: bool,
}

impl Default for TeardownOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            dry_run: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Set {
        targets: Vec<TeardownTarget>,
    }

    #[test]
    fn test_targets_from_toml() {
        let set: Set = toml::from_str(
            r#"
            targets = [
                { type = "stop-service", name = "k3s" },
                { type = "delete-interfaces", pattern = "^veth" },
                { type = "remove-path", path = "/var/lib/rancher" },
            ]
            "#,
        )
        .unwrap();
        assert_eq!(set.targets.len(), 3);
        assert_eq!(set.targets[1].stage(), Stage::Network);
        assert_eq!(set.targets[2].to_string(), "remove-path /var/lib/rancher");
    }

    #[test]
    fn test_stage_order() {
        assert!(Stage::StopServices < Stage::KillProcesses);
        assert!(Stage::KillProcesses < Stage::Network);
        assert!(Stage::Network < Stage::Unmount);
        assert!(Stage::Unmount < Stage::RemoveData);
        assert!(Stage::RemoveData < Stage::RestartServices);
    }

    #[test]
    fn test_report_success() {
        let record = |outcome| ActionRecord {
            action: "x".into(),
            target: "x".into(),
            outcome,
        };
        let mut report = TeardownReport {
            records: vec![
                record(ActionOutcome::done()),
                record(ActionOutcome::succeeded("already absent")),
            ],
            dry_run: false,
        };
        assert!(report.is_success());
        report.records.push(record(ActionOutcome::Failed {
            error: "busy".into(),
        }));
        assert!(!report.is_success());
        assert_eq!(report.succeeded(), 2);
    }
}

//! Core types for declarative reconciliation

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ErrorCategory;

/// Label marking resources owned by this tool
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Label naming the reconcile scope that last applied a resource
pub const SCOPE_LABEL: &str = "stackctl.io/scope";

/// Default value for [`MANAGED_BY_LABEL`]
pub const DEFAULT_MANAGER: &str = "stackctl";

/// Annotation for explicit dependency declarations
///
/// Value is a comma separated list of `Kind/name` (same namespace) or
/// `Kind/namespace/name` references.
pub const DEPENDS_ON_ANNOTATION: &str = "stackctl.io/depends-on";

/// Resource kind
///
/// Variants are declared in apply priority order, so the derived ordering
/// sorts dependencies first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Kind {
    Namespace,
    PersistentVolumeClaim,
    ConfigMap,
    Deployment,
    Job,
    Service,
    Ingress,
    NetworkPolicy,
    PodDisruptionBudget,
    /// Unrecognized kind, kept opaque
    Other(String),
}

impl Kind {
    /// Parse a kind from its manifest name
    pub fn from_name(name: &str) -> Self {
        match name {
            "Namespace" => Kind::Namespace,
            "PersistentVolumeClaim" => Kind::PersistentVolumeClaim,
            "ConfigMap" => Kind::ConfigMap,
            "Deployment" => Kind::Deployment,
            "Job" => Kind::Job,
            "Service" => Kind::Service,
            "Ingress" => Kind::Ingress,
            "NetworkPolicy" => Kind::NetworkPolicy,
            "PodDisruptionBudget" => Kind::PodDisruptionBudget,
            other => Kind::Other(other.to_string()),
        }
    }

    /// Manifest name of this kind
    pub fn as_str(&self) -> &str {
        match self {
            Kind::Namespace => "Namespace",
            Kind::PersistentVolumeClaim => "PersistentVolumeClaim",
            Kind::ConfigMap => "ConfigMap",
            Kind::Deployment => "Deployment",
            Kind::Job => "Job",
            Kind::Service => "Service",
            Kind::Ingress => "Ingress",
            Kind::NetworkPolicy => "NetworkPolicy",
            Kind::PodDisruptionBudget => "PodDisruptionBudget",
            Kind::Other(name) => name,
        }
    }

    /// Apply priority; lower values are applied first and deleted last
    pub fn priority(&self) -> u8 {
        match self {
            Kind::Namespace => 0,
            Kind::PersistentVolumeClaim => 1,
            Kind::ConfigMap => 2,
            Kind::Deployment | Kind::Job => 3,
            Kind::Service => 4,
            Kind::Ingress => 5,
            Kind::NetworkPolicy | Kind::PodDisruptionBudget => 6,
            Kind::Other(_) => 7,
        }
    }

    /// Whether resources of this kind never live inside a namespace
    pub fn is_cluster_scoped(&self) -> bool {
        matches!(self, Kind::Namespace)
    }

    /// Whether this kind carries a pod template that may reference
    /// config maps and claims
    pub fn is_workload(&self) -> bool {
        match self {
            Kind::Deployment | Kind::Job => true,
            Kind::Other(name) => matches!(
                name.as_str(),
                "StatefulSet" | "DaemonSet" | "CronJob" | "ReplicaSet" | "Pod"
            ),
            _ => false,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unique identity of a resource within a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub kind: Kind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceKey {
    pub fn new(kind: Kind, namespace: Option<&str>, name: &str) -> Self {
        Self {
            kind,
            namespace: namespace.map(ToString::to_string),
            name: name.to_string(),
        }
    }

    /// Key of the Namespace document this resource lives in
    pub fn namespace_key(&self) -> Option<ResourceKey> {
        self.namespace
            .as_deref()
            .map(|ns| ResourceKey::new(Kind::Namespace, None, ns))
    }

    /// Parse a `Kind/name` or `Kind/namespace/name` reference
    ///
    /// Two-part references resolve to `default_namespace`.
    pub fn parse_reference(reference: &str, default_namespace: Option<&str>) -> Option<Self> {
        let parts: Vec<&str> = reference.trim().split('/').collect();
        match parts.as_slice() {
            [kind, name] if !kind.is_empty() && !name.is_empty() => {
                let kind = Kind::from_name(kind);
                let ns = if kind.is_cluster_scoped() {
                    None
                } else {
                    default_namespace
                };
                Some(ResourceKey::new(kind, ns, name))
            }
            [kind, ns, name] if !kind.is_empty() && !ns.is_empty() && !name.is_empty() => {
                Some(ResourceKey::new(Kind::from_name(kind), Some(ns), name))
            }
            _ => None,
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// A parsed unit of desired state
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDocument {
    pub key: ResourceKey,
    pub api_version: String,
    /// Full manifest body, opaque to the reconciler
    pub payload: Value,
    /// Resources that must exist before this one
    pub depends_on: BTreeSet<ResourceKey>,
    /// File the document was loaded from
    pub source: Option<PathBuf>,
}

impl ResourceDocument {
    pub fn new(key: ResourceKey, api_version: &str, payload: Value) -> Self {
        Self {
            key,
            api_version: api_version.to_string(),
            payload,
            depends_on: BTreeSet::new(),
            source: None,
        }
    }

    /// Read an annotation from `metadata.annotations`
    pub fn annotation(&self, name: &str) -> Option<&str> {
        self.payload
            .pointer("/metadata/annotations")
            .and_then(|a| a.get(name))
            .and_then(Value::as_str)
    }
}

/// Live state of a resource as reported by the cluster
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedResource {
    pub key: ResourceKey,
    pub payload: Value,
    /// Opaque version token, changes on every write
    pub resource_version: String,
    pub status: Option<Value>,
    /// Whether the resource carries the management marker
    pub managed: bool,
}

/// Kind of change an operation performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Create => f.write_str("create"),
            Action::Update => f.write_str("update"),
            Action::Delete => f.write_str("delete"),
        }
    }
}

/// A single planned change
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub action: Action,
    pub key: ResourceKey,
    /// Desired payload for create/update, none for delete
    pub payload: Option<Value>,
    /// Indices of plan operations this one depends on; if any of them
    /// does not succeed this operation is skipped
    pub waits_on: Vec<usize>,
    /// Indices of plan operations that must finish first (in any outcome)
    /// to keep the conventional kind order
    pub after: Vec<usize>,
}

impl Operation {
    pub fn create(key: ResourceKey, payload: Value) -> Self {
        Self {
            action: Action::Create,
            key,
            payload: Some(payload),
            waits_on: Vec::new(),
            after: Vec::new(),
        }
    }

    pub fn update(key: ResourceKey, payload: Value) -> Self {
        Self {
            action: Action::Update,
            key,
            payload: Some(payload),
            waits_on: Vec::new(),
            after: Vec::new(),
        }
    }

    pub fn delete(key: ResourceKey) -> Self {
        Self {
            action: Action::Delete,
            key,
            payload: None,
            waits_on: Vec::new(),
            after: Vec::new(),
        }
    }

    /// Human-readable description
    pub fn description(&self) -> String {
        format!("{} {}", self.action, self.key)
    }
}

/// Ordered set of operations; dependencies come before dependents
/// for create/update and after them for delete
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationPlan {
    pub operations: Vec<Operation>,
}

impl OperationPlan {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Count operations of one action
    pub fn count(&self, action: Action) -> usize {
        self.operations.iter().filter(|op| op.action == action).count()
    }
}

/// Outcome of one planned operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// Applied; `attempts` includes retries
    Succeeded { attempts: u32 },
    /// Gave up on this operation
    Failed {
        category: String,
        error: String,
        attempts: u32,
    },
    /// Never dispatched
    Skipped { reason: String },
}

impl Outcome {
    pub fn failed(category: ErrorCategory, error: impl fmt::Display, attempts: u32) -> Self {
        Self::Failed {
            category: category.label().to_string(),
            error: error.to_string(),
            attempts,
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
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

/// Result of a single operation in a report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub action: Action,
    pub key: ResourceKey,
    pub outcome: Outcome,
}

/// Summary of a reconciliation cycle
///
/// Holds one record per planned operation, in plan order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub records: Vec<OperationRecord>,
    /// Whether apply was skipped entirely
    pub dry_run: bool,
}

impl ReconcileReport {
    fn count_succeeded(&self, action: Action) -> usize {
        self.records
            .iter()
            .filter(|r| r.action == action && r.outcome.is_success())
            .count()
    }

    pub fn created(&self) -> usize {
        self.count_succeeded(Action::Create)
    }

    pub fn updated(&self) -> usize {
        self.count_succeeded(Action::Update)
    }

    pub fn deleted(&self) -> usize {
        self.count_succeeded(Action::Delete)
    }

    pub fn failed(&self) -> usize {
        self.records
            .iter()
            .filter(|r| matches!(r.outcome, Outcome::Failed { .. }))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.records
            .iter()
            .filter(|r| matches!(r.outcome, Outcome::Skipped { .. }))
            .count()
    }

    /// Total number of actual changes made
    pub fn total_changes(&self) -> usize {
        self.created() + self.updated() + self.deleted()
    }

    /// Every planned operation succeeded (dry runs count as success)
    pub fn is_success(&self) -> bool {
        self.dry_run || self.records.iter().all(|r| r.outcome.is_success())
    }

    /// Record for a given key, if it was planned
    pub fn record(&self, key: &ResourceKey) -> Option<&OperationRecord> {
        self.records.iter().find(|r| &r.key == key)
    }
}

/// Retry configuration for transient failures
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum delay between retries
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    pub fn new(max_attempts: u32, base_delay: Duration, backoff_factor: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff_factor,
            max_delay: Duration::from_secs(10),
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.base_delay.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        let capped = delay.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Create a config that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

/// What to do with the rest of the plan after a non-transient failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Skip only operations that depend on the failed one
    #[default]
    SkipDependents,
    /// Stop dispatching anything else
    Abort,
}

/// Options for executing a plan
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Compute the plan but don't apply it
    pub dry_run: bool,
    /// Maximum operations in flight
    pub jobs: usize,
    /// Retry policy for transient failures
    pub retry: RetryConfig,
    /// Timeout handed to every boundary call
    pub timeout: Duration,
    /// Reaction to non-transient failures
    pub on_failure: FailurePolicy,
    /// Value of the management label stamped on applied resources
    pub manager: String,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            jobs: 4,
            retry: RetryConfig::default(),
            timeout: Duration::from_secs(30),
            on_failure: FailurePolicy::default(),
            manager: DEFAULT_MANAGER.to_string(),
        }
    }
}

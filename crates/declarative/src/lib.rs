//! # Declarative
//!
//! Declarative reconciliation for Kubernetes-style manifests.
//!
//! This crate loads a directory of desired-state documents, orders them by
//! their dependencies, compares them with what the cluster reports and
//! applies the difference.
//!
//! ## Core Concepts
//!
//! - **ResourceDocument**: One desired resource, keyed by kind, namespace and name
//! - **ManifestStore**: Loads and validates documents from a directory tree
//! - **Grapher**: Orders documents so dependencies are applied first
//! - **Planner**: Turns desired and observed state into an [`OperationPlan`]
//! - **Executor**: Applies a plan with bounded parallelism and retries
//! - **Reconciler**: Runs observe, plan and apply as one cycle per scope
//!
//! ## Example
//!
//! ```ignore
//! use declarative::{CancelToken, ExecuteOptions, InMemoryCluster, NoProgress, Reconciler};
//!
//! let desired = declarative::store::load("deploy/".as_ref())?;
//! let cluster = InMemoryCluster::new();
//! let report = Reconciler::new(&cluster, ExecuteOptions::default())
//!     .reconcile(desired, &CancelToken::new(), &NoProgress)?;
//! assert!(report.is_success());
//! ```
//!
//! ## Provider Traits
//!
//! - [`ClusterApi`]: Observes and mutates the live system
//! - [`ProgressCallback`]: Receives progress updates
//! - [`RetryCallback`]: Receives retry notifications
//!
//! This keeps the crate free of any particular cluster client or UI.

pub mod command;
pub mod context;
pub mod diff;
pub mod error;
pub mod executor;
pub mod graph;
pub mod memory;
pub mod planner;
pub mod reconciler;
pub mod retry;
pub mod store;
pub mod types;

// Re-export main types at crate root
pub use command::{CommandOutput, run_with_timeout};
pub use context::{ApplyContext, CancelToken, ClusterApi, FnCluster, NoProgress, ProgressCallback};
pub use diff::{FieldChanges, field_changes, needs_update, project, strip_server_fields};
pub use error::{Error, ErrorCategory, ParseIssue, Result};
pub use executor::execute;
pub use memory::{Fault, InMemoryCluster};
pub use reconciler::{Reconciler, ScopeRegistry, reconcile};
pub use retry::{RetryCallback, with_retry};
pub use store::ManifestStore;
pub use types::{
    Action, ExecuteOptions, FailurePolicy, Kind, ObservedResource, Operation, OperationPlan,
    OperationRecord, Outcome, ReconcileReport, ResourceDocument, ResourceKey, RetryConfig,
};

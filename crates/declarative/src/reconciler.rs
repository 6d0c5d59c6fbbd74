//! Reconciler - one observe, plan, apply cycle
//!
//! At most one cycle runs per scope at a time. A second cycle for the same
//! scope is rejected with [`Error::Busy`] rather than queued.

use crate::context::{ApplyContext, CancelToken, ClusterApi, ProgressCallback};
use crate::error::{Error, Result};
use crate::executor;
use crate::graph;
use crate::planner;
use crate::retry::{LogCallback, with_retry};
use crate::types::{
    ExecuteOptions, Kind, ObservedResource, OperationPlan, ReconcileReport, ResourceDocument,
};
use std::collections::{BTreeSet, HashSet};
use std::sync::{Mutex, OnceLock, PoisonError};

/// Scope used when none is given
pub const DEFAULT_SCOPE: &str = "default";

/// Tracks which scopes have a cycle in progress
#[derive(Debug, Default)]
pub struct ScopeRegistry {
    active: Mutex<HashSet<String>>,
}

impl ScopeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry
    pub fn global() -> &'static ScopeRegistry {
        static GLOBAL: OnceLock<ScopeRegistry> = OnceLock::new();
        GLOBAL.get_or_init(ScopeRegistry::new)
    }

    /// Claim `scope` until the returned guard is dropped
    pub fn acquire(&self, scope: &str) -> Result<ScopeGuard<'_>> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(scope.to_string()) {
            return Err(Error::Busy {
                scope: scope.to_string(),
            });
        }
        Ok(ScopeGuard {
            registry: self,
            scope: scope.to_string(),
        })
    }

    pub fn is_active(&self, scope: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(scope)
    }
}

/// Releases a scope on drop
#[derive(Debug)]
pub struct ScopeGuard<'a> {
    registry: &'a ScopeRegistry,
    scope: String,
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        self.registry
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.scope);
    }
}

/// Drives the cluster toward a desired snapshot
pub struct Reconciler<'a> {
    cluster: &'a dyn ClusterApi,
    options: ExecuteOptions,
    scope: String,
    registry: &'a ScopeRegistry,
}

impl<'a> Reconciler<'a> {
    pub fn new(cluster: &'a dyn ClusterApi, options: ExecuteOptions) -> Self {
        Self {
            cluster,
            options,
            scope: DEFAULT_SCOPE.to_string(),
            registry: ScopeRegistry::global(),
        }
    }

    /// Set the scope name
    ///
    /// Only one cycle runs per scope at a time, and a cycle only deletes
    /// resources its own scope applied.
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    /// Use a private registry instead of the process-wide one
    pub fn with_registry(mut self, registry: &'a ScopeRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn options(&self) -> &ExecuteOptions {
        &self.options
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Observe the cluster, covering `kinds` on top of the built-in ones,
    /// retrying transient failures
    pub fn observe(
        &self,
        kinds: impl IntoIterator<Item = Kind>,
        cancel: &CancelToken,
    ) -> Result<Vec<ObservedResource>> {
        let ctx = ApplyContext {
            dry_run: self.options.dry_run,
            ..ApplyContext::new(self.options.timeout)
        }
        .with_kinds(kinds);
        let callback = LogCallback { what: "observe" };
        with_retry(&self.options.retry, cancel, &callback, || {
            self.cluster.observe(&ctx)
        })
        .result
    }

    /// Order the snapshot, observe the cluster and compute the plan
    ///
    /// Documents are expected to carry their dependency edges already
    /// (see [`graph::link`]); a cycle fails here before anything is
    /// observed.
    pub fn plan(&self, desired: Vec<ResourceDocument>, cancel: &CancelToken) -> Result<OperationPlan> {
        let ordered = graph::order(desired)?;
        let kinds: BTreeSet<Kind> = ordered.iter().map(|d| d.key.kind.clone()).collect();
        let observed = self.observe(kinds, cancel)?;
        log::debug!("Observed {} resources", observed.len());
        planner::plan(&ordered, &observed, &self.options.manager, &self.scope)
    }

    /// Run one full cycle
    ///
    /// Fails without applying anything on a cycle, an unreachable cluster,
    /// a busy scope or cancellation before the plan exists. Once the plan
    /// exists every operation gets an outcome in the report.
    pub fn reconcile(
        &self,
        desired: Vec<ResourceDocument>,
        cancel: &CancelToken,
        progress: &dyn ProgressCallback,
    ) -> Result<ReconcileReport> {
        let _guard = self.registry.acquire(&self.scope)?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let plan = self.plan(desired, cancel)?;
        if plan.is_empty() {
            log::info!("Cluster already matches desired state");
            return Ok(ReconcileReport {
                records: Vec::new(),
                dry_run: self.options.dry_run,
            });
        }

        let report = executor::execute(&plan, self.cluster, &self.options, cancel, progress)?;
        log::info!(
            "Reconciled scope '{}': {} created, {} updated, {} deleted, {} failed, {} skipped",
            self.scope,
            report.created(),
            report.updated(),
            report.deleted(),
            report.failed(),
            report.skipped()
        );
        Ok(report)
    }
}

/// Run one cycle in the default scope
pub fn reconcile(
    desired: Vec<ResourceDocument>,
    cluster: &dyn ClusterApi,
    options: &ExecuteOptions,
    cancel: &CancelToken,
    progress: &dyn ProgressCallback,
) -> Result<ReconcileReport> {
    Reconciler::new(cluster, options.clone()).reconcile(desired, cancel, progress)
}

//! Apply context and collaborator traits
//!
//! These traits keep the reconciler independent of how the live system is
//! reached (kubectl, an API client, an in-memory fake) and of how progress
//! is shown.

use crate::error::{Error, Result};
use crate::types::{Kind, ObservedResource, Operation, Outcome};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Shared cancellation flag
///
/// Cloning yields a handle to the same flag. Once cancelled, no further
/// operations are dispatched; in-flight ones are allowed to finish.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Cancel automatically once `after` has elapsed
    pub fn cancel_after(&self, after: Duration) {
        let token = self.clone();
        std::thread::spawn(move || {
            std::thread::sleep(after);
            if !token.is_cancelled() {
                log::warn!("Run exceeded {}s, cancelling", after.as_secs());
                token.cancel();
            }
        });
    }
}

/// Context passed to every boundary call
#[derive(Debug, Clone)]
pub struct ApplyContext {
    /// Deadline for a single call
    pub timeout: Duration,
    /// Whether the call must not change anything
    pub dry_run: bool,
    /// Kinds present in the desired snapshot
    pub kinds: BTreeSet<Kind>,
}

impl ApplyContext {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            dry_run: false,
            kinds: BTreeSet::new(),
        }
    }

    /// Ask `observe` to cover these kinds as well as the built-in ones
    pub fn with_kinds(mut self, kinds: impl IntoIterator<Item = Kind>) -> Self {
        self.kinds.extend(kinds);
        self
    }
}

/// The live cluster, reached only through these two calls
///
/// Implementations must report transient failures as
/// [`Error::Conflict`] or [`Error::Timeout`] so they get retried, and
/// rejections as [`Error::Validation`].
pub trait ClusterApi: Send + Sync {
    /// Snapshot every resource the reconciler may need to compare against
    ///
    /// That is every built-in kind plus each kind in `ctx.kinds`; a kind
    /// the cluster does not serve has nothing to report.
    fn observe(&self, ctx: &ApplyContext) -> Result<Vec<ObservedResource>>;

    /// Apply a single operation
    fn apply(&self, operation: &Operation, ctx: &ApplyContext) -> Result<()>;
}

/// [`ClusterApi`] built from a pair of closures
pub struct FnCluster<O, A> {
    observe: O,
    apply: A,
}

impl<O, A> FnCluster<O, A>
where
    O: Fn() -> Result<Vec<ObservedResource>> + Send + Sync,
    A: Fn(&Operation) -> Result<()> + Send + Sync,
{
    pub fn new(observe: O, apply: A) -> Self {
        Self { observe, apply }
    }
}

impl<O, A> ClusterApi for FnCluster<O, A>
where
    O: Fn() -> Result<Vec<ObservedResource>> + Send + Sync,
    A: Fn(&Operation) -> Result<()> + Send + Sync,
{
    fn observe(&self, _ctx: &ApplyContext) -> Result<Vec<ObservedResource>> {
        (self.observe)()
    }

    fn apply(&self, operation: &Operation, _ctx: &ApplyContext) -> Result<()> {
        (self.apply)(operation)
    }
}

/// Progress callback for plan execution
///
/// Must be `Sync`: with `jobs > 1` the callbacks fire from worker threads.
pub trait ProgressCallback: Sync {
    /// Called when a phase (apply or delete) starts
    fn on_phase_start(&self, _name: &str, _count: usize) {}

    /// Called when an operation is dispatched
    fn on_operation_start(&self, _operation: &Operation) {}

    /// Called before a retry sleep
    fn on_retry(&self, _operation: &Operation, _attempt: u32, _error: &Error, _delay: Duration) {}

    /// Called when an operation has a final outcome
    fn on_operation_complete(&self, _operation: &Operation, _outcome: &Outcome) {}
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {}

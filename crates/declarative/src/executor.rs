//! Execution engine - applies a plan with bounded parallelism
//!
//! Operations run in two phases: creates and updates first, deletes
//! second. Within a phase an operation is dispatched once everything it
//! waits on has an outcome; if one of its dependencies did not succeed it
//! is skipped instead.

use crate::context::{ApplyContext, CancelToken, ClusterApi, ProgressCallback};
use crate::error::{Error, ErrorCategory, Result};
use crate::retry::{RetryCallback, with_retry};
use crate::types::{
    Action, ExecuteOptions, FailurePolicy, Operation, OperationPlan, OperationRecord, Outcome,
    ReconcileReport,
};
use std::any::Any;
use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver};
use std::time::Duration;

type Completion = (usize, Outcome);

/// Execute a plan against the cluster
///
/// Per-operation failures never make this return an error; they are
/// recorded in the report. The only error is failing to start the worker
/// pool.
pub fn execute(
    plan: &OperationPlan,
    cluster: &dyn ClusterApi,
    opts: &ExecuteOptions,
    cancel: &CancelToken,
    progress: &dyn ProgressCallback,
) -> Result<ReconcileReport> {
    if opts.dry_run {
        return Ok(dry_run_report(plan));
    }

    let split = plan
        .operations
        .iter()
        .position(|op| op.action == Action::Delete)
        .unwrap_or(plan.len());
    let phases = [("apply", 0..split), ("delete", split..plan.len())];

    let jobs = opts.jobs.max(1);
    let pool = if jobs > 1 {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(jobs)
            .build()
            .map_err(|e| Error::Other(format!("Failed to create thread pool: {e}")))?;
        Some(pool)
    } else {
        None
    };

    let mut state = PhaseState::new(plan, opts.on_failure, progress);
    let run = |i: usize| apply_operation(&plan.operations[i], cluster, opts, cancel, progress);

    for (name, range) in phases {
        if range.is_empty() {
            continue;
        }
        log::debug!("Starting {} phase ({} operations)", name, range.len());
        progress.on_phase_start(name, range.len());

        let (tx, rx) = mpsc::channel::<Completion>();
        match &pool {
            Some(pool) => pool.in_place_scope(|scope| {
                let run = &run;
                let mut dispatch = |i: usize| {
                    let tx = tx.clone();
                    scope.spawn(move |_| {
                        // A worker must always report back or the phase never ends
                        let outcome = panic::catch_unwind(AssertUnwindSafe(|| run(i)))
                            .unwrap_or_else(|payload| panicked(&plan.operations[i], &*payload));
                        let _ = tx.send((i, outcome));
                    });
                };
                state.run_phase(range, jobs, &mut dispatch, &rx, cancel);
            }),
            None => {
                let mut dispatch = |i: usize| {
                    let _ = tx.send((i, run(i)));
                };
                state.run_phase(range, 1, &mut dispatch, &rx, cancel);
            }
        }
    }

    Ok(state.into_report())
}

/// Outcome for an operation whose worker panicked
fn panicked(operation: &Operation, payload: &(dyn Any + Send)) -> Outcome {
    let message = payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    log::error!("{} panicked: {}", operation.description(), message);
    Outcome::failed(ErrorCategory::Other, format!("panicked: {message}"), 1)
}

fn dry_run_report(plan: &OperationPlan) -> ReconcileReport {
    ReconcileReport {
        records: plan
            .operations
            .iter()
            .map(|op| OperationRecord {
                action: op.action,
                key: op.key.clone(),
                outcome: Outcome::skipped("dry run"),
            })
            .collect(),
        dry_run: true,
    }
}

/// Outcomes collected across phases
struct PhaseState<'a> {
    plan: &'a OperationPlan,
    policy: FailurePolicy,
    progress: &'a dyn ProgressCallback,
    outcomes: Vec<Option<Outcome>>,
    dispatched: Vec<bool>,
    aborted: bool,
}

impl<'a> PhaseState<'a> {
    fn new(plan: &'a OperationPlan, policy: FailurePolicy, progress: &'a dyn ProgressCallback) -> Self {
        Self {
            plan,
            policy,
            progress,
            outcomes: vec![None; plan.len()],
            dispatched: vec![false; plan.len()],
            aborted: false,
        }
    }

    fn finish(&mut self, index: usize, outcome: Outcome) {
        let op = &self.plan.operations[index];
        if matches!(outcome, Outcome::Failed { .. }) && self.policy == FailurePolicy::Abort {
            log::warn!("{} failed, not dispatching anything else", op.key);
            self.aborted = true;
        }
        self.progress.on_operation_complete(op, &outcome);
        self.outcomes[index] = Some(outcome);
    }

    /// First dependency of `index` that has settled without succeeding
    fn broken_dependency(&self, index: usize) -> Option<usize> {
        self.plan.operations[index]
            .waits_on
            .iter()
            .copied()
            .find(|&d| matches!(&self.outcomes[d], Some(o) if !o.is_success()))
    }

    fn is_ready(&self, index: usize) -> bool {
        let op = &self.plan.operations[index];
        op.waits_on
            .iter()
            .chain(&op.after)
            .all(|&d| self.outcomes[d].is_some())
    }

    fn run_phase(
        &mut self,
        range: Range<usize>,
        capacity: usize,
        dispatch: &mut dyn FnMut(usize),
        completions: &Receiver<Completion>,
        cancel: &CancelToken,
    ) {
        let mut in_flight = 0;
        loop {
            let halted = self.aborted || cancel.is_cancelled();
            // Dependencies always precede dependents, so one pass settles
            // whole chains of skips
            for i in range.clone() {
                if self.outcomes[i].is_some() || self.dispatched[i] {
                    continue;
                }
                if let Some(dep) = self.broken_dependency(i) {
                    let reason = format!("{} did not succeed", self.plan.operations[dep].key);
                    self.finish(i, Outcome::skipped(reason));
                    continue;
                }
                if halted || in_flight >= capacity || !self.is_ready(i) {
                    continue;
                }
                self.dispatched[i] = true;
                in_flight += 1;
                dispatch(i);
            }

            if in_flight == 0 {
                break;
            }
            let Ok((i, outcome)) = completions.recv() else {
                break;
            };
            in_flight -= 1;
            self.finish(i, outcome);
        }

        let reason = if cancel.is_cancelled() {
            "cancelled"
        } else if self.aborted {
            "aborted after an earlier failure"
        } else {
            "not dispatched"
        };
        for i in range {
            if self.outcomes[i].is_none() {
                self.finish(i, Outcome::skipped(reason));
            }
        }
    }

    fn into_report(self) -> ReconcileReport {
        let records = self
            .plan
            .operations
            .iter()
            .zip(self.outcomes)
            .map(|(op, outcome)| OperationRecord {
                action: op.action,
                key: op.key.clone(),
                outcome: outcome.unwrap_or_else(|| Outcome::skipped("not dispatched")),
            })
            .collect();
        ReconcileReport {
            records,
            dry_run: false,
        }
    }
}

/// Forwards retries to the progress callback and the log
struct RetryReporter<'a> {
    operation: &'a Operation,
    progress: &'a dyn ProgressCallback,
}

impl RetryCallback for RetryReporter<'_> {
    fn on_retry(&self, attempt: u32, max_attempts: u32, error: &Error, delay: Duration) {
        log::warn!(
            "{} failed (attempt {}/{}): {}. Retrying in {}ms",
            self.operation.description(),
            attempt,
            max_attempts,
            error,
            delay.as_millis()
        );
        self.progress.on_retry(self.operation, attempt, error, delay);
    }
}

/// Apply a single operation, retrying transient failures
fn apply_operation(
    operation: &Operation,
    cluster: &dyn ClusterApi,
    opts: &ExecuteOptions,
    cancel: &CancelToken,
    progress: &dyn ProgressCallback,
) -> Outcome {
    progress.on_operation_start(operation);
    let ctx = ApplyContext::new(opts.timeout);
    let reporter = RetryReporter {
        operation,
        progress,
    };

    let retried = with_retry(&opts.retry, cancel, &reporter, || {
        cluster.apply(operation, &ctx)
    });
    match retried.result {
        Ok(()) => {
            log::info!("{}", operation.description());
            Outcome::Succeeded {
                attempts: retried.attempts,
            }
        }
        Err(e) => {
            log::error!("{} failed: {}", operation.description(), e);
            Outcome::failed(e.category(), &e, retried.attempts)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{FnCluster, NoProgress};
    use crate::types::{Kind, ResourceKey, RetryConfig};
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn cm(name: &str) -> ResourceKey {
        ResourceKey::new(Kind::ConfigMap, Some("media"), name)
    }

    fn create(name: &str, waits_on: &[usize]) -> Operation {
        let mut op = Operation::create(cm(name), json!({ "metadata": { "name": name } }));
        op.waits_on = waits_on.to_vec();
        op
    }

    fn options(jobs: usize) -> ExecuteOptions {
        ExecuteOptions {
            jobs,
            retry: RetryConfig::new(3, Duration::from_millis(1), 1.0),
            ..Default::default()
        }
    }

    fn no_observe() -> Result<Vec<crate::types::ObservedResource>> {
        Ok(Vec::new())
    }

    fn outcomes(report: &ReconcileReport) -> Vec<&'static str> {
        report.records.iter().map(|r| r.outcome.label()).collect()
    }

    #[test]
    fn test_sequential_runs_in_plan_order() {
        let plan = OperationPlan {
            operations: vec![create("a", &[]), create("b", &[0]), create("c", &[1])],
        };
        let seen = Mutex::new(Vec::new());
        let cluster = FnCluster::new(no_observe, |op: &Operation| {
            seen.lock().unwrap().push(op.key.name.clone());
            Ok(())
        });
        let report = execute(&plan, &cluster, &options(1), &CancelToken::new(), &NoProgress).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(report.created(), 3);
        assert!(report.is_success());
    }

    #[test]
    fn test_failure_skips_only_dependents() {
        let plan = OperationPlan {
            operations: vec![
                create("bad", &[]),
                create("child", &[0]),
                create("grandchild", &[1]),
                create("independent", &[]),
            ],
        };
        let cluster = FnCluster::new(no_observe, |op: &Operation| {
            if op.key.name == "bad" {
                Err(Error::validation("field is immutable"))
            } else {
                Ok(())
            }
        });
        let report = execute(&plan, &cluster, &options(1), &CancelToken::new(), &NoProgress).unwrap();
        assert_eq!(outcomes(&report), vec!["failed", "skipped", "skipped", "succeeded"]);
        match &report.records[0].outcome {
            Outcome::Failed {
                category, attempts, ..
            } => {
                assert_eq!(category, "validation");
                assert_eq!(*attempts, 1);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_soft_ordering_survives_failure() {
        let mut after_bad = create("service", &[]);
        after_bad.after = vec![0];
        let plan = OperationPlan {
            operations: vec![create("bad", &[]), after_bad],
        };
        let cluster = FnCluster::new(no_observe, |op: &Operation| {
            if op.key.name == "bad" {
                Err(Error::validation("bad"))
            } else {
                Ok(())
            }
        });
        let report = execute(&plan, &cluster, &options(2), &CancelToken::new(), &NoProgress).unwrap();
        assert_eq!(outcomes(&report), vec!["failed", "succeeded"]);
    }

    #[test]
    fn test_abort_policy_stops_dispatch() {
        let plan = OperationPlan {
            operations: vec![create("bad", &[]), create("other", &[])],
        };
        let cluster = FnCluster::new(no_observe, |op: &Operation| {
            if op.key.name == "bad" {
                Err(Error::validation("bad"))
            } else {
                Ok(())
            }
        });
        let opts = ExecuteOptions {
            on_failure: FailurePolicy::Abort,
            ..options(1)
        };
        let report = execute(&plan, &cluster, &opts, &CancelToken::new(), &NoProgress).unwrap();
        assert_eq!(outcomes(&report), vec!["failed", "skipped"]);
        assert_eq!(
            report.records[1].outcome,
            Outcome::skipped("aborted after an earlier failure")
        );
    }

    #[test]
    fn test_conflict_is_retried() {
        let calls = AtomicU32::new(0);
        let plan = OperationPlan {
            operations: vec![create("a", &[])],
        };
        let cluster = FnCluster::new(no_observe, |op: &Operation| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::conflict(&op.key, "resourceVersion changed"))
            } else {
                Ok(())
            }
        });
        let report = execute(&plan, &cluster, &options(1), &CancelToken::new(), &NoProgress).unwrap();
        assert_eq!(report.records[0].outcome, Outcome::Succeeded { attempts: 2 });
    }

    #[test]
    fn test_exhausted_timeouts_fail_only_that_operation() {
        let plan = OperationPlan {
            operations: vec![create("slow", &[]), create("fast", &[])],
        };
        let cluster = FnCluster::new(no_observe, |op: &Operation| {
            if op.key.name == "slow" {
                Err(Error::Timeout {
                    what: "apply".into(),
                    after: Duration::from_millis(1),
                })
            } else {
                Ok(())
            }
        });
        let report = execute(&plan, &cluster, &options(1), &CancelToken::new(), &NoProgress).unwrap();
        assert_eq!(outcomes(&report), vec!["failed", "succeeded"]);
        assert!(matches!(
            report.records[0].outcome,
            Outcome::Failed { attempts: 3, .. }
        ));
    }

    #[test]
    fn test_panicking_worker_fails_its_operation() {
        let plan = OperationPlan {
            operations: vec![create("a", &[]), create("b", &[]), create("c", &[1])],
        };
        let cluster = FnCluster::new(no_observe, |op: &Operation| {
            assert_ne!(op.key.name, "b", "apply blew up");
            Ok(())
        });
        let report = execute(&plan, &cluster, &options(2), &CancelToken::new(), &NoProgress).unwrap();
        assert_eq!(outcomes(&report), vec!["succeeded", "failed", "skipped"]);
        let Outcome::Failed { error, .. } = &report.records[1].outcome else {
            panic!("expected failure");
        };
        assert!(error.contains("apply blew up"), "{error}");
    }

    #[test]
    fn test_cancellation_skips_remaining() {
        let cancel = CancelToken::new();
        let plan = OperationPlan {
            operations: vec![create("a", &[]), create("b", &[0]), create("c", &[1])],
        };
        let cluster = FnCluster::new(no_observe, |op: &Operation| {
            if op.key.name == "a" {
                cancel.cancel();
            }
            Ok(())
        });
        let report = execute(&plan, &cluster, &options(1), &cancel, &NoProgress).unwrap();
        assert_eq!(outcomes(&report), vec!["succeeded", "skipped", "skipped"]);
        assert_eq!(report.records[2].outcome, Outcome::skipped("cancelled"));
    }

    #[test]
    fn test_parallel_respects_dependencies() {
        // Two chains of three plus a fan-in at the end
        let plan = OperationPlan {
            operations: vec![
                create("a1", &[]),
                create("b1", &[]),
                create("a2", &[0]),
                create("b2", &[1]),
                create("a3", &[2]),
                create("b3", &[3]),
                create("join", &[4, 5]),
            ],
        };
        let done = Mutex::new(HashSet::new());
        let cluster = FnCluster::new(no_observe, |op: &Operation| {
            let index = plan
                .operations
                .iter()
                .position(|o| o.key == op.key)
                .unwrap();
            {
                let done = done.lock().unwrap();
                for dep in &plan.operations[index].waits_on {
                    assert!(done.contains(dep), "{} ran before {}", op.key, dep);
                }
            }
            std::thread::sleep(Duration::from_millis(5));
            done.lock().unwrap().insert(index);
            Ok(())
        });
        let report = execute(&plan, &cluster, &options(4), &CancelToken::new(), &NoProgress).unwrap();
        assert_eq!(report.created(), 7);
        assert_eq!(report.records.len(), 7);
    }

    #[test]
    fn test_deletes_run_after_applies() {
        let mut plan = OperationPlan {
            operations: vec![create("new", &[])],
        };
        plan.operations.push(Operation::delete(cm("old")));
        let seen = Mutex::new(Vec::new());
        let cluster = FnCluster::new(no_observe, |op: &Operation| {
            seen.lock().unwrap().push(op.description());
            Ok(())
        });
        let report = execute(&plan, &cluster, &options(4), &CancelToken::new(), &NoProgress).unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["create ConfigMap/media/new", "delete ConfigMap/media/old"]
        );
        assert_eq!(report.deleted(), 1);
    }

    #[test]
    fn test_dry_run_applies_nothing() {
        let plan = OperationPlan {
            operations: vec![create("a", &[])],
        };
        let cluster = FnCluster::new(no_observe, |_op: &Operation| -> Result<()> {
            panic!("dry run must not apply")
        });
        let opts = ExecuteOptions {
            dry_run: true,
            ..options(1)
        };
        let report = execute(&plan, &cluster, &opts, &CancelToken::new(), &NoProgress).unwrap();
        assert!(report.dry_run);
        assert!(report.is_success());
        assert_eq!(report.created(), 0);
    }
}

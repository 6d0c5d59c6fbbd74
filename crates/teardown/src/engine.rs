//! Teardown engine - runs targets stage by stage, never stopping early
//!
//! Targets are stably sorted by [`Stage`]. Each target resolves to zero or
//! more concrete host actions; every action is attempted regardless of how
//! the previous ones went, and an absent target counts as removed.

use crate::backend::HostBackend;
use crate::error::Result;
use crate::types::{
    ActionOutcome, ActionRecord, HostAction, Stage, TeardownOptions, TeardownReport,
    TeardownTarget,
};
use declarative::{ApplyContext, CancelToken};
use regex::Regex;
use std::path::PathBuf;

/// Progress callback for teardown
pub trait TeardownProgress {
    /// Called when a stage with at least one target starts
    fn on_stage_start(&self, _stage: Stage, _targets: usize) {}

    /// Called after each action has an outcome
    fn on_action_complete(&self, _record: &ActionRecord) {}
}

/// No-op progress callback
pub struct NoProgress;

impl TeardownProgress for NoProgress {}

/// Remove every target from the host
pub fn teardown(
    targets: &[TeardownTarget],
    backend: &dyn HostBackend,
    opts: &TeardownOptions,
    cancel: &CancelToken,
    progress: &dyn TeardownProgress,
) -> TeardownReport {
    let mut ordered: Vec<&TeardownTarget> = targets.iter().collect();
    ordered.sort_by_key(|t| t.stage());

    let ctx = ApplyContext {
        dry_run: opts.dry_run,
        ..ApplyContext::new(opts.timeout)
    };
    let mut report = TeardownReport {
        records: Vec::new(),
        dry_run: opts.dry_run,
    };

    let mut current_stage = None;
    for target in ordered {
        let stage = target.stage();
        if current_stage != Some(stage) {
            current_stage = Some(stage);
            let count = targets.iter().filter(|t| t.stage() == stage).count();
            log::debug!("Teardown stage: {}", stage.label());
            progress.on_stage_start(stage, count);
        }

        let target_name = target.to_string();
        let mut push = |action: String, outcome: ActionOutcome| {
            let record = ActionRecord {
                action,
                target: target_name.clone(),
                outcome,
            };
            progress.on_action_complete(&record);
            report.records.push(record);
        };

        if cancel.is_cancelled() {
            push(
                target_name.clone(),
                ActionOutcome::Skipped {
                    reason: "cancelled".into(),
                },
            );
            continue;
        }

        let actions = match expand(target, backend, &ctx) {
            Ok(actions) => actions,
            Err(e) if e.is_absence() => {
                push(target_name.clone(), ActionOutcome::succeeded("nothing to remove"));
                continue;
            }
            Err(e) => {
                log::warn!("{target_name}: discovery failed: {e}");
                push(
                    target_name.clone(),
                    ActionOutcome::Failed {
                        error: e.to_string(),
                    },
                );
                continue;
            }
        };

        if actions.is_empty() {
            push(target_name.clone(), ActionOutcome::succeeded("nothing matched"));
            continue;
        }

        for action in actions {
            let label = action.to_string();
            let outcome = if cancel.is_cancelled() {
                ActionOutcome::Skipped {
                    reason: "cancelled".into(),
                }
            } else {
                run_action(&action, backend, &ctx)
            };
            push(label, outcome);
        }
    }

    log::info!(
        "Teardown finished: {} succeeded, {} failed, {} skipped",
        report.succeeded(),
        report.failed(),
        report.skipped()
    );
    report
}

/// Resolve a target to concrete actions against the live host
pub fn expand(
    target: &TeardownTarget,
    backend: &dyn HostBackend,
    ctx: &ApplyContext,
) -> Result<Vec<HostAction>> {
    let actions = match target {
        TeardownTarget::StopService { name } => vec![HostAction::StopService(name.clone())],
        TeardownTarget::KillProcesses { pattern } => {
            vec![HostAction::KillProcesses(pattern.clone())]
        }
        TeardownTarget::DeleteInterface { name } => {
            vec![HostAction::DeleteInterface(name.clone())]
        }
        TeardownTarget::DeleteInterfaces { pattern } => {
            let regex = Regex::new(pattern)?;
            backend
                .list_interfaces(ctx)?
                .into_iter()
                .filter(|name| regex.is_match(name))
                .map(HostAction::DeleteInterface)
                .collect()
        }
        TeardownTarget::DeleteNetns { prefix } => backend
            .list_netns(ctx)?
            .into_iter()
            .filter(|name| name.starts_with(prefix.as_str()))
            .map(HostAction::DeleteNetns)
            .collect(),
        TeardownTarget::Unmount { prefix } => {
            let mut mounts: Vec<PathBuf> = backend
                .list_mounts(ctx)?
                .into_iter()
                .filter(|m| m.starts_with(prefix))
                .collect();
            // Deepest first; a mount can be listed twice when stacked
            mounts.sort_by(|a, b| {
                b.components()
                    .count()
                    .cmp(&a.components().count())
                    .then_with(|| a.cmp(b))
            });
            mounts.dedup();
            mounts.into_iter().map(HostAction::Unmount).collect()
        }
        TeardownTarget::RemovePath { path } => vec![HostAction::RemovePath(path.clone())],
        TeardownTarget::RestartService { name } => {
            vec![HostAction::RestartService(name.clone())]
        }
    };
    log::debug!("{} -> {} action(s)", target, actions.len());
    Ok(actions)
}

fn run_action(action: &HostAction, backend: &dyn HostBackend, ctx: &ApplyContext) -> ActionOutcome {
    let result: Result<Option<String>> = match action {
        HostAction::StopService(name) => backend.stop_service(name, ctx).map(|()| None),
        HostAction::KillProcesses(pattern) => backend.kill_processes(pattern, ctx).map(|n| match n {
            0 => Some("no matching processes".to_string()),
            n => Some(format!("{n} process(es) killed")),
        }),
        HostAction::DeleteInterface(name) => backend.delete_interface(name, ctx).map(|()| None),
        HostAction::DeleteNetns(name) => backend.delete_netns(name, ctx).map(|()| None),
        HostAction::Unmount(path) => backend.unmount(path, ctx).map(|()| None),
        HostAction::RemovePath(path) => backend.remove_path(path, ctx).map(|()| None),
        HostAction::RestartService(name) => backend.restart_service(name, ctx).map(|()| None),
    };

    match result {
        Ok(detail) if ctx.dry_run => ActionOutcome::Skipped {
            reason: detail.map_or_else(|| "dry run".to_string(), |d| format!("dry run ({d})")),
        },
        Ok(detail) => {
            log::info!("{action}");
            ActionOutcome::Succeeded { detail }
        }
        Err(e) if e.is_absence() => {
            log::debug!("{action}: already absent");
            ActionOutcome::succeeded("already absent")
        }
        Err(e) => {
            log::warn!("{action}: {e} ({})", e.category().advice());
            ActionOutcome::Failed {
                error: e.to_string(),
            }
        }
    }
}

//! `stackctl reconcile` - make the cluster match a manifest directory

use anyhow::{Context as _, Result, anyhow};
use colored::Colorize;
use declarative::{
    Error, ManifestStore, Outcome, ReconcileReport, Reconciler, ResourceDocument,
};
use std::path::Path;
use std::time::Instant;

use super::Exit;
use crate::Context;
use crate::cli::ReconcileArgs;
use crate::lock::RunLock;
use crate::paths;
use crate::progress::{self, ReconcileProgress};
use crate::state::{self, RunSummary};
use crate::ui;

pub fn run(ctx: &Context, args: ReconcileArgs) -> Result<Exit> {
    let config = super::load_config(ctx)?;
    let (mut options, cluster) = super::cluster_from(&config, &args.cluster);
    if let Some(jobs) = args.jobs {
        options.jobs = jobs.max(1);
    }
    if let Some(policy) = args.on_failure {
        options.on_failure = policy.into();
    }
    options.dry_run = args.dry_run;
    let scope = super::scope_from(&config, args.scope)?;

    let desired = load_manifests(&args.root, config.reconcile.max_document_bytes)?;

    // Dry runs change nothing, so they don't need the cross-process lock
    let _lock = if args.dry_run {
        None
    } else {
        Some(RunLock::acquire(&paths::state_dir()?, &scope)?)
    };

    let cancel = super::cancel_token(args.max_duration);

    if !ctx.quiet {
        ui::header(&format!(
            "Reconciling {} (scope '{}'{})",
            args.root.display(),
            scope,
            if args.dry_run { ", dry run" } else { "" }
        ));
    }

    let progress = ReconcileProgress::new(progress::visible(ctx.quiet));
    let started = Instant::now();
    let result = Reconciler::new(&cluster, options)
        .with_scope(scope.as_str())
        .reconcile(desired, &cancel, &progress);
    progress.finish();
    let report =
        result.with_context(|| format!("Reconcile of {} failed", args.root.display()))?;

    print_report(&report);
    state::remember_reconcile(
        &scope,
        RunSummary::from_reconcile(&args.root.display().to_string(), &report, started.elapsed()),
    );
    Ok(Exit::from_success(report.is_success()))
}

/// Load the manifest tree, listing every problem on its own line
pub fn load_manifests(root: &Path, max_document_bytes: usize) -> Result<Vec<ResourceDocument>> {
    match ManifestStore::new(root)
        .with_max_document_bytes(max_document_bytes)
        .load()
    {
        Ok(documents) => Ok(documents),
        Err(Error::Parse { issues }) => {
            let lines: Vec<String> = issues.iter().map(|i| format!("  {i}")).collect();
            Err(anyhow!(
                "{} in {}:\n{}",
                ui::plural(issues.len(), "manifest problem"),
                root.display(),
                lines.join("\n")
            ))
        }
        Err(e) => Err(e).with_context(|| format!("Could not load {}", root.display())),
    }
}

fn print_report(report: &ReconcileReport) {
    if !report.records.is_empty() {
        ui::section("Operations");
    }
    for record in &report.records {
        let subject = format!("{} {}", record.action, record.key);
        match &record.outcome {
            Outcome::Succeeded { attempts } => {
                let note = (*attempts > 1).then(|| format!("{attempts} attempts"));
                ui::item(&"✓".green().to_string(), &subject, note.as_deref());
            }
            Outcome::Failed {
                category,
                error,
                attempts,
            } => {
                let note = format!("{category}, {}: {error}", ui::plural(*attempts as usize, "attempt"));
                ui::item(&"✗".red().to_string(), &subject, Some(&note));
            }
            Outcome::Skipped { reason } => {
                ui::item(&"-".yellow().to_string(), &subject, Some(reason));
            }
        }
    }
    println!();

    let line = summary_line(report);
    if report.records.is_empty() || report.dry_run || report.is_success() {
        ui::success(&line);
    } else {
        ui::warn(&line);
    }
}

/// One-line outcome of a reconcile
pub fn summary_line(report: &ReconcileReport) -> String {
    if report.records.is_empty() {
        return "Cluster already matches desired state".to_string();
    }
    if report.dry_run {
        return format!(
            "Dry run: {} planned, nothing applied",
            ui::plural(report.records.len(), "operation")
        );
    }
    let mut line = format!(
        "{} created, {} updated, {} deleted",
        report.created(),
        report.updated(),
        report.deleted()
    );
    if !report.is_success() {
        line.push_str(&format!(
            ", {} failed, {} skipped",
            report.failed(),
            report.skipped()
        ));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use declarative::{Action, ErrorCategory, Kind, OperationRecord, ResourceKey};
    use std::fs;
    use tempfile::TempDir;

    fn record(action: Action, name: &str, outcome: Outcome) -> OperationRecord {
        OperationRecord {
            action,
            key: ResourceKey::new(Kind::ConfigMap, Some("media"), name),
            outcome,
        }
    }

    #[test]
    fn test_summary_line_converged() {
        let report = ReconcileReport::default();
        assert_eq!(summary_line(&report), "Cluster already matches desired state");
    }

    #[test]
    fn test_summary_line_success() {
        let report = ReconcileReport {
            records: vec![
                record(Action::Create, "a", Outcome::Succeeded { attempts: 1 }),
                record(Action::Delete, "b", Outcome::Succeeded { attempts: 1 }),
            ],
            dry_run: false,
        };
        assert_eq!(summary_line(&report), "1 created, 0 updated, 1 deleted");
    }

    #[test]
    fn test_summary_line_partial_failure() {
        let report = ReconcileReport {
            records: vec![
                record(Action::Create, "a", Outcome::Succeeded { attempts: 1 }),
                record(
                    Action::Update,
                    "b",
                    Outcome::failed(ErrorCategory::Validation, "rejected: bad data", 1),
                ),
                record(Action::Create, "c", Outcome::skipped("cancelled")),
            ],
            dry_run: false,
        };
        assert_eq!(
            summary_line(&report),
            "1 created, 0 updated, 0 deleted, 1 failed, 1 skipped"
        );
    }

    #[test]
    fn test_summary_line_dry_run() {
        let report = ReconcileReport {
            records: vec![record(Action::Create, "a", Outcome::skipped("dry run"))],
            dry_run: true,
        };
        assert_eq!(summary_line(&report), "Dry run: 1 operation planned, nothing applied");
    }

    #[test]
    fn test_load_manifests_lists_every_problem() {
        let dir = TempDir::new().unwrap();
        let configs = dir.path().join("configs");
        fs::create_dir_all(&configs).unwrap();
        fs::write(configs.join("a.yaml"), "kind: ConfigMap\nmetadata:\n  name: a\n").unwrap();
        fs::write(configs.join("b.yaml"), "apiVersion: v1\nkind: ConfigMap\n").unwrap();

        let err = load_manifests(dir.path(), 1_000_000).unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("2 manifest problems in "), "{message}");
        assert!(message.contains("missing apiVersion"));
        assert!(message.contains("missing metadata"));
    }
}

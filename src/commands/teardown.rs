//! `stackctl teardown` - remove k3s residue from this host

use anyhow::{Context as _, Result, bail};
use colored::Colorize;
use std::time::{Duration, Instant};
use teardown::{
    ActionOutcome, HostBackend, TeardownOptions, TeardownReport, TeardownTarget, backend,
};

use super::Exit;
use crate::Context;
use crate::cli::TeardownArgs;
use crate::config::SetEntry;
use crate::progress::{self, TeardownSpinner};
use crate::state::{self, RunSummary};
use crate::ui;

pub fn run(ctx: &Context, args: TeardownArgs) -> Result<Exit> {
    let config = super::load_config(ctx)?;
    let set = config.target_set(&args.set)?;
    let mut options = config.teardown_options();
    options.dry_run = args.dry_run;
    if let Some(secs) = args.timeout {
        options.timeout = Duration::from_secs(secs.max(1));
    }

    if !args.dry_run {
        if !is_root() {
            ui::warn("Not running as root; most actions will fail with permission errors");
        }
        if !args.yes && !confirm(&set)? {
            ui::info("Teardown cancelled");
            return Ok(Exit::Success);
        }
    }

    if !ctx.quiet {
        ui::header(&format!(
            "Tearing down '{}' ({}{})",
            set.id,
            ui::plural(set.targets.len(), "target"),
            if args.dry_run { ", dry run" } else { "" }
        ));
    }

    let started = Instant::now();
    let report = execute(
        &set.targets,
        &backend::default_backend(),
        &options,
        args.max_duration,
        ctx.quiet,
    );

    print_report(&report);
    state::remember_teardown(&set.id, RunSummary::from_teardown(&set.id, &report, started.elapsed()));

    // Absence already counts as success; skips outside a dry run mean cancelled
    Ok(Exit::from_success(report.is_success()))
}

/// Run the targets until done, interrupted or out of time
fn execute(
    targets: &[TeardownTarget],
    backend: &dyn HostBackend,
    options: &TeardownOptions,
    max_duration: Option<u64>,
    quiet: bool,
) -> TeardownReport {
    let cancel = super::cancel_token(max_duration);
    let spinner = TeardownSpinner::new(progress::visible(quiet));
    let report = teardown::teardown(targets, backend, options, &cancel, &spinner);
    spinner.finish();
    report
}

fn confirm(set: &SetEntry) -> Result<bool> {
    if !console::Term::stderr().is_term() {
        bail!("refusing to tear down '{}' without --yes when not interactive", set.id);
    }
    dialoguer::Confirm::new()
        .with_prompt(format!(
            "Remove '{}' from this host ({})?",
            set.id,
            ui::plural(set.targets.len(), "target")
        ))
        .default(false)
        .interact()
        .context("Failed to read confirmation")
}

#[cfg(unix)]
fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn is_root() -> bool {
    false
}

fn print_report(report: &TeardownReport) {
    ui::section("Actions");
    for record in &report.records {
        match &record.outcome {
            ActionOutcome::Succeeded { detail } => {
                ui::item(&"✓".green().to_string(), &record.action, detail.as_deref());
            }
            ActionOutcome::Failed { error } => {
                ui::item(&"✗".red().to_string(), &record.action, Some(error));
            }
            ActionOutcome::Skipped { reason } => {
                ui::item(&"-".yellow().to_string(), &record.action, Some(reason));
            }
        }
    }
    println!();

    let line = summary_line(report);
    if report.failed() == 0 {
        ui::success(&line);
    } else {
        ui::warn(&line);
    }
}

/// One-line outcome of a teardown
pub fn summary_line(report: &TeardownReport) -> String {
    if report.dry_run {
        return format!(
            "Dry run: {} would run, nothing changed",
            ui::plural(report.records.len(), "action")
        );
    }
    let mut line = format!("{} succeeded", ui::plural(report.succeeded(), "action"));
    if report.failed() > 0 {
        line.push_str(&format!(", {} failed", report.failed()));
    }
    if report.skipped() > 0 {
        line.push_str(&format!(", {} skipped", report.skipped()));
    }
    line
}

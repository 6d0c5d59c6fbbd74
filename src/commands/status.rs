//! `stackctl status` - last recorded runs

use anyhow::Result;
use chrono::Local;
use colored::Colorize;
use std::collections::BTreeMap;

use super::Exit;
use crate::Context;
use crate::paths;
use crate::state::{RunSummary, StackState};
use crate::ui;

pub fn run(ctx: &Context) -> Result<Exit> {
    let state = StackState::load()?;

    ui::header("stackctl status");
    match &ctx.config {
        Some(path) => ui::kv("Config", &path.display().to_string()),
        None => ui::kv("Config", &paths::config_file()?.display().to_string()),
    }
    ui::kv("State", &paths::state_dir()?.display().to_string());

    show_runs("Reconcile", "scope", &state.reconcile);
    show_runs("Teardown", "set", &state.teardown);
    println!();
    Ok(Exit::Success)
}

fn show_runs(title: &str, noun: &str, runs: &BTreeMap<String, RunSummary>) {
    ui::section(title);
    if runs.is_empty() {
        ui::dim("no runs recorded");
        return;
    }
    for (name, run) in runs {
        let status = match run.status_label() {
            "ok" => "ok".green(),
            "failed" => "failed".red(),
            other => other.yellow(),
        };
        println!("  {} {} {}", noun.dimmed(), name.bold(), status);
        ui::kv("subject", &run.subject);
        ui::kv(
            "finished",
            &run.finished_at
                .with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
        );
        ui::kv("outcome", &outcome(run));
    }
}

fn outcome(run: &RunSummary) -> String {
    format!(
        "{} succeeded, {} failed, {} skipped in {:.1}s",
        run.succeeded,
        run.failed,
        run.skipped,
        run.duration_ms as f64 / 1000.0
    )
}

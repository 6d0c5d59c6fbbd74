//! Terminal progress for reconcile and teardown runs.
//!
//! Bars are hidden when stdout is not a terminal or `-q` is given, so
//! piped output only carries the final report.

use colored::Colorize;
use declarative::{Error, Operation, Outcome, ProgressCallback};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use teardown::{ActionRecord, Stage, TeardownProgress};

use crate::ui;

const MESSAGE_WIDTH: usize = 48;

fn new_bar(visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(0);
    if let Ok(style) =
        ProgressStyle::default_bar().template("{spinner:.green} {prefix:.bold} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
    {
        pb.set_style(style.progress_chars("=>-"));
    }
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

/// Whether progress should be drawn
pub fn visible(quiet: bool) -> bool {
    !quiet && console::Term::stdout().is_term()
}

/// Progress bar for plan execution
pub struct ReconcileProgress {
    pb: ProgressBar,
}

impl ReconcileProgress {
    pub fn new(visible: bool) -> Self {
        Self { pb: new_bar(visible) }
    }

    pub fn finish(&self) {
        self.pb.finish_and_clear();
    }
}

impl ProgressCallback for ReconcileProgress {
    fn on_phase_start(&self, name: &str, count: usize) {
        self.pb.set_prefix(name.to_string());
        self.pb.set_position(0);
        self.pb.set_length(count as u64);
    }

    fn on_operation_start(&self, operation: &Operation) {
        self.pb
            .set_message(ui::truncate(&operation.description(), MESSAGE_WIDTH));
    }

    fn on_retry(&self, operation: &Operation, attempt: u32, error: &Error, delay: Duration) {
        self.pb.suspend(|| {
            println!(
                "  {} {} (attempt {} failed: {}; retrying in {:.1}s)",
                "↻".yellow(),
                operation.description(),
                attempt,
                error,
                delay.as_secs_f64()
            );
        });
    }

    fn on_operation_complete(&self, _operation: &Operation, _outcome: &Outcome) {
        self.pb.inc(1);
    }
}

/// Spinner for teardown stages
pub struct TeardownSpinner {
    pb: ProgressBar,
}

impl TeardownSpinner {
    pub fn new(visible: bool) -> Self {
        let pb = if visible {
            let pb = ProgressBar::new_spinner();
            if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {prefix:.bold} {msg}") {
                pb.set_style(style);
            }
            pb.enable_steady_tick(Duration::from_millis(120));
            pb
        } else {
            ProgressBar::hidden()
        };
        Self { pb }
    }

    pub fn finish(&self) {
        self.pb.finish_and_clear();
    }
}

impl TeardownProgress for TeardownSpinner {
    fn on_stage_start(&self, stage: Stage, targets: usize) {
        self.pb.set_prefix(stage.label());
        self.pb.set_message(ui::plural(targets, "target"));
    }

    fn on_action_complete(&self, record: &ActionRecord) {
        self.pb
            .set_message(ui::truncate(&record.action, MESSAGE_WIDTH));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use declarative::{Kind, ResourceKey};
    use serde_json::json;

    #[test]
    fn test_hidden_bar_counts_operations() {
        let progress = ReconcileProgress::new(false);
        let op = Operation::create(
            ResourceKey::new(Kind::Namespace, None, "media"),
            json!({ "kind": "Namespace" }),
        );
        progress.on_phase_start("apply", 2);
        progress.on_operation_start(&op);
        progress.on_operation_complete(&op, &Outcome::Succeeded { attempts: 1 });
        assert_eq!(progress.pb.position(), 1);
        assert_eq!(progress.pb.length(), Some(2));
        progress.finish();
    }
}

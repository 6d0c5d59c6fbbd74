//! `stackctl plan` - show what a reconcile would do

use anyhow::{Context as _, Result};
use colored::Colorize;
use declarative::{
    Action, CancelToken, Kind, ObservedResource, Operation, OperationPlan, Reconciler, ResourceKey,
    field_changes, graph, planner, project, strip_server_fields,
};
use serde_json::Value;
use std::collections::HashMap;

use super::Exit;
use super::reconcile::load_manifests;
use crate::Context;
use crate::cli::PlanArgs;
use crate::ui;

pub fn run(ctx: &Context, args: PlanArgs) -> Result<Exit> {
    let config = super::load_config(ctx)?;
    let (options, cluster) = super::cluster_from(&config, &args.cluster);
    let scope = super::scope_from(&config, args.scope)?;

    let desired = load_manifests(&args.root, config.reconcile.max_document_bytes)?;
    let ordered = graph::order(desired).context("Cannot order manifests")?;
    let kinds: Vec<Kind> = ordered.iter().map(|d| d.key.kind.clone()).collect();
    let observed = Reconciler::new(&cluster, options.clone())
        .with_scope(scope.as_str())
        .observe(kinds, &CancelToken::new())
        .context("Could not observe the cluster")?;
    let plan = planner::plan(&ordered, &observed, &options.manager, &scope)?;

    if plan.is_empty() {
        ui::success(&format!(
            "No changes: the cluster matches {}",
            args.root.display()
        ));
        return Ok(Exit::Success);
    }

    if !ctx.quiet {
        ui::header(&format!("Plan for {}", args.root.display()));
    }
    let live: HashMap<&ResourceKey, &ObservedResource> =
        observed.iter().map(|o| (&o.key, o)).collect();

    for (index, op) in plan.operations.iter().enumerate() {
        let before = live.get(&op.key).map(|o| &o.payload);
        println!("{}", describe(index, op, before));
        if args.diff
            && op.action == Action::Update
            && let (Some(desired), Some(before)) = (&op.payload, before)
        {
            print_diff(desired, before);
        }
    }

    println!();
    ui::info(&totals(&plan));
    Ok(Exit::Success)
}

fn symbol(action: Action) -> String {
    match action {
        Action::Create => "+".green().to_string(),
        Action::Update => "~".yellow().to_string(),
        Action::Delete => "-".red().to_string(),
    }
}

/// One plan line: position, action and key, then what it waits for
fn describe(index: usize, op: &Operation, before: Option<&Value>) -> String {
    let mut line = format!("  {:>3}. {} {} {}", index + 1, symbol(op.action), op.action, op.key);
    if op.action == Action::Update
        && let (Some(desired), Some(before)) = (&op.payload, before)
    {
        let changes = field_changes(desired, &current_view(desired, before));
        line.push_str(&format!(
            " {}",
            format!("({} to add, {} to change)", changes.adds, changes.updates).dimmed()
        ));
    }
    if !op.waits_on.is_empty() {
        let deps: Vec<String> = op.waits_on.iter().map(|i| format!("#{}", i + 1)).collect();
        line.push_str(&format!(" {}", format!("needs {}", deps.join(", ")).dimmed()));
    }
    line
}

/// The live payload restricted to what the manifest sets
fn current_view(desired: &Value, before: &Value) -> Value {
    project(&strip_server_fields(before.clone()), desired)
}

fn print_diff(desired: &Value, before: &Value) {
    let old = serde_yaml::to_string(&current_view(desired, before)).unwrap_or_default();
    let new = serde_yaml::to_string(desired).unwrap_or_default();
    for line in diff_lines(&old, &new) {
        let colored = match line.chars().next() {
            Some('-') => line.red(),
            Some('+') => line.green(),
            _ => line.normal(),
        };
        println!("        {colored}");
    }
}

/// Changed lines of a YAML diff, prefixed with `-` or `+`
fn diff_lines(old: &str, new: &str) -> Vec<String> {
    let diff = similar::TextDiff::from_lines(old, new);
    diff.iter_all_changes()
        .filter_map(|change| {
            let text = change.value().trim_end();
            match change.tag() {
                similar::ChangeTag::Delete => Some(format!("- {text}")),
                similar::ChangeTag::Insert => Some(format!("+ {text}")),
                similar::ChangeTag::Equal => None,
            }
        })
        .collect()
}

fn totals(plan: &OperationPlan) -> String {
    format!(
        "Plan: {} to create, {} to update, {} to delete",
        plan.count(Action::Create),
        plan.count(Action::Update),
        plan.count(Action::Delete)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_diff_lines_show_only_changes() {
        let old = "data:\n  level: info\nkind: ConfigMap\n";
        let new = "data:\n  level: debug\nkind: ConfigMap\n";
        assert_eq!(
            diff_lines(old, new),
            vec!["-   level: info".to_string(), "+   level: debug".to_string()]
        );
    }

    #[test]
    fn test_current_view_ignores_server_fields() {
        let desired = json!({ "metadata": { "name": "cfg" }, "data": { "level": "debug" } });
        let before = json!({
            "metadata": { "name": "cfg", "uid": "u-1", "resourceVersion": "9" },
            "data": { "level": "info", "extra": "x" },
            "status": {}
        });
        assert_eq!(
            current_view(&desired, &before),
            json!({ "metadata": { "name": "cfg" }, "data": { "level": "info" } })
        );
    }

    #[test]
    fn test_describe_update_counts_fields() {
        colored::control::set_override(false);
        let key = ResourceKey::new(Kind::ConfigMap, Some("media"), "cfg");
        let desired = json!({ "metadata": { "name": "cfg" }, "data": { "level": "debug", "new": "1" } });
        let before = json!({ "metadata": { "name": "cfg" }, "data": { "level": "info" } });
        let mut op = Operation::update(key, desired);
        op.waits_on = vec![0];
        assert_eq!(
            describe(1, &op, Some(&before)),
            "    2. ~ update ConfigMap/media/cfg (1 to add, 1 to change) needs #1"
        );
    }

    #[test]
    fn test_totals() {
        let plan = OperationPlan {
            operations: vec![
                Operation::create(ResourceKey::new(Kind::Namespace, None, "media"), json!({})),
                Operation::delete(ResourceKey::new(Kind::Service, Some("infra"), "dns")),
            ],
        };
        assert_eq!(totals(&plan), "Plan: 1 to create, 0 to update, 1 to delete");
    }
}

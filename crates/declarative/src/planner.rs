//! Execution planner - turns desired and observed state into an operation plan

use crate::diff;
use crate::error::Result;
use crate::graph;
use crate::types::{
    Action, Kind, MANAGED_BY_LABEL, ObservedResource, Operation, OperationPlan, ResourceDocument,
    ResourceKey, SCOPE_LABEL,
};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};

/// Set the management label on a payload
pub fn stamp_manager(payload: &mut Value, manager: &str) {
    set_label(payload, MANAGED_BY_LABEL, manager);
}

/// Set the management and scope labels on a payload
pub fn stamp_owner(payload: &mut Value, manager: &str, scope: &str) {
    set_label(payload, MANAGED_BY_LABEL, manager);
    set_label(payload, SCOPE_LABEL, scope);
}

fn set_label(payload: &mut Value, name: &str, value: &str) {
    let Some(obj) = payload.as_object_mut() else {
        return;
    };
    let meta = obj
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()));
    let Some(meta) = meta.as_object_mut() else {
        return;
    };
    let labels = meta
        .entry("labels")
        .or_insert_with(|| Value::Object(Map::new()));
    if let Some(labels) = labels.as_object_mut() {
        labels.insert(name.to_string(), Value::String(value.to_string()));
    }
}

/// Scope label of a payload, if any
pub fn scope_of(payload: &Value) -> Option<&str> {
    payload
        .pointer("/metadata/labels")
        .and_then(|labels| labels.get(SCOPE_LABEL))
        .and_then(Value::as_str)
}

/// Whether a payload carries the management label for `manager`
pub fn is_managed_by(payload: &Value, manager: &str) -> bool {
    payload
        .pointer("/metadata/labels")
        .and_then(|labels| labels.get(MANAGED_BY_LABEL))
        .and_then(Value::as_str)
        == Some(manager)
}

/// Compute the operations needed to move `observed` to `desired`
///
/// `desired` must already be in dependency order (see [`graph::order`]).
/// Create/update operations follow that order and stamp `manager` and
/// `scope` on their payloads. Deletes come last, dependents first, and
/// only touch resources of `manager` labelled with this `scope` that are
/// missing from `desired`.
pub fn plan(
    desired: &[ResourceDocument],
    observed: &[ObservedResource],
    manager: &str,
    scope: &str,
) -> Result<OperationPlan> {
    let live: HashMap<&ResourceKey, &ObservedResource> =
        observed.iter().map(|o| (&o.key, o)).collect();

    let mut operations = Vec::new();
    let mut apply_deps = Vec::new();
    for doc in desired {
        let mut payload = doc.payload.clone();
        stamp_owner(&mut payload, manager, scope);
        let op = match live.get(&doc.key) {
            None => Operation::create(doc.key.clone(), payload),
            Some(current) if diff::needs_update(&payload, &current.payload) => {
                Operation::update(doc.key.clone(), payload)
            }
            Some(_) => {
                log::debug!("{} is up to date", doc.key);
                continue;
            }
        };
        operations.push(op);
        apply_deps.push(doc.depends_on.clone());
    }
    link_forward(&mut operations, &apply_deps);

    let wanted: BTreeSet<&ResourceKey> = desired.iter().map(|d| &d.key).collect();
    let mut orphans: Vec<ResourceDocument> = observed
        .iter()
        .filter(|o| {
            o.managed && scope_of(&o.payload) == Some(scope) && !wanted.contains(&o.key)
        })
        .map(|o| ResourceDocument::new(o.key.clone(), "", o.payload.clone()))
        .collect();
    graph::link(&mut orphans);
    let mut orphans = graph::order(orphans)?;
    orphans.reverse();

    let offset = operations.len();
    let mut deletes: Vec<Operation> = orphans
        .iter()
        .map(|o| Operation::delete(o.key.clone()))
        .collect();
    link_reverse(&mut deletes, &orphans, offset);
    operations.extend(deletes);

    let plan = OperationPlan { operations };
    log::info!(
        "Plan: {} to create, {} to update, {} to delete",
        plan.count(Action::Create),
        plan.count(Action::Update),
        plan.count(Action::Delete)
    );
    Ok(plan)
}

/// Whether `earlier` must finish before `later` under the kind-priority table
fn precedes_by_priority(earlier: &ResourceKey, later: &ResourceKey) -> bool {
    let scoped = earlier.kind == Kind::Namespace
        || later.kind == Kind::Namespace
        || earlier.namespace == later.namespace;
    scoped && earlier.kind.priority() < later.kind.priority()
}

fn link_forward(operations: &mut [Operation], deps: &[BTreeSet<ResourceKey>]) {
    for i in 0..operations.len() {
        let (mut waits, mut after) = (Vec::new(), Vec::new());
        for j in 0..i {
            if deps[i].contains(&operations[j].key) {
                waits.push(j);
            } else if precedes_by_priority(&operations[j].key, &operations[i].key) {
                after.push(j);
            }
        }
        operations[i].waits_on = waits;
        operations[i].after = after;
    }
}

fn link_reverse(deletes: &mut [Operation], docs: &[ResourceDocument], offset: usize) {
    for i in 0..deletes.len() {
        let (mut waits, mut after) = (Vec::new(), Vec::new());
        for j in 0..i {
            if docs[j].depends_on.contains(&docs[i].key) {
                waits.push(j + offset);
            } else if precedes_by_priority(&docs[i].key, &docs[j].key) {
                after.push(j + offset);
            }
        }
        deletes[i].waits_on = waits;
        deletes[i].after = after;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(kind: Kind, ns: Option<&str>, name: &str) -> ResourceKey {
        ResourceKey::new(kind, ns, name)
    }

    fn document(kind: Kind, ns: Option<&str>, name: &str) -> ResourceDocument {
        let mut meta = json!({ "name": name });
        if let Some(ns) = ns {
            meta["namespace"] = json!(ns);
        }
        ResourceDocument::new(
            key(kind.clone(), ns, name),
            "v1",
            json!({ "kind": kind.as_str(), "metadata": meta, "spec": { "v": 1 } }),
        )
    }

    const SCOPE: &str = "default";

    fn observed_from(doc: &ResourceDocument, managed: bool) -> ObservedResource {
        let mut payload = doc.payload.clone();
        if managed {
            stamp_owner(&mut payload, "stackctl", SCOPE);
        }
        ObservedResource {
            key: doc.key.clone(),
            payload,
            resource_version: "1".into(),
            status: None,
            managed,
        }
    }

    fn media_stack() -> Vec<ResourceDocument> {
        let mut docs = vec![
            document(Kind::Namespace, None, "media"),
            document(Kind::PersistentVolumeClaim, Some("media"), "media-data"),
            document(Kind::Deployment, Some("media"), "lidarr"),
        ];
        graph::link(&mut docs);
        docs[2]
            .depends_on
            .insert(key(Kind::PersistentVolumeClaim, Some("media"), "media-data"));
        graph::order(docs).unwrap()
    }

    #[test]
    fn test_stamp_manager_creates_labels() {
        let mut payload = json!({ "metadata": { "name": "x" } });
        stamp_manager(&mut payload, "stackctl");
        assert!(is_managed_by(&payload, "stackctl"));
        assert!(!is_managed_by(&payload, "helm"));
    }

    #[test]
    fn test_plan_creates_in_dependency_order() {
        let plan = plan(&media_stack(), &[], "stackctl", SCOPE).unwrap();
        let described: Vec<String> = plan.operations.iter().map(Operation::description).collect();
        assert_eq!(
            described,
            vec![
                "create Namespace/media",
                "create PersistentVolumeClaim/media/media-data",
                "create Deployment/media/lidarr"
            ]
        );
        assert_eq!(plan.operations[1].waits_on, vec![0]);
        assert_eq!(plan.operations[2].waits_on, vec![0, 1]);
        assert!(plan.operations[2].after.is_empty());
        let payload = plan.operations[2].payload.as_ref().unwrap();
        assert!(is_managed_by(payload, "stackctl"));
    }

    #[test]
    fn test_plan_is_empty_when_converged() {
        let desired = media_stack();
        let observed: Vec<_> = desired.iter().map(|d| observed_from(d, true)).collect();
        assert!(plan(&desired, &observed, "stackctl", SCOPE).unwrap().is_empty());
    }

    #[test]
    fn test_plan_updates_drifted_resource() {
        let desired = media_stack();
        let mut observed: Vec<_> = desired.iter().map(|d| observed_from(d, true)).collect();
        observed[2].payload["spec"]["v"] = json!(2);
        let plan = plan(&desired, &observed, "stackctl", SCOPE).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.operations[0].action, Action::Update);
        assert!(plan.operations[0].waits_on.is_empty());
    }

    #[test]
    fn test_plan_deletes_only_managed_orphans_dependents_first() {
        let desired = vec![document(Kind::Namespace, None, "media")];
        let mut old = vec![
            document(Kind::Namespace, None, "legacy"),
            document(Kind::ConfigMap, Some("legacy"), "cfg"),
            document(Kind::Service, Some("legacy"), "web"),
        ];
        graph::link(&mut old);
        let mut observed: Vec<_> = old.iter().map(|d| observed_from(d, true)).collect();
        observed.push(observed_from(&document(Kind::Service, Some("kube-system"), "dns"), false));
        observed.push(observed_from(&desired[0], true));

        let plan = plan(&desired, &observed, "stackctl", SCOPE).unwrap();
        let described: Vec<String> = plan.operations.iter().map(Operation::description).collect();
        assert_eq!(
            described,
            vec![
                "delete Service/legacy/web",
                "delete ConfigMap/legacy/cfg",
                "delete Namespace/legacy"
            ]
        );
        // Nothing in cfg references web; the kind order alone holds it back
        assert!(plan.operations[1].waits_on.is_empty());
        assert_eq!(plan.operations[1].after, vec![0]);
        assert_eq!(plan.operations[2].waits_on, vec![0, 1]);
    }

    #[test]
    fn test_plan_leaves_other_scopes_alone() {
        let desired = vec![document(Kind::Namespace, None, "infra")];
        let media = document(Kind::Namespace, None, "media");
        let mut theirs = observed_from(&media, true);
        stamp_owner(&mut theirs.payload, "stackctl", "media");
        let mut unscoped = observed_from(&document(Kind::Namespace, None, "legacy"), false);
        stamp_manager(&mut unscoped.payload, "stackctl");
        unscoped.managed = true;

        let plan = plan(&desired, &[theirs, unscoped], "stackctl", "infra").unwrap();
        let described: Vec<String> = plan.operations.iter().map(Operation::description).collect();
        assert_eq!(described, vec!["create Namespace/infra"]);
        let payload = plan.operations[0].payload.as_ref().unwrap();
        assert_eq!(scope_of(payload), Some("infra"));
    }

    #[test]
    fn test_priority_edges_do_not_become_dependencies() {
        let desired = graph::order(vec![
            document(Kind::ConfigMap, Some("media"), "settings"),
            document(Kind::Service, Some("media"), "web"),
        ])
        .unwrap();
        let plan = plan(&desired, &[], "stackctl", SCOPE).unwrap();
        assert!(plan.operations[1].waits_on.is_empty());
        assert_eq!(plan.operations[1].after, vec![0]);
    }

    #[test]
    fn test_priority_edges_stay_within_namespace() {
        let desired = graph::order(vec![
            document(Kind::ConfigMap, Some("infra"), "dns"),
            document(Kind::Service, Some("media"), "web"),
        ])
        .unwrap();
        let plan = plan(&desired, &[], "stackctl", SCOPE).unwrap();
        assert!(
            plan.operations
                .iter()
                .all(|op| op.waits_on.is_empty() && op.after.is_empty())
        );
    }
}

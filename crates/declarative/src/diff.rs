//! Semantic diff between desired and observed payloads
//!
//! Server-populated fields are stripped before comparing, and the observed
//! payload may carry extra fields (defaults filled in by the API server)
//! without counting as drift.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Annotation kubectl writes on client-side apply
pub const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

const SERVER_METADATA_FIELDS: [&str; 7] = [
    "managedFields",
    "resourceVersion",
    "generation",
    "creationTimestamp",
    "uid",
    "selfLink",
    "deletionGracePeriodSeconds",
];

/// Remove fields owned by the API server
pub fn strip_server_fields(mut value: Value) -> Value {
    if let Some(obj) = value.as_object_mut() {
        obj.remove("status");
        if let Some(meta) = obj.get_mut("metadata").and_then(Value::as_object_mut) {
            for field in SERVER_METADATA_FIELDS {
                meta.remove(field);
            }
            let annotations_empty =
                if let Some(ann) = meta.get_mut("annotations").and_then(Value::as_object_mut) {
                    ann.remove(LAST_APPLIED_ANNOTATION);
                    ann.is_empty()
                } else {
                    false
                };
            if annotations_empty {
                meta.remove("annotations");
            }
        }
    }
    value
}

/// Whether every field of `desired` is present with the same value in `observed`
///
/// Arrays must have the same length and match element-wise.
pub fn is_subset(desired: &Value, observed: &Value) -> bool {
    match (desired, observed) {
        (Value::Object(want), Value::Object(have)) => {
            want.iter().all(|(k, v)| match have.get(k) {
                Some(hv) => is_subset(v, hv),
                // An explicit null asks for the field to be absent
                None => v.is_null(),
            })
        }
        (Value::Array(want), Value::Array(have)) => {
            want.len() == have.len() && want.iter().zip(have).all(|(w, h)| is_subset(w, h))
        }
        (w, h) => w == h,
    }
}

/// Whether the observed payload already satisfies the desired one
pub fn needs_update(desired: &Value, observed: &Value) -> bool {
    let desired = strip_server_fields(desired.clone());
    let observed = strip_server_fields(observed.clone());
    !is_subset(&desired, &observed)
}

/// The parts of `observed` that `desired` mentions
///
/// Server defaults outside the desired shape are dropped, so what is left
/// lines up field by field with `desired` for display and counting.
pub fn project(observed: &Value, desired: &Value) -> Value {
    match (observed, desired) {
        (Value::Object(have), Value::Object(want)) => Value::Object(
            have.iter()
                .filter_map(|(k, v)| want.get(k).map(|w| (k.clone(), project(v, w))))
                .collect(),
        ),
        (Value::Array(have), Value::Array(want)) if have.len() == want.len() => {
            Value::Array(have.iter().zip(want).map(|(h, w)| project(h, w)).collect())
        }
        _ => observed.clone(),
    }
}

/// Counts of field-level differences
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChanges {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

impl FieldChanges {
    pub fn total(&self) -> usize {
        self.adds + self.updates + self.removes
    }
}

/// Count field additions, updates and removals from `base` to `target`
pub fn field_changes(target: &Value, base: &Value) -> FieldChanges {
    fn walk(a: &Value, b: &Value, c: &mut FieldChanges) {
        match (a, b) {
            (Value::Object(ao), Value::Object(bo)) => {
                for (k, av) in ao {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, c),
                        None => c.adds += 1,
                    }
                }
                c.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Value::Array(aa), Value::Array(bb)) => {
                c.updates += aa.iter().zip(bb).filter(|(x, y)| x != y).count();
                c.adds += aa.len().saturating_sub(bb.len());
                c.removes += bb.len().saturating_sub(aa.len());
            }
            (av, bv) => {
                if av != bv {
                    c.updates += 1;
                }
            }
        }
    }
    let mut changes = FieldChanges::default();
    walk(target, base, &mut changes);
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strip_server_fields() {
        let v = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "x",
                "namespace": "ns",
                "managedFields": [ {"foo": "bar"} ],
                "resourceVersion": "123",
                "generation": 5,
                "uid": "abc",
                "creationTimestamp": "2020-01-01T00:00:00Z",
                "annotations": { LAST_APPLIED_ANNOTATION: "{}" }
            },
            "status": { "obs": true },
            "data": { "k": "v" }
        });
        let pruned = strip_server_fields(v);
        let meta = pruned.get("metadata").unwrap().as_object().unwrap();
        assert_eq!(meta.len(), 2);
        assert!(!pruned.as_object().unwrap().contains_key("status"));
        assert_eq!(pruned["data"]["k"], "v");
    }

    #[test]
    fn test_server_defaults_are_not_drift() {
        let desired = json!({
            "metadata": { "name": "web", "labels": { "app": "web" } },
            "spec": { "ports": [{ "port": 80 }] }
        });
        let observed = json!({
            "metadata": { "name": "web", "labels": { "app": "web" }, "resourceVersion": "7" },
            "spec": {
                "ports": [{ "port": 80, "protocol": "TCP", "targetPort": 80 }],
                "clusterIP": "10.43.0.12",
                "type": "ClusterIP"
            },
            "status": { "loadBalancer": {} }
        });
        assert!(!needs_update(&desired, &observed));
    }

    #[test]
    fn test_changed_value_is_drift() {
        let desired = json!({ "spec": { "replicas": 2 } });
        let observed = json!({ "spec": { "replicas": 1, "paused": false } });
        assert!(needs_update(&desired, &observed));
    }

    #[test]
    fn test_array_length_change_is_drift() {
        let desired = json!({ "spec": { "ports": [{ "port": 80 }] } });
        let observed = json!({ "spec": { "ports": [{ "port": 80 }, { "port": 443 }] } });
        assert!(needs_update(&desired, &observed));
    }

    #[test]
    fn test_field_changes_counts() {
        let base = json!({ "a": 1, "b": { "x": 1 }, "c": [1, 2, 3] });
        let target = json!({ "a": 2, "b": { "x": 1, "y": 2 }, "c": [1, 9], "d": true });
        let c = field_changes(&target, &base);
        assert_eq!(c, FieldChanges { adds: 2, updates: 2, removes: 1 });
        assert_eq!(c.total(), 5);
    }

    #[test]
    fn test_project_drops_server_defaults() {
        let observed = json!({
            "metadata": { "name": "web", "namespace": "media", "uid": "u-1" },
            "spec": {
                "replicas": 2,
                "revisionHistoryLimit": 10,
                "template": { "spec": { "containers": [ { "name": "web", "image": "a:1", "imagePullPolicy": "IfNotPresent" } ] } }
            }
        });
        let desired = json!({
            "metadata": { "name": "web", "namespace": "media" },
            "spec": {
                "replicas": 3,
                "template": { "spec": { "containers": [ { "name": "web", "image": "a:1" } ] } }
            }
        });
        let projected = project(&observed, &desired);
        assert_eq!(
            projected,
            json!({
                "metadata": { "name": "web", "namespace": "media" },
                "spec": {
                    "replicas": 2,
                    "template": { "spec": { "containers": [ { "name": "web", "image": "a:1" } ] } }
                }
            })
        );
        assert_eq!(
            field_changes(&desired, &projected),
            FieldChanges { adds: 0, updates: 1, removes: 0 }
        );
    }
}

//! Dependency grapher - orders resources so dependencies come first
//!
//! Hard edges come from three places:
//! - a namespaced resource depends on its Namespace document
//! - references found in the payload (config maps, claims and secrets
//!   mounted by pod templates, services behind an ingress)
//! - the [`DEPENDS_ON_ANNOTATION`] annotation
//!
//! Ties between independent resources are broken by kind priority, then
//! namespace, then name, so the output is deterministic and follows the
//! conventional apply order whenever the edges allow it.

use crate::error::{Error, Result};
use crate::types::{DEPENDS_ON_ANNOTATION, Kind, ResourceDocument, ResourceKey};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Sort key used for tie-breaking
pub type TieBreak<'a> = (u8, Option<&'a str>, &'a str, &'a Kind);

pub fn tie_break(key: &ResourceKey) -> TieBreak<'_> {
    (
        key.kind.priority(),
        key.namespace.as_deref(),
        key.name.as_str(),
        &key.kind,
    )
}

/// Populate `depends_on` for every document from edges that resolve
/// inside the snapshot
pub fn link(documents: &mut [ResourceDocument]) {
    let present: BTreeSet<ResourceKey> = documents.iter().map(|d| d.key.clone()).collect();

    for doc in documents.iter_mut() {
        let mut deps = BTreeSet::new();
        if let Some(ns) = doc.key.namespace_key()
            && present.contains(&ns)
        {
            deps.insert(ns);
        }
        for reference in references(doc) {
            if reference == doc.key {
                continue;
            }
            if present.contains(&reference) {
                deps.insert(reference);
            } else {
                log::debug!("{} references {} which is not in the snapshot", doc.key, reference);
            }
        }
        doc.depends_on = deps;
    }
}

/// Every resource `doc` refers to, whether or not it exists
pub fn references(doc: &ResourceDocument) -> BTreeSet<ResourceKey> {
    let mut refs = BTreeSet::new();
    let ns = doc.key.namespace.as_deref();

    if let Some(declared) = doc.annotation(DEPENDS_ON_ANNOTATION) {
        for part in declared.split(',').filter(|p| !p.trim().is_empty()) {
            match ResourceKey::parse_reference(part, ns) {
                Some(key) => {
                    refs.insert(key);
                }
                None => log::warn!("{}: ignoring malformed dependency '{}'", doc.key, part.trim()),
            }
        }
    }

    // Only namespaced resources can reference namespaced objects by name
    if let Some(ns) = ns {
        let is_ingress = doc.key.kind == Kind::Ingress;
        scan(&doc.payload, ns, is_ingress, &mut refs);
    }
    refs
}

fn scan(value: &Value, ns: &str, is_ingress: bool, refs: &mut BTreeSet<ResourceKey>) {
    match value {
        Value::Object(map) => {
            for (field, child) in map {
                if let Some(key) = reference_for(field, child, ns, is_ingress) {
                    refs.insert(key);
                }
                scan(child, ns, is_ingress, refs);
            }
        }
        Value::Array(items) => {
            for item in items {
                scan(item, ns, is_ingress, refs);
            }
        }
        _ => {}
    }
}

fn reference_for(field: &str, value: &Value, ns: &str, is_ingress: bool) -> Option<ResourceKey> {
    let named = |attr: &str| value.get(attr).and_then(Value::as_str);
    let (kind, name) = match field {
        "configMap" | "configMapRef" | "configMapKeyRef" => (Kind::ConfigMap, named("name")?),
        "persistentVolumeClaim" => (Kind::PersistentVolumeClaim, named("claimName")?),
        "secretRef" | "secretKeyRef" => (Kind::Other("Secret".to_string()), named("name")?),
        "secret" => (Kind::Other("Secret".to_string()), named("secretName")?),
        "service" if is_ingress => (Kind::Service, named("name")?),
        "serviceName" if is_ingress => (Kind::Service, value.as_str()?),
        _ => return None,
    };
    Some(ResourceKey::new(kind, Some(ns), name))
}

/// Order documents so every one appears after everything it depends on
///
/// Edges pointing outside the input are ignored. Fails with
/// [`Error::Cycle`] naming one cycle if no such order exists.
pub fn order(documents: Vec<ResourceDocument>) -> Result<Vec<ResourceDocument>> {
    let index: HashMap<ResourceKey, usize> = documents
        .iter()
        .enumerate()
        .map(|(i, d)| (d.key.clone(), i))
        .collect();

    let mut pending = vec![0usize; documents.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); documents.len()];
    for (i, doc) in documents.iter().enumerate() {
        for dep in &doc.depends_on {
            if let Some(&j) = index.get(dep)
                && j != i
            {
                pending[i] += 1;
                dependents[j].push(i);
            }
        }
    }

    let mut ready: BTreeMap<TieBreak<'_>, usize> = documents
        .iter()
        .enumerate()
        .filter(|(i, _)| pending[*i] == 0)
        .map(|(i, d)| (tie_break(&d.key), i))
        .collect();

    let mut sequence = Vec::with_capacity(documents.len());
    while let Some((_, i)) = ready.pop_first() {
        sequence.push(i);
        for &dependent in &dependents[i] {
            pending[dependent] -= 1;
            if pending[dependent] == 0 {
                ready.insert(tie_break(&documents[dependent].key), dependent);
            }
        }
    }

    if sequence.len() < documents.len() {
        let members = find_cycle(&documents, &index, &pending);
        return Err(Error::Cycle { members });
    }

    let mut slots: Vec<Option<ResourceDocument>> = documents.into_iter().map(Some).collect();
    Ok(sequence
        .into_iter()
        .filter_map(|i| slots[i].take())
        .collect())
}

/// Walk unresolved dependencies from a stuck node until a node repeats
fn find_cycle(
    documents: &[ResourceDocument],
    index: &HashMap<ResourceKey, usize>,
    pending: &[usize],
) -> Vec<ResourceKey> {
    let stuck = |i: usize| pending[i] > 0;
    let Some(start) = (0..documents.len())
        .filter(|&i| stuck(i))
        .min_by(|&a, &b| tie_break(&documents[a].key).cmp(&tie_break(&documents[b].key)))
    else {
        return Vec::new();
    };

    let mut path = vec![start];
    let mut current = start;
    loop {
        let next = documents[current]
            .depends_on
            .iter()
            .filter_map(|dep| index.get(dep).copied())
            .find(|&j| j != current && stuck(j));
        let Some(next) = next else {
            break;
        };
        if let Some(pos) = path.iter().position(|&p| p == next) {
            // Edges point at dependencies; report in apply order
            let mut cycle: Vec<ResourceKey> =
                path[pos..].iter().map(|&i| documents[i].key.clone()).collect();
            cycle.reverse();
            return cycle;
        }
        path.push(next);
        current = next;
    }

    path.into_iter().map(|i| documents[i].key.clone()).collect()
}

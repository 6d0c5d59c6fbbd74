//! In-memory cluster for tests and offline planning

use crate::context::{ApplyContext, ClusterApi};
use crate::error::{Error, Result};
use crate::planner;
use crate::types::{Action, DEFAULT_MANAGER, Kind, ObservedResource, Operation, ResourceKey};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Failure injected for one resource key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Every apply is rejected
    Reject(String),
    /// The next `n` applies report a conflict
    Conflict(u32),
    /// The next `n` applies time out
    Timeout(u32),
}

#[derive(Debug, Default)]
struct State {
    resources: BTreeMap<ResourceKey, ObservedResource>,
    faults: HashMap<ResourceKey, Fault>,
    applied: Vec<String>,
    next_version: u64,
    observe_failures: u32,
}

/// A [`ClusterApi`] that keeps resources in a map
///
/// Like a server listed by resource type, observe only reports kinds
/// outside the built-in set when they are asked for. Writes bump a resource version and add the server-owned metadata a
/// real API server would, so drift detection sees realistic payloads.
#[derive(Debug)]
pub struct InMemoryCluster {
    manager: String,
    state: Mutex<State>,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::with_manager(DEFAULT_MANAGER)
    }

    pub fn with_manager(manager: &str) -> Self {
        Self {
            manager: manager.to_string(),
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a resource directly, bypassing faults and the apply log
    pub fn insert(&self, key: ResourceKey, payload: Value) {
        let mut state = self.state();
        let resource = self.stored(&mut state, key.clone(), payload);
        state.resources.insert(key, resource);
    }

    /// Change a stored payload in place, as another client would
    pub fn mutate(&self, key: &ResourceKey, change: impl FnOnce(&mut Value)) -> bool {
        let mut state = self.state();
        let Some(mut payload) = state.resources.get(key).map(|r| r.payload.clone()) else {
            return false;
        };
        change(&mut payload);
        let resource = self.stored(&mut state, key.clone(), payload);
        state.resources.insert(key.clone(), resource);
        true
    }

    pub fn inject(&self, key: ResourceKey, fault: Fault) {
        self.state().faults.insert(key, fault);
    }

    /// Make the next `n` observe calls time out
    pub fn fail_observe(&self, n: u32) {
        self.state().observe_failures = n;
    }

    pub fn get(&self, key: &ResourceKey) -> Option<ObservedResource> {
        self.state().resources.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.state().resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Descriptions of every successful apply, in order
    pub fn applied(&self) -> Vec<String> {
        self.state().applied.clone()
    }

    fn stored(&self, state: &mut State, key: ResourceKey, mut payload: Value) -> ObservedResource {
        state.next_version += 1;
        let version = state.next_version.to_string();
        if let Some(meta) = payload.get_mut("metadata").and_then(Value::as_object_mut) {
            meta.insert("resourceVersion".into(), Value::String(version.clone()));
            meta.entry("uid")
                .or_insert_with(|| Value::String(format!("uid-{}", key.name)));
        }
        if let Some(obj) = payload.as_object_mut() {
            obj.entry("status").or_insert_with(|| json!({}));
        }
        ObservedResource {
            managed: planner::is_managed_by(&payload, &self.manager),
            status: payload.get("status").cloned(),
            key,
            payload,
            resource_version: version,
        }
    }

    fn take_fault(state: &mut State, key: &ResourceKey, timeout: &ApplyContext) -> Result<()> {
        let fault = match state.faults.get_mut(key) {
            Some(Fault::Reject(message)) => return Err(Error::validation(message.clone())),
            Some(Fault::Conflict(n)) if *n > 0 => {
                *n -= 1;
                Error::conflict(key, "the object has been modified")
            }
            Some(Fault::Timeout(n)) if *n > 0 => {
                *n -= 1;
                Error::Timeout {
                    what: format!("apply {key}"),
                    after: timeout.timeout,
                }
            }
            _ => return Ok(()),
        };
        Err(fault)
    }
}

impl ClusterApi for InMemoryCluster {
    fn observe(&self, ctx: &ApplyContext) -> Result<Vec<ObservedResource>> {
        let mut state = self.state();
        if state.observe_failures > 0 {
            state.observe_failures -= 1;
            return Err(Error::Timeout {
                what: "observe".into(),
                after: ctx.timeout,
            });
        }
        Ok(state
            .resources
            .values()
            .filter(|r| !matches!(r.key.kind, Kind::Other(_)) || ctx.kinds.contains(&r.key.kind))
            .cloned()
            .collect())
    }

    fn apply(&self, operation: &Operation, ctx: &ApplyContext) -> Result<()> {
        let mut state = self.state();
        Self::take_fault(&mut state, &operation.key, ctx)?;
        if ctx.dry_run {
            return Ok(());
        }

        let key = &operation.key;
        let exists = state.resources.contains_key(key);
        match (operation.action, &operation.payload) {
            (Action::Create, _) if exists => {
                return Err(Error::conflict(key, "already exists"));
            }
            (Action::Update, _) if !exists => {
                return Err(Error::conflict(key, "not found"));
            }
            (Action::Create | Action::Update, Some(payload)) => {
                let resource = self.stored(&mut state, key.clone(), payload.clone());
                state.resources.insert(key.clone(), resource);
            }
            (Action::Create | Action::Update, None) => {
                return Err(Error::validation(format!("{key}: missing payload")));
            }
            (Action::Delete, _) => {
                state.resources.remove(key);
            }
        }
        state.applied.push(operation.description());
        Ok(())
    }
}

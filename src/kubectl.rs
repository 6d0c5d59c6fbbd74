//! Cluster access through the `kubectl` CLI

use declarative::planner::is_managed_by;
use declarative::store::document_from_value;
use declarative::{
    Action, ApplyContext, ClusterApi, Error, Kind, ObservedResource, Operation, Result,
    run_with_timeout,
};
use serde_json::Value;

use crate::config::KubectlSection;

/// Built-in resource types listed on every observe, in `kubectl get` syntax
const OBSERVED_TYPES: &str = "namespaces,persistentvolumeclaims,configmaps,deployments,jobs,\
services,ingresses,networkpolicies,poddisruptionbudgets";

/// [`ClusterApi`] backed by `kubectl`
///
/// Creates go through `kubectl create` so an unexpected existing object
/// surfaces as a conflict; updates use `kubectl apply`.
#[derive(Debug, Clone)]
pub struct KubectlCluster {
    binary: String,
    context: Option<String>,
    kubeconfig: Option<String>,
    manager: String,
}

impl KubectlCluster {
    pub fn new(section: &KubectlSection, manager: &str) -> Self {
        Self {
            binary: section.binary.clone(),
            context: section.context.clone(),
            kubeconfig: section
                .kubeconfig
                .as_deref()
                .map(|p| crate::paths::expand(p).display().to_string()),
            manager: manager.to_string(),
        }
    }

    /// Override the kubeconfig context
    pub fn with_context(mut self, context: Option<String>) -> Self {
        if context.is_some() {
            self.context = context;
        }
        self
    }

    /// Connection flags followed by `args`
    fn args<'a>(&'a self, args: &[&'a str]) -> Vec<&'a str> {
        let mut all = Vec::with_capacity(args.len() + 4);
        if let Some(kubeconfig) = &self.kubeconfig {
            all.extend(["--kubeconfig", kubeconfig.as_str()]);
        }
        if let Some(context) = &self.context {
            all.extend(["--context", context.as_str()]);
        }
        all.extend_from_slice(args);
        all
    }

    /// Run kubectl and turn a non-zero exit into a classified error
    fn run(&self, args: &[&str], input: Option<&[u8]>, what: &str, ctx: &ApplyContext) -> Result<String> {
        let args = self.args(args);
        let output = run_with_timeout(&self.binary, &args, input, ctx.timeout)?;
        if !output.success {
            return Err(classify(what, &output.stderr_str(), ctx));
        }
        Ok(output.stdout_str())
    }
}

impl KubectlCluster {
    /// `kubectl get` across all namespaces
    fn list(&self, types: &str, ctx: &ApplyContext) -> Result<Vec<ObservedResource>> {
        let stdout = self.run(
            &["get", types, "--all-namespaces", "-o", "json"],
            None,
            "observe",
            ctx,
        )?;
        let list: Value = serde_json::from_str(&stdout)?;
        parse_list(&list, &self.manager)
    }
}

/// Resource name kubectl expects for a kind: lower case and plural,
/// guessed the way the API machinery guesses it
pub fn resource_name(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if let Some(stem) = lower.strip_suffix('y')
        && !stem.ends_with(['a', 'e', 'i', 'o', 'u'])
    {
        return format!("{stem}ies");
    }
    if lower.ends_with('s') || lower.ends_with('x') || lower.ends_with("ch") || lower.ends_with("sh") {
        return format!("{lower}es");
    }
    format!("{lower}s")
}

fn is_unknown_type(message: &str) -> bool {
    message.contains("the server doesn't have a resource type")
}

impl ClusterApi for KubectlCluster {
    fn observe(&self, ctx: &ApplyContext) -> Result<Vec<ObservedResource>> {
        let mut observed = self.list(OBSERVED_TYPES, ctx)?;
        // One call per extra kind, so a missing CRD only hides its own kind
        for kind in &ctx.kinds {
            if !matches!(kind, Kind::Other(_)) {
                continue;
            }
            let resource = resource_name(kind.as_str());
            match self.list(&resource, ctx) {
                Ok(found) => observed.extend(found),
                Err(Error::Validation { message }) if is_unknown_type(&message) => {
                    log::debug!("Cluster does not serve {resource}, nothing to observe");
                }
                Err(e) => return Err(e),
            }
        }
        log::debug!("kubectl reported {} resources", observed.len());
        Ok(observed)
    }

    fn apply(&self, operation: &Operation, ctx: &ApplyContext) -> Result<()> {
        let what = operation.description();
        match operation.action {
            Action::Create | Action::Update => {
                let payload = operation
                    .payload
                    .as_ref()
                    .ok_or_else(|| Error::Other(format!("{what}: no payload")))?;
                let body = serde_json::to_vec(payload)?;
                let verb = if operation.action == Action::Create {
                    "create"
                } else {
                    "apply"
                };
                self.run(&[verb, "-f", "-"], Some(&body), &what, ctx)?;
            }
            Action::Delete => {
                let key = &operation.key;
                let mut args = vec!["delete", key.kind.as_str(), key.name.as_str()];
                if let Some(ns) = &key.namespace {
                    args.extend(["--namespace", ns.as_str()]);
                }
                args.push("--ignore-not-found");
                self.run(&args, None, &what, ctx)?;
            }
        }
        Ok(())
    }
}

/// Turn `kubectl get -o json` output into observed resources
///
/// Items that do not look like resources are skipped with a warning.
pub fn parse_list(list: &Value, manager: &str) -> Result<Vec<ObservedResource>> {
    let items = list
        .get("items")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::Other("kubectl output has no items".to_string()))?;

    let mut observed = Vec::with_capacity(items.len());
    for item in items {
        let doc = match document_from_value(item.clone()) {
            Ok(doc) => doc,
            Err(e) => {
                log::warn!("Ignoring unreadable live object: {e}");
                continue;
            }
        };
        let resource_version = doc
            .payload
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        observed.push(ObservedResource {
            managed: is_managed_by(&doc.payload, manager),
            status: doc.payload.get("status").cloned(),
            resource_version,
            key: doc.key,
            payload: doc.payload,
        });
    }
    Ok(observed)
}

/// Classify kubectl's stderr
///
/// Optimistic-concurrency and existence races are conflicts, transport
/// trouble is a timeout, anything else is a rejection.
pub fn classify(what: &str, stderr: &str, ctx: &ApplyContext) -> Error {
    let lower = stderr.to_lowercase();
    let message = stderr.trim().to_string();

    if lower.contains("(alreadyexists)")
        || lower.contains("already exists")
        || lower.contains("(conflict)")
        || lower.contains("the object has been modified")
        || (lower.contains("(notfound)") && !what.starts_with("delete"))
    {
        return Error::conflict(what, message);
    }

    if lower.contains("i/o timeout")
        || lower.contains("handshake timeout")
        || lower.contains("(timeout)")
        || lower.contains("timed out")
        || lower.contains("deadline exceeded")
        || lower.contains("connection refused")
        || lower.contains("(serviceunavailable)")
        || lower.contains("(toomanyrequests)")
        || lower.contains("unable to connect to the server")
    {
        return Error::Timeout {
            what: format!("{what}: {message}"),
            after: ctx.timeout,
        };
    }

    Error::validation(message)
}

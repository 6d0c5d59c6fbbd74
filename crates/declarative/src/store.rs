//! Manifest store - loads desired state from a directory tree
//!
//! The tree groups documents by kind into a fixed set of subdirectories,
//! visited in apply priority order:
//!
//! ```text
//! <root>/
//!   namespaces/   storage/   configs/   deployments/
//!   services/     ingress/   jobs/      security/
//! ```
//!
//! Every problem found while loading is collected and reported together
//! as a single [`Error::Parse`].

use crate::error::{Error, ParseIssue, Result};
use crate::graph;
use crate::types::{Kind, ResourceDocument, ResourceKey};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Subdirectories scanned under the manifest root, in load order
pub const SUBDIRECTORIES: [&str; 8] = [
    "namespaces",
    "storage",
    "configs",
    "deployments",
    "services",
    "ingress",
    "jobs",
    "security",
];

/// Namespaces that exist in every cluster and need no document
pub const BUILTIN_NAMESPACES: [&str; 4] = ["default", "kube-system", "kube-public", "kube-node-lease"];

/// Default upper bound for a single manifest document
pub const DEFAULT_MAX_DOCUMENT_BYTES: usize = 1_000_000;

/// How many documents' worth of bytes one file may hold
const FILE_LIMIT_FACTOR: usize = 16;

const MANIFEST_EXTENSIONS: [&str; 3] = ["yaml", "yml", "json"];

/// Loader for a manifest directory tree
#[derive(Debug, Clone)]
pub struct ManifestStore {
    root: PathBuf,
    max_document_bytes: usize,
}

impl ManifestStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_document_bytes: DEFAULT_MAX_DOCUMENT_BYTES,
        }
    }

    /// Reject documents larger than `bytes`
    ///
    /// Files are refused unread once they exceed sixteen times that.
    pub fn with_max_document_bytes(mut self, bytes: usize) -> Self {
        self.max_document_bytes = bytes;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// List manifest files in load order
    pub fn files(&self) -> Result<Vec<PathBuf>> {
        if !self.root.is_dir() {
            return Err(Error::parse(
                Some(self.root.clone()),
                "manifest root is not a directory",
            ));
        }

        let mut files = Vec::new();
        let mut issues = Vec::new();
        for sub in SUBDIRECTORIES {
            let dir = self.root.join(sub);
            if !dir.is_dir() {
                log::debug!("Skipping missing manifest directory {}", dir.display());
                continue;
            }
            for entry in WalkDir::new(&dir).sort_by_file_name() {
                match entry {
                    Ok(entry) if entry.file_type().is_file() && is_manifest(entry.path()) => {
                        files.push(entry.into_path());
                    }
                    Ok(_) => {}
                    Err(e) => issues.push(ParseIssue::new(
                        e.path().map(Path::to_path_buf),
                        format!("cannot read directory entry: {e}"),
                    )),
                }
            }
        }

        if issues.is_empty() {
            Ok(files)
        } else {
            Err(Error::Parse { issues })
        }
    }

    /// Load, validate and link every document under the root
    pub fn load(&self) -> Result<Vec<ResourceDocument>> {
        let files = self.files()?;
        let mut documents = Vec::new();
        let mut issues = Vec::new();

        for path in &files {
            let (docs, mut found) = self.load_file(path);
            documents.extend(docs);
            issues.append(&mut found);
        }

        issues.extend(validate(&documents));
        if !issues.is_empty() {
            return Err(Error::Parse { issues });
        }

        graph::link(&mut documents);
        log::info!(
            "Loaded {} documents from {} files under {}",
            documents.len(),
            files.len(),
            self.root.display()
        );
        Ok(documents)
    }
}

impl ManifestStore {
    fn max_file_bytes(&self) -> usize {
        self.max_document_bytes.saturating_mul(FILE_LIMIT_FACTOR)
    }

    /// Parse one file, checking its size before reading and every
    /// document's size before parsing
    fn load_file(&self, path: &Path) -> (Vec<ResourceDocument>, Vec<ParseIssue>) {
        let issue = |message: String| ParseIssue::new(Some(path.to_path_buf()), message);
        let limit = self.max_file_bytes();
        match fs::metadata(path) {
            Ok(meta) if meta.len() > limit as u64 => {
                return (Vec::new(), vec![issue(format!("file exceeds {limit} bytes"))]);
            }
            Ok(_) => {}
            Err(e) => return (Vec::new(), vec![issue(format!("cannot read: {e}"))]),
        }
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => return (Vec::new(), vec![issue(format!("cannot read: {e}"))]),
        };

        let mut docs = Vec::new();
        let mut issues = Vec::new();
        for (index, chunk) in split_documents(&content).into_iter().enumerate() {
            if chunk.len() > self.max_document_bytes {
                issues.push(issue(format!(
                    "document {}: exceeds {} bytes",
                    index + 1,
                    self.max_document_bytes
                )));
                continue;
            }
            let (parsed, mut found) = parse_numbered(chunk, Some(path), index);
            docs.extend(parsed);
            issues.append(&mut found);
        }
        (docs, issues)
    }
}

/// Split a multi-document YAML stream at its `---` separator lines
///
/// Each piece keeps its separator line. Text before a leading separator is
/// dropped when it is empty.
pub fn split_documents(content: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut offset = 0;
    for line in content.split_inclusive('\n') {
        let trimmed = line.trim_end();
        let is_separator = trimmed == "---" || trimmed.starts_with("--- ");
        if is_separator && offset > start {
            pieces.push(&content[start..offset]);
            start = offset;
        }
        offset += line.len();
    }
    if offset > start {
        pieces.push(&content[start..offset]);
    }
    pieces
}

/// Load the manifest tree at `root` with default limits
pub fn load(root: &Path) -> Result<Vec<ResourceDocument>> {
    ManifestStore::new(root).load()
}

fn is_manifest(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| MANIFEST_EXTENSIONS.contains(&e))
}

/// Parse every YAML document in `content`
///
/// Returns the documents that parsed and the problems with the ones that
/// did not. Empty documents are skipped; `List` documents are flattened.
pub fn parse_documents(
    content: &str,
    source: Option<&Path>,
) -> (Vec<ResourceDocument>, Vec<ParseIssue>) {
    parse_numbered(content, source, 0)
}

/// [`parse_documents`] with document numbers starting after `skipped`
fn parse_numbered(
    content: &str,
    source: Option<&Path>,
    skipped: usize,
) -> (Vec<ResourceDocument>, Vec<ParseIssue>) {
    let mut docs = Vec::new();
    let mut issues = Vec::new();
    let source_buf = source.map(Path::to_path_buf);

    for (n, de) in serde_yaml::Deserializer::from_str(content).enumerate() {
        let index = skipped + n;
        let yaml = match serde_yaml::Value::deserialize(de) {
            Ok(v) => v,
            Err(e) => {
                issues.push(ParseIssue::new(
                    source_buf.clone(),
                    format!("document {}: invalid YAML: {e}", index + 1),
                ));
                break;
            }
        };
        if yaml.is_null() {
            continue;
        }
        let json = match serde_json::to_value(yaml) {
            Ok(v) => v,
            Err(e) => {
                issues.push(ParseIssue::new(
                    source_buf.clone(),
                    format!("document {}: not representable as JSON: {e}", index + 1),
                ));
                continue;
            }
        };
        collect_documents(json, source_buf.as_ref(), index + 1, &mut docs, &mut issues);
    }

    (docs, issues)
}

fn collect_documents(
    value: Value,
    source: Option<&PathBuf>,
    index: usize,
    docs: &mut Vec<ResourceDocument>,
    issues: &mut Vec<ParseIssue>,
) {
    if value.get("kind").and_then(Value::as_str) == Some("List") {
        match value.get("items").and_then(Value::as_array) {
            Some(items) => {
                for item in items {
                    collect_documents(item.clone(), source, index, docs, issues);
                }
            }
            None => issues.push(ParseIssue::new(
                source.cloned(),
                format!("document {index}: List without items"),
            )),
        }
        return;
    }

    match document_from_value(value) {
        Ok(mut doc) => {
            doc.source = source.cloned();
            docs.push(doc);
        }
        Err(message) => issues.push(ParseIssue::new(
            source.cloned(),
            format!("document {index}: {message}"),
        )),
    }
}

/// Build a [`ResourceDocument`] from a single manifest body
///
/// Namespaced kinds without `metadata.namespace` land in `default`; the
/// resolved namespace is written back into the payload.
pub fn document_from_value(mut value: Value) -> std::result::Result<ResourceDocument, String> {
    if !value.is_object() {
        return Err("expected a mapping at the top level".to_string());
    }
    let api_version = value
        .get("apiVersion")
        .and_then(Value::as_str)
        .ok_or("missing apiVersion")?
        .to_string();
    let kind = Kind::from_name(
        value
            .get("kind")
            .and_then(Value::as_str)
            .ok_or("missing kind")?,
    );
    let metadata = value
        .get("metadata")
        .and_then(Value::as_object)
        .ok_or("missing metadata")?;
    let name = metadata
        .get("name")
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
        .ok_or("missing metadata.name")?
        .to_string();
    let declared_ns = match metadata.get("namespace") {
        None | Some(Value::Null) => None,
        Some(Value::String(ns)) if !ns.is_empty() => Some(ns.clone()),
        Some(_) => return Err("metadata.namespace must be a non-empty string".to_string()),
    };

    let namespace = if kind.is_cluster_scoped() {
        if declared_ns.is_some() {
            return Err(format!("{kind} '{name}' is cluster-scoped but sets metadata.namespace"));
        }
        None
    } else {
        let ns = declared_ns.unwrap_or_else(|| "default".to_string());
        if let Some(meta) = value.get_mut("metadata").and_then(Value::as_object_mut) {
            meta.insert("namespace".to_string(), Value::String(ns.clone()));
        }
        Some(ns)
    };

    let key = ResourceKey {
        kind,
        namespace,
        name,
    };
    Ok(ResourceDocument::new(key, &api_version, value))
}

/// Check snapshot-level invariants: unique keys and declared namespaces
pub fn validate(documents: &[ResourceDocument]) -> Vec<ParseIssue> {
    let mut issues = Vec::new();
    let mut seen: BTreeMap<&ResourceKey, Option<&PathBuf>> = BTreeMap::new();

    for doc in documents {
        match seen.get(&doc.key) {
            Some(first) => {
                let first =
                    first.map_or_else(|| "<input>".to_string(), |p| p.display().to_string());
                issues.push(ParseIssue::new(
                    doc.source.clone(),
                    format!("duplicate {} (first defined in {first})", doc.key),
                ));
            }
            None => {
                seen.insert(&doc.key, doc.source.as_ref());
            }
        }
    }

    let declared: BTreeSet<&str> = documents
        .iter()
        .filter(|d| d.key.kind == Kind::Namespace)
        .map(|d| d.key.name.as_str())
        .chain(BUILTIN_NAMESPACES)
        .collect();

    for doc in documents {
        if let Some(ns) = doc.key.namespace.as_deref()
            && !declared.contains(ns)
        {
            issues.push(ParseIssue::new(
                doc.source.clone(),
                format!("{} references undeclared namespace '{ns}'", doc.key),
            ));
        }
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn issues(err: Error) -> Vec<ParseIssue> {
        match err {
            Error::Parse { issues } => issues,
            other => panic!("expected parse error, got {other}"),
        }
    }

    #[test]
    fn test_document_from_value_defaults_namespace() {
        let value = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "settings" },
            "data": { "a": "b" }
        });
        let doc = document_from_value(value).unwrap();
        assert_eq!(doc.key.namespace.as_deref(), Some("default"));
        assert_eq!(
            doc.payload.pointer("/metadata/namespace").and_then(Value::as_str),
            Some("default")
        );
    }

    #[test]
    fn test_document_from_value_errors() {
        let missing_api = serde_json::json!({ "kind": "Foo", "metadata": { "name": "x" } });
        assert_eq!(document_from_value(missing_api).unwrap_err(), "missing apiVersion");

        let missing_kind = serde_json::json!({ "apiVersion": "v1", "metadata": { "name": "x" } });
        assert_eq!(document_from_value(missing_kind).unwrap_err(), "missing kind");

        let missing_name = serde_json::json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": {} });
        assert_eq!(document_from_value(missing_name).unwrap_err(), "missing metadata.name");

        let namespaced_ns = serde_json::json!({
            "apiVersion": "v1", "kind": "Namespace",
            "metadata": { "name": "media", "namespace": "x" }
        });
        assert!(document_from_value(namespaced_ns).unwrap_err().contains("cluster-scoped"));
    }

    #[test]
    fn test_parse_documents_multi_document_and_list() {
        let content = "\
apiVersion: v1
kind: Namespace
metadata:
  name: media
---
---
apiVersion: v1
kind: List
items:
  - apiVersion: v1
    kind: Service
    metadata: { name: web, namespace: media }
  - apiVersion: v1
    kind: ConfigMap
    metadata: { name: cfg, namespace: media }
";
        let (docs, issues) = parse_documents(content, None);
        assert!(issues.is_empty(), "{issues:?}");
        let names: Vec<_> = docs.iter().map(|d| d.key.name.as_str()).collect();
        assert_eq!(names, vec!["media", "web", "cfg"]);
    }

    #[test]
    fn test_load_walks_subdirectories_in_priority_order() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "deployments/lidarr.yaml",
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: lidarr\n  namespace: media\n",
        );
        write(
            dir.path(),
            "namespaces/media.yaml",
            "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: media\n",
        );
        write(dir.path(), "namespaces/README.md", "not a manifest");
        write(
            dir.path(),
            "unrelated/ignored.yaml",
            "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: ignored\n",
        );

        let docs = ManifestStore::new(dir.path()).load().unwrap();
        let keys: Vec<String> = docs.iter().map(|d| d.key.to_string()).collect();
        assert_eq!(keys, vec!["Namespace/media", "Deployment/media/lidarr"]);
        assert!(docs[1].depends_on.contains(&docs[0].key));
    }

    #[test]
    fn test_load_reports_every_problem() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "namespaces/media.yaml",
            "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: media\n",
        );
        write(
            dir.path(),
            "services/a.yaml",
            "apiVersion: v1\nkind: Service\nmetadata:\n  name: web\n  namespace: media\n",
        );
        write(
            dir.path(),
            "services/b.yaml",
            "apiVersion: v1\nkind: Service\nmetadata:\n  name: web\n  namespace: media\n",
        );
        write(
            dir.path(),
            "configs/orphan.yaml",
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cfg\n  namespace: music\n",
        );
        write(dir.path(), "jobs/broken.yaml", "kind: Job\nmetadata: [oops\n");

        let found = issues(ManifestStore::new(dir.path()).load().unwrap_err());
        assert_eq!(found.len(), 3, "{found:?}");
        assert!(found.iter().any(|i| i.message.contains("invalid YAML")));
        assert!(found.iter().any(|i| i.message.contains("duplicate Service/media/web")));
        assert!(found.iter().any(|i| i.message.contains("undeclared namespace 'music'")));
    }

    #[test]
    fn test_load_rejects_oversized_files() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "namespaces/media.yaml",
            "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: media\n",
        );
        let found = issues(
            ManifestStore::new(dir.path())
                .with_max_document_bytes(10)
                .load()
                .unwrap_err(),
        );
        assert!(found[0].message.contains("exceeds 10 bytes"));
    }

    #[test]
    fn test_size_limit_applies_per_document() {
        let dir = TempDir::new().unwrap();
        let namespace = "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: media\n";
        let config = "---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cfg\n  namespace: media\n";
        let big = format!(
            "---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: big\n  namespace: media\ndata:\n  blob: {}\n",
            "x".repeat(200)
        );
        let limit = namespace.len().max(config.len());

        // Together the two small documents exceed the limit; alone they don't
        write(dir.path(), "namespaces/media.yaml", &format!("{namespace}{config}"));
        let docs = ManifestStore::new(dir.path())
            .with_max_document_bytes(limit)
            .load()
            .unwrap();
        assert_eq!(docs.len(), 2);

        let neighbour = config.replace("name: cfg", "name: cf2");
        write(dir.path(), "configs/big.yaml", &format!("{neighbour}{big}"));
        let found = issues(
            ManifestStore::new(dir.path())
                .with_max_document_bytes(limit)
                .load()
                .unwrap_err(),
        );
        assert_eq!(found.len(), 1, "{found:?}");
        assert!(found[0].message.starts_with("document 2: exceeds"), "{found:?}");
    }

    #[test]
    fn test_huge_file_is_refused_unread() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "configs/huge.yaml", &"# filler\n".repeat(100));
        let found = issues(
            ManifestStore::new(dir.path())
                .with_max_document_bytes(10)
                .load()
                .unwrap_err(),
        );
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].message, "file exceeds 160 bytes");
    }

    #[test]
    fn test_split_documents_keeps_separators() {
        let content = "---\na: 1\n--- # second\nb: 2\n---\n";
        assert_eq!(
            split_documents(content),
            vec!["---\na: 1\n", "--- # second\nb: 2\n", "---\n"]
        );
        assert_eq!(split_documents("a: 1\n"), vec!["a: 1\n"]);
        assert!(split_documents("").is_empty());
    }

    #[test]
    fn test_builtin_namespaces_need_no_document() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "configs/cfg.yaml",
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cfg\n",
        );
        let docs = load(dir.path()).unwrap();
        assert_eq!(docs[0].key.namespace.as_deref(), Some("default"));
        assert!(docs[0].depends_on.is_empty());
    }

    #[test]
    fn test_missing_root_is_parse_error() {
        let err = load(Path::new("/definitely/not/here")).unwrap_err();
        assert!(err.is_fatal());
    }
}

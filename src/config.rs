//! `stackctl.toml` loading and validation
//!
//! Every field has a default, so a missing file or a missing section is
//! fine. Command-line flags are applied on top by the commands.

use anyhow::{Context, Result};
use declarative::store::DEFAULT_MAX_DOCUMENT_BYTES;
use declarative::types::DEFAULT_MANAGER;
use declarative::{ExecuteOptions, FailurePolicy, RetryConfig};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use teardown::{TeardownOptions, TeardownTarget, presets};
use thiserror::Error;

use crate::paths;

static SET_ID: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9_-]*$").ok());

/// Scopes name a lock file and fill a label value
static SCOPE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]{0,62}$").ok());

/// Problems with config content, as opposed to I/O or TOML syntax
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {field}: {message}")]
    Invalid { field: String, message: String },

    #[error("unknown target set '{id}' (available: {})", .known.join(", "))]
    UnknownSet { id: String, known: Vec<String> },
}

/// Check a reconcile scope name
pub fn check_scope(scope: &str) -> std::result::Result<(), ConfigError> {
    if SCOPE.as_ref().is_some_and(|re| re.is_match(scope)) {
        Ok(())
    } else {
        Err(invalid(
            "scope",
            format!("'{scope}' must be lowercase letters, digits and '-', at most 63 long"),
        ))
    }
}

fn invalid(field: impl Into<String>, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.into(),
        message: message.into(),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub reconcile: ReconcileSection,
    pub kubectl: KubectlSection,
    pub teardown: TeardownSection,
}

/// `[reconcile]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileSection {
    /// Operations in flight at once
    pub jobs: usize,
    /// Attempts per operation, including the first
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    /// Deadline for each cluster call
    pub timeout_secs: u64,
    /// Value of the `app.kubernetes.io/managed-by` label
    pub manager: String,
    pub on_failure: FailurePolicy,
    pub max_document_bytes: usize,
    /// Lock scope; one reconcile per scope at a time
    pub scope: String,
}

impl Default for ReconcileSection {
    fn default() -> Self {
        let retry = RetryConfig::default();
        Self {
            jobs: 4,
            max_attempts: retry.max_attempts,
            base_delay_ms: retry.base_delay.as_millis() as u64,
            max_delay_ms: retry.max_delay.as_millis() as u64,
            backoff_factor: retry.backoff_factor,
            timeout_secs: 30,
            manager: DEFAULT_MANAGER.to_string(),
            on_failure: FailurePolicy::default(),
            max_document_bytes: DEFAULT_MAX_DOCUMENT_BYTES,
            scope: declarative::reconciler::DEFAULT_SCOPE.to_string(),
        }
    }
}

/// `[kubectl]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KubectlSection {
    pub binary: String,
    pub context: Option<String>,
    pub kubeconfig: Option<String>,
}

impl Default for KubectlSection {
    fn default() -> Self {
        Self {
            binary: "kubectl".to_string(),
            context: None,
            kubeconfig: None,
        }
    }
}

/// `[teardown]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TeardownSection {
    /// Deadline for each host command
    pub timeout_secs: u64,
    /// User-defined target sets; an id shared with a builtin replaces it
    pub sets: BTreeMap<String, TargetSet>,
}

impl Default for TeardownSection {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            sets: BTreeMap::new(),
        }
    }
}

/// `[teardown.sets.<id>]`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetSet {
    #[serde(default)]
    pub description: Option<String>,
    pub targets: Vec<TeardownTarget>,
}

/// Where a target set comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetSource {
    Builtin,
    Config,
}

impl SetSource {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Builtin => "builtin",
            Self::Config => "config",
        }
    }
}

/// A resolvable target set, for listings
#[derive(Debug, Clone)]
pub struct SetEntry {
    pub id: String,
    pub source: SetSource,
    pub description: Option<String>,
    pub targets: Vec<TeardownTarget>,
}

impl Config {
    /// Load from `path`, or from the default location when `None`
    pub fn load(path: Option<&Path>) -> Result<(Self, PathBuf)> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => paths::config_file()?,
        };
        let config = Self::load_from(&path)?;
        Ok((config, path))
    }

    /// Load and validate one file; a missing file gives the defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Invalid TOML in {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config in {}", path.display()))?;
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let r = &self.reconcile;
        if r.jobs == 0 {
            return Err(invalid("reconcile.jobs", "must be at least 1"));
        }
        if r.max_attempts == 0 {
            return Err(invalid("reconcile.max_attempts", "must be at least 1"));
        }
        if r.backoff_factor < 1.0 {
            return Err(invalid("reconcile.backoff_factor", "must be at least 1.0"));
        }
        if r.timeout_secs == 0 {
            return Err(invalid("reconcile.timeout_secs", "must be positive"));
        }
        if r.manager.trim().is_empty() {
            return Err(invalid("reconcile.manager", "must not be empty"));
        }
        check_scope(&r.scope).map_err(|e| match e {
            ConfigError::Invalid { message, .. } => invalid("reconcile.scope", message),
            other => other,
        })?;
        if self.kubectl.binary.trim().is_empty() {
            return Err(invalid("kubectl.binary", "must not be empty"));
        }
        if self.teardown.timeout_secs == 0 {
            return Err(invalid("teardown.timeout_secs", "must be positive"));
        }

        for (id, set) in &self.teardown.sets {
            let field = format!("teardown.sets.{id}");
            if !SET_ID.as_ref().is_some_and(|re| re.is_match(id)) {
                return Err(invalid(field, "ids use lowercase letters, digits, '-' and '_'"));
            }
            if set.targets.is_empty() {
                return Err(invalid(field, "has no targets"));
            }
            // Reject broken patterns now rather than halfway through a teardown
            for target in &set.targets {
                if let TeardownTarget::DeleteInterfaces { pattern } = target
                    && let Err(e) = Regex::new(pattern)
                {
                    return Err(invalid(field, format!("bad pattern '{pattern}': {e}")));
                }
            }
        }
        Ok(())
    }

    /// Executor options from `[reconcile]`
    pub fn execute_options(&self) -> ExecuteOptions {
        let r = &self.reconcile;
        ExecuteOptions {
            dry_run: false,
            jobs: r.jobs,
            retry: RetryConfig {
                max_attempts: r.max_attempts,
                base_delay: Duration::from_millis(r.base_delay_ms),
                backoff_factor: r.backoff_factor,
                max_delay: Duration::from_millis(r.max_delay_ms),
            },
            timeout: Duration::from_secs(r.timeout_secs),
            on_failure: r.on_failure,
            manager: r.manager.clone(),
        }
    }

    pub fn teardown_options(&self) -> TeardownOptions {
        TeardownOptions {
            timeout: Duration::from_secs(self.teardown.timeout_secs),
            dry_run: false,
        }
    }

    /// Every target set, config sets shadowing builtins, sorted by id
    pub fn target_sets(&self) -> Vec<SetEntry> {
        let mut sets: BTreeMap<String, SetEntry> = BTreeMap::new();
        for id in presets::NAMES {
            if let Some(targets) = presets::preset(id) {
                sets.insert(
                    id.to_string(),
                    SetEntry {
                        id: id.to_string(),
                        source: SetSource::Builtin,
                        description: presets::description(id).map(str::to_string),
                        targets,
                    },
                );
            }
        }
        for (id, set) in &self.teardown.sets {
            sets.insert(
                id.clone(),
                SetEntry {
                    id: id.clone(),
                    source: SetSource::Config,
                    description: set.description.clone(),
                    targets: set.targets.clone(),
                },
            );
        }
        sets.into_values().collect()
    }

    /// Resolve a target set id
    pub fn target_set(&self, id: &str) -> std::result::Result<SetEntry, ConfigError> {
        let sets = self.target_sets();
        let known = sets.iter().map(|s| s.id.clone()).collect();
        sets.into_iter()
            .find(|s| s.id == id)
            .ok_or(ConfigError::UnknownSet {
                id: id.to_string(),
                known,
            })
    }
}

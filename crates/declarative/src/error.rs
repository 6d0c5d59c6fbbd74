//! Error types for reconciliation.
//!
//! Errors are categorized so the executor can decide whether an operation
//! is worth retrying, whether it aborts the whole run, or whether it only
//! fails the resource it belongs to.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::types::ResourceKey;

/// Categories of reconciliation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed desired-state input
    Parse,
    /// Unsatisfiable dependency ordering
    Cycle,
    /// Live state changed underneath us (transient)
    Conflict,
    /// A boundary call did not finish in time (transient)
    Timeout,
    /// The external system rejected the operation
    Validation,
    /// Another cycle is already running for the same scope
    Busy,
    /// The run was cancelled
    Cancelled,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    /// Whether this category is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict | Self::Timeout)
    }

    /// Whether this category aborts the run before any operation is attempted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Parse | Self::Cycle | Self::Busy)
    }

    /// Short label used in reports.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Parse => "parse",
            Self::Cycle => "cycle",
            Self::Conflict => "conflict",
            Self::Timeout => "timeout",
            Self::Validation => "validation",
            Self::Busy => "busy",
            Self::Cancelled => "cancelled",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A single problem found while loading manifests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIssue {
    /// File the problem was found in, if any
    pub path: Option<PathBuf>,
    /// What is wrong
    pub message: String,
}

impl ParseIssue {
    pub fn new(path: Option<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            path,
            message: message.into(),
        }
    }
}

impl fmt::Display for ParseIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{}: {}", path.display(), self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Errors that can occur while loading, planning or applying resources.
#[derive(Debug, Error)]
pub enum Error {
    /// One or more manifest documents are malformed
    #[error("{} manifest problem(s): {}", .issues.len(), format_issues(.issues))]
    Parse {
        /// Every problem found, in discovery order
        issues: Vec<ParseIssue>,
    },

    /// Dependency cycle between resources
    #[error("dependency cycle: {}", format_cycle(.members))]
    Cycle {
        /// Resources forming the cycle, in edge order
        members: Vec<ResourceKey>,
    },

    /// Observed state changed concurrently
    #[error("conflict on {key}: {message}")]
    Conflict { key: String, message: String },

    /// Boundary call exceeded its deadline
    #[error("timed out after {}s: {what}", .after.as_secs_f64())]
    Timeout { what: String, after: Duration },

    /// Operation rejected by the external system
    #[error("rejected: {message}")]
    Validation { message: String },

    /// A reconciliation cycle already holds this scope
    #[error("a reconciliation cycle is already running for scope '{scope}'")]
    Busy { scope: String },

    /// The run was cancelled before this operation was dispatched
    #[error("cancelled")]
    Cancelled,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

fn format_issues(issues: &[ParseIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn format_cycle(members: &[ResourceKey]) -> String {
    let mut parts: Vec<String> = members.iter().map(ToString::to_string).collect();
    if let Some(first) = members.first() {
        parts.push(first.to_string());
    }
    parts.join(" -> ")
}

impl Error {
    /// Get the error category for retry and abort decisions.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Parse { .. } => ErrorCategory::Parse,
            Error::Cycle { .. } => ErrorCategory::Cycle,
            Error::Conflict { .. } => ErrorCategory::Conflict,
            Error::Timeout { .. } => ErrorCategory::Timeout,
            Error::Validation { .. } => ErrorCategory::Validation,
            Error::Busy { .. } => ErrorCategory::Busy,
            Error::Cancelled => ErrorCategory::Cancelled,
            _ => ErrorCategory::Other,
        }
    }

    /// Whether this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }

    /// Whether this error aborts the run before anything is applied.
    pub fn is_fatal(&self) -> bool {
        self.category().is_fatal()
    }

    /// Build a single-issue parse error.
    pub fn parse(path: Option<PathBuf>, message: impl Into<String>) -> Self {
        Error::Parse {
            issues: vec![ParseIssue::new(path, message)],
        }
    }

    pub fn conflict(key: impl fmt::Display, message: impl Into<String>) -> Self {
        Error::Conflict {
            key: key.to_string(),
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
        }
    }
}

/// Result type for reconciliation operations.
pub type Result<T> = std::result::Result<T, Error>;

//! Error types for host teardown actions.
//!
//! Absence is its own category: removing something that is already gone
//! counts as success, so backends must report it as [`Error::NotFound`]
//! rather than a generic failure.

use std::time::Duration;
use thiserror::Error;

/// Categories of host action errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The thing to remove does not exist
    NotFound,
    /// Permission denied (usually needs root)
    Permission,
    /// The action exceeded its deadline
    Timeout,
    /// Bad discovery pattern
    Pattern,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    /// Whether the error means the target is already gone.
    pub fn is_absence(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    /// Get actionable advice for resolving this error category.
    pub fn advice(&self) -> &'static str {
        match self {
            Self::NotFound => "No action needed - already absent",
            Self::Permission => "Run teardown as root",
            Self::Timeout => "Raise [teardown] timeout_secs or check for hung processes",
            Self::Pattern => "Fix the regular expression in the target set",
            Self::Other => "Check the error details for more information",
        }
    }
}

/// Errors that can occur during teardown.
#[derive(Debug, Error)]
pub enum Error {
    /// Target is already absent
    #[error("not found: {what}")]
    NotFound {
        /// What was looked for
        what: String,
    },

    /// A host primitive failed for a reason other than absence
    #[error("{action} failed: {message}")]
    HostAction {
        /// The action that failed, e.g. `delete-interface cni0`
        action: String,
        /// Error output from the failed command
        message: String,
    },

    /// Permission denied
    #[error("permission denied: {message}")]
    Permission {
        /// Details about what permission was denied
        message: String,
    },

    /// Command did not finish in time
    #[error("timed out after {}s: {what}", .after.as_secs_f64())]
    Timeout { what: String, after: Duration },

    /// Invalid discovery pattern
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Get the error category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::NotFound { .. } => ErrorCategory::NotFound,
            Error::Permission { .. } => ErrorCategory::Permission,
            Error::Timeout { .. } => ErrorCategory::Timeout,
            Error::Pattern(_) => ErrorCategory::Pattern,
            Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound => ErrorCategory::NotFound,
            Error::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                ErrorCategory::Permission
            }
            _ => ErrorCategory::Other,
        }
    }

    /// Whether the error means the target is already gone.
    pub fn is_absence(&self) -> bool {
        self.category().is_absence()
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound { what: what.into() }
    }

    /// Create an error from a failed host command.
    ///
    /// Analyzes stderr to tell absence and permission problems apart from
    /// real failures.
    pub fn from_command_output(action: &str, stderr: &str) -> Self {
        let stderr_lower = stderr.to_lowercase();

        // Absence, as reported by systemctl, ip, umount and rm
        if stderr_lower.contains("not loaded")
            || stderr_lower.contains("does not exist")
            || stderr_lower.contains("cannot find device")
            || stderr_lower.contains("no such file or directory")
            || stderr_lower.contains("no such device")
            || stderr_lower.contains("not mounted")
            || stderr_lower.contains("no mount point specified")
            || stderr_lower.contains("not found")
        {
            return Error::NotFound {
                what: action.to_string(),
            };
        }

        if stderr_lower.contains("permission denied")
            || stderr_lower.contains("operation not permitted")
            || stderr_lower.contains("access denied")
            || stderr_lower.contains("must be superuser")
            || stderr_lower.contains("interactive authentication required")
        {
            return Error::Permission {
                message: format!("{action}: {}", stderr.trim()),
            };
        }

        Error::HostAction {
            action: action.to_string(),
            message: stderr.trim().to_string(),
        }
    }
}

impl From<declarative::Error> for Error {
    fn from(err: declarative::Error) -> Self {
        match err {
            declarative::Error::Timeout { what, after } => Error::Timeout { what, after },
            declarative::Error::Io(e) => Error::Io(e),
            other => Error::Other(other.to_string()),
        }
    }
}

/// Result type for teardown operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_command_output_absence() {
        let cases = [
            ("stop-service k3s", "Failed to stop k3s.service: Unit k3s.service not loaded."),
            ("delete-interface cni0", "Cannot find device \"cni0\""),
            ("delete-netns cni-1", "Cannot remove namespace file \"/run/netns/cni-1\": No such file or directory"),
            ("unmount /run/k3s", "umount: /run/k3s: not mounted."),
        ];
        for (action, stderr) in cases {
            let err = Error::from_command_output(action, stderr);
            assert!(err.is_absence(), "{action}: {err}");
        }
    }

    #[test]
    fn test_from_command_output_permission() {
        let err = Error::from_command_output("delete-interface cni0", "RTNETLINK answers: Operation not permitted");
        assert_eq!(err.category(), ErrorCategory::Permission);
        assert!(!err.is_absence());
    }

    #[test]
    fn test_from_command_output_other() {
        let err = Error::from_command_output("unmount /run/k3s", "umount: /run/k3s: target is busy.");
        assert!(matches!(err, Error::HostAction { .. }));
        assert_eq!(err.to_string(), "unmount /run/k3s failed: umount: /run/k3s: target is busy.");
    }

    #[test]
    fn test_io_not_found_is_absence() {
        let err = Error::from(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(err.is_absence());
    }

    #[test]
    fn test_from_declarative_timeout() {
        let err = Error::from(declarative::Error::Timeout {
            what: "systemctl stop k3s".into(),
            after: Duration::from_secs(5),
        });
        assert_eq!(err.category(), ErrorCategory::Timeout);
    }
}

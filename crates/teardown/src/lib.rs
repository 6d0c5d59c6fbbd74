//! # Teardown
//!
//! Idempotent removal of cluster residue from a host.
//!
//! A teardown is a list of [`TeardownTarget`]s: services to stop, process
//! patterns to kill, interfaces, network namespaces and mounts to remove,
//! data paths to delete and services to restart. The engine runs them in a
//! fixed stage order, attempts every action even after failures, and treats
//! an already-absent target as success, so a second run is always clean.
//!
//! ## Example
//!
//! ```ignore
//! use declarative::CancelToken;
//! use teardown::{NoProgress, TeardownOptions, backend, presets, teardown};
//!
//! let report = teardown(
//!     &presets::k3s(),
//!     &backend::default_backend(),
//!     &TeardownOptions::default(),
//!     &CancelToken::new(),
//!     &NoProgress,
//! );
//! assert!(report.is_success());
//! ```

pub mod backend;
pub mod engine;
pub mod error;
pub mod presets;
pub mod types;

pub use backend::HostBackend;
pub use backend::system::SystemBackend;
pub use engine::{NoProgress, TeardownProgress, expand, teardown};
pub use error::{Error, ErrorCategory, Result};
pub use types::{
    ActionOutcome, ActionRecord, HostAction, Stage, TeardownOptions, TeardownReport,
    TeardownTarget,
};

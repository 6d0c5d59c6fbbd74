//! Backend abstraction for host actions.
//!
//! The [`HostBackend`] trait is the only way the engine touches the host,
//! so tests can swap in a recording fake.

pub mod system;

use crate::error::Result;
use declarative::ApplyContext;
use std::path::{Path, PathBuf};

/// Host primitives used by teardown.
///
/// Every removal must report an already-absent target as
/// [`Error::NotFound`](crate::Error::NotFound) so the engine can treat it
/// as success.
pub trait HostBackend: Send + Sync {
    /// Stop a system service.
    fn stop_service(&self, name: &str, ctx: &ApplyContext) -> Result<()>;

    /// Restart a system service.
    fn restart_service(&self, name: &str, ctx: &ApplyContext) -> Result<()>;

    /// Terminate processes whose command line matches `pattern`.
    ///
    /// Returns how many processes matched; zero is not an error.
    fn kill_processes(&self, pattern: &str, ctx: &ApplyContext) -> Result<usize>;

    /// Names of all network interfaces.
    fn list_interfaces(&self, ctx: &ApplyContext) -> Result<Vec<String>>;

    /// Delete a network interface.
    fn delete_interface(&self, name: &str, ctx: &ApplyContext) -> Result<()>;

    /// Names of all network namespaces.
    fn list_netns(&self, ctx: &ApplyContext) -> Result<Vec<String>>;

    /// Delete a network namespace.
    fn delete_netns(&self, name: &str, ctx: &ApplyContext) -> Result<()>;

    /// Current mount points.
    fn list_mounts(&self, ctx: &ApplyContext) -> Result<Vec<PathBuf>>;

    /// Unmount a mount point.
    fn unmount(&self, path: &Path, ctx: &ApplyContext) -> Result<()>;

    /// Remove a file or directory tree.
    fn remove_path(&self, path: &Path, ctx: &ApplyContext) -> Result<()>;
}

/// Get the default backend (real host commands).
pub fn default_backend() -> system::SystemBackend {
    system::SystemBackend::new()
}

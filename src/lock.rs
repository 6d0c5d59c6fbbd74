//! Cross-process lock so two `stackctl` invocations never reconcile the
//! same scope at once
//!
//! The lock is an exclusive `flock` on `reconcile-<scope>.lock` in the
//! state directory. The kernel drops it when the holder exits, however it
//! exits, so a crashed run never leaves a lock behind. The file itself
//! stays and only records the holder's pid for error messages.

use anyhow::{Context, Result, bail};
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, Write};
use std::path::{Path, PathBuf};

/// Held lock; released on drop
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    file: File,
}

impl RunLock {
    /// Take the lock for `scope` inside `dir`
    ///
    /// `scope` must already be a valid scope name.
    pub fn acquire(dir: &Path, scope: &str) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create state directory: {}", dir.display()))?;
        let path = dir.join(format!("reconcile-{scope}.lock"));

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;

        if !try_lock(&file).with_context(|| format!("Failed to lock {}", path.display()))? {
            let owner = fs::read_to_string(&path).unwrap_or_default();
            let owner = owner.trim();
            let who = if owner.is_empty() {
                "another stackctl".to_string()
            } else {
                format!("another stackctl (pid {owner})")
            };
            bail!("{who} is reconciling scope '{scope}'");
        }

        file.set_len(0)
            .and_then(|()| file.rewind())
            .and_then(|()| writeln!(file, "{}", std::process::id()))
            .with_context(|| format!("Failed to write {}", path.display()))?;
        log::debug!("Acquired {}", path.display());
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        // Unlinking would let a waiter lock the old inode while a newcomer
        // locks a fresh one; clear the pid and let close release the lock
        if let Err(e) = self.file.set_len(0) {
            log::warn!("Could not clear lock {}: {e}", self.path.display());
        }
    }
}

/// Take an exclusive lock without blocking; `false` when someone holds it
#[cfg(unix)]
fn try_lock(file: &File) -> std::io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: the descriptor is owned by `file` and stays open for the call
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Ok(false)
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
fn try_lock(_file: &File) -> std::io::Result<bool> {
    Ok(true)
}

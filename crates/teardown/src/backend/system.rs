//! Host backend using `systemctl`, `pkill`, `ip`, `umount` and `std::fs`.

use crate::backend::HostBackend;
use crate::error::{Error, Result};
use declarative::{ApplyContext, CommandOutput, run_with_timeout};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Backend that executes real host commands.
///
/// Discovery reads the kernel's views directly: `/sys/class/net` for
/// interfaces, `/run/netns` for named network namespaces and
/// `/proc/mounts` for mount points. Those locations can be redirected for
/// tests, and so can the directory host programs are taken from.
#[derive(Debug, Clone)]
pub struct SystemBackend {
    net_dir: PathBuf,
    netns_dir: PathBuf,
    mounts_file: PathBuf,
    bin_dir: Option<PathBuf>,
}

impl Default for SystemBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemBackend {
    pub fn new() -> Self {
        Self {
            net_dir: PathBuf::from("/sys/class/net"),
            netns_dir: PathBuf::from("/run/netns"),
            mounts_file: PathBuf::from("/proc/mounts"),
            bin_dir: None,
        }
    }

    /// Read discovery data from other locations
    pub fn with_roots(net_dir: PathBuf, netns_dir: PathBuf, mounts_file: PathBuf) -> Self {
        Self {
            net_dir,
            netns_dir,
            mounts_file,
            bin_dir: None,
        }
    }

    /// Run host programs from `dir` instead of looking them up on `PATH`
    pub fn with_bin_dir(mut self, dir: PathBuf) -> Self {
        self.bin_dir = Some(dir);
        self
    }

    fn program(&self, name: &str) -> String {
        match &self.bin_dir {
            Some(dir) => dir.join(name).display().to_string(),
            None => name.to_string(),
        }
    }

    /// Run a host command, whatever its exit status.
    fn exec(&self, action: &str, program: &str, args: &[&str], ctx: &ApplyContext) -> Result<CommandOutput> {
        match run_with_timeout(&self.program(program), args, None, ctx.timeout) {
            Ok(output) => Ok(output),
            // A missing binary is a real failure, not an absent target
            Err(declarative::Error::Io(e)) => Err(Error::HostAction {
                action: action.to_string(),
                message: format!("cannot run {program}: {e}"),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Run a host command and check for success.
    fn run(&self, action: &str, program: &str, args: &[&str], ctx: &ApplyContext) -> Result<String> {
        if ctx.dry_run {
            log::debug!("dry run: {} {}", program, args.join(" "));
            return Ok(String::new());
        }
        let output = self.exec(action, program, args, ctx)?;
        if !output.success {
            return Err(Error::from_command_output(action, &output.stderr_str()));
        }
        Ok(output.stdout_str())
    }
}

impl HostBackend for SystemBackend {
    fn stop_service(&self, name: &str, ctx: &ApplyContext) -> Result<()> {
        self.run(&format!("stop-service {name}"), "systemctl", &["stop", name], ctx)?;
        Ok(())
    }

    fn restart_service(&self, name: &str, ctx: &ApplyContext) -> Result<()> {
        self.run(&format!("restart-service {name}"), "systemctl", &["restart", name], ctx)?;
        Ok(())
    }

    fn kill_processes(&self, pattern: &str, ctx: &ApplyContext) -> Result<usize> {
        let action = format!("kill-processes {pattern}");
        // pgrep and pkill: 0 matched, 1 nothing matched, 2 and up a bad
        // pattern or an internal error
        let found = self.exec(&action, "pgrep", &["-f", pattern], ctx)?;
        let matched = match found.code {
            Some(0) => found
                .stdout_str()
                .lines()
                .filter(|l| !l.trim().is_empty())
                .count(),
            Some(1) => return Ok(0),
            _ => return Err(match_failure(&action, "pgrep", &found)),
        };
        if ctx.dry_run {
            log::debug!("dry run: pkill -KILL -f {pattern}");
            return Ok(matched);
        }
        let killed = self.exec(&action, "pkill", &["-KILL", "-f", pattern], ctx)?;
        match killed.code {
            Some(0) => Ok(matched),
            // Exited between pgrep and pkill
            Some(1) => Ok(0),
            _ => Err(match_failure(&action, "pkill", &killed)),
        }
    }

    fn list_interfaces(&self, _ctx: &ApplyContext) -> Result<Vec<String>> {
        list_dir_names(&self.net_dir)
    }

    fn delete_interface(&self, name: &str, ctx: &ApplyContext) -> Result<()> {
        self.run(
            &format!("delete-interface {name}"),
            "ip",
            &["link", "delete", name],
            ctx,
        )?;
        Ok(())
    }

    fn list_netns(&self, _ctx: &ApplyContext) -> Result<Vec<String>> {
        list_dir_names(&self.netns_dir)
    }

    fn delete_netns(&self, name: &str, ctx: &ApplyContext) -> Result<()> {
        self.run(
            &format!("delete-netns {name}"),
            "ip",
            &["netns", "delete", name],
            ctx,
        )?;
        Ok(())
    }

    fn list_mounts(&self, _ctx: &ApplyContext) -> Result<Vec<PathBuf>> {
        let content = fs::read_to_string(&self.mounts_file)?;
        Ok(parse_mounts(&content))
    }

    fn unmount(&self, path: &Path, ctx: &ApplyContext) -> Result<()> {
        let target = path.to_string_lossy();
        self.run(&format!("unmount {target}"), "umount", &[target.as_ref()], ctx)?;
        Ok(())
    }

    fn remove_path(&self, path: &Path, ctx: &ApplyContext) -> Result<()> {
        let meta = match fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::not_found(path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        if ctx.dry_run {
            log::debug!("dry run: remove {}", path.display());
            return Ok(());
        }
        if meta.is_dir() {
            fs::remove_dir_all(path)?;
        } else {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

fn match_failure(action: &str, program: &str, output: &CommandOutput) -> Error {
    let status = output
        .code
        .map_or_else(|| "killed by a signal".to_string(), |c| format!("exit {c}"));
    Error::HostAction {
        action: action.to_string(),
        message: format!("{program} failed ({status}): {}", output.stderr_str().trim()),
    }
}

/// Entry names of a directory; a missing directory has none
fn list_dir_names(dir: &Path) -> Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut names = Vec::new();
    for entry in entries {
        names.push(entry?.file_name().to_string_lossy().to_string());
    }
    names.sort();
    Ok(names)
}

/// Mount points from `/proc/mounts` content
pub fn parse_mounts(content: &str) -> Vec<PathBuf> {
    content
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|field| PathBuf::from(unescape_mount_field(field)))
        .collect()
}

/// Undo the octal escapes the kernel uses for whitespace and backslashes
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && let Some(value) = field
                .get(i + 1..i + 4)
                .and_then(|digits| u8::from_str_radix(digits, 8).ok())
        {
            out.push(value);
            i += 4;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).to_string()
}

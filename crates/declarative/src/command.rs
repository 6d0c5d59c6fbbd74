//! Running external commands under a deadline

use crate::error::{Error, Result};
use std::io::{Read, Write};
use std::process::{Command, Output, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How long to wait for pipe threads after killing a timed-out child
const REAP_GRACE: Duration = Duration::from_secs(1);

/// Output from an external command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub success: bool,
    /// Exit code; `None` when the process was killed by a signal
    pub code: Option<i32>,
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            stdout: output.stdout,
            stderr: output.stderr,
            success: output.status.success(),
            code: output.status.code(),
        }
    }
}

impl CommandOutput {
    /// Get stdout as a string
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    /// Get stderr as a string
    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }
}

/// Run a command, feeding `input` on stdin, and kill it if it outlives `timeout`
///
/// Returns [`Error::Timeout`] when the deadline passes and [`Error::Io`] when
/// the program cannot be started. A non-zero exit is not an error here; check
/// [`CommandOutput::success`].
pub fn run_with_timeout(
    program: &str,
    args: &[&str],
    input: Option<&[u8]>,
    timeout: Duration,
) -> Result<CommandOutput> {
    log::trace!("exec: {} {}", program, args.join(" "));

    let mut child = Command::new(program)
        .args(args)
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let writer = match (input, child.stdin.take()) {
        (Some(bytes), Some(mut stdin)) => {
            let bytes = bytes.to_vec();
            Some(thread::spawn(move || {
                // Dropping stdin at the end closes the pipe
                let _ = stdin.write_all(&bytes);
            }))
        }
        _ => None,
    };
    let stdout = child.stdout.take().map(spawn_reader);
    let stderr = child.stderr.take().map(spawn_reader);

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            let grace = Instant::now() + REAP_GRACE;
            if let Some(writer) = writer {
                reap(writer, grace);
            }
            for reader in stdout.into_iter().chain(stderr) {
                reap(reader, grace);
            }
            return Err(Error::Timeout {
                what: format!("{} {}", program, args.join(" ")),
                after: timeout,
            });
        }
        thread::sleep(POLL_INTERVAL);
    };

    if let Some(writer) = writer {
        let _ = writer.join();
    }

    Ok(CommandOutput {
        stdout: stdout.map(join_reader).unwrap_or_default(),
        stderr: stderr.map(join_reader).unwrap_or_default(),
        success: status.success(),
        code: status.code(),
    })
}

/// Join a pipe thread once it finishes, giving up at `deadline`
///
/// A grandchild that inherited the pipe can keep it open after the child
/// is gone; such a thread is left to end on its own.
fn reap<T>(handle: JoinHandle<T>, deadline: Instant) {
    while !handle.is_finished() && Instant::now() < deadline {
        thread::sleep(POLL_INTERVAL);
    }
    if handle.is_finished() {
        let _ = handle.join();
    } else {
        log::debug!("Pipe still held open after kill, not waiting for it");
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        buf
    })
}

fn join_reader(handle: JoinHandle<Vec<u8>>) -> Vec<u8> {
    handle.join().unwrap_or_default()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_run_captures_output() {
        let out = run_with_timeout("sh", &["-c", "echo hi; echo err >&2"], None, Duration::from_secs(5))
            .unwrap();
        assert!(out.success);
        assert_eq!(out.stdout_str().trim(), "hi");
        assert_eq!(out.stderr_str().trim(), "err");
    }

    #[test]
    fn test_run_feeds_stdin() {
        let out = run_with_timeout("cat", &[], Some(b"payload"), Duration::from_secs(5)).unwrap();
        assert_eq!(out.stdout_str(), "payload");
    }

    #[test]
    fn test_run_reports_failure_exit() {
        let out = run_with_timeout("sh", &["-c", "exit 3"], None, Duration::from_secs(5)).unwrap();
        assert!(!out.success);
        assert_eq!(out.code, Some(3));
    }

    #[test]
    fn test_timeout_does_not_wait_on_inherited_pipes() {
        // The backgrounded sleep keeps stdout open after sh is killed
        let started = Instant::now();
        let err = run_with_timeout(
            "sh",
            &["-c", "sleep 5 & sleep 5"],
            None,
            Duration::from_millis(100),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_run_times_out() {
        let err = run_with_timeout("sleep", &["5"], None, Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[test]
    fn test_missing_program_is_io_error() {
        let err = run_with_timeout(
            "definitely-not-a-real-binary-xyz",
            &[],
            None,
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}

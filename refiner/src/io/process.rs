//! Helpers for running child processes with timeouts, cancellation and bounded output.

use std::io::{ErrorKind, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::cancel::CancelToken;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success() && !self.timed_out && !self.cancelled
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Render stdout and stderr as one log block, noting truncation.
    pub fn render_log(&self, label: &str) -> String {
        let mut buf = String::new();
        buf.push_str("=== stdout ===\n");
        buf.push_str(&String::from_utf8_lossy(&self.stdout));
        if self.stdout_truncated > 0 {
            buf.push_str(&format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            ));
        }
        buf.push_str("\n=== stderr ===\n");
        buf.push_str(&String::from_utf8_lossy(&self.stderr));
        if self.stderr_truncated > 0 {
            buf.push_str(&format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            ));
        }
        if self.timed_out {
            buf.push_str(&format!("\n[{label} timed out]\n"));
        }
        if self.cancelled {
            buf.push_str(&format!("\n[{label} cancelled]\n"));
        }
        buf
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
/// When `cancel` fires the child is killed and the output is marked `cancelled`.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    cancel: Option<&CancelToken>,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdin_handle = match stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            Some(thread::spawn(move || -> std::io::Result<()> {
                match child_stdin.write_all(&input) {
                    // The child may exit without reading all of its input.
                    Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(()),
                    other => other,
                }
            }))
        }
        None => None,
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let (status, timed_out, cancelled) = wait_with_deadline(&mut child, started, timeout, cancel)?;

    if let Some(handle) = stdin_handle {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(err = %e, "failed to write child stdin"),
            Err(_) => return Err(anyhow!("stdin writer thread panicked")),
        }
    }
    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    let elapsed = started.elapsed();
    debug!(
        exit_code = ?status.code(),
        timed_out,
        cancelled,
        elapsed_ms = elapsed.as_millis() as u64,
        "command finished"
    );
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        cancelled,
        elapsed,
    })
}

/// Wait in short slices so cancellation is noticed while the child runs.
fn wait_with_deadline(
    child: &mut Child,
    started: Instant,
    timeout: Duration,
    cancel: Option<&CancelToken>,
) -> Result<(ExitStatus, bool, bool)> {
    loop {
        let waited = started.elapsed();
        if waited >= timeout {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            return Ok((kill_and_wait(child)?, true, false));
        }
        if cancel.is_some_and(CancelToken::is_cancelled) {
            warn!("run cancelled, killing command");
            return Ok((kill_and_wait(child)?, false, true));
        }
        let slice = (timeout - waited).min(CancelToken::poll_interval());
        if let Some(status) = child.wait_timeout(slice).context("wait for command")? {
            return Ok((status, false, false));
        }
    }
}

fn kill_and_wait(child: &mut Child) -> Result<ExitStatus> {
    if let Err(e) = child.kill() {
        // Already exited between the last poll and the kill.
        if e.kind() != ErrorKind::InvalidInput {
            return Err(e).context("kill command");
        }
    }
    child.wait().context("wait command after kill")
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_stdout_stderr_and_status() {
        let out = run_command_with_timeout(
            sh("echo out; echo err >&2; exit 3"),
            None,
            Duration::from_secs(10),
            1000,
            None,
        )
        .expect("run");
        assert_eq!(out.status.code(), Some(3));
        assert_eq!(out.stdout_lossy(), "out\n");
        assert_eq!(out.stderr_lossy(), "err\n");
        assert!(!out.success());
    }

    #[test]
    fn feeds_stdin() {
        let out = run_command_with_timeout(
            sh("cat"),
            Some(b"context text"),
            Duration::from_secs(10),
            1000,
            None,
        )
        .expect("run");
        assert!(out.success());
        assert_eq!(out.stdout_lossy(), "context text");
    }

    #[test]
    fn kills_on_timeout() {
        let out = run_command_with_timeout(
            sh("sleep 5"),
            None,
            Duration::from_millis(200),
            1000,
            None,
        )
        .expect("run");
        assert!(out.timed_out);
        assert!(!out.success());
        assert!(out.elapsed < Duration::from_secs(5));
    }

    #[test]
    fn kills_on_cancel() {
        let token = CancelToken::new();
        token.cancel();
        let out = run_command_with_timeout(
            sh("sleep 5"),
            None,
            Duration::from_secs(30),
            1000,
            Some(&token),
        )
        .expect("run");
        assert!(out.cancelled);
        assert!(!out.timed_out);
        assert!(out.render_log("validation").contains("[validation cancelled]"));
    }

    #[test]
    fn truncates_output_beyond_limit() {
        let out = run_command_with_timeout(
            sh("printf 'abcdefghij'"),
            None,
            Duration::from_secs(10),
            4,
            None,
        )
        .expect("run");
        assert_eq!(out.stdout, b"abcd");
        assert_eq!(out.stdout_truncated, 6);
        assert!(out.render_log("proposer").contains("truncated 6 bytes"));
    }
}

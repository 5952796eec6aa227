//! Helpers for running child processes with timeouts and bounded output.

use std::io::{Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
}

/// Run a command with a timeout, feeding `stdin` and capturing both output streams.
///
/// Output is drained on reader threads while the child runs so a chatty agent cannot
/// deadlock on a full pipe. `output_limit_bytes` bounds the bytes kept per stream;
/// anything beyond the cap is discarded while the pipe keeps draining.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = cmd.spawn().context("spawn command")?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_limited(stderr, output_limit_bytes));

    // Stdin is fed on its own thread: input larger than the pipe buffer must
    // not deadlock against a child that writes output before draining stdin.
    let stdin_handle = match stdin {
        Some(input) => {
            let child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            Some(thread::spawn(move || write_stdin(child_stdin, &input)))
        }
        None => None,
    };

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    if let Some(handle) = stdin_handle {
        handle
            .join()
            .map_err(|_| anyhow!("stdin writer thread panicked"))??;
    }
    let stdout = join_reader(stdout_handle).context("join stdout")?;
    let stderr = join_reader(stderr_handle).context("join stderr")?;

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        timed_out,
    })
}

// Dropping the handle closes the pipe so the child sees EOF. A child that
// exits (or is killed) without draining its stdin surfaces as a broken pipe,
// which is not an error here.
fn write_stdin(mut stdin: std::process::ChildStdin, input: &[u8]) -> Result<()> {
    match stdin.write_all(input) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
        Err(err) => Err(err).context("write stdin"),
    }
}

fn join_reader(handle: thread::JoinHandle<Result<Vec<u8>>>) -> Result<Vec<u8>> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_limited<R: Read>(mut reader: R, limit: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut dropped = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        let keep = n.min(remaining);
        buf.extend_from_slice(&chunk[..keep]);
        dropped += n - keep;
    }

    if dropped > 0 {
        warn!(dropped, "output exceeded limit, tail discarded");
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdin_is_fed_back_through_stdout() {
        let mut cmd = Command::new("cat");
        cmd.arg("-");
        let output = run_command_with_timeout(
            cmd,
            Some(b"hello pipe"),
            Duration::from_secs(10),
            1024,
        )
        .expect("run");
        assert!(output.status.success());
        assert_eq!(output.stdout, b"hello pipe");
    }

    #[test]
    fn large_stdin_against_an_eagerly_writing_child_finishes() {
        // The child fills its stdout pipe before touching stdin; the parent
        // writes far more than one pipe buffer of input at the same time.
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg("head -c 200000 /dev/zero; cat >/dev/null; echo ok");
        let input = vec![b'x'; 1 << 20];
        let output =
            run_command_with_timeout(cmd, Some(&input), Duration::from_secs(30), 1024)
                .expect("run");
        assert!(output.status.success());
        assert!(!output.timed_out);
        // The cap discards the tail but the pipes stayed drained.
        assert_eq!(output.stdout.len(), 1024);
    }

    #[test]
    fn timeout_kills_a_stuck_child() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("sleep 30");
        let output = run_command_with_timeout(cmd, None, Duration::from_millis(100), 1024)
            .expect("run");
        assert!(output.timed_out);
        assert!(!output.status.success());
    }

    #[test]
    fn child_exiting_without_reading_stdin_is_not_an_error() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("exit 3");
        let input = vec![b'x'; 1 << 20];
        let output = run_command_with_timeout(cmd, Some(&input), Duration::from_secs(10), 1024)
            .expect("run");
        assert_eq!(output.status.code(), Some(3));
    }
}

//! Turn invocation against the external coding agent CLI.
//!
//! The [`TurnInvoker`] trait decouples the retry loops from the actual agent
//! backend (currently `codex exec`). Tests use scripted invokers that return
//! predetermined messages without spawning processes.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::io::process::run_command_with_timeout;

/// Environment variable selecting the external agent binary.
pub const BINARY_ENV: &str = "CODEX_BIN";

const DEFAULT_BINARY: &str = "codex";
const DEFAULT_TURN_TIMEOUT: Duration = Duration::from_secs(60 * 60);
const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 8 * 1024 * 1024;

/// The external agent process failed outright. Always fatal to the current
/// run; the core never retries it silently.
#[derive(Debug, Error)]
pub enum InvocationError {
    #[error("failed to run agent process: {0}")]
    Process(String),

    #[error("agent exited with code {code:?}: {stderr}")]
    ExitStatus { code: Option<i32>, stderr: String },

    #[error("agent timed out after {0:?}")]
    TimedOut(Duration),

    #[error("agent returned no message; raw output:\n{0}")]
    NoMessage(String),

    #[error("could not parse extra agent flags: {0}")]
    Flags(String),
}

/// Parameters for one blocking round-trip with the agent.
#[derive(Debug, Clone)]
pub struct TurnRequest<'a> {
    /// Prompt text fed to the agent on stdin.
    pub prompt: &'a str,
    /// Working directory for the agent process.
    pub cwd: Option<&'a Path>,
    /// Continuation token resuming a prior conversation, if any.
    pub session_token: Option<&'a str>,
    /// Whether to run the agent unrestricted (`--yolo`) or sandboxed (`--full-auto`).
    pub yolo: bool,
    /// Additional raw CLI flags, shell-quoted as one string.
    pub flags: Option<&'a str>,
}

/// The agent's final message plus the refreshed continuation token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub message: String,
    pub session_token: Option<String>,
}

/// Abstraction over agent invocation backends.
pub trait TurnInvoker: Sync {
    /// Perform one turn. Blocks until the agent finishes or fails.
    fn invoke(&self, request: &TurnRequest<'_>) -> Result<Turn, InvocationError>;
}

/// Invoker that spawns the codex CLI and decodes its JSONL event stream.
#[derive(Debug, Clone)]
pub struct CodexInvoker {
    binary: PathBuf,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl Default for CodexInvoker {
    fn default() -> Self {
        let binary = std::env::var_os(BINARY_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BINARY));
        Self {
            binary,
            timeout: DEFAULT_TURN_TIMEOUT,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
        }
    }
}

impl CodexInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn command(&self, request: &TurnRequest<'_>) -> Result<Command, InvocationError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("exec")
            .arg("--json")
            .arg("--color")
            .arg("never")
            .arg("--skip-git-repo-check");
        if request.yolo {
            cmd.arg("--yolo");
        } else {
            cmd.arg("--full-auto");
        }
        if let Some(flags) = request.flags {
            let extra = shlex::split(flags)
                .ok_or_else(|| InvocationError::Flags(flags.to_string()))?;
            cmd.args(extra);
        }
        if let Some(cwd) = request.cwd {
            cmd.arg("--cd").arg(cwd);
            cmd.current_dir(cwd);
        }
        if let Some(token) = request.session_token {
            cmd.arg("resume").arg(token);
        }
        cmd.arg("-");
        Ok(cmd)
    }
}

impl TurnInvoker for CodexInvoker {
    #[instrument(skip_all, fields(resuming = request.session_token.is_some(), yolo = request.yolo))]
    fn invoke(&self, request: &TurnRequest<'_>) -> Result<Turn, InvocationError> {
        info!(binary = %self.binary.display(), "starting agent turn");
        let cmd = self.command(request)?;

        let output = run_command_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )
        .map_err(|err| InvocationError::Process(format!("{err:#}")))?;

        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "agent turn timed out");
            return Err(InvocationError::TimedOut(self.timeout));
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(exit_code = ?output.status.code(), "agent turn failed");
            return Err(InvocationError::ExitStatus {
                code: output.status.code(),
                stderr,
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let turn = decode_turn(&stdout)?;
        debug!(
            message_bytes = turn.message.len(),
            has_token = turn.session_token.is_some(),
            "agent turn completed"
        );
        Ok(turn)
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ThreadEvent {
    #[serde(rename = "thread.started")]
    ThreadStarted {
        #[serde(default)]
        thread_id: Option<String>,
    },
    #[serde(rename = "item.completed")]
    ItemCompleted { item: ThreadItem },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ThreadItem {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

/// Decode a JSONL event stream into the final agent message and continuation token.
///
/// Only `thread.started` (token) and completed `agent_message` items matter;
/// intermediate reasoning and tool events are discarded. Multiple agent messages
/// in one turn join with a blank line. A turn that produced no message at all is
/// an [`InvocationError::NoMessage`] carrying the undecodable lines (or the whole
/// output) as a diagnostic.
pub fn decode_turn(stdout: &str) -> Result<Turn, InvocationError> {
    let mut session_token = None;
    let mut messages: Vec<String> = Vec::new();
    let mut raw_lines: Vec<&str> = Vec::new();

    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<ThreadEvent>(line) {
            Ok(ThreadEvent::ThreadStarted { thread_id }) => {
                if let Some(id) = thread_id {
                    session_token = Some(id);
                }
            }
            Ok(ThreadEvent::ItemCompleted { item }) => {
                if item.kind == "agent_message"
                    && let Some(text) = item.text
                {
                    messages.push(text);
                }
            }
            Ok(ThreadEvent::Other) => {}
            Err(_) => raw_lines.push(line),
        }
    }

    if messages.is_empty() {
        let raw = if raw_lines.is_empty() {
            stdout.trim().to_string()
        } else {
            raw_lines.join("\n")
        };
        return Err(InvocationError::NoMessage(raw));
    }

    Ok(Turn {
        message: messages.join("\n\n"),
        session_token,
    })
}

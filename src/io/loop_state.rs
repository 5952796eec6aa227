//! Durable state file backing the ralph loop's cooperative cancellation.
//!
//! The file doubles as the cancellation sentinel: its presence means the loop
//! may keep going, and removing it (by hand or via `ralph --cancel`) asks the
//! loop to stop at the next round boundary. State therefore lives on disk, not
//! in loop memory, so an operator in another process can cancel a run.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

/// Directory under the working directory holding loop state.
pub const STATE_DIR: &str = ".codexrun";
/// State/sentinel file name. `.local.` marks it as never-committed scratch.
pub const STATE_FILE: &str = "ralph-loop.local.md";

/// Snapshot written before every round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopState {
    pub iteration: u32,
    pub max_iterations: u32,
    pub completion_promise: Option<String>,
    pub started_at: String,
    pub prompt: String,
}

/// Resolve the state file path for a working directory (cwd of the process
/// when `None`).
pub fn state_path(cwd: Option<&Path>) -> Result<PathBuf> {
    let root = match cwd {
        Some(dir) => dir.to_path_buf(),
        None => std::env::current_dir().context("resolve current directory")?,
    };
    Ok(root.join(STATE_DIR).join(STATE_FILE))
}

/// Atomically write the state file (temp file + rename).
pub fn write_state(path: &Path, state: &LoopState) -> Result<()> {
    debug!(path = %path.display(), iteration = state.iteration, "writing loop state");
    let parent = path
        .parent()
        .with_context(|| format!("state path missing parent {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("md.tmp");
    fs::write(&tmp_path, render_state(state))
        .with_context(|| format!("write temp state {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace state {}", path.display()))?;
    Ok(())
}

/// Read the `iteration` field back out of an existing state file, if parseable.
pub fn read_iteration(path: &Path) -> Option<u32> {
    let contents = fs::read_to_string(path).ok()?;
    frontmatter_field(&contents, "iteration")?.parse().ok()
}

/// Remove the state file. Missing files are fine (already cancelled).
pub fn clear_state(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove state {}", path.display())),
    }
}

fn render_state(state: &LoopState) -> String {
    let promise = match &state.completion_promise {
        Some(text) => format!("\"{text}\""),
        None => "null".to_string(),
    };
    format!(
        "---\n\
         active: true\n\
         iteration: {}\n\
         max_iterations: {}\n\
         completion_promise: {}\n\
         started_at: \"{}\"\n\
         ---\n\
         \n\
         {}",
        state.iteration, state.max_iterations, promise, state.started_at, state.prompt
    )
}

fn frontmatter_field<'a>(contents: &'a str, key: &str) -> Option<&'a str> {
    let mut lines = contents.lines();
    if lines.next()?.trim() != "---" {
        return None;
    }
    for line in lines {
        if line.trim() == "---" {
            break;
        }
        if let Some((name, value)) = line.split_once(':')
            && name.trim() == key
        {
            return Some(value.trim());
        }
    }
    None
}

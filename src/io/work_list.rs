//! Persisted work-item list backing the fan-out runner.
//!
//! One item per line. A bare line is pending; a line starting with a status
//! marker has already been handled and is skipped on load. Finished lines get
//! the item's one-line outcome appended after a `|` separator, so the file is
//! both the input and the durable progress record of a run.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

/// Item currently being processed.
pub const RUNNING_MARKER: &str = "⏳";
/// Item finished successfully.
pub const SUCCEEDED_MARKER: &str = "✅";
/// Item finished with a failure.
pub const FAILED_MARKER: &str = "❌";

const MARKERS: [&str; 3] = [RUNNING_MARKER, SUCCEEDED_MARKER, FAILED_MARKER];

/// Which previously-marked lines to put back in the queue before a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryMode {
    /// Leave marked lines alone.
    None,
    /// Re-queue lines marked failed.
    Failed,
    /// Re-queue every marked line.
    All,
}

/// In-memory view of the list file, rewritten in place as items progress.
#[derive(Debug)]
pub struct WorkList {
    path: PathBuf,
    lines: Vec<String>,
    ends_with_newline: bool,
}

impl WorkList {
    pub fn load(path: &Path) -> Result<Self> {
        let data =
            fs::read_to_string(path).with_context(|| format!("read list {}", path.display()))?;
        let ends_with_newline = data.ends_with('\n');
        let lines = data.lines().map(str::to_string).collect();
        Ok(Self {
            path: path.to_path_buf(),
            lines,
            ends_with_newline,
        })
    }

    /// Items still to run, as `(line index, item content)` in file order.
    /// Blank lines and already-marked lines are excluded.
    pub fn pending_items(&self) -> Vec<(usize, String)> {
        self.lines
            .iter()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty() && status_marker(line).is_none())
            .map(|(index, line)| (index, line.clone()))
            .collect()
    }

    /// Count of lines carrying a status marker (treated as already complete).
    pub fn skipped(&self) -> usize {
        self.lines
            .iter()
            .filter(|line| status_marker(line).is_some())
            .count()
    }

    /// Mark a line as in progress and persist the file.
    pub fn mark_running(&mut self, index: usize, item: &str) -> Result<()> {
        self.lines[index] = format!("{RUNNING_MARKER} {item}");
        self.save()
    }

    /// Record an item's final status and one-line outcome, persisting the file.
    /// This write is the last observable effect of the item's run.
    pub fn finalize(&mut self, index: usize, item: &str, success: bool, outcome: &str) -> Result<()> {
        let marker = if success { SUCCEEDED_MARKER } else { FAILED_MARKER };
        self.lines[index] = format!("{marker} {item} | {outcome}");
        self.save()
    }

    pub fn line(&self, index: usize) -> &str {
        &self.lines[index]
    }

    fn save(&self) -> Result<()> {
        let mut text = self.lines.join("\n");
        if self.ends_with_newline {
            text.push('\n');
        }
        write_atomic(&self.path, &text)
    }
}

/// The status marker at the head of a line, if any.
pub fn status_marker(line: &str) -> Option<&'static str> {
    MARKERS
        .iter()
        .find(|marker| line.starts_with(*marker))
        .copied()
}

/// Strip markers and outcome annotations so items run again.
///
/// `RetryMode::Failed` resets only failed lines; `RetryMode::All` resets every
/// marked line. The file is rewritten only when something changed.
pub fn reset_for_retry(path: &Path, mode: RetryMode) -> Result<()> {
    if mode == RetryMode::None {
        return Ok(());
    }
    let data = fs::read_to_string(path).with_context(|| format!("read list {}", path.display()))?;
    let ends_with_newline = data.ends_with('\n');

    let mut changed = false;
    let cleaned: Vec<String> = data
        .lines()
        .map(|line| {
            let reset = match mode {
                RetryMode::All => status_marker(line).is_some(),
                RetryMode::Failed => line.starts_with(FAILED_MARKER),
                RetryMode::None => false,
            };
            if !reset {
                return line.to_string();
            }
            changed = true;
            strip_annotations(line)
        })
        .collect();

    if !changed {
        return Ok(());
    }
    debug!(path = %path.display(), "re-queued marked items");
    let mut text = cleaned.join("\n");
    if ends_with_newline {
        text.push('\n');
    }
    write_atomic(path, &text)
}

fn strip_annotations(line: &str) -> String {
    let mut rest = line;
    if let Some(marker) = status_marker(rest) {
        rest = &rest[marker.len()..];
        rest = rest.strip_prefix(' ').unwrap_or(rest);
    }
    match rest.find('|') {
        Some(pipe) => rest[..pipe].trim_end().to_string(),
        None => rest.to_string(),
    }
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    // The temp file lands next to the list so the rename stays on one filesystem.
    let tmp_path = path.with_extension("list.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp list {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace list {}", path.display()))?;
    Ok(())
}

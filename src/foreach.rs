//! Bounded-parallel fan-out of one task definition over a work-item list.
//!
//! Each pending item gets its own rendered task and its own conversation.
//! Progress is persisted into the list file itself, so an interrupted run can
//! be resumed: already-marked lines are skipped, and retry modes re-queue
//! them explicitly.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;

use anyhow::{Result, anyhow, bail};
use tracing::{info, instrument, warn};

use crate::io::invoker::TurnInvoker;
use crate::io::taskfile::TaskDefinition;
use crate::io::work_list::{RetryMode, WorkList, reset_for_retry};
use crate::session::SessionOptions;
use crate::task::run_task;

/// Fan-out settings.
#[derive(Debug, Clone)]
pub struct ForeachConfig {
    /// Worker cap. `None` runs every pending item concurrently.
    pub workers: Option<usize>,
    pub retry: RetryMode,
    pub session: SessionOptions,
}

impl Default for ForeachConfig {
    fn default() -> Self {
        Self {
            workers: None,
            retry: RetryMode::None,
            session: SessionOptions::default(),
        }
    }
}

/// One item's final status.
#[derive(Debug, Clone)]
pub struct ItemOutcome {
    pub item: String,
    pub success: bool,
    /// The one-line outcome written to the list file.
    pub summary: String,
}

/// Aggregate result of a fan-out run.
#[derive(Debug, Clone)]
pub struct ForeachResult {
    pub succeeded: usize,
    pub failed: usize,
    /// Lines already marked before the run started.
    pub skipped: usize,
    /// Outcomes for this run's items, in list-file order.
    pub outcomes: Vec<ItemOutcome>,
}

/// Run the task definition over every pending item in the list file.
///
/// A failed item never aborts the run; only an unwritable list file does.
#[instrument(skip_all, fields(list = %list_path.display(), retry = ?config.retry))]
pub fn run_foreach<I: TurnInvoker + ?Sized>(
    invoker: &I,
    list_path: &Path,
    task_def: &TaskDefinition,
    config: &ForeachConfig,
) -> Result<ForeachResult> {
    if config.workers == Some(0) {
        bail!("worker count must be at least 1");
    }
    reset_for_retry(list_path, config.retry)?;

    let list = WorkList::load(list_path)?;
    let skipped = list.skipped();
    let pending = list.pending_items();
    if pending.is_empty() {
        info!(skipped, "nothing to do");
        return Ok(ForeachResult {
            succeeded: 0,
            failed: 0,
            skipped,
            outcomes: Vec::new(),
        });
    }

    let workers = config
        .workers
        .map_or(pending.len(), |cap| cap.min(pending.len()));
    info!(items = pending.len(), workers, skipped, "starting fan-out");

    let list = Mutex::new(list);
    let next = AtomicUsize::new(0);
    let slots: Mutex<Vec<Option<ItemOutcome>>> = Mutex::new(vec![None; pending.len()]);
    let persist_errors: Mutex<Vec<String>> = Mutex::new(Vec::new());

    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                loop {
                    let slot = next.fetch_add(1, Ordering::SeqCst);
                    let Some((line_index, item)) = pending.get(slot) else {
                        break;
                    };
                    if let Err(err) = lock(&list).mark_running(*line_index, item) {
                        lock(&persist_errors).push(format!("{err:#}"));
                        break;
                    }

                    let outcome = run_item(invoker, task_def, item, config);
                    let persisted =
                        lock(&list).finalize(*line_index, item, outcome.success, &outcome.summary);
                    if let Err(err) = persisted {
                        lock(&persist_errors).push(format!("{err:#}"));
                        break;
                    }
                    lock(&slots)[slot] = Some(outcome);
                }
            });
        }
    });

    let persist_errors = lock(&persist_errors);
    if let Some(first) = persist_errors.first() {
        return Err(anyhow!("could not persist list progress: {first}"));
    }

    let outcomes: Vec<ItemOutcome> = lock(&slots).iter().flatten().cloned().collect();
    let succeeded = outcomes.iter().filter(|outcome| outcome.success).count();
    let failed = outcomes.len() - succeeded;
    info!(succeeded, failed, skipped, "fan-out finished");

    Ok(ForeachResult {
        succeeded,
        failed,
        skipped,
        outcomes,
    })
}

fn run_item<I: TurnInvoker + ?Sized>(
    invoker: &I,
    task_def: &TaskDefinition,
    item: &str,
    config: &ForeachConfig,
) -> ItemOutcome {
    let spec = match task_def.to_spec(Some(item), &config.session) {
        Ok(spec) => spec,
        Err(err) => {
            warn!(item, error = %err, "could not render task for item");
            return ItemOutcome {
                item: item.to_string(),
                success: false,
                summary: format!("{err:#}"),
            };
        }
    };
    let max_iterations = spec.max_iterations;

    match run_task(invoker, &spec) {
        Ok(result) => {
            let text = if result.success {
                result.summary
            } else {
                result.last_error.unwrap_or(result.summary)
            };
            ItemOutcome {
                item: item.to_string(),
                success: result.success,
                summary: format!(
                    "{} {}",
                    one_line(&text),
                    format_turns(Some(result.iterations), max_iterations)
                ),
            }
        }
        Err(err) => {
            warn!(item, error = %err, "item run failed");
            ItemOutcome {
                item: item.to_string(),
                success: false,
                summary: format!(
                    "{} {}",
                    one_line(&format!("{err:#}")),
                    format_turns(None, max_iterations)
                ),
            }
        }
    }
}

// Workers only hold the locks across short file writes; a panic mid-write
// still leaves valid data, so poisoned locks are safe to take over.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn one_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn format_turns(used: Option<u32>, total: u32) -> String {
    match used {
        Some(used) => format!("[turns: {used}/{total}]"),
        None => format!("[turns: ?/{total}]"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_line_collapses_whitespace() {
        assert_eq!(one_line("a  b\nc\t d"), "a b c d");
        assert_eq!(one_line(""), "");
    }

    #[test]
    fn turn_counters_render_both_shapes() {
        assert_eq!(format_turns(Some(3), 10), "[turns: 3/10]");
        assert_eq!(format_turns(None, 5), "[turns: ?/5]");
    }
}

//! Repeat-until-promise loop with durable, file-based cancellation.
//!
//! The same prompt is sent round after round until the agent emits the
//! configured completion promise, the round cap is hit, or an operator cancels
//! the run by deleting the state file. The sentinel is checked both before and
//! after each turn, so a cancellation during a long turn still wins over
//! whatever the turn produced.

use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{info, instrument, warn};

use crate::io::invoker::TurnInvoker;
use crate::io::loop_state::{LoopState, clear_state, read_iteration, state_path, write_state};
use crate::session::{SessionContext, SessionOptions};

/// Configuration for one loop run.
#[derive(Debug, Clone)]
pub struct RalphConfig {
    /// Prompt repeated every round.
    pub prompt: String,
    /// Round cap. `0` means unbounded; stop on promise or cancellation.
    pub max_iterations: u32,
    /// Literal text whose presence in a round's output ends the loop.
    pub completion_promise: Option<String>,
    /// Start a fresh conversation every round instead of reusing one.
    pub fresh: bool,
    pub session: SessionOptions,
}

impl RalphConfig {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            max_iterations: 0,
            completion_promise: None,
            fresh: true,
            session: SessionOptions::default(),
        }
    }
}

/// Why the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RalphStop {
    /// The state file disappeared.
    Cancelled,
    /// A round's output contained the completion promise.
    Promise,
    /// The round cap was reached without a promise.
    MaxIterations,
}

#[derive(Debug, Clone)]
pub struct RalphOutcome {
    pub stop: RalphStop,
    /// Rounds fully completed.
    pub iterations: u32,
    pub last_message: Option<String>,
}

/// Run the loop to completion.
pub fn run_ralph_loop<I: TurnInvoker + ?Sized>(
    invoker: &I,
    config: &RalphConfig,
) -> Result<RalphOutcome> {
    run_ralph_loop_with_progress(invoker, config, |_, _| {})
}

/// [`run_ralph_loop`] with a per-round callback receiving the round number and
/// the agent's message.
#[instrument(skip_all, fields(max_iterations = config.max_iterations, fresh = config.fresh))]
pub fn run_ralph_loop_with_progress<I: TurnInvoker + ?Sized>(
    invoker: &I,
    config: &RalphConfig,
    mut on_round: impl FnMut(u32, &str),
) -> Result<RalphOutcome> {
    if config.prompt.trim().is_empty() {
        bail!("loop prompt is empty");
    }

    let path = state_path(config.session.cwd.as_deref())?;
    let started_at = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    let mut state = LoopState {
        iteration: 1,
        max_iterations: config.max_iterations,
        completion_promise: config.completion_promise.clone(),
        started_at,
        prompt: config.prompt.clone(),
    };
    write_state(&path, &state)?;
    info!(state = %path.display(), "loop started");

    let round_prompt = round_prompt(config);
    let mut reused_session: Option<SessionContext<'_, I>> = None;
    let mut last_message: Option<String> = None;

    let outcome = loop {
        let iteration = state.iteration;
        if !path.exists() {
            info!(iteration, "state file removed, stopping");
            break RalphOutcome {
                stop: RalphStop::Cancelled,
                iterations: iteration - 1,
                last_message,
            };
        }

        info!(iteration, "starting loop round");
        let message = if config.fresh {
            let mut session = SessionContext::new(invoker, config.session.clone());
            session.send(&round_prompt)
        } else {
            let session = reused_session
                .get_or_insert_with(|| SessionContext::new(invoker, config.session.clone()));
            session.send(&round_prompt)
        };
        let message = match message {
            Ok(message) => message,
            Err(err) => {
                // Leave no stale sentinel behind when the run dies.
                let _ = clear_state(&path);
                return Err(err).with_context(|| format!("loop round {iteration}"));
            }
        };
        on_round(iteration, &message);

        // A cancellation issued while the turn ran beats the turn's outcome.
        if !path.exists() {
            info!(iteration, "cancelled during round");
            break RalphOutcome {
                stop: RalphStop::Cancelled,
                iterations: iteration,
                last_message: Some(message),
            };
        }

        if let Some(promise) = &config.completion_promise
            && message.contains(promise.as_str())
        {
            info!(iteration, "completion promise found");
            break RalphOutcome {
                stop: RalphStop::Promise,
                iterations: iteration,
                last_message: Some(message),
            };
        }

        if config.max_iterations > 0 && iteration >= config.max_iterations {
            warn!(iteration, "round cap reached without promise");
            break RalphOutcome {
                stop: RalphStop::MaxIterations,
                iterations: iteration,
                last_message: Some(message),
            };
        }

        last_message = Some(message);
        state.iteration = iteration + 1;
        write_state(&path, &state)?;
    };

    if outcome.stop != RalphStop::Cancelled {
        clear_state(&path)?;
    }
    Ok(outcome)
}

fn round_prompt(config: &RalphConfig) -> String {
    let mut prompt = config.prompt.clone();
    prompt.push_str(
        "\n\nUse your best judgement: pick the most valuable next step and do it well.",
    );
    if let Some(promise) = &config.completion_promise {
        prompt.push_str(&format!(
            "\n\nWhen, and only when, the whole job is truly finished, include the exact \
             text {promise} in your reply. Do not emit it before then."
        ));
    }
    prompt
}

/// Cancel a running loop by removing its state file.
///
/// Returns a short human-readable report. Errors when no loop is running in
/// the given directory.
pub fn cancel_ralph_loop(cwd: Option<&std::path::Path>) -> Result<String> {
    let path: PathBuf = state_path(cwd)?;
    if !path.exists() {
        return Err(anyhow!("no loop is running here ({})", path.display()));
    }
    let iteration = read_iteration(&path);
    clear_state(&path)?;
    Ok(match iteration {
        Some(iteration) => format!("cancelled loop at iteration {iteration}"),
        None => "cancelled loop".to_string(),
    })
}

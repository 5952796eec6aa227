//! Bounded iterate-until-checked-success over one task.
//!
//! A task runs as a single conversation: the first round sends the task
//! prompt, every later round sends a fix-up prompt carrying the previous
//! round's failure reason. Hooks (set-up, tear-down, outcome) run as detached
//! one-shot turns so they never leak into the task conversation.

use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use tracing::{info, instrument, warn};

use crate::checker::{Checker, Verdict, evaluate};
use crate::io::invoker::TurnInvoker;
use crate::session::{SessionContext, SessionOptions};

/// Round cap applied when a task does not choose its own.
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

/// Everything needed to run one task to completion.
#[derive(Debug)]
pub struct TaskSpec {
    /// The work to do, sent verbatim on the first round.
    pub prompt: String,
    pub checker: Checker,
    /// Round cap. `0` means unbounded; rely on the checker to terminate.
    pub max_iterations: u32,
    pub set_up: Option<String>,
    pub tear_down: Option<String>,
    pub on_success: Option<String>,
    pub on_failure: Option<String>,
    pub session: SessionOptions,
}

impl TaskSpec {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            checker: Checker::Default,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            set_up: None,
            tear_down: None,
            on_success: None,
            on_failure: None,
            session: SessionOptions::default(),
        }
    }

    pub fn with_checker(mut self, checker: Checker) -> Self {
        self.checker = checker;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_session(mut self, session: SessionOptions) -> Self {
        self.session = session;
        self
    }
}

/// What one round produced.
#[derive(Debug, Clone)]
pub struct IterationRecord {
    /// 1-indexed round number.
    pub round: u32,
    pub output: String,
    pub verdict: Verdict,
    pub elapsed: Duration,
}

/// Final outcome of a task run.
///
/// `success: false` means the round cap was exhausted with the checker still
/// failing. Invocation failures never produce a result; they surface as `Err`.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub success: bool,
    /// The agent's latest output, passing or not.
    pub summary: String,
    /// Rounds actually spent.
    pub iterations: u32,
    /// Last check failure reason when `success` is false.
    pub last_error: Option<String>,
    pub session_token: Option<String>,
}

/// Run a task until the checker passes or the round cap is exhausted.
pub fn run_task<I: TurnInvoker + ?Sized>(invoker: &I, spec: &TaskSpec) -> Result<TaskResult> {
    run_task_with_progress(invoker, spec, |_| {})
}

/// [`run_task`] with a per-round callback for progress reporting.
#[instrument(skip_all, fields(max_iterations = spec.max_iterations))]
pub fn run_task_with_progress<I: TurnInvoker + ?Sized>(
    invoker: &I,
    spec: &TaskSpec,
    on_round: impl FnMut(&IterationRecord),
) -> Result<TaskResult> {
    if spec.prompt.trim().is_empty() {
        bail!("task prompt is empty");
    }

    let mut session = SessionContext::new(invoker, spec.session.clone());

    // Once set-up has been attempted, tear-down is owed no matter what.
    let outcome = match run_set_up(&session, spec) {
        Ok(()) => run_rounds(&mut session, spec, on_round),
        Err(err) => Err(err),
    };

    // Tear-down always runs, even when the rounds failed hard. A hook failure
    // must not mask the original error.
    if let Some(tear_down) = &spec.tear_down {
        info!("running tear-down hook");
        match (&outcome, session.send_detached(tear_down)) {
            (_, Ok(_)) => {}
            (Ok(_), Err(err)) => return Err(err).context("tear-down hook"),
            (Err(_), Err(err)) => warn!(error = %err, "tear-down hook failed"),
        }
    }

    let result = outcome?;

    let hook = if result.success {
        spec.on_success.as_ref()
    } else {
        spec.on_failure.as_ref()
    };
    if let Some(hook) = hook {
        info!(success = result.success, "running outcome hook");
        session.send_detached(hook).context("outcome hook")?;
    }

    Ok(result)
}

fn run_set_up<I: TurnInvoker + ?Sized>(
    session: &SessionContext<'_, I>,
    spec: &TaskSpec,
) -> Result<()> {
    if let Some(set_up) = &spec.set_up {
        info!("running set-up hook");
        session.send_detached(set_up).context("set-up hook")?;
    }
    Ok(())
}

fn run_rounds<I: TurnInvoker + ?Sized>(
    session: &mut SessionContext<'_, I>,
    spec: &TaskSpec,
    mut on_round: impl FnMut(&IterationRecord),
) -> Result<TaskResult> {
    let mut round: u32 = 0;
    let mut last_reason: Option<String> = None;

    loop {
        round += 1;
        let prompt = match &last_reason {
            None => spec.prompt.clone(),
            Some(reason) => fix_prompt(reason),
        };

        info!(round, "starting task round");
        let started = Instant::now();
        let output = session
            .send(&prompt)
            .with_context(|| format!("task round {round}"))?;
        let verdict = evaluate(&spec.checker, session, &spec.prompt, &output)
            .with_context(|| format!("verification after round {round}"))?;
        let record = IterationRecord {
            round,
            output,
            verdict,
            elapsed: started.elapsed(),
        };
        on_round(&record);

        match record.verdict {
            Verdict::Pass => {
                info!(round, "task passed verification");
                return Ok(TaskResult {
                    success: true,
                    summary: record.output,
                    iterations: round,
                    last_error: None,
                    session_token: session.session_token().map(str::to_string),
                });
            }
            Verdict::Fail { reason } => {
                warn!(round, reason = %reason, "task round failed verification");
                if spec.max_iterations > 0 && round >= spec.max_iterations {
                    return Ok(TaskResult {
                        success: false,
                        summary: record.output,
                        iterations: round,
                        last_error: Some(reason),
                        session_token: session.session_token().map(str::to_string),
                    });
                }
                last_reason = Some(reason);
            }
        }
    }
}

fn fix_prompt(reason: &str) -> String {
    format!(
        "The following checks failed:\n{reason}\n\nCan you please dive in and \
         see if you agree with this assessment, then fix these issues while \
         staying as close as you can to the spirit of the original task?"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedInvoker, ScriptedTurn};

    fn failing_predicate() -> Checker {
        Checker::Predicate(Box::new(|_| Some("not done yet".to_string())))
    }

    #[test]
    fn disabled_checker_passes_on_first_round() {
        let invoker = ScriptedInvoker::new(vec![ScriptedTurn::message("did the thing")]);
        let spec = TaskSpec::new("do the thing").with_checker(Checker::Disabled);

        let result = run_task(&invoker, &spec).expect("result");
        assert!(result.success);
        assert_eq!(result.iterations, 1);
        assert_eq!(result.summary, "did the thing");
        assert_eq!(invoker.invocations(), 1);
    }

    #[test]
    fn empty_prompt_is_rejected_before_any_turn() {
        let invoker = ScriptedInvoker::repeating("unreachable");
        let spec = TaskSpec::new("   ");
        assert!(run_task(&invoker, &spec).is_err());
        assert_eq!(invoker.invocations(), 0);
    }

    #[test]
    fn later_rounds_send_the_fix_prompt() {
        let invoker = ScriptedInvoker::repeating("attempt");
        let calls = std::sync::atomic::AtomicU32::new(0);
        let spec = TaskSpec::new("original task")
            .with_checker(Checker::Predicate(Box::new(move |_| {
                match calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) {
                    0 => Some("missing tests".to_string()),
                    _ => None,
                }
            })))
            .with_max_iterations(5);

        let result = run_task(&invoker, &spec).expect("result");
        assert!(result.success);
        assert_eq!(result.iterations, 2);

        let prompts = invoker.recorded_prompts();
        assert_eq!(prompts[0], "original task");
        assert!(prompts[1].contains("The following checks failed:\nmissing tests"));
    }

    #[test]
    fn exhaustion_is_a_failed_result_not_an_error() {
        let invoker = ScriptedInvoker::repeating("still broken");
        let spec = TaskSpec::new("fix it")
            .with_checker(failing_predicate())
            .with_max_iterations(3);

        let result = run_task(&invoker, &spec).expect("result");
        assert!(!result.success);
        assert_eq!(result.iterations, 3);
        assert_eq!(result.last_error.as_deref(), Some("not done yet"));
        assert_eq!(invoker.invocations(), 3);
    }

    #[test]
    fn progress_callback_sees_every_round() {
        let invoker = ScriptedInvoker::repeating("attempt");
        let spec = TaskSpec::new("task")
            .with_checker(failing_predicate())
            .with_max_iterations(2);

        let mut rounds = Vec::new();
        let result = run_task_with_progress(&invoker, &spec, |record| {
            rounds.push((record.round, record.verdict.clone()));
        })
        .expect("result");

        assert!(!result.success);
        assert_eq!(rounds.len(), 2);
        assert_eq!(rounds[0].0, 1);
        assert_eq!(rounds[1].0, 2);
    }

    #[test]
    fn hooks_run_in_order_around_the_task() {
        let invoker = ScriptedInvoker::repeating("done");
        let mut spec = TaskSpec::new("main work").with_checker(Checker::Disabled);
        spec.set_up = Some("prepare".to_string());
        spec.tear_down = Some("clean".to_string());
        spec.on_success = Some("celebrate".to_string());
        spec.on_failure = Some("lament".to_string());

        let result = run_task(&invoker, &spec).expect("result");
        assert!(result.success);
        assert_eq!(
            invoker.recorded_prompts(),
            vec!["prepare", "main work", "clean", "celebrate"]
        );
    }

    #[test]
    fn failure_hook_runs_after_exhaustion() {
        let invoker = ScriptedInvoker::repeating("nope");
        let mut spec = TaskSpec::new("task")
            .with_checker(failing_predicate())
            .with_max_iterations(1);
        spec.on_failure = Some("report failure".to_string());

        let result = run_task(&invoker, &spec).expect("result");
        assert!(!result.success);
        assert_eq!(
            invoker.recorded_prompts().last().map(String::as_str),
            Some("report failure")
        );
    }

    #[test]
    fn invocation_failure_is_fatal_and_downcastable() {
        use crate::io::invoker::InvocationError;

        let invoker = ScriptedInvoker::new(vec![ScriptedTurn::failing("agent crashed")]);
        let spec = TaskSpec::new("task").with_checker(Checker::Disabled);

        let err = run_task(&invoker, &spec).expect_err("fatal");
        assert!(err.downcast_ref::<InvocationError>().is_some());
    }

    #[test]
    fn tear_down_runs_when_set_up_fails() {
        let invoker = ScriptedInvoker::new(vec![
            ScriptedTurn::failing("no workspace"),
            ScriptedTurn::message("cleaned"),
        ]);
        let mut spec = TaskSpec::new("task").with_checker(Checker::Disabled);
        spec.set_up = Some("prepare".to_string());
        spec.tear_down = Some("clean".to_string());
        spec.on_failure = Some("should not run".to_string());

        let err = run_task(&invoker, &spec).expect_err("fatal");
        assert!(format!("{err:#}").contains("set-up hook"));
        assert_eq!(invoker.recorded_prompts(), vec!["prepare", "clean"]);
    }

    #[test]
    fn tear_down_failure_does_not_mask_a_round_error() {
        let invoker = ScriptedInvoker::new(vec![
            ScriptedTurn::failing("round exploded"),
            ScriptedTurn::failing("tear-down exploded too"),
        ]);
        let mut spec = TaskSpec::new("task").with_checker(Checker::Disabled);
        spec.tear_down = Some("clean".to_string());

        let err = run_task(&invoker, &spec).expect_err("fatal");
        assert!(format!("{err:#}").contains("round exploded"));
    }
}

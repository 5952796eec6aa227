//! End-to-end task runs against scripted agents.

use codexrun::checker::{Checker, MALFORMED_VERIFICATION};
use codexrun::io::invoker::InvocationError;
use codexrun::task::{TaskSpec, run_task, run_task_with_progress};
use codexrun::test_support::{ScriptedInvoker, ScriptedTurn};

fn predicate_passing_at(call: u32) -> Checker {
    let calls = std::sync::atomic::AtomicU32::new(1);
    Checker::Predicate(Box::new(move |_| {
        let current = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if current >= call {
            None
        } else {
            Some(format!("attempt {current} was not enough"))
        }
    }))
}

#[test]
fn exhaustion_spends_exactly_the_round_cap() {
    let invoker = ScriptedInvoker::repeating("still at it");
    let spec = TaskSpec::new("never finishes")
        .with_checker(Checker::Predicate(Box::new(|_| {
            Some("not there yet".to_string())
        })))
        .with_max_iterations(3);

    let result = run_task(&invoker, &spec).expect("result");
    assert!(!result.success);
    assert_eq!(result.iterations, 3);
    assert_eq!(result.last_error.as_deref(), Some("not there yet"));
    assert_eq!(result.summary, "still at it");
    assert_eq!(invoker.invocations(), 3);
}

#[test]
fn passes_at_the_round_the_checker_allows() {
    let invoker = ScriptedInvoker::repeating("attempt");
    let spec = TaskSpec::new("eventually finishes")
        .with_checker(predicate_passing_at(4))
        .with_max_iterations(10);

    let result = run_task(&invoker, &spec).expect("result");
    assert!(result.success);
    assert_eq!(result.iterations, 4);
    assert!(result.last_error.is_none());
}

#[test]
fn zero_cap_means_unbounded_rounds() {
    let invoker = ScriptedInvoker::repeating("attempt");
    let spec = TaskSpec::new("slow burn")
        .with_checker(predicate_passing_at(25))
        .with_max_iterations(0);

    let result = run_task(&invoker, &spec).expect("result");
    assert!(result.success);
    assert_eq!(result.iterations, 25);
    assert_eq!(invoker.invocations(), 25);
}

#[test]
fn invocation_failure_aborts_instead_of_retrying() {
    let invoker = ScriptedInvoker::new(vec![
        ScriptedTurn::message("fine"),
        ScriptedTurn::failing("backend went away"),
    ]);
    let spec = TaskSpec::new("two rounds needed")
        .with_checker(predicate_passing_at(2))
        .with_max_iterations(10);

    let err = run_task(&invoker, &spec).expect_err("fatal");
    let invocation = err
        .downcast_ref::<InvocationError>()
        .expect("invocation error");
    assert!(matches!(invocation, InvocationError::Process(_)));
    assert_eq!(invoker.invocations(), 2);
}

#[test]
fn default_verifier_runs_in_the_same_session_and_survives_garbage() {
    let invoker = ScriptedInvoker::new(vec![
        ScriptedTurn::message("created hello.txt").with_token("t-1"),
        // Verification reply with no JSON: retryable, not fatal.
        ScriptedTurn::message("looks good to me!").with_token("t-2"),
        ScriptedTurn::message("double-checked and fixed").with_token("t-3"),
        ScriptedTurn::message(r#"{"success": true, "reason": ""}"#).with_token("t-4"),
    ]);
    let spec = TaskSpec::new("create hello.txt").with_max_iterations(5);

    let result = run_task(&invoker, &spec).expect("result");
    assert!(result.success);
    assert_eq!(result.iterations, 2);
    assert_eq!(result.summary, "double-checked and fixed");
    assert_eq!(result.session_token.as_deref(), Some("t-4"));

    let prompts = invoker.recorded_prompts();
    assert_eq!(prompts.len(), 4);
    // First verification embeds the criteria (the task prompt) and the output.
    assert!(prompts[1].contains("create hello.txt"));
    assert!(prompts[1].contains("created hello.txt"));
    // The fix round carries the malformed-verification reason forward.
    assert!(prompts[2].contains(MALFORMED_VERIFICATION));
    // Every turn after the first resumed the same conversation.
    let tokens = invoker.recorded_tokens();
    assert_eq!(
        tokens,
        vec![
            None,
            Some("t-1".to_string()),
            Some("t-2".to_string()),
            Some("t-3".to_string()),
        ]
    );
}

#[test]
fn prompt_checker_fail_fail_pass() {
    let invoker = ScriptedInvoker::new(vec![
        ScriptedTurn::message("first try"),
        ScriptedTurn::message(r#"{"success": false, "reason": "tests missing"}"#),
        ScriptedTurn::message("second try"),
        ScriptedTurn::message(r#"{"success": false, "reason": "one test red"}"#),
        ScriptedTurn::message("third try"),
        ScriptedTurn::message(r#"{"success": true}"#),
    ]);
    let spec = TaskSpec::new("make the suite green")
        .with_checker(Checker::Prompt("all tests pass".to_string()))
        .with_max_iterations(10);

    let mut reasons = Vec::new();
    let result = run_task_with_progress(&invoker, &spec, |record| {
        reasons.push(record.verdict.reason().map(str::to_string));
    })
    .expect("result");

    assert!(result.success);
    assert_eq!(result.iterations, 3);
    assert_eq!(result.summary, "third try");
    assert_eq!(
        reasons,
        vec![
            Some("tests missing".to_string()),
            Some("one test red".to_string()),
            None,
        ]
    );
}

#[test]
fn hooks_bracket_the_run_and_pick_the_right_outcome() {
    let invoker = ScriptedInvoker::repeating("output");
    let mut spec = TaskSpec::new("the work")
        .with_checker(Checker::Predicate(Box::new(|_| Some("nope".to_string()))))
        .with_max_iterations(2);
    spec.set_up = Some("set the stage".to_string());
    spec.tear_down = Some("strike the stage".to_string());
    spec.on_success = Some("take a bow".to_string());
    spec.on_failure = Some("file a complaint".to_string());

    let result = run_task(&invoker, &spec).expect("result");
    assert!(!result.success);
    assert_eq!(
        invoker.recorded_prompts(),
        vec![
            "set the stage".to_string(),
            "the work".to_string(),
            "The following checks failed:\nnope\n\nCan you please dive in and see if you \
             agree with this assessment, then fix these issues while staying as close as \
             you can to the spirit of the original task?"
                .to_string(),
            "strike the stage".to_string(),
            "file a complaint".to_string(),
        ]
    );
}

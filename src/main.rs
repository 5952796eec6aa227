//! Retry orchestration CLI for the codex coding agent.
//!
//! One binary, three shapes of run: a single turn (`run`), a verified task
//! with bounded retries (`task`), and loops over tasks (`ralph`, `science`,
//! `foreach`).

use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Args, Parser, Subcommand};

use codexrun::checker::Checker;
use codexrun::exit_codes;
use codexrun::foreach::{ForeachConfig, run_foreach};
use codexrun::io::invoker::CodexInvoker;
use codexrun::io::taskfile::load_task_file;
use codexrun::io::work_list::RetryMode;
use codexrun::logging;
use codexrun::ralph::{RalphConfig, RalphStop, cancel_ralph_loop, run_ralph_loop_with_progress};
use codexrun::session::{SessionContext, SessionOptions};
use codexrun::task::{DEFAULT_MAX_ITERATIONS, TaskSpec, run_task_with_progress};

const SCIENCE_TEMPLATE: &str = "Good afternoon! We have a fun task today - take a good look \
around this repo and review all relevant knowledge you have. Our task is to {task}. We're \
working step by step in a scientific manner so if there's a SCIENCE.md read that first to \
understand the progress of the rest of the team so far. Then try as hard as you can to find \
a good path forwards - run as many experiments as you want and take your time, we have all \
night. Note down everything you learn that wasn't obvious in a knowledge section in \
SCIENCE.md and any experiments in a similar section. The aim is to move the ball forwards, \
either by getting closer to the goal or ruling out a hypothesis whilst understanding why. \
If you think of several options, pick one and run with it - I will not be available to make \
decisions for you, I give you my full permission to explore and make your own best \
judgement towards our goal! Remember to update SCIENCE.md. Good hunting!";

const TASK_TEMPLATE: &str = r#"# Main task prompt. Required. Use {{item}} for per-item values.
prompt = """
Describe what the agent should do here.
"""

# Optional setup steps before the task runs.
# set_up = "Create a branch for {{item}} and switch to it."

# Optional verification prompt. Use "none" to skip verification.
# If absent, the task prompt itself is used as the success criteria.
# check = "Run the test suite and confirm everything passes with no skips."

# Optional round cap. 0 means unlimited. Defaults to 10.
# max_iterations = 10

# Optional follow-up instructions.
# on_success = "Commit the work with a descriptive message."
# on_failure = "Write a note to NOTES.md about what is still broken."

# Optional cleanup, runs whether the task passed or not.
# tear_down = "Switch back to the main branch."
"#;

#[derive(Parser)]
#[command(
    name = "codexrun",
    version,
    about = "Retry orchestration for the codex coding agent"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct SessionArgs {
    /// Working directory for the agent.
    #[arg(long)]
    cwd: Option<PathBuf>,
    /// Run the agent sandboxed (--full-auto) instead of unrestricted (--yolo).
    #[arg(long = "no-yolo", action = ArgAction::SetFalse)]
    yolo: bool,
    /// Additional raw CLI flags passed to the agent (quoted as needed).
    #[arg(long)]
    flags: Option<String>,
}

impl SessionArgs {
    fn options(&self) -> SessionOptions {
        SessionOptions {
            cwd: self.cwd.clone(),
            yolo: self.yolo,
            flags: self.flags.clone(),
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Send one prompt and print the agent's reply.
    Run {
        /// Prompt text. Use '-' or omit to read from stdin.
        prompt: Option<String>,
        /// Resume an existing conversation.
        #[arg(long)]
        session_token: Option<String>,
        /// Print the continuation token to stderr after the turn.
        #[arg(long)]
        print_session: bool,
        #[command(flatten)]
        session: SessionArgs,
    },
    /// Run a task until verification passes or retries are exhausted.
    Task {
        /// Prompt text. Use '-' or omit to read from stdin (unless -f is given).
        prompt: Option<String>,
        /// Load the task from a TOML task file instead.
        #[arg(short = 'f', long = "file", conflicts_with_all = ["prompt", "check", "max_iterations"])]
        file: Option<PathBuf>,
        /// Work item substituted for {{item}} in the task file.
        #[arg(short = 'i', long = "item", requires = "file")]
        item: Option<String>,
        /// Verification criteria. Defaults to the task prompt. "none" disables.
        #[arg(long)]
        check: Option<String>,
        /// Round cap. 0 means unlimited.
        #[arg(long, default_value_t = DEFAULT_MAX_ITERATIONS)]
        max_iterations: u32,
        /// Only print the final summary.
        #[arg(short, long)]
        quiet: bool,
        #[command(flatten)]
        session: SessionArgs,
    },
    /// Repeat one prompt until the agent delivers the completion promise.
    Ralph {
        /// Prompt text. Use '-' or omit to read from stdin.
        prompt: Option<String>,
        /// Round cap. 0 means unlimited.
        #[arg(long, default_value_t = 0)]
        max_iterations: u32,
        /// Literal text that, when present in a reply, ends the loop.
        #[arg(long)]
        completion_promise: Option<String>,
        /// Reuse one conversation across rounds instead of starting fresh.
        #[arg(long)]
        reuse_session: bool,
        /// Cancel the loop running in the target directory and exit.
        #[arg(long, conflicts_with_all = ["prompt", "max_iterations", "completion_promise", "reuse_session"])]
        cancel: bool,
        #[command(flatten)]
        session: SessionArgs,
    },
    /// Run a science-mode loop: wraps a short task in an exploratory prompt.
    Science {
        /// Short task description. Use '-' or omit to read from stdin.
        task: Option<String>,
        /// Round cap. 0 means unlimited.
        #[arg(long, default_value_t = 0)]
        max_iterations: u32,
        /// Literal text that, when present in a reply, ends the loop.
        #[arg(long)]
        completion_promise: Option<String>,
        /// Reuse one conversation across rounds instead of starting fresh.
        #[arg(long)]
        reuse_session: bool,
        /// Cancel the loop running in the target directory and exit.
        #[arg(long, conflicts_with_all = ["task", "max_iterations", "completion_promise", "reuse_session"])]
        cancel: bool,
        #[command(flatten)]
        session: SessionArgs,
    },
    /// Run a task file over every pending item in a list file.
    Foreach {
        /// List file, one work item per line.
        list_file: PathBuf,
        /// TOML task file applied to each item.
        task_file: PathBuf,
        /// Worker cap, at least 1. Defaults to one worker per pending item.
        #[arg(short = 'n', long = "workers", value_parser = clap::value_parser!(u16).range(1..))]
        workers: Option<u16>,
        /// Re-queue items previously marked failed (❌).
        #[arg(long, conflicts_with = "retry_all")]
        retry_failed: bool,
        /// Re-queue every previously marked item.
        #[arg(long)]
        retry_all: bool,
        #[command(flatten)]
        session: SessionArgs,
    },
    /// Write a commented task-file template.
    Create {
        /// Target path. A .toml extension is added if missing.
        path: PathBuf,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::FAILED);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            prompt,
            session_token,
            print_session,
            session,
        } => cmd_run(prompt, session_token, print_session, &session),
        Command::Task {
            prompt,
            file,
            item,
            check,
            max_iterations,
            quiet,
            session,
        } => cmd_task(prompt, file, item, check, max_iterations, quiet, &session),
        Command::Ralph {
            prompt,
            max_iterations,
            completion_promise,
            reuse_session,
            cancel,
            session,
        } => {
            if cancel {
                return cmd_cancel(&session);
            }
            let prompt = read_prompt(prompt)?;
            cmd_ralph(
                prompt,
                max_iterations,
                completion_promise,
                reuse_session,
                &session,
            )
        }
        Command::Science {
            task,
            max_iterations,
            completion_promise,
            reuse_session,
            cancel,
            session,
        } => {
            if cancel {
                return cmd_cancel(&session);
            }
            let task = read_prompt(task)?;
            let prompt = SCIENCE_TEMPLATE.replace("{task}", task.trim());
            cmd_ralph(
                prompt,
                max_iterations,
                completion_promise,
                reuse_session,
                &session,
            )
        }
        Command::Foreach {
            list_file,
            task_file,
            workers,
            retry_failed,
            retry_all,
            session,
        } => cmd_foreach(
            &list_file,
            &task_file,
            workers.map(usize::from),
            retry_failed,
            retry_all,
            &session,
        ),
        Command::Create { path } => cmd_create(path),
    }
}

fn cmd_run(
    prompt: Option<String>,
    session_token: Option<String>,
    print_session: bool,
    session_args: &SessionArgs,
) -> Result<i32> {
    let prompt = read_prompt(prompt)?;
    let invoker = CodexInvoker::new();
    let mut session = match session_token {
        Some(token) => SessionContext::resume(&invoker, session_args.options(), token),
        None => SessionContext::new(&invoker, session_args.options()),
    };

    let message = session.send(&prompt)?;
    println!("{message}");
    if print_session && let Some(token) = session.session_token() {
        eprintln!("session: {token}");
    }
    Ok(exit_codes::OK)
}

fn cmd_task(
    prompt: Option<String>,
    file: Option<PathBuf>,
    item: Option<String>,
    check: Option<String>,
    max_iterations: u32,
    quiet: bool,
    session_args: &SessionArgs,
) -> Result<i32> {
    let options = session_args.options();
    let spec = match file {
        Some(path) => {
            let def = load_task_file(&path)?;
            match (&item, def.uses_item()) {
                (Some(_), false) => bail!(
                    "{} does not use {{{{item}}}}, but --item was given",
                    path.display()
                ),
                (None, true) => bail!("{} uses {{{{item}}}}; pass --item", path.display()),
                _ => {}
            }
            def.to_spec(item.as_deref(), &options)?
        }
        None => {
            let checker = match check.as_deref() {
                None => Checker::Default,
                Some(text) if text.trim().eq_ignore_ascii_case("none") => Checker::Disabled,
                Some(text) => Checker::Prompt(text.to_string()),
            };
            TaskSpec::new(read_prompt(prompt)?)
                .with_checker(checker)
                .with_max_iterations(max_iterations)
                .with_session(options)
        }
    };

    let invoker = CodexInvoker::new();
    let result = run_task_with_progress(&invoker, &spec, |record| {
        if !quiet {
            match record.verdict.reason() {
                None => eprintln!("round {}: passed ({:?})", record.round, record.elapsed),
                Some(reason) => eprintln!("round {}: failed: {reason}", record.round),
            }
        }
    })?;

    println!("{}", result.summary);
    if result.success {
        Ok(exit_codes::OK)
    } else {
        if let Some(error) = &result.last_error {
            eprintln!(
                "task failed after {} round(s): {error}",
                result.iterations
            );
        }
        Ok(exit_codes::FAILED)
    }
}

fn cmd_ralph(
    prompt: String,
    max_iterations: u32,
    completion_promise: Option<String>,
    reuse_session: bool,
    session_args: &SessionArgs,
) -> Result<i32> {
    let config = RalphConfig {
        prompt,
        max_iterations,
        completion_promise,
        fresh: !reuse_session,
        session: session_args.options(),
    };

    let invoker = CodexInvoker::new();
    let outcome = run_ralph_loop_with_progress(&invoker, &config, |iteration, message| {
        eprintln!("--- iteration {iteration} ---");
        println!("{message}");
    })?;

    match outcome.stop {
        RalphStop::Promise => {
            eprintln!("promise delivered after {} iteration(s)", outcome.iterations);
            Ok(exit_codes::OK)
        }
        RalphStop::MaxIterations => {
            eprintln!("stopped at the {} iteration cap", outcome.iterations);
            Ok(exit_codes::OK)
        }
        RalphStop::Cancelled => {
            eprintln!("cancelled after {} iteration(s)", outcome.iterations);
            Ok(exit_codes::CANCELLED)
        }
    }
}

fn cmd_cancel(session_args: &SessionArgs) -> Result<i32> {
    let report = cancel_ralph_loop(session_args.cwd.as_deref())?;
    println!("{report}");
    Ok(exit_codes::OK)
}

fn cmd_foreach(
    list_file: &std::path::Path,
    task_file: &std::path::Path,
    workers: Option<usize>,
    retry_failed: bool,
    retry_all: bool,
    session_args: &SessionArgs,
) -> Result<i32> {
    let task_def = load_task_file(task_file)?;
    let config = ForeachConfig {
        workers,
        retry: if retry_all {
            RetryMode::All
        } else if retry_failed {
            RetryMode::Failed
        } else {
            RetryMode::None
        },
        session: session_args.options(),
    };

    let invoker = CodexInvoker::new();
    let result = run_foreach(&invoker, list_file, &task_def, &config)?;

    for outcome in &result.outcomes {
        let status = if outcome.success { "ok" } else { "failed" };
        println!("{status}: {} | {}", outcome.item, outcome.summary);
    }
    eprintln!(
        "{} succeeded, {} failed, {} skipped",
        result.succeeded, result.failed, result.skipped
    );
    if result.failed > 0 {
        Ok(exit_codes::FAILED)
    } else {
        Ok(exit_codes::OK)
    }
}

fn cmd_create(path: PathBuf) -> Result<i32> {
    let target = if path.extension().is_some_and(|ext| ext == "toml") {
        path
    } else {
        let mut name = path.into_os_string();
        name.push(".toml");
        PathBuf::from(name)
    };
    if target.exists() {
        bail!("{} already exists", target.display());
    }
    std::fs::write(&target, TASK_TEMPLATE)
        .with_context(|| format!("write {}", target.display()))?;
    println!("wrote {}", target.display());
    Ok(exit_codes::OK)
}

/// Resolve a prompt argument: explicit text, or stdin when '-' or omitted.
fn read_prompt(arg: Option<String>) -> Result<String> {
    if let Some(text) = arg
        && text != "-"
    {
        return Ok(text);
    }
    let mut data = String::new();
    std::io::stdin()
        .read_to_string(&mut data)
        .context("read prompt from stdin")?;
    if data.trim().is_empty() {
        bail!("no prompt provided; pass a prompt or pipe one via stdin");
    }
    Ok(data)
}

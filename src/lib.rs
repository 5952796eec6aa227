//! Retry orchestration for an external autonomous coding agent.
//!
//! The crate wraps a blocking agent CLI (`codex exec`) in three composable
//! layers:
//!
//! - one turn: [`io::invoker::TurnInvoker`] and [`session::SessionContext`]
//! - one task: [`task::run_task`], iterate-until-checked-success with hooks
//! - many tasks: [`ralph::run_ralph_loop`] (repeat until promise) and
//!   [`foreach::run_foreach`] (bounded-parallel fan-out over a list file)
//!
//! Orchestration logic lives at the crate root; process, file, and
//! wire-format concerns live under [`io`].

pub mod checker;
pub mod exit_codes;
pub mod foreach;
pub mod io;
pub mod logging;
pub mod ralph;
pub mod session;
pub mod task;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

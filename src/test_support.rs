//! Scripted invokers for deterministic tests.
//!
//! No processes are spawned: a [`ScriptedInvoker`] replays a fixed sequence of
//! turns and records what it was asked, so tests can assert on prompts,
//! continuation tokens, and concurrency without a real agent.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::io::invoker::{InvocationError, Turn, TurnInvoker, TurnRequest};

type SideEffect = Box<dyn Fn() + Send + Sync>;

/// One pre-scripted agent reply (or failure).
pub struct ScriptedTurn {
    message: String,
    session_token: Option<String>,
    error: Option<String>,
    side_effect: Option<SideEffect>,
}

impl ScriptedTurn {
    /// A successful turn returning `message`.
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            session_token: None,
            error: None,
            side_effect: None,
        }
    }

    /// A turn that fails with a process error.
    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            message: String::new(),
            session_token: None,
            error: Some(reason.into()),
            side_effect: None,
        }
    }

    /// Attach a continuation token to the reply.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    /// Run `effect` while the turn is "in flight", before the reply returns.
    /// Useful for simulating outside interference such as deleting a file.
    pub fn with_side_effect(mut self, effect: impl Fn() + Send + Sync + 'static) -> Self {
        self.side_effect = Some(Box::new(effect));
        self
    }
}

/// [`TurnInvoker`] that replays scripted turns and records every request.
pub struct ScriptedInvoker {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    /// Message returned after the script runs out, if any.
    fallback: Option<String>,
    hold: Option<Duration>,
    prompts: Mutex<Vec<String>>,
    tokens: Mutex<Vec<Option<String>>>,
    invocations: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedInvoker {
    /// Replay exactly these turns; running past the script is an error.
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            fallback: None,
            hold: None,
            prompts: Mutex::new(Vec::new()),
            tokens: Mutex::new(Vec::new()),
            invocations: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Reply with the same message forever.
    pub fn repeating(message: impl Into<String>) -> Self {
        let mut invoker = Self::new(Vec::new());
        invoker.fallback = Some(message.into());
        invoker
    }

    /// Fall back to `message` once the script is exhausted.
    pub fn with_fallback(mut self, message: impl Into<String>) -> Self {
        self.fallback = Some(message.into());
        self
    }

    /// Sleep this long inside every turn, to make overlap observable.
    pub fn with_hold(mut self, hold: Duration) -> Self {
        self.hold = Some(hold);
        self
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Highest number of turns that were ever in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn recorded_prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("prompts lock").clone()
    }

    /// The continuation token each request carried, in invocation order.
    pub fn recorded_tokens(&self) -> Vec<Option<String>> {
        self.tokens.lock().expect("tokens lock").clone()
    }
}

impl TurnInvoker for ScriptedInvoker {
    fn invoke(&self, request: &TurnRequest<'_>) -> Result<Turn, InvocationError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        self.prompts
            .lock()
            .expect("prompts lock")
            .push(request.prompt.to_string());
        self.tokens
            .lock()
            .expect("tokens lock")
            .push(request.session_token.map(str::to_string));

        if let Some(hold) = self.hold {
            std::thread::sleep(hold);
        }

        let scripted = self.turns.lock().expect("turns lock").pop_front();
        let result = match scripted {
            Some(turn) => {
                if let Some(effect) = &turn.side_effect {
                    effect();
                }
                match turn.error {
                    Some(reason) => Err(InvocationError::Process(reason)),
                    None => Ok(Turn {
                        message: turn.message,
                        session_token: turn.session_token,
                    }),
                }
            }
            None => match &self.fallback {
                Some(message) => Ok(Turn {
                    message: message.clone(),
                    session_token: None,
                }),
                None => Err(InvocationError::NoMessage(
                    "scripted invoker ran out of turns".to_string(),
                )),
            },
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

//! Conversation continuity across agent turns.

use std::path::PathBuf;

use tracing::{debug, instrument};

use crate::io::invoker::{InvocationError, TurnInvoker, TurnRequest};

/// Per-run invocation options shared by every turn in a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Working directory for the agent process.
    pub cwd: Option<PathBuf>,
    /// Run the agent unrestricted rather than sandboxed.
    pub yolo: bool,
    /// Extra raw CLI flags passed through to the agent, shell-quoted.
    pub flags: Option<String>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            cwd: None,
            yolo: true,
            flags: None,
        }
    }
}

/// A conversation with the agent, identified by its continuation token.
///
/// Sending a prompt through the same context resumes the conversation the
/// previous turn left off. The token is opaque; it only ever comes from the
/// agent itself.
#[derive(Debug)]
pub struct SessionContext<'a, I: TurnInvoker + ?Sized> {
    invoker: &'a I,
    options: SessionOptions,
    token: Option<String>,
}

impl<'a, I: TurnInvoker + ?Sized> SessionContext<'a, I> {
    /// Start a fresh conversation.
    pub fn new(invoker: &'a I, options: SessionOptions) -> Self {
        Self {
            invoker,
            options,
            token: None,
        }
    }

    /// Attach to an existing conversation by its continuation token.
    pub fn resume(invoker: &'a I, options: SessionOptions, token: String) -> Self {
        Self {
            invoker,
            options,
            token: Some(token),
        }
    }

    /// The current continuation token, once the agent has issued one.
    pub fn session_token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Send one prompt in this conversation and return the agent's message.
    ///
    /// The stored token is replaced only when the turn succeeds and carries a
    /// new token, so a failed turn leaves the session resumable where it was.
    #[instrument(skip_all, fields(resuming = self.token.is_some()))]
    pub fn send(&mut self, prompt: &str) -> Result<String, InvocationError> {
        let request = TurnRequest {
            prompt,
            cwd: self.options.cwd.as_deref(),
            session_token: self.token.as_deref(),
            yolo: self.options.yolo,
            flags: self.options.flags.as_deref(),
        };
        let turn = self.invoker.invoke(&request)?;
        if let Some(token) = turn.session_token {
            debug!("session token refreshed");
            self.token = Some(token);
        }
        Ok(turn.message)
    }

    /// Send a one-shot prompt outside this conversation.
    ///
    /// Used for hooks that should not pollute the task conversation with their
    /// own context. Neither reads nor updates the stored token.
    pub fn send_detached(&self, prompt: &str) -> Result<String, InvocationError> {
        let request = TurnRequest {
            prompt,
            cwd: self.options.cwd.as_deref(),
            session_token: None,
            yolo: self.options.yolo,
            flags: self.options.flags.as_deref(),
        };
        Ok(self.invoker.invoke(&request)?.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedInvoker, ScriptedTurn};

    #[test]
    fn send_threads_token_across_turns() {
        let invoker = ScriptedInvoker::new(vec![
            ScriptedTurn::message("first").with_token("t-1"),
            ScriptedTurn::message("second").with_token("t-2"),
        ]);
        let mut session = SessionContext::new(&invoker, SessionOptions::default());

        assert!(session.session_token().is_none());
        session.send("one").expect("turn");
        assert_eq!(session.session_token(), Some("t-1"));
        session.send("two").expect("turn");
        assert_eq!(session.session_token(), Some("t-2"));

        assert_eq!(invoker.recorded_tokens(), vec![None, Some("t-1".into())]);
    }

    #[test]
    fn failed_turn_leaves_token_unchanged() {
        let invoker = ScriptedInvoker::new(vec![
            ScriptedTurn::message("ok").with_token("t-1"),
            ScriptedTurn::failing("backend down"),
        ]);
        let mut session = SessionContext::new(&invoker, SessionOptions::default());

        session.send("one").expect("turn");
        session.send("two").expect_err("failure");
        assert_eq!(session.session_token(), Some("t-1"));
    }

    #[test]
    fn detached_send_skips_the_session() {
        let invoker = ScriptedInvoker::new(vec![
            ScriptedTurn::message("ok").with_token("t-1"),
            ScriptedTurn::message("hook ran"),
        ]);
        let mut session = SessionContext::new(&invoker, SessionOptions::default());

        session.send("one").expect("turn");
        session.send_detached("hook").expect("hook turn");

        assert_eq!(session.session_token(), Some("t-1"));
        assert_eq!(invoker.recorded_tokens(), vec![None, None]);
    }

    #[test]
    fn resume_starts_with_the_given_token() {
        let invoker = ScriptedInvoker::new(vec![ScriptedTurn::message("back")]);
        let mut session =
            SessionContext::resume(&invoker, SessionOptions::default(), "t-9".to_string());

        session.send("continue").expect("turn");
        assert_eq!(invoker.recorded_tokens(), vec![Some("t-9".into())]);
        // No new token in the reply keeps the old one.
        assert_eq!(session.session_token(), Some("t-9"));
    }
}

//! Success verification for task rounds.
//!
//! After each agent turn the task runner asks a checker whether the work is
//! actually done. Prompt-based checkers run a verification turn inside the
//! same conversation, so the verifier sees everything the agent just did.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::io::invoker::{InvocationError, TurnInvoker};
use crate::session::SessionContext;

/// Failure reason recorded when a verification reply cannot be decoded.
/// Retryable: the next round asks the agent to address it like any other
/// check failure.
pub const MALFORMED_VERIFICATION: &str = "malformed verification response";

/// How a task round's output gets judged.
pub enum Checker {
    /// Every round passes. The first agent turn wins.
    Disabled,
    /// In-process predicate. Returns `None` on pass, or the failure reason.
    Predicate(Box<dyn Fn(&str) -> Option<String> + Send + Sync>),
    /// Explicit verification criteria, judged by the agent itself.
    Prompt(String),
    /// No criteria given: verify against the task prompt itself.
    Default,
}

impl fmt::Debug for Checker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("Disabled"),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
            Self::Prompt(criteria) => f.debug_tuple("Prompt").field(criteria).finish(),
            Self::Default => f.write_str("Default"),
        }
    }
}

/// Outcome of one verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail { reason: String },
}

impl Verdict {
    pub fn passed(&self) -> bool {
        matches!(self, Self::Pass)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Pass => None,
            Self::Fail { reason } => Some(reason),
        }
    }
}

/// Judge the latest round. Prompt-based checkers spend one extra agent turn
/// in the same session; an invocation failure there is fatal, not a verdict.
#[instrument(skip_all, fields(checker = ?std::mem::discriminant(checker)))]
pub fn evaluate<I: TurnInvoker + ?Sized>(
    checker: &Checker,
    session: &mut SessionContext<'_, I>,
    task_prompt: &str,
    output: &str,
) -> Result<Verdict, InvocationError> {
    match checker {
        Checker::Disabled => Ok(Verdict::Pass),
        Checker::Predicate(predicate) => Ok(match predicate(output) {
            // An absent or blank reason is a pass; only a real reason fails.
            None => Verdict::Pass,
            Some(reason) if reason.trim().is_empty() => Verdict::Pass,
            Some(reason) => Verdict::Fail { reason },
        }),
        Checker::Prompt(criteria) => verify_with_agent(session, criteria, output),
        Checker::Default => verify_with_agent(session, task_prompt, output),
    }
}

fn verify_with_agent<I: TurnInvoker + ?Sized>(
    session: &mut SessionContext<'_, I>,
    criteria: &str,
    output: &str,
) -> Result<Verdict, InvocationError> {
    let reply = session.send(&verification_prompt(criteria, output))?;
    let verdict = parse_verdict(&reply);
    debug!(passed = verdict.passed(), "verification turn judged");
    Ok(verdict)
}

fn verification_prompt(criteria: &str, output: &str) -> String {
    format!(
        "You are now acting as a strict verifier for the work you just did.\n\
         \n\
         Success criteria:\n{criteria}\n\
         \n\
         Your latest report was:\n{output}\n\
         \n\
         Re-examine the actual state of the work against the criteria. Do not \
         take the report at face value.\n\
         \n\
         Respond with a single JSON object and nothing else:\n\
         {{\"success\": true|false, \"reason\": \"<short explanation, required when success is false>\"}}"
    )
}

#[derive(Debug, Deserialize)]
struct VerifierReply {
    success: bool,
    #[serde(default)]
    reason: Option<String>,
}

/// Decode a verification reply into a verdict.
///
/// Accepts a bare JSON object, one inside a fenced code block, or one embedded
/// in surrounding prose. Anything undecodable is a retryable failure with
/// [`MALFORMED_VERIFICATION`] as the reason.
pub fn parse_verdict(reply: &str) -> Verdict {
    let Some(body) = extract_json_object(reply) else {
        warn!("verification reply contained no JSON object");
        return Verdict::Fail {
            reason: MALFORMED_VERIFICATION.to_string(),
        };
    };
    match serde_json::from_str::<VerifierReply>(body) {
        Ok(VerifierReply { success: true, .. }) => Verdict::Pass,
        Ok(VerifierReply {
            success: false,
            reason,
        }) => Verdict::Fail {
            reason: reason
                .filter(|r| !r.trim().is_empty())
                .unwrap_or_else(|| "verification reported failure".to_string()),
        },
        Err(err) => {
            warn!(error = %err, "verification reply JSON did not match the expected shape");
            Verdict::Fail {
                reason: MALFORMED_VERIFICATION.to_string(),
            }
        }
    }
}

static FENCED_JSON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("fenced JSON pattern")
});

fn extract_json_object(reply: &str) -> Option<&str> {
    if let Some(captures) = FENCED_JSON.captures(reply)
        && let Some(body) = captures.get(1)
    {
        return Some(body.as_str());
    }
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    (end > start).then(|| &reply[start..=end])
}

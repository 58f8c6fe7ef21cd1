//! Decision policy contract
//!
//! The reasoning model behind the agent loop is an external collaborator;
//! only its calling contract lives here. Per turn the policy is shown the
//! accumulated context and prior turns and produces raw text, which the loop
//! parses into either a tool call or a final answer (see
//! [`parse_action`]). `oneshot` covers side queries made from inside tools
//! (code generation, code repair) that must not consume loop turns.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{MuxError, Result};

/// One completed think/act turn, fed back to the policy on the next turn.
#[derive(Debug, Clone)]
pub struct TurnRecord {
    /// The policy's rationale for the action
    pub thought: String,
    /// The tool it invoked
    pub tool: String,
    /// The structured input it supplied
    pub input: Value,
    /// What the tool returned
    pub observation: String,
}

/// A parsed policy action.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyAction {
    /// Invoke a tool with structured input
    ToolCall {
        /// Rationale surfaced to observers before the act
        thought: String,
        /// Tool name
        tool: String,
        /// Structured input
        input: Value,
    },
    /// Terminate the loop with this answer
    FinalAnswer(String),
}

/// Parses raw policy output into an action.
///
/// Accepted shapes:
/// - `{"final_answer": "..."}`
/// - `{"thought": "...", "tool": "...", "tool_input": ...}` (thought and
///   input optional)
///
/// Anything else returns `None`; the loop decides whether to reprompt.
///
/// # Example
/// ```
/// use kernelmux::agent::{parse_action, PolicyAction};
///
/// let action = parse_action(r#"{"thought":"inspect","tool":"dataset_info","tool_input":{}}"#);
/// assert!(matches!(action, Some(PolicyAction::ToolCall { .. })));
///
/// assert!(parse_action("not json at all").is_none());
/// ```
pub fn parse_action(raw: &str) -> Option<PolicyAction> {
    let value: Value = serde_json::from_str(raw.trim()).ok()?;
    let obj = value.as_object()?;

    if let Some(answer) = obj.get("final_answer") {
        let text = match answer {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        return Some(PolicyAction::FinalAnswer(text));
    }

    let tool = obj.get("tool")?.as_str()?.to_string();
    let thought = obj
        .get("thought")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let input = obj.get("tool_input").cloned().unwrap_or(Value::Null);
    Some(PolicyAction::ToolCall {
        thought,
        tool,
        input,
    })
}

/// The external decision policy driving the agent loop.
#[async_trait]
pub trait DecisionPolicy: Send + Sync {
    /// Produces the next raw action text given the accumulated context, the
    /// prior turns of this loop invocation, and the user's query.
    async fn decide(&self, context: &str, turns: &[TurnRecord], query: &str) -> Result<String>;

    /// Runs a single side query outside the loop (used by tools for code
    /// generation and repair).
    async fn oneshot(&self, prompt: &str, query: &str) -> Result<String>;
}

/// A policy that replays a fixed script of responses.
///
/// Test double for exercising the loop without a live model; both `decide`
/// and `oneshot` pop from the same queue in order.
#[derive(Default)]
pub struct ScriptedPolicy {
    responses: Mutex<VecDeque<String>>,
}

impl ScriptedPolicy {
    /// Creates a policy replaying `responses` in order.
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().map(Into::into).collect()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.responses.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends another scripted response.
    pub fn push(&self, response: &str) {
        self.lock().push_back(response.to_string());
    }

    /// Responses not yet consumed.
    pub fn remaining(&self) -> usize {
        self.lock().len()
    }

    fn next(&self) -> Result<String> {
        self.lock()
            .pop_front()
            .ok_or_else(|| MuxError::AgentLoop("scripted policy exhausted".to_string()))
    }
}

#[async_trait]
impl DecisionPolicy for ScriptedPolicy {
    async fn decide(&self, _context: &str, _turns: &[TurnRecord], _query: &str) -> Result<String> {
        self.next()
    }

    async fn oneshot(&self, _prompt: &str, _query: &str) -> Result<String> {
        self.next()
    }
}

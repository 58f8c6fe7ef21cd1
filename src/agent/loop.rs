//! Agent loop coordinator
//!
//! Drives a bounded think/act cycle against the external decision policy:
//! `THINK -> ACT -> (THINK | DONE | ERROR)`. Each THINK shows the policy the
//! accumulated context and prior turns; each ACT dispatches the chosen tool.
//! Tools that open exchanges on the bus suspend the loop without blocking
//! other bus activity — the loop runs on its own task, never on the router.
//!
//! Termination is explicit about *why* the loop ended: a policy-chosen final
//! answer and hitting the iteration cap are distinct outcomes; tool failure
//! and unrepairable policy output are errors.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::error::{MuxError, Result};
use crate::tools::{ToolContext, ToolRegistry};

use super::context::ContextStore;
use super::policy::{parse_action, DecisionPolicy, PolicyAction, TurnRecord};

/// Callback invoked before each ACT with the policy's rationale, the chosen
/// tool name, and its input. Best-effort: it must not block.
pub type ThoughtObserver = Arc<dyn Fn(&str, &str, &Value) + Send + Sync>;

/// Why the loop ended.
///
/// Reaching the iteration cap is deliberately a separate variant from a
/// policy-chosen answer so callers can surface the two differently.
#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    /// The policy produced a final answer (or a tool signalled completion)
    Answer(String),
    /// The configured iteration cap was reached without a final answer
    IterationCap(u32),
}

/// Structural classification of the loop's final text output.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentReply {
    /// Recognized structured action: generated code for a notebook cell
    CodeCell {
        /// Target language of the generated code
        language: String,
        /// The code itself
        content: String,
    },
    /// Plain text response
    Text(String),
}

/// Classifies terminal agent output.
///
/// Output that parses as `{"action": "code_cell", "language": ..,
/// "content": ..}` becomes [`AgentReply::CodeCell`]; anything else —
/// including malformed JSON — falls back to [`AgentReply::Text`].
/// Malformed structure is not an error.
///
/// # Example
/// ```
/// use kernelmux::agent::{classify_output, AgentReply};
///
/// let reply = classify_output(r#"{"action":"code_cell","language":"python","content":"print(1)"}"#);
/// assert_eq!(
///     reply,
///     AgentReply::CodeCell { language: "python".into(), content: "print(1)".into() }
/// );
///
/// let reply = classify_output("The mean is 4.2");
/// assert_eq!(reply, AgentReply::Text("The mean is 4.2".into()));
/// ```
pub fn classify_output(text: &str) -> AgentReply {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(text.trim()) {
        if map.get("action").and_then(Value::as_str) == Some("code_cell") {
            let language = map
                .get("language")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let content = map
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            return AgentReply::CodeCell { language, content };
        }
    }
    AgentReply::Text(text.to_string())
}

/// The think/act loop coordinator.
pub struct AgentLoop {
    policy: Arc<dyn DecisionPolicy>,
    tools: Arc<ToolRegistry>,
    context: ContextStore,
    max_iterations: u32,
    max_repair_attempts: u32,
    max_depth: u32,
    depth: u32,
    observer: Option<ThoughtObserver>,
}

impl AgentLoop {
    /// Creates a loop with default caps (see [`AgentConfig::default`]).
    pub fn new(
        policy: Arc<dyn DecisionPolicy>,
        tools: Arc<ToolRegistry>,
        context: ContextStore,
    ) -> Self {
        let defaults = AgentConfig::default();
        Self {
            policy,
            tools,
            context,
            max_iterations: defaults.max_iterations,
            max_repair_attempts: defaults.max_repair_attempts,
            max_depth: defaults.max_depth,
            depth: 0,
            observer: None,
        }
    }

    /// Applies caps from config (builder pattern).
    pub fn with_config(mut self, config: &AgentConfig) -> Self {
        self.max_iterations = config.max_iterations;
        self.max_repair_attempts = config.max_repair_attempts;
        self.max_depth = config.max_depth;
        self
    }

    /// Overrides the iteration cap (builder pattern).
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Overrides the repair reprompt budget (builder pattern).
    pub fn with_repair_attempts(mut self, attempts: u32) -> Self {
        self.max_repair_attempts = attempts;
        self
    }

    /// Installs a thought observer (builder pattern).
    pub fn with_observer(mut self, observer: ThoughtObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Marks this loop as a nested invocation at `depth`.
    ///
    /// Each invocation gets its own iteration budget; the depth guard keeps
    /// recursive tool-triggers-loop nesting from bypassing the cap.
    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    /// This loop's nesting depth.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Runs the loop to termination for one query.
    ///
    /// # Errors
    /// - a tool fails during ACT
    /// - policy output cannot be parsed after the repair budget
    /// - the policy itself fails
    /// - the nesting depth guard trips
    pub async fn run(&self, query: &str, ctx: &ToolContext) -> Result<Termination> {
        if self.depth >= self.max_depth {
            return Err(MuxError::AgentLoop(format!(
                "nested agent invocations exceeded depth {}",
                self.max_depth
            )));
        }

        let context = self.context.render();
        let mut turns: Vec<TurnRecord> = Vec::new();
        info!(depth = self.depth, "agent loop started");

        for iteration in 1..=self.max_iterations {
            debug!(iteration, "think");
            let action = self.think(&context, &turns, query).await?;

            match action {
                PolicyAction::FinalAnswer(text) => {
                    info!(iteration, "policy produced final answer");
                    return Ok(Termination::Answer(text));
                }
                PolicyAction::ToolCall {
                    thought,
                    tool,
                    input,
                } => {
                    if let Some(observer) = &self.observer {
                        observer(&thought, &tool, &input);
                    }
                    info!(tool = %tool, iteration, "act");

                    let observation = self
                        .tools
                        .execute(&tool, input.clone(), ctx)
                        .await
                        .map_err(|e| {
                            MuxError::AgentLoop(format!("tool '{}' failed: {}", tool, e))
                        })?;

                    if ctx.loop_control.is_stopped() {
                        info!(tool = %tool, "tool signalled completion");
                        return Ok(Termination::Answer(observation));
                    }

                    turns.push(TurnRecord {
                        thought,
                        tool,
                        input,
                        observation,
                    });
                }
            }
        }

        warn!(cap = self.max_iterations, "iteration cap reached");
        Ok(Termination::IterationCap(self.max_iterations))
    }

    /// One THINK step with bounded repair reprompts for unparsable output.
    async fn think(
        &self,
        context: &str,
        turns: &[TurnRecord],
        query: &str,
    ) -> Result<PolicyAction> {
        let mut raw = self.policy.decide(context, turns, query).await?;
        for attempt in 0..=self.max_repair_attempts {
            if let Some(action) = parse_action(&raw) {
                return Ok(action);
            }
            if attempt == self.max_repair_attempts {
                break;
            }
            warn!(attempt, "policy output unparsable, reprompting");
            let repair_query = format!(
                "{}\n\nYour previous reply could not be interpreted. Respond with a single \
                 JSON object: either {{\"thought\", \"tool\", \"tool_input\"}} or \
                 {{\"final_answer\"}}.",
                query
            );
            raw = self.policy.decide(context, turns, &repair_query).await?;
        }
        Err(MuxError::AgentLoop(
            "policy output could not be parsed as a tool call or final answer".to_string(),
        ))
    }
}

//! Agent module - loop coordination, decision policy contract, context store
//!
//! The agent side of the broker: a bounded think/act loop driven by an
//! external decision policy, grounded by an ordered store of context blocks.
//! The policy's reasoning is out of scope here; only its calling contract
//! ([`DecisionPolicy`]) is defined.

mod context;
mod r#loop;
mod policy;

pub use context::{ContextHandle, ContextStore};
pub use policy::{parse_action, DecisionPolicy, PolicyAction, ScriptedPolicy, TurnRecord};
pub use r#loop::{classify_output, AgentLoop, AgentReply, Termination, ThoughtObserver};

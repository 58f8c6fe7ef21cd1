//! KernelMux - LLM-agent notebook kernel broker
//!
//! KernelMux sits between an interactive notebook front-end and a disposable
//! compute kernel. It multiplexes many request/response exchanges over the
//! fixed set of kernel channels, lets dynamically registered filters
//! observe, rewrite, or suppress in-flight messages, correlates the
//! multi-message lifecycle of each execution (echo, streamed output, result,
//! terminal reply), and drives a tool-using agent whose actions open new
//! exchanges on the same bus.

pub mod agent;
pub mod backend;
pub mod broker;
pub mod bus;
pub mod config;
pub mod error;
pub mod exchange;
pub mod filter;
pub mod logging;
pub mod tools;

pub use agent::{AgentLoop, AgentReply, ContextStore, DecisionPolicy, Termination};
pub use broker::KernelBroker;
pub use bus::{BusEnvelope, BusMessage, Channel, KernelBus, Origin};
pub use config::Config;
pub use error::{MuxError, Result};
pub use exchange::{ExchangeCorrelator, ExchangeOutcome, ExchangeStatus, ExchangeTicket};
pub use filter::{FilterAction, FilterChain, FilterId, MessageFilter};

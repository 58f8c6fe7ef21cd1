//! Error types for KernelMux
//!
//! This module defines all error types used throughout the broker.
//! Uses `thiserror` for ergonomic error handling with automatic `Display` and
//! `Error` trait implementations.

use thiserror::Error;

/// The primary error type for KernelMux operations.
#[derive(Error, Debug)]
pub enum MuxError {
    /// Configuration-related errors (invalid config file, bad values, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Channel errors (unknown channel name, routing issues, etc.)
    #[error("Channel error: {0}")]
    Channel(String),

    /// Bus queue closed unexpectedly (all receivers dropped)
    #[error("Bus error: channel closed")]
    BusClosed,

    /// Filter chain bookkeeping errors.
    ///
    /// Removing a filter entry that is not registered indicates a logic
    /// defect in the caller (double-completion or a mismatched token) and
    /// is reported here rather than silently ignored.
    #[error("Filter error: {0}")]
    Filter(String),

    /// Exchange correlation errors (correlator dropped mid-wait, duplicate
    /// token, cancelled exchange, etc.)
    #[error("Exchange error: {0}")]
    Exchange(String),

    /// Agent loop errors (unparsable policy output after repair attempts,
    /// tool dispatch failure, recursion depth exceeded)
    #[error("Agent loop error: {0}")]
    AgentLoop(String),

    /// Tool execution errors (invalid arguments, execution failures)
    #[error("Tool error: {0}")]
    Tool(String),

    /// Compute backend errors (kernel provisioning/destruction failures,
    /// non-success HTTP statuses). Never retried automatically: a stale
    /// kernel handle must not be silently reused.
    #[error("Backend error: {0}")]
    Backend(String),

    /// Data service errors (dataset not found, missing download URL)
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Resource not found (tools, context handles, etc.)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Standard I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// A specialized `Result` type for KernelMux operations.
pub type Result<T> = std::result::Result<T, MuxError>;

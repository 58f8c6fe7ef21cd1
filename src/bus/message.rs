//! Message types for the KernelMux bus
//!
//! This module defines the protocol message carried on every channel, plus
//! the routing envelope that tags a message with its channel and origin.
//! The wire encoding of messages (multipart frames, HMAC signing) belongs to
//! the transport adapters; inside the broker a message is just this struct.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::Channel;

/// A single protocol message.
///
/// The `msg_id` doubles as the correlation token for exchanges started by
/// this broker: replies carry it in their `parent_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    /// Unique message identifier
    pub msg_id: String,
    /// Message kind (e.g., "execute_request", "stream", "status")
    pub msg_type: String,
    /// The `msg_id` of the request this message responds to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Message payload
    #[serde(default)]
    pub content: Value,
    /// Additional metadata
    #[serde(default)]
    pub metadata: Value,
    /// RFC 3339 creation timestamp
    pub date: String,
}

impl BusMessage {
    /// Creates a new message with a fresh v4 UUID and no parent.
    ///
    /// # Example
    /// ```
    /// use kernelmux::bus::BusMessage;
    /// use serde_json::json;
    ///
    /// let msg = BusMessage::new("status", json!({"execution_state": "idle"}));
    /// assert_eq!(msg.msg_type, "status");
    /// assert!(msg.parent_id.is_none());
    /// ```
    pub fn new(msg_type: &str, content: Value) -> Self {
        Self {
            msg_id: Uuid::new_v4().to_string(),
            msg_type: msg_type.to_string(),
            parent_id: None,
            content,
            metadata: Value::Object(serde_json::Map::new()),
            date: Utc::now().to_rfc3339(),
        }
    }

    /// Sets the parent message id (builder pattern).
    pub fn with_parent(mut self, parent_id: &str) -> Self {
        self.parent_id = Some(parent_id.to_string());
        self
    }

    /// Sets the metadata object (builder pattern).
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Creates a message responding to `parent`.
    ///
    /// # Example
    /// ```
    /// use kernelmux::bus::BusMessage;
    /// use serde_json::json;
    ///
    /// let request = BusMessage::new("llm_request", json!({"request": "mean of df?"}));
    /// let reply = BusMessage::reply_to(&request, "llm_reply", json!({"status": "ok"}));
    /// assert_eq!(reply.parent_id.as_deref(), Some(request.msg_id.as_str()));
    /// ```
    pub fn reply_to(parent: &BusMessage, msg_type: &str, content: Value) -> Self {
        Self::new(msg_type, content).with_parent(&parent.msg_id)
    }

    /// Builds an `execute_request` message for the compute backend.
    ///
    /// Flags default to the broker's internal-execution profile: not silent,
    /// no history, stdin allowed, keep going on error.
    pub fn execute_request(code: &str) -> Self {
        Self::new(
            "execute_request",
            serde_json::json!({
                "silent": false,
                "store_history": false,
                "user_expressions": {},
                "allow_stdin": true,
                "stop_on_error": false,
                "code": code,
            }),
        )
        .with_metadata(serde_json::json!({"trusted": true}))
    }

    /// Returns true if this message's parent id equals `token`.
    pub fn parent_is(&self, token: &str) -> bool {
        self.parent_id.as_deref() == Some(token)
    }
}

/// Which side of the broker a message arrived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// The interactive front-end (notebook client)
    Frontend,
    /// The proxied compute backend (kernel)
    Backend,
}

impl Origin {
    /// The side a passed-through message should be forwarded to.
    pub fn opposite(&self) -> Origin {
        match self {
            Origin::Frontend => Origin::Backend,
            Origin::Backend => Origin::Frontend,
        }
    }
}

/// A message tagged with the channel it travels on and the side it came from.
#[derive(Debug, Clone)]
pub struct BusEnvelope {
    /// The channel carrying the message
    pub channel: Channel,
    /// The side the message arrived from
    pub origin: Origin,
    /// The message itself
    pub message: BusMessage,
}

impl BusEnvelope {
    /// Creates a new envelope.
    pub fn new(channel: Channel, origin: Origin, message: BusMessage) -> Self {
        Self {
            channel,
            origin,
            message,
        }
    }

    /// Shorthand for a message arriving from the backend.
    pub fn from_backend(channel: Channel, message: BusMessage) -> Self {
        Self::new(channel, Origin::Backend, message)
    }

    /// Shorthand for a message arriving from the front-end.
    pub fn from_frontend(channel: Channel, message: BusMessage) -> Self {
        Self::new(channel, Origin::Frontend, message)
    }

    /// Returns a copy of this envelope carrying `message` instead.
    pub fn with_message(&self, message: BusMessage) -> Self {
        Self {
            channel: self.channel,
            origin: self.origin,
            message,
        }
    }
}

//! Exchange Correlator Module
//!
//! One *exchange* is a single logical request/response interaction with the
//! compute backend, split across several physical messages: an echoed copy of
//! the request, zero or more streamed output fragments, an optional
//! synchronous result, and exactly one terminal reply. All of them carry the
//! request's `msg_id` as their parent — that id is the correlation token.
//!
//! The correlator keeps one exchange record per live token, installed
//! atomically *before* the request is sent, with typed slots for each message
//! kind in the lifecycle (echo, result, stream, terminal reply). The router
//! hands it every backend message via [`ExchangeCorrelator::observe`]; a
//! message matching a live token is routed into its record and consumed,
//! everything else passes through untouched. Because the whole record is
//! removed in one step at the terminal reply, there is no per-entry
//! unregistration to forget, and nothing can fire after completion.
//!
//! Waiters suspend on a per-exchange completion flag (a `tokio::sync::watch`
//! channel) that the terminal handler resolves directly — no polling. No
//! timeout is enforced by default: a backend that never replies stalls the
//! caller. [`ExchangeCorrelator::wait_timeout`] and
//! [`ExchangeCorrelator::cancel`] are the explicit escape hatches.
//!
//! Multiple exchanges may be in flight concurrently on the same channels;
//! isolation rests entirely on the token comparison, not on locks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::bus::{BusEnvelope, BusMessage, Channel, KernelBus, Origin};
use crate::error::{MuxError, Result};
use crate::filter::FilterAction;

/// Caller-supplied callback receiving `(stream_name, text)` fragments as
/// they arrive, ahead of exchange completion.
pub type StreamSink = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Lifecycle status reported by the terminal reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeStatus {
    /// The request completed successfully
    Ok,
    /// The request raised an error
    Error,
    /// The request was aborted before running
    Aborted,
}

impl ExchangeStatus {
    fn from_reply(content: &Value) -> Self {
        match content.get("status").and_then(Value::as_str) {
            Some("ok") => ExchangeStatus::Ok,
            Some("aborted") => ExchangeStatus::Aborted,
            _ => ExchangeStatus::Error,
        }
    }

    /// Returns true for [`ExchangeStatus::Ok`].
    pub fn is_ok(&self) -> bool {
        matches!(self, ExchangeStatus::Ok)
    }
}

/// The terminal reply envelope of an exchange.
///
/// An error status here is a property of the exchange's result, not an
/// engine fault: it is stored, not raised, and the caller decides how to
/// present it.
#[derive(Debug, Clone)]
pub struct ReplyEnvelope {
    /// Lifecycle status (ok/error/aborted)
    pub status: ExchangeStatus,
    /// Full reply content as sent by the backend
    pub content: Value,
}

/// Everything an exchange accumulated by the time it completed (or was
/// cancelled).
#[derive(Debug, Clone, Default)]
pub struct ExchangeOutcome {
    /// Standard-output fragments in arrival order
    pub stdout: Vec<String>,
    /// Error-output fragments in arrival order
    pub stderr: Vec<String>,
    /// The synchronous result of the last expression, if the request
    /// produced one (absence is not an error)
    pub return_value: Option<String>,
    /// The terminal reply; `None` only for cancelled exchanges
    pub reply: Option<ReplyEnvelope>,
}

impl ExchangeOutcome {
    /// All stdout fragments concatenated.
    pub fn stdout_text(&self) -> String {
        self.stdout.concat()
    }

    /// All stderr fragments concatenated.
    pub fn stderr_text(&self) -> String {
        self.stderr.concat()
    }

    /// Returns true if the terminal reply reported success.
    pub fn is_ok(&self) -> bool {
        matches!(&self.reply, Some(r) if r.status.is_ok())
    }

    /// Structurally decodes the textual return value as JSON.
    ///
    /// Returns `None` when no return value was produced or the text is not
    /// valid JSON — conversion is skipped, never failed.
    ///
    /// # Example
    /// ```
    /// use kernelmux::exchange::ExchangeOutcome;
    ///
    /// let mut outcome = ExchangeOutcome::default();
    /// assert!(outcome.decode_value().is_none());
    ///
    /// outcome.return_value = Some("42".to_string());
    /// assert_eq!(outcome.decode_value(), Some(serde_json::json!(42)));
    /// ```
    pub fn decode_value(&self) -> Option<Value> {
        self.return_value
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }
}

/// Waiter handle for one exchange, returned by [`ExchangeCorrelator::begin`].
#[derive(Debug)]
pub struct ExchangeTicket {
    token: String,
    done: watch::Receiver<bool>,
}

impl ExchangeTicket {
    /// The correlation token shared by all messages of this exchange.
    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Per-token accumulation state. Typed slots for each message kind in the
/// exchange lifecycle replace ad-hoc filter registrations; the record is
/// created before the request is sent and removed exactly once, at the
/// terminal reply.
struct ExchangeRecord {
    outcome: ExchangeOutcome,
    /// The backend broadcasts one echoed copy of the request; it is consumed
    /// on first sight and this flag cleared, so the echo suppression is
    /// structurally one-shot.
    echo_pending: bool,
    sink: Option<StreamSink>,
    done_tx: watch::Sender<bool>,
}

/// Correlates multi-message exchanges over the shared bus.
pub struct ExchangeCorrelator {
    bus: KernelBus,
    active: Mutex<HashMap<String, ExchangeRecord>>,
    finished: Mutex<HashMap<String, ExchangeOutcome>>,
}

impl ExchangeCorrelator {
    /// Creates a correlator sending requests through `bus`.
    pub fn new(bus: KernelBus) -> Self {
        Self {
            bus,
            active: Mutex::new(HashMap::new()),
            finished: Mutex::new(HashMap::new()),
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, HashMap<String, ExchangeRecord>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_finished(&self) -> MutexGuard<'_, HashMap<String, ExchangeOutcome>> {
        self.finished.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Dispatches an execute request and returns a waiter ticket.
    ///
    /// The correlation token is the dispatched message's own id. The record
    /// is installed before the request leaves, so no reply can race it.
    pub async fn begin(&self, code: &str) -> Result<ExchangeTicket> {
        self.begin_with_sink(code, None).await
    }

    /// Like [`ExchangeCorrelator::begin`], forwarding streamed output to
    /// `sink` as it arrives.
    pub async fn begin_with_sink(
        &self,
        code: &str,
        sink: Option<StreamSink>,
    ) -> Result<ExchangeTicket> {
        let message = BusMessage::execute_request(code);
        let token = message.msg_id.clone();
        let (done_tx, done_rx) = watch::channel(false);

        {
            let mut active = self.lock_active();
            if active.contains_key(&token) {
                return Err(MuxError::Exchange(format!(
                    "exchange token {} already in flight",
                    token
                )));
            }
            active.insert(
                token.clone(),
                ExchangeRecord {
                    outcome: ExchangeOutcome::default(),
                    echo_pending: true,
                    sink,
                    done_tx,
                },
            );
        }
        debug!(token = %token, "exchange opened");

        if let Err(e) = self
            .bus
            .send_to_backend(BusEnvelope::from_frontend(Channel::Shell, message))
            .await
        {
            self.lock_active().remove(&token);
            return Err(e);
        }

        Ok(ExchangeTicket {
            token,
            done: done_rx,
        })
    }

    /// Suspends until the exchange completes, then takes its outcome.
    ///
    /// No timeout: a backend that never replies stalls the caller
    /// indefinitely. Use [`ExchangeCorrelator::wait_timeout`] where that is
    /// unacceptable.
    pub async fn wait(&self, ticket: &mut ExchangeTicket) -> Result<ExchangeOutcome> {
        loop {
            if *ticket.done.borrow_and_update() {
                break;
            }
            if ticket.done.changed().await.is_err() {
                // Sender gone without flipping the flag: the record was
                // removed by cancel().
                if *ticket.done.borrow() {
                    break;
                }
                return Err(MuxError::Exchange(format!(
                    "exchange {} cancelled before completion",
                    ticket.token
                )));
            }
        }
        self.lock_finished().remove(&ticket.token).ok_or_else(|| {
            MuxError::Exchange(format!(
                "outcome for exchange {} already claimed",
                ticket.token
            ))
        })
    }

    /// [`ExchangeCorrelator::wait`] bounded by `timeout`.
    pub async fn wait_timeout(
        &self,
        ticket: &mut ExchangeTicket,
        timeout: Duration,
    ) -> Result<ExchangeOutcome> {
        match tokio::time::timeout(timeout, self.wait(ticket)).await {
            Ok(result) => result,
            Err(_) => Err(MuxError::Exchange(format!(
                "exchange {} timed out after {:?}",
                ticket.token, timeout
            ))),
        }
    }

    /// Convenience: dispatch and wait in one call.
    pub async fn execute(&self, code: &str) -> Result<ExchangeOutcome> {
        let mut ticket = self.begin(code).await?;
        self.wait(&mut ticket).await
    }

    /// Convenience: dispatch with a stream sink and wait.
    pub async fn execute_with_sink(
        &self,
        code: &str,
        sink: StreamSink,
    ) -> Result<ExchangeOutcome> {
        let mut ticket = self.begin_with_sink(code, Some(sink)).await?;
        self.wait(&mut ticket).await
    }

    /// Abandons an exchange, removing its record so no further messages are
    /// consumed on its behalf. Returns whatever had accumulated, or the
    /// finished outcome if completion already happened.
    pub fn cancel(&self, token: &str) -> Option<ExchangeOutcome> {
        if let Some(record) = self.lock_active().remove(token) {
            warn!(token = %token, "exchange cancelled while in flight");
            return Some(record.outcome);
        }
        self.lock_finished().remove(token)
    }

    /// Number of exchanges currently in flight.
    pub fn open_count(&self) -> usize {
        self.lock_active().len()
    }

    /// Returns true if `token` identifies a live exchange.
    pub fn is_open(&self, token: &str) -> bool {
        self.lock_active().contains_key(token)
    }

    /// Inspects a routed message, consuming it into a matching record.
    ///
    /// Every message is compared by its *parent* id against the live tokens:
    /// a mismatch passes through unmodified so unrelated concurrent
    /// exchanges are unaffected. Matching messages are consumed — they
    /// belong to an engine-internal exchange and must not reach the
    /// front-end.
    pub fn observe(&self, envelope: &BusEnvelope) -> FilterAction {
        if envelope.origin != Origin::Backend {
            return FilterAction::Pass(envelope.message.clone());
        }
        let msg = &envelope.message;
        let Some(parent) = msg.parent_id.as_deref() else {
            return FilterAction::Pass(msg.clone());
        };

        match (envelope.channel, msg.msg_type.as_str()) {
            (Channel::IoPub, "execute_input") => {
                let mut active = self.lock_active();
                match active.get_mut(parent) {
                    Some(record) => {
                        record.echo_pending = false;
                        FilterAction::Suppress
                    }
                    None => FilterAction::Pass(msg.clone()),
                }
            }
            (Channel::IoPub, "execute_result") => {
                let mut active = self.lock_active();
                match active.get_mut(parent) {
                    Some(record) => {
                        record.outcome.return_value = msg
                            .content
                            .get("data")
                            .and_then(|d| d.get("text/plain"))
                            .and_then(Value::as_str)
                            .map(String::from);
                        FilterAction::Suppress
                    }
                    None => FilterAction::Pass(msg.clone()),
                }
            }
            (Channel::IoPub, "stream") => {
                let name = msg
                    .content
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("stdout")
                    .to_string();
                let text = msg
                    .content
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();

                let sink = {
                    let mut active = self.lock_active();
                    match active.get_mut(parent) {
                        Some(record) => {
                            match name.as_str() {
                                "stderr" => record.outcome.stderr.push(text.clone()),
                                _ => record.outcome.stdout.push(text.clone()),
                            }
                            record.sink.clone()
                        }
                        None => return FilterAction::Pass(msg.clone()),
                    }
                };
                // Sink runs outside the record lock
                if let Some(sink) = sink {
                    sink(&name, &text);
                }
                FilterAction::Suppress
            }
            (Channel::Shell, "execute_reply") => {
                let removed = self.lock_active().remove(parent);
                match removed {
                    Some(mut record) => {
                        let status = ExchangeStatus::from_reply(&msg.content);
                        record.outcome.reply = Some(ReplyEnvelope {
                            status,
                            content: msg.content.clone(),
                        });
                        self.lock_finished()
                            .insert(parent.to_string(), record.outcome);
                        // The record is already gone from the active map, so
                        // the flag flips false -> true exactly once and no
                        // slot can fire after this point.
                        let _ = record.done_tx.send(true);
                        debug!(token = %parent, ?status, "exchange completed");
                        FilterAction::Suppress
                    }
                    None => FilterAction::Pass(msg.clone()),
                }
            }
            _ => FilterAction::Pass(msg.clone()),
        }
    }
}

//! Filter Chain Module
//!
//! An ordered, mutable collection of (channel, message-kind, handler) entries.
//! Every inbound message on a channel runs through all handlers registered
//! for its (channel, kind) pair, in registration order. Each handler can pass
//! the message through unchanged, transform it, or suppress it; suppression
//! stops propagation to the transport and to later handlers in the same pass.
//!
//! Dispatch snapshots the matching entries before running any handler, so a
//! handler may mutate the chain mid-pass (including unregistering itself)
//! without skipped or duplicated invocations.
//!
//! A handler that should only ever fire once reports itself via
//! [`MessageFilter::is_expired`]; the chain prunes expired entries after each
//! dispatch pass. This is how one-shot suppressors retire without their owner
//! having to remember to unregister them.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::{debug, error};

use crate::bus::{BusEnvelope, BusMessage, Channel};
use crate::error::{MuxError, Result};

/// Handle identifying a registered filter entry.
pub type FilterId = u64;

/// Outcome of running a handler against a message.
#[derive(Debug)]
pub enum FilterAction {
    /// Propagate this message (possibly transformed) to later handlers and
    /// then to the transport.
    Pass(BusMessage),
    /// Drop the message; later handlers do not see it.
    Suppress,
}

impl FilterAction {
    /// Returns true if the action suppresses the message.
    pub fn is_suppress(&self) -> bool {
        matches!(self, FilterAction::Suppress)
    }
}

/// A handler that observes in-flight messages on one (channel, kind) pair.
#[async_trait]
pub trait MessageFilter: Send + Sync {
    /// Inspects a message and decides what happens to it.
    async fn on_message(&self, envelope: &BusEnvelope) -> FilterAction;

    /// One-shot handlers return true once they have fired; the chain prunes
    /// expired entries after each dispatch pass.
    fn is_expired(&self) -> bool {
        false
    }
}

#[derive(Clone)]
struct FilterEntry {
    id: FilterId,
    channel: Channel,
    msg_type: String,
    filter: Arc<dyn MessageFilter>,
}

/// The ordered interception chain.
///
/// # Example
/// ```
/// use kernelmux::bus::{BusEnvelope, BusMessage, Channel};
/// use kernelmux::filter::{FilterAction, FilterChain, FnFilter};
/// use serde_json::json;
///
/// # tokio_test::block_on(async {
/// let chain = FilterChain::new();
/// let id = chain.register(
///     Channel::IoPub,
///     "stream",
///     FnFilter::new(|_env| FilterAction::Suppress),
/// );
///
/// let env = BusEnvelope::from_backend(
///     Channel::IoPub,
///     BusMessage::new("stream", json!({"name": "stdout", "text": "hi"})),
/// );
/// assert!(chain.dispatch(env).await.is_suppress());
/// chain.unregister(id).unwrap();
/// # });
/// ```
pub struct FilterChain {
    entries: Mutex<Vec<FilterEntry>>,
    next_id: AtomicU64,
}

impl FilterChain {
    /// Creates an empty chain.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<FilterEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs a handler for `(channel, msg_type)` and returns its handle.
    ///
    /// Handlers run in registration order.
    pub fn register(
        &self,
        channel: Channel,
        msg_type: &str,
        filter: Arc<dyn MessageFilter>,
    ) -> FilterId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().push(FilterEntry {
            id,
            channel,
            msg_type: msg_type.to_string(),
            filter,
        });
        debug!(filter = id, channel = %channel, msg_type, "filter registered");
        id
    }

    /// Removes the entry registered under `id`.
    ///
    /// Removing an entry that is not installed indicates a logic defect in
    /// the caller (double-completion or a mismatched token); it is reported
    /// as [`MuxError::Filter`] and logged at error level rather than being
    /// silently ignored.
    pub fn unregister(&self, id: FilterId) -> Result<()> {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        if entries.len() == before {
            error!(filter = id, "unregistering a filter that is not installed");
            return Err(MuxError::Filter(format!(
                "filter entry {} is not installed",
                id
            )));
        }
        debug!(filter = id, "filter unregistered");
        Ok(())
    }

    /// Returns true if an entry with this handle is installed.
    pub fn has(&self, id: FilterId) -> bool {
        self.lock().iter().any(|e| e.id == id)
    }

    /// Number of installed entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if no entries are installed.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Runs the message through all matching handlers in registration order.
    ///
    /// The matching set is snapshotted up front; handlers may register or
    /// unregister entries during the pass without affecting it. Expired
    /// entries are pruned afterwards.
    pub async fn dispatch(&self, envelope: BusEnvelope) -> FilterAction {
        let channel = envelope.channel;
        let origin = envelope.origin;
        let msg_type = envelope.message.msg_type.clone();

        let snapshot: Vec<FilterEntry> = {
            let entries = self.lock();
            entries
                .iter()
                .filter(|e| {
                    e.channel == channel
                        && e.msg_type == msg_type
                        && !e.filter.is_expired()
                })
                .cloned()
                .collect()
        };

        if snapshot.is_empty() {
            return FilterAction::Pass(envelope.message);
        }

        let mut current = envelope.message;
        for entry in snapshot {
            let env = BusEnvelope::new(channel, origin, current.clone());
            match entry.filter.on_message(&env).await {
                FilterAction::Pass(next) => current = next,
                FilterAction::Suppress => {
                    debug!(filter = entry.id, channel = %channel, msg_type = %msg_type, "message suppressed");
                    self.prune_expired();
                    return FilterAction::Suppress;
                }
            }
        }
        self.prune_expired();
        FilterAction::Pass(current)
    }

    fn prune_expired(&self) {
        let mut entries = self.lock();
        entries.retain(|e| {
            let keep = !e.filter.is_expired();
            if !keep {
                debug!(filter = e.id, "expired filter pruned");
            }
            keep
        });
    }
}

impl Default for FilterChain {
    fn default() -> Self {
        Self::new()
    }
}

/// Adapter turning a plain closure into a [`MessageFilter`].
pub struct FnFilter<F> {
    f: F,
}

impl<F> FnFilter<F>
where
    F: Fn(&BusEnvelope) -> FilterAction + Send + Sync + 'static,
{
    /// Wraps a closure.
    pub fn new(f: F) -> Arc<Self> {
        Arc::new(Self { f })
    }
}

#[async_trait]
impl<F> MessageFilter for FnFilter<F>
where
    F: Fn(&BusEnvelope) -> FilterAction + Send + Sync,
{
    async fn on_message(&self, envelope: &BusEnvelope) -> FilterAction {
        (self.f)(envelope)
    }
}

/// Suppresses a single message whose parent id matches the stored token,
/// then retires.
///
/// Mirrors the echo-silencing handler installed around internal executions:
/// the backend broadcasts a copy of every request it receives, and exactly
/// one such copy per request must be kept from the front-end. The handler
/// retires after its first invocation whether or not it matched, so it can
/// never affect a later, unrelated request of the same kind.
pub struct OnceSuppress {
    parent_id: String,
    fired: AtomicBool,
}

impl OnceSuppress {
    /// Creates a suppressor for messages whose parent is `parent_id`.
    pub fn new(parent_id: &str) -> Arc<Self> {
        Arc::new(Self {
            parent_id: parent_id.to_string(),
            fired: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl MessageFilter for OnceSuppress {
    async fn on_message(&self, envelope: &BusEnvelope) -> FilterAction {
        let first = !self.fired.swap(true, Ordering::SeqCst);
        if first && envelope.message.parent_is(&self.parent_id) {
            FilterAction::Suppress
        } else {
            FilterAction::Pass(envelope.message.clone())
        }
    }

    fn is_expired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn stream_env(text: &str) -> BusEnvelope {
        BusEnvelope::from_backend(
            Channel::IoPub,
            BusMessage::new("stream", json!({"name": "stdout", "text": text})),
        )
    }

    #[tokio::test]
    async fn test_empty_chain_passes() {
        let chain = FilterChain::new();
        let action = chain.dispatch(stream_env("hi")).await;
        match action {
            FilterAction::Pass(msg) => assert_eq!(msg.content["text"], "hi"),
            FilterAction::Suppress => panic!("empty chain must pass"),
        }
    }

    #[tokio::test]
    async fn test_register_and_suppress() {
        let chain = FilterChain::new();
        chain.register(
            Channel::IoPub,
            "stream",
            FnFilter::new(|_| FilterAction::Suppress),
        );
        assert!(chain.dispatch(stream_env("gone")).await.is_suppress());
    }

    #[tokio::test]
    async fn test_non_matching_kind_ignored() {
        let chain = FilterChain::new();
        chain.register(
            Channel::IoPub,
            "execute_result",
            FnFilter::new(|_| FilterAction::Suppress),
        );
        // A stream message is not touched by an execute_result filter
        assert!(!chain.dispatch(stream_env("kept")).await.is_suppress());
    }

    #[tokio::test]
    async fn test_non_matching_channel_ignored() {
        let chain = FilterChain::new();
        chain.register(
            Channel::Shell,
            "stream",
            FnFilter::new(|_| FilterAction::Suppress),
        );
        assert!(!chain.dispatch(stream_env("kept")).await.is_suppress());
    }

    #[tokio::test]
    async fn test_transform_feeds_later_handlers() {
        let chain = FilterChain::new();
        chain.register(
            Channel::IoPub,
            "stream",
            FnFilter::new(|env| {
                let mut msg = env.message.clone();
                msg.content["text"] = json!("first");
                FilterAction::Pass(msg)
            }),
        );
        chain.register(
            Channel::IoPub,
            "stream",
            FnFilter::new(|env| {
                // Sees the first handler's transformation
                assert_eq!(env.message.content["text"], "first");
                let mut msg = env.message.clone();
                msg.content["text"] = json!("second");
                FilterAction::Pass(msg)
            }),
        );

        match chain.dispatch(stream_env("original")).await {
            FilterAction::Pass(msg) => assert_eq!(msg.content["text"], "second"),
            FilterAction::Suppress => panic!("expected pass"),
        }
    }

    #[tokio::test]
    async fn test_suppress_stops_pass() {
        let chain = FilterChain::new();
        let later_ran = Arc::new(AtomicBool::new(false));
        chain.register(
            Channel::IoPub,
            "stream",
            FnFilter::new(|_| FilterAction::Suppress),
        );
        let flag = Arc::clone(&later_ran);
        chain.register(
            Channel::IoPub,
            "stream",
            FnFilter::new(move |env| {
                flag.store(true, Ordering::SeqCst);
                FilterAction::Pass(env.message.clone())
            }),
        );

        assert!(chain.dispatch(stream_env("x")).await.is_suppress());
        assert!(!later_ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_unregister() {
        let chain = FilterChain::new();
        let id = chain.register(
            Channel::IoPub,
            "stream",
            FnFilter::new(|_| FilterAction::Suppress),
        );
        assert!(chain.has(id));
        chain.unregister(id).unwrap();
        assert!(!chain.has(id));
        assert!(!chain.dispatch(stream_env("back")).await.is_suppress());
    }

    #[tokio::test]
    async fn test_unregister_absent_is_error() {
        let chain = FilterChain::new();
        let result = chain.unregister(999);
        assert!(matches!(result, Err(MuxError::Filter(_))));
    }

    #[tokio::test]
    async fn test_double_unregister_is_error() {
        let chain = FilterChain::new();
        let id = chain.register(
            Channel::IoPub,
            "stream",
            FnFilter::new(|env| FilterAction::Pass(env.message.clone())),
        );
        chain.unregister(id).unwrap();
        assert!(chain.unregister(id).is_err());
    }

    // A filter that unregisters another entry while the chain is mid-pass.
    struct RemovesOther {
        chain: Arc<FilterChain>,
        target: FilterId,
        done: AtomicBool,
    }

    #[async_trait]
    impl MessageFilter for RemovesOther {
        async fn on_message(&self, envelope: &BusEnvelope) -> FilterAction {
            if !self.done.swap(true, Ordering::SeqCst) {
                self.chain.unregister(self.target).unwrap();
            }
            FilterAction::Pass(envelope.message.clone())
        }
    }

    #[tokio::test]
    async fn test_mutation_during_dispatch_uses_snapshot() {
        let chain = Arc::new(FilterChain::new());

        // Ids are sequential starting at 1: the remover registers first and
        // gets id 1, the counter it removes gets id 2.
        let remover = Arc::new(RemovesOther {
            chain: Arc::clone(&chain),
            target: 2,
            done: AtomicBool::new(false),
        });
        chain.register(Channel::IoPub, "stream", remover);

        let count = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&count);
        let counter_id = chain.register(
            Channel::IoPub,
            "stream",
            FnFilter::new(move |env| {
                counted.fetch_add(1, Ordering::SeqCst);
                FilterAction::Pass(env.message.clone())
            }),
        );
        assert_eq!(counter_id, 2);

        // Pass 1: the remover unregisters the counter mid-pass, but the
        // counter was snapshotted and still runs exactly once.
        chain.dispatch(stream_env("a")).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Pass 2: the counter is gone and must not run again.
        chain.dispatch(stream_env("b")).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_once_suppress_fires_once() {
        let chain = FilterChain::new();
        let token = "request-1";
        chain.register(Channel::IoPub, "execute_input", OnceSuppress::new(token));

        let echo = BusEnvelope::from_backend(
            Channel::IoPub,
            BusMessage::new("execute_input", json!({"code": "x = 1"})).with_parent(token),
        );
        assert!(chain.dispatch(echo).await.is_suppress());

        // A second, unrelated request of the same kind is untouched
        let unrelated = BusEnvelope::from_backend(
            Channel::IoPub,
            BusMessage::new("execute_input", json!({"code": "y = 2"})).with_parent("request-2"),
        );
        assert!(!chain.dispatch(unrelated).await.is_suppress());
        // And the expired entry has been pruned
        assert!(chain.is_empty());
    }

    #[tokio::test]
    async fn test_once_suppress_non_matching_first_passes_and_retires() {
        let chain = FilterChain::new();
        chain.register(Channel::IoPub, "execute_input", OnceSuppress::new("token-a"));

        let other = BusEnvelope::from_backend(
            Channel::IoPub,
            BusMessage::new("execute_input", json!({})).with_parent("token-b"),
        );
        assert!(!chain.dispatch(other).await.is_suppress());
        assert!(chain.is_empty());
    }

    #[tokio::test]
    async fn test_registration_order_preserved() {
        let chain = FilterChain::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b", "c"] {
            let order = Arc::clone(&order);
            chain.register(
                Channel::IoPub,
                "stream",
                FnFilter::new(move |env| {
                    order.lock().unwrap().push(tag);
                    FilterAction::Pass(env.message.clone())
                }),
            );
        }

        chain.dispatch(stream_env("x")).await;
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }
}

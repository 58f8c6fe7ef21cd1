//! Integration tests for exchange correlation over a running broker.
//!
//! Messages are fed through the bus exactly as a transport adapter would
//! deliver them, so every assertion covers the full router path: filter
//! chain, correlator, forwarding.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use kernelmux::agent::ScriptedPolicy;
use kernelmux::broker::KernelBroker;
use kernelmux::bus::{BusEnvelope, BusMessage, Channel};
use kernelmux::config::Config;
use kernelmux::filter::OnceSuppress;

fn spawn_broker() -> (Arc<KernelBroker>, tokio::task::JoinHandle<()>) {
    let broker = KernelBroker::new(Config::default(), Arc::new(ScriptedPolicy::default()));
    let runner = Arc::clone(&broker);
    let handle = tokio::spawn(async move {
        runner.run().await.unwrap();
    });
    (broker, handle)
}

async fn feed_backend(broker: &KernelBroker, channel: Channel, message: BusMessage) {
    broker
        .bus()
        .publish_inbound(BusEnvelope::from_backend(channel, message))
        .await
        .unwrap();
}

fn stream(token: &str, name: &str, text: &str) -> BusMessage {
    BusMessage::new("stream", json!({"name": name, "text": text})).with_parent(token)
}

fn result(token: &str, value: &str) -> BusMessage {
    BusMessage::new("execute_result", json!({"data": {"text/plain": value}})).with_parent(token)
}

fn reply(token: &str, status: &str) -> BusMessage {
    BusMessage::new("execute_reply", json!({"status": status})).with_parent(token)
}

fn echo(token: &str, code: &str) -> BusMessage {
    BusMessage::new("execute_input", json!({"code": code})).with_parent(token)
}

/// Drains every envelope currently sitting in the frontend queue.
async fn drain_frontend(broker: &KernelBroker) -> Vec<BusMessage> {
    let mut messages = Vec::new();
    while let Ok(Some(envelope)) = tokio::time::timeout(
        Duration::from_millis(50),
        broker.bus().consume_frontend(),
    )
    .await
    {
        messages.push(envelope.message);
    }
    messages
}

// ============================================================================
// Concurrent exchange isolation
// ============================================================================

#[tokio::test]
async fn concurrent_exchanges_never_cross_tokens() {
    let (broker, handle) = spawn_broker();
    let correlator = Arc::clone(broker.correlator());

    let mut ticket_a = correlator.begin("job_a()").await.unwrap();
    let mut ticket_b = correlator.begin("job_b()").await.unwrap();
    let a = ticket_a.token().to_string();
    let b = ticket_b.token().to_string();
    assert_ne!(a, b);

    // Interleave traffic for both exchanges on the same channels
    feed_backend(&broker, Channel::IoPub, echo(&a, "job_a()")).await;
    feed_backend(&broker, Channel::IoPub, stream(&a, "stdout", "a1")).await;
    feed_backend(&broker, Channel::IoPub, echo(&b, "job_b()")).await;
    feed_backend(&broker, Channel::IoPub, stream(&b, "stdout", "b1")).await;
    feed_backend(&broker, Channel::IoPub, stream(&a, "stderr", "a2")).await;
    feed_backend(&broker, Channel::IoPub, result(&b, "'b-value'")).await;
    feed_backend(&broker, Channel::IoPub, stream(&b, "stdout", "b2")).await;
    feed_backend(&broker, Channel::Shell, reply(&b, "ok")).await;
    feed_backend(&broker, Channel::IoPub, stream(&a, "stdout", "a3")).await;
    feed_backend(&broker, Channel::Shell, reply(&a, "ok")).await;

    let outcome_a = correlator.wait(&mut ticket_a).await.unwrap();
    let outcome_b = correlator.wait(&mut ticket_b).await.unwrap();

    // Each exchange saw exactly its own fragments, in arrival order,
    // partitioned by stream name
    assert_eq!(outcome_a.stdout, vec!["a1", "a3"]);
    assert_eq!(outcome_a.stderr, vec!["a2"]);
    assert!(outcome_a.return_value.is_none());

    assert_eq!(outcome_b.stdout, vec!["b1", "b2"]);
    assert!(outcome_b.stderr.is_empty());
    assert_eq!(outcome_b.return_value.as_deref(), Some("'b-value'"));

    broker.stop();
    let _ = tokio::time::timeout(Duration::from_millis(200), handle).await;
}

// ============================================================================
// Completion happens exactly once
// ============================================================================

#[tokio::test]
async fn completion_fires_once_and_late_traffic_passes_through() {
    let (broker, handle) = spawn_broker();
    let correlator = Arc::clone(broker.correlator());

    let mut ticket = correlator.begin("x = 1").await.unwrap();
    let token = ticket.token().to_string();

    feed_backend(&broker, Channel::IoPub, stream(&token, "stdout", "once")).await;
    feed_backend(&broker, Channel::Shell, reply(&token, "ok")).await;

    let outcome = correlator.wait(&mut ticket).await.unwrap();
    assert_eq!(outcome.stdout, vec!["once"]);
    assert_eq!(correlator.open_count(), 0);

    // Re-delivery after completion: nothing is consumed, nothing mutates.
    // The late messages are proxied to the front-end instead.
    feed_backend(&broker, Channel::IoPub, stream(&token, "stdout", "late")).await;
    feed_backend(&broker, Channel::Shell, reply(&token, "ok")).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let forwarded = drain_frontend(&broker).await;
    let types: Vec<&str> = forwarded.iter().map(|m| m.msg_type.as_str()).collect();
    assert!(types.contains(&"stream"));
    assert!(types.contains(&"execute_reply"));

    broker.stop();
    let _ = tokio::time::timeout(Duration::from_millis(200), handle).await;
}

// ============================================================================
// Internal exchange traffic never reaches the front-end
// ============================================================================

#[tokio::test]
async fn matched_exchange_traffic_is_consumed() {
    let (broker, handle) = spawn_broker();
    let correlator = Arc::clone(broker.correlator());

    let mut ticket = correlator.begin("internal()").await.unwrap();
    let token = ticket.token().to_string();

    feed_backend(&broker, Channel::IoPub, echo(&token, "internal()")).await;
    feed_backend(&broker, Channel::IoPub, stream(&token, "stdout", "secret")).await;
    feed_backend(&broker, Channel::IoPub, result(&token, "3")).await;
    feed_backend(&broker, Channel::Shell, reply(&token, "ok")).await;

    correlator.wait(&mut ticket).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // None of the matched messages were forwarded
    assert!(drain_frontend(&broker).await.is_empty());

    broker.stop();
    let _ = tokio::time::timeout(Duration::from_millis(200), handle).await;
}

// ============================================================================
// One-shot echo suppression (filter chain)
// ============================================================================

#[tokio::test]
async fn once_suppress_retires_after_first_invocation() {
    let (broker, handle) = spawn_broker();

    // No live exchange for these tokens, so only the chain touches them
    broker
        .filters()
        .register(Channel::IoPub, "execute_input", OnceSuppress::new("req-1"));

    feed_backend(&broker, Channel::IoPub, echo("req-1", "a()")).await;
    feed_backend(&broker, Channel::IoPub, echo("req-2", "b()")).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let forwarded = drain_frontend(&broker).await;
    // The matching echo was suppressed; the unrelated one passed untouched
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0].parent_id.as_deref(), Some("req-2"));

    broker.stop();
    let _ = tokio::time::timeout(Duration::from_millis(200), handle).await;
}

// ============================================================================
// Literal round-trip with structural decoding
// ============================================================================

#[tokio::test]
async fn literal_round_trip_decodes_structurally() {
    let (broker, handle) = spawn_broker();
    let correlator = Arc::clone(broker.correlator());

    // A fake kernel answering exactly one request
    let kernel_bus = broker.bus().clone();
    let kernel = tokio::spawn(async move {
        let request = kernel_bus.consume_backend().await.unwrap();
        assert_eq!(request.message.msg_type, "execute_request");
        let token = request.message.msg_id.clone();
        for (channel, message) in [
            (Channel::IoPub, echo(&token, "6 * 7")),
            (Channel::IoPub, result(&token, "42")),
            (Channel::Shell, reply(&token, "ok")),
        ] {
            kernel_bus
                .publish_inbound(BusEnvelope::from_backend(channel, message))
                .await
                .unwrap();
        }
    });

    let outcome = correlator.execute("6 * 7").await.unwrap();
    assert!(outcome.is_ok());
    assert_eq!(outcome.return_value.as_deref(), Some("42"));
    assert_eq!(outcome.decode_value(), Some(json!(42)));

    kernel.await.unwrap();
    broker.stop();
    let _ = tokio::time::timeout(Duration::from_millis(200), handle).await;
}

// ============================================================================
// Exchange error status is data, not an engine fault
// ============================================================================

#[tokio::test]
async fn exchange_error_status_lands_in_outcome() {
    let (broker, handle) = spawn_broker();
    let correlator = Arc::clone(broker.correlator());

    let mut ticket = correlator.begin("boom()").await.unwrap();
    let token = ticket.token().to_string();

    feed_backend(&broker, Channel::IoPub, stream(&token, "stderr", "Traceback ...")).await;
    feed_backend(&broker, Channel::Shell, reply(&token, "error")).await;

    let outcome = correlator.wait(&mut ticket).await.unwrap();
    assert!(!outcome.is_ok());
    assert_eq!(outcome.stderr_text(), "Traceback ...");

    broker.stop();
    let _ = tokio::time::timeout(Duration::from_millis(200), handle).await;
}

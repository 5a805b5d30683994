//! Pub/sub metrics for observability.
//!
//! Uses the global OpenTelemetry meter provider which must be initialized
//! by the host application. Without one, recording is a no-op.

use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

static METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    METER.get_or_init(|| opentelemetry::global::meter("waddle-pubsub"))
}

// ============================================================================
// Counters (Cumulative)
// ============================================================================

/// Counter for items published.
pub fn items_published() -> Counter<u64> {
    meter()
        .u64_counter("pubsub.items.published")
        .with_description("Total items published to leaf nodes")
        .with_unit("item")
        .build()
}

/// Counter for items removed by retraction, eviction or purge.
pub fn items_retracted() -> Counter<u64> {
    meter()
        .u64_counter("pubsub.items.retracted")
        .with_description("Total items removed from leaf nodes")
        .with_unit("item")
        .build()
}

/// Counter for notification stanzas handed to the transport.
pub fn notifications_sent() -> Counter<u64> {
    meter()
        .u64_counter("pubsub.notifications.sent")
        .with_description("Total event notifications sent to subscribers")
        .with_unit("message")
        .build()
}

/// Counter for listener callbacks that failed or panicked.
pub fn listener_failures() -> Counter<u64> {
    meter()
        .u64_counter("pubsub.listener.failures")
        .with_description("Total listener callbacks that failed")
        .with_unit("failure")
        .build()
}

/// Counter for storage writes that failed.
pub fn persistence_failures() -> Counter<u64> {
    meter()
        .u64_counter("pubsub.persistence.failures")
        .with_description("Total storage operations that failed")
        .with_unit("failure")
        .build()
}

// ============================================================================
// Gauges (Current State)
// ============================================================================

/// Gauge for hosted nodes.
pub fn nodes_hosted() -> Gauge<i64> {
    meter()
        .i64_gauge("pubsub.nodes.hosted")
        .with_description("Current number of nodes hosted by a service")
        .with_unit("node")
        .build()
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Record items published to a node.
pub fn record_items_published(count: usize) {
    items_published().add(count as u64, &[]);
}

/// Record items removed from a node.
pub fn record_items_retracted(count: usize, reason: &'static str) {
    items_retracted().add(count as u64, &[KeyValue::new("reason", reason)]);
}

/// Record notifications sent for one event.
pub fn record_notifications_sent(count: usize, event: &'static str) {
    notifications_sent().add(count as u64, &[KeyValue::new("event", event)]);
}

/// Record a failed listener callback.
pub fn record_listener_failure(callback: &'static str) {
    listener_failures().add(1, &[KeyValue::new("callback", callback)]);
}

/// Record a failed storage operation.
pub fn record_persistence_failure(operation: &'static str) {
    persistence_failures().add(1, &[KeyValue::new("operation", operation)]);
}

/// Update the hosted nodes gauge.
pub fn record_node_count(count: usize, service: &str) {
    nodes_hosted().record(count as i64, &[KeyValue::new("service", service.to_string())]);
}

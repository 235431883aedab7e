//! Metric instrument factories for kernel-worker.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without an OTLP endpoint the global provider is a no-op, so recording
//! is always safe.

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("kernel-worker")
}

/// Counter: claim attempts.
/// Labels: `result` ("claimed" | "lost" | "error").
pub fn claims() -> Counter<u64> {
    meter()
        .u64_counter("kernel.work.claims")
        .with_description("Assignment commits attempted by this worker")
        .build()
}

/// Counter: finished executions.
/// Labels: `status` ("success" | "failure").
pub fn executions() -> Counter<u64> {
    meter()
        .u64_counter("kernel.work.executions")
        .with_description("Work items executed to a terminal event")
        .build()
}

/// Counter: heartbeat commits.
/// Labels: `result` ("ok" | "rejected" | "error").
pub fn heartbeats() -> Counter<u64> {
    meter()
        .u64_counter("kernel.session.heartbeats")
        .with_description("Session heartbeat commits")
        .build()
}

/// Counter: log appends.
/// Labels: `event`, `result` ("accepted" | "rejected").
pub fn commits() -> Counter<u64> {
    meter()
        .u64_counter("kernel.store.commits")
        .with_description("Events appended to the notebook log")
        .build()
}

/// Histogram: execution duration in milliseconds.
pub fn execution_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("kernel.work.duration_ms")
        .with_description("Work item execution duration in milliseconds")
        .with_unit("ms")
        .build()
}

pub fn record_commit(event: &'static str, accepted: bool) {
    commits().add(
        1,
        &[
            KeyValue::new("event", event),
            KeyValue::new("result", if accepted { "accepted" } else { "rejected" }),
        ],
    );
}

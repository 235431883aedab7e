//! Integration tests for telemetry initialization and span helpers.

use kernel_worker::model::{CellId, SessionId, WorkId};
use kernel_worker::telemetry::{TelemetryConfig, init_telemetry, metrics, work};

#[test]
fn telemetry_initializes_without_endpoint() {
    // Only one global subscriber per process; a second init may fail.
    let config = TelemetryConfig {
        endpoint: None,
        service_name: "kernel-worker-test".to_string(),
        log_level: "debug".to_string(),
    };
    let _guard = init_telemetry(config);
}

#[test]
fn work_span_creates_and_records_transition() {
    let span = work::start_work_span(
        &WorkId::generate(),
        &CellId::generate(),
        &SessionId::for_runtime("test"),
    );
    work::record_state_transition(&span, "assigned", "running");
    work::record_state_transition(&span, "running", "completed");
}

#[test]
fn metrics_record_without_a_provider() {
    metrics::record_commit("work-assigned", true);
    metrics::record_commit("work-assigned", false);
    metrics::execution_duration_ms().record(12.0, &[]);
}

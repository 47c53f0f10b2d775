// ABOUTME: Prometheus metrics for connections, frame drops, admission, and pointer repair.
// ABOUTME: Thin recording helpers so call sites never spell metric names by hand.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub const WS_CONNECTIONS_TOTAL: &str = "parley_ws_connections_total";
pub const WS_ACTIVE_CONNECTIONS: &str = "parley_ws_active_connections";
pub const WS_REJECTED_TOTAL: &str = "parley_ws_rejected_total";
pub const FRAMES_DROPPED_TOTAL: &str = "parley_frames_dropped_total";
pub const COMMANDS_EXECUTED_TOTAL: &str = "parley_commands_executed_total";
pub const RUNTIME_EVENTS_PUSHED_TOTAL: &str = "parley_runtime_events_pushed_total";
pub const PUSH_DROPPED_TOTAL: &str = "parley_push_dropped_total";
pub const ADMISSION_DENIED_TOTAL: &str = "parley_admission_denied_total";
pub const POINTER_REPAIRS_TOTAL: &str = "parley_pointer_repairs_total";

/// Install the global Prometheus recorder and return the render handle.
///
/// Call once at startup. A second install fails because the recorder is global.
pub fn init_metrics() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;
    tracing::info!("Prometheus metrics recorder installed");
    Ok(handle)
}

pub fn record_connection_opened() {
    metrics::counter!(WS_CONNECTIONS_TOTAL).increment(1);
}

pub fn set_active_connections(count: usize) {
    metrics::gauge!(WS_ACTIVE_CONNECTIONS).set(count as f64);
}

pub fn record_connection_rejected(reason: &'static str) {
    metrics::counter!(WS_REJECTED_TOTAL, "reason" => reason).increment(1);
}

pub fn record_frame_dropped(reason: &'static str) {
    metrics::counter!(FRAMES_DROPPED_TOTAL, "reason" => reason).increment(1);
}

pub fn record_command_executed(outcome: &'static str) {
    metrics::counter!(COMMANDS_EXECUTED_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_runtime_event_pushed() {
    metrics::counter!(RUNTIME_EVENTS_PUSHED_TOTAL).increment(1);
}

pub fn record_push_dropped() {
    metrics::counter!(PUSH_DROPPED_TOTAL).increment(1);
}

pub fn record_admission_denied(scope: &'static str) {
    metrics::counter!(ADMISSION_DENIED_TOTAL, "scope" => scope).increment(1);
}

pub fn record_pointer_repair(source: &'static str) {
    metrics::counter!(POINTER_REPAIRS_TOTAL, "source" => source).increment(1);
}

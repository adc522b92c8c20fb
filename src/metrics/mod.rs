//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Submissions and pre-submission failures
//! - Lifecycle outcomes and resolution latency
//! - Late signals discarded after a lifecycle was decided
//! - Gas used by confirmed transactions

use crate::error::{OpsError, OpsResult};
use crate::lifecycle::Outcome;

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};
use std::path::Path;
use tracing::info;

lazy_static! {
    // Submission metrics
    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "registry_ops_transactions_submitted_total",
        "Total transactions handed to the network",
        &["operation"]
    ).unwrap();

    pub static ref TX_SUBMISSION_REJECTED: CounterVec = register_counter_vec!(
        "registry_ops_submissions_rejected_total",
        "Total calls refused by the client before reaching the network",
        &["operation"]
    ).unwrap();

    pub static ref PRECONDITION_FAILED: CounterVec = register_counter_vec!(
        "registry_ops_precondition_failures_total",
        "Total writes stopped by a failed precondition",
        &["operation"]
    ).unwrap();

    // Lifecycle metrics
    pub static ref LIFECYCLES: CounterVec = register_counter_vec!(
        "registry_ops_lifecycles_total",
        "Total resolved lifecycles by terminal status",
        &["operation", "status"]
    ).unwrap();

    pub static ref LATE_SIGNALS: CounterVec = register_counter_vec!(
        "registry_ops_late_signals_total",
        "Signals that arrived after their lifecycle was decided",
        &["operation", "signal"]
    ).unwrap();

    pub static ref LIFECYCLE_LATENCY: HistogramVec = register_histogram_vec!(
        "registry_ops_lifecycle_latency_seconds",
        "Time from submission to terminal outcome",
        &["operation"],
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    ).unwrap();

    // Gas metrics
    pub static ref GAS_USED: CounterVec = register_counter_vec!(
        "registry_ops_gas_used_total",
        "Gas used by confirmed transactions",
        &["operation"]
    ).unwrap();
}

// Helper functions to record metrics

pub fn record_submitted(operation: &str) {
    TX_SUBMITTED.with_label_values(&[operation]).inc();
}

pub fn record_submission_rejected(operation: &str) {
    TX_SUBMISSION_REJECTED.with_label_values(&[operation]).inc();
}

pub fn record_precondition_failed(operation: &str) {
    PRECONDITION_FAILED.with_label_values(&[operation]).inc();
}

pub fn record_late_signal(operation: &str, signal: &str) {
    LATE_SIGNALS.with_label_values(&[operation, signal]).inc();
}

pub fn record_outcome(outcome: &Outcome) {
    let operation = outcome.operation();
    LIFECYCLES
        .with_label_values(&[operation, outcome.status().as_str()])
        .inc();
    LIFECYCLE_LATENCY
        .with_label_values(&[operation])
        .observe(outcome.elapsed().as_secs_f64());

    if let Some(gas) = outcome.gas() {
        // saturates at u64::MAX
        let used = gas.gas_used.min(u64::MAX.into()).as_u64();
        GAS_USED.with_label_values(&[operation]).inc_by(used as f64);
    }
}

/// Current metrics in the text exposition format
pub fn render() -> OpsResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| OpsError::Internal(format!("Failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer).map_err(|e| OpsError::Internal(e.to_string()))
}

/// Write metrics for a node-exporter textfile collector.
///
/// The file is written next to its destination and renamed, so the
/// collector never reads a partial file.
pub fn write_textfile(path: &Path) -> OpsResult<()> {
    let body = render()?;
    let staging = path.with_extension("prom.tmp");

    std::fs::write(&staging, body)
        .and_then(|_| std::fs::rename(&staging, path))
        .map_err(|e| {
            OpsError::Internal(format!(
                "Failed to write metrics to {}: {}",
                path.display(),
                e
            ))
        })?;

    info!("Metrics written to {}", path.display());
    Ok(())
}

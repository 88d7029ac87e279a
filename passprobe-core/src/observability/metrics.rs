//! Run metrics.
//!
//! Metrics follow Prometheus naming conventions:
//! - `_total` suffix for counters
//! - `_seconds` suffix for histograms measuring duration
//!
//! Nothing installs an exporter by default; embedders that want the numbers
//! install a `metrics` recorder before the run.

use metrics::{counter, describe_counter, describe_histogram, histogram};

/// Register all metrics with descriptions.
pub fn register_metrics() {
    describe_counter!(
        "passprobe_attempts_total",
        "Total number of device test cycles (by outcome)"
    );
    describe_counter!(
        "passprobe_restore_failures_total",
        "Total number of devices that could not be returned to their original driver"
    );
    describe_counter!(
        "passprobe_devices_skipped_total",
        "Total number of candidate devices skipped (by reason)"
    );
    describe_histogram!(
        "passprobe_launch_duration_seconds",
        "Wall time of a test guest run (by launcher)"
    );
}

pub fn record_attempt(outcome: &str) {
    counter!("passprobe_attempts_total", "outcome" => outcome.to_string()).increment(1);
}

pub fn record_restore_failure(manual_recovery: bool) {
    counter!(
        "passprobe_restore_failures_total",
        "manual_recovery" => manual_recovery.to_string()
    )
    .increment(1);
}

pub fn record_skip(reason: &str) {
    counter!("passprobe_devices_skipped_total", "reason" => reason.to_string()).increment(1);
}

pub fn record_launch(duration_secs: f64, launcher: &str) {
    histogram!("passprobe_launch_duration_seconds", "launcher" => launcher.to_string())
        .record(duration_secs);
}

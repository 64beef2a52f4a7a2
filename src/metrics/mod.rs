//! Metrics module
//!
//! Prometheus counters and histograms for the request pipeline, permission
//! checks and dual-write workflows.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, HistogramVec,
};

lazy_static! {
    // Request pipeline metrics
    pub static ref REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "graphguard_requests_total",
        "Proxied requests by verb and decision",
        &["verb", "decision"]
    ).unwrap();

    // Permission check metrics
    pub static ref CHECKS_TOTAL: CounterVec = register_counter_vec!(
        "graphguard_permission_checks_total",
        "Permission checks by outcome",
        &["outcome"]
    ).unwrap();

    // Workflow metrics
    pub static ref WORKFLOW_RUNS_TOTAL: CounterVec = register_counter_vec!(
        "graphguard_workflow_runs_total",
        "Dual-write workflow runs by strategy and outcome",
        &["strategy", "outcome"]
    ).unwrap();

    pub static ref WORKFLOW_DURATION: HistogramVec = register_histogram_vec!(
        "graphguard_workflow_duration_seconds",
        "Dual-write workflow duration in seconds",
        &["strategy"],
        vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]
    ).unwrap();

    // Response filter metrics
    pub static ref FILTERED_OBJECTS: CounterVec = register_counter_vec!(
        "graphguard_filtered_objects_total",
        "Collection items admitted or dropped by the response filter",
        &["action"]
    ).unwrap();
}

/// Record a request decision: allowed, denied, bypassed or error.
pub fn record_request(verb: &str, decision: &str) {
    REQUESTS_TOTAL.with_label_values(&[verb, decision]).inc();
}

/// Record a permission check outcome.
pub fn record_check(outcome: &str) {
    CHECKS_TOTAL.with_label_values(&[outcome]).inc();
}

/// Record a workflow run.
pub fn record_workflow(strategy: &str, outcome: &str, duration_secs: f64) {
    WORKFLOW_RUNS_TOTAL
        .with_label_values(&[strategy, outcome])
        .inc();
    WORKFLOW_DURATION
        .with_label_values(&[strategy])
        .observe(duration_secs);
}

/// Record filtered collection items.
pub fn record_filtered(kept: usize, dropped: usize) {
    FILTERED_OBJECTS
        .with_label_values(&["kept"])
        .inc_by(kept as f64);
    FILTERED_OBJECTS
        .with_label_values(&["dropped"])
        .inc_by(dropped as f64);
}

//! Prometheus metrics for the ingest engine.
//!
//! Registered into the worker's registry through [`all_metrics`].

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts};

// =============================================================================
// Job lifecycle
// =============================================================================

/// Jobs submitted to the batch service, by action.
pub static JOBS_SUBMITTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("cellingest_jobs_submitted_total", "Total jobs submitted"),
        &["action"],
    )
    .unwrap()
});

/// Requests that reached a terminal outcome.
pub static JOBS_COMPLETED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("cellingest_jobs_completed_total", "Total requests finished"),
        &["action", "result"], // "succeeded", "retried", "failed", "abandoned"
    )
    .unwrap()
});

/// Escalated retries after an out-of-memory exit.
pub static JOB_RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("cellingest_job_retries_total", "Total escalated job retries"),
        &["action"],
    )
    .unwrap()
});

/// Wall-clock time between submission and completion.
pub static JOB_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new("cellingest_job_duration_seconds", "Duration of remote jobs").buckets(
            vec![
                60.0, 300.0, 600.0, 1800.0, 3600.0, 7200.0, 14400.0, 28800.0, 86400.0,
            ],
        ),
        &["action", "result"],
    )
    .unwrap()
});

/// Launches pushed back by the concurrency gate.
pub static ADMISSION_DEFERRALS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "cellingest_admission_deferrals_total",
        "Total launches deferred by the concurrency gate",
    )
    .unwrap()
});

/// Source uploads that failed and were retried or given up on.
pub static UPLOAD_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("cellingest_upload_failures_total", "Total failed source uploads").unwrap()
});

// =============================================================================
// Gateway
// =============================================================================

/// Batch API calls that returned an error after backoff.
pub static GATEWAY_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("cellingest_gateway_errors_total", "Total batch API errors"),
        &["operation"], // "submit", "status", "exit_code", ...
    )
    .unwrap()
});

// =============================================================================
// Scheduler
// =============================================================================

/// Steps executed by the scheduler, by step and outcome.
pub static STEPS_EXECUTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("cellingest_steps_executed_total", "Total scheduler steps run"),
        &["step", "outcome"], // outcome: "rescheduled", "finished", "error"
    )
    .unwrap()
});

/// Get all core metrics for registration in a registry.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        Box::new(JOBS_SUBMITTED.clone()),
        Box::new(JOBS_COMPLETED.clone()),
        Box::new(JOB_RETRIES.clone()),
        Box::new(JOB_DURATION.clone()),
        Box::new(ADMISSION_DEFERRALS.clone()),
        Box::new(UPLOAD_FAILURES.clone()),
        Box::new(GATEWAY_ERRORS.clone()),
        Box::new(STEPS_EXECUTED.clone()),
    ]
}

//! Orchestrator and admission gate configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the ingest orchestrator and its scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Enable/disable the scheduler loop.
    /// When disabled, requests are persisted but no step runs.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Delay between status checks of a running job (milliseconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// How often the scheduler looks for due steps (milliseconds).
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Maximum steps claimed per tick.
    #[serde(default = "default_max_steps")]
    pub max_steps_per_tick: usize,

    /// Upload attempts before the request fails.
    #[serde(default = "default_upload_attempts")]
    pub max_upload_attempts: u32,

    /// Upload retry n waits `n * upload_retry_base_ms`.
    #[serde(default = "default_upload_retry_base")]
    pub upload_retry_base_ms: u64,

    /// Delay before re-running a step that hit an internal error (milliseconds).
    #[serde(default = "default_step_error_backoff")]
    pub step_error_backoff_ms: u64,

    /// Exit codes that signal the job ran out of memory.
    #[serde(default = "default_retryable_exit_codes")]
    pub retryable_exit_codes: Vec<i32>,

    /// Upper bound on attempts for one file/action across escalations.
    #[serde(default = "default_max_job_attempts")]
    pub max_job_attempts: u32,

    /// Clusters with more points than this are subsampled.
    #[serde(default = "default_subsample_threshold")]
    pub subsample_threshold: u64,

    /// Group annotations with more distinct values are skipped for DE.
    #[serde(default = "default_max_de_groups")]
    pub max_de_groups: usize,
}

fn default_enabled() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    60_000 // 1 minute
}

fn default_tick_interval() -> u64 {
    1_000
}

fn default_max_steps() -> usize {
    50
}

fn default_upload_attempts() -> u32 {
    3
}

fn default_upload_retry_base() -> u64 {
    30_000
}

fn default_step_error_backoff() -> u64 {
    60_000
}

fn default_retryable_exit_codes() -> Vec<i32> {
    vec![137, 139]
}

fn default_max_job_attempts() -> u32 {
    5
}

fn default_subsample_threshold() -> u64 {
    1_000
}

fn default_max_de_groups() -> usize {
    200
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            poll_interval_ms: default_poll_interval(),
            tick_interval_ms: default_tick_interval(),
            max_steps_per_tick: default_max_steps(),
            max_upload_attempts: default_upload_attempts(),
            upload_retry_base_ms: default_upload_retry_base(),
            step_error_backoff_ms: default_step_error_backoff(),
            retryable_exit_codes: default_retryable_exit_codes(),
            max_job_attempts: default_max_job_attempts(),
            subsample_threshold: default_subsample_threshold(),
            max_de_groups: default_max_de_groups(),
        }
    }
}

impl OrchestratorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Wait before upload retry number `attempt` (1-based).
    pub fn upload_retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.upload_retry_base_ms.saturating_mul(attempt as u64))
    }

    pub fn step_error_backoff(&self) -> Duration {
        Duration::from_millis(self.step_error_backoff_ms)
    }
}

/// Admission control for concurrent expression ingests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Earlier matrices older than this no longer block (hours).
    #[serde(default = "default_freshness_window")]
    pub freshness_window_hours: u64,

    /// How long a denied request waits before trying again (milliseconds).
    #[serde(default = "default_requeue_delay")]
    pub requeue_delay_ms: u64,
}

/// Largest accepted window, one century.
const MAX_WINDOW_HOURS: u64 = 876_000;

fn default_freshness_window() -> u64 {
    24
}

fn default_requeue_delay() -> u64 {
    120_000 // 2 minutes
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            freshness_window_hours: default_freshness_window(),
            requeue_delay_ms: default_requeue_delay(),
        }
    }
}

impl GateConfig {
    pub fn freshness_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.freshness_window_hours.min(MAX_WINDOW_HOURS) as i64)
    }

    pub fn requeue_delay(&self) -> Duration {
        Duration::from_millis(self.requeue_delay_ms)
    }
}

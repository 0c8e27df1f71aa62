use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sizing::MachineSpec;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    /// Transport kept failing after every retry.
    #[error("Batch API unavailable after {attempts} attempts: {last_error}")]
    Unavailable { attempts: u32, last_error: String },

    /// A single transport failure (network, timeout, auth, 5xx).
    #[error("Batch API transport error: {0}")]
    Transport(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    /// The API refused the request and retrying will not help.
    #[error("Batch API rejected request: {0}")]
    Rejected(String),

    #[error("Invalid response from batch API: {0}")]
    InvalidResponse(String),
}

impl GatewayError {
    /// Transport-level failures worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transport(_))
    }
}

/// Opaque reference to a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobHandle(String);

impl JobHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything needed to launch one container job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub command: Vec<String>,
    pub image: String,
    pub resources: MachineSpec,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

impl JobSpec {
    /// Command line as a single shell-style string, for reports.
    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }
}

/// Remote job state collapsed to what the orchestrator branches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteJobState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl RemoteJobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RemoteJobState::Succeeded | RemoteJobState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteJobState::Queued => "queued",
            RemoteJobState::Running => "running",
            RemoteJobState::Succeeded => "succeeded",
            RemoteJobState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub state: RemoteJobState,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Resources a job ran with, for analytics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub machine_type: String,
    pub cpu_milli: u64,
    pub memory_mib: u64,
    pub boot_disk_gib: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub handle: JobHandle,
    pub state: RemoteJobState,
    pub labels: BTreeMap<String, String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Label filter for listing jobs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFilter {
    pub labels: BTreeMap<String, String>,
    pub limit: Option<u32>,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.labels
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
    }
}

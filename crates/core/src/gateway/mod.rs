//! Remote batch-compute collaborator.
//!
//! The orchestrator submits container jobs through [`JobSubmissionGateway`]
//! and polls them with single non-blocking status queries.

mod backoff;
mod batch;
mod types;

pub use backoff::{backoff_delay, with_backoff};
pub use batch::BatchApiGateway;
pub use types::*;

use async_trait::async_trait;

/// Remote batch-compute platform.
#[async_trait]
pub trait JobSubmissionGateway: Send + Sync {
    /// Submit a job. Safe to retry on transport failure.
    async fn submit(&self, spec: &JobSpec) -> Result<JobHandle, GatewayError>;

    async fn status(&self, handle: &JobHandle) -> Result<JobStatus, GatewayError>;

    /// Exit code of the job's task, once terminal.
    async fn exit_code(&self, handle: &JobHandle) -> Result<Option<i32>, GatewayError>;

    /// Failure-related events in chronological order.
    async fn error_events(&self, handle: &JobHandle) -> Result<Vec<ErrorEvent>, GatewayError>;

    async fn resource_usage(&self, handle: &JobHandle) -> Result<ResourceUsage, GatewayError>;

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobSummary>, GatewayError>;
}

//! Mock batch gateway for testing.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::gateway::{
    ErrorEvent, GatewayError, JobFilter, JobHandle, JobSpec, JobStatus, JobSubmissionGateway,
    JobSummary, RemoteJobState, ResourceUsage,
};

/// A recorded submission for test assertions.
#[derive(Debug, Clone)]
pub struct RecordedSubmission {
    pub handle: JobHandle,
    pub spec: JobSpec,
}

#[derive(Debug, Clone)]
struct MockJob {
    spec: JobSpec,
    state: RemoteJobState,
    exit_code: Option<i32>,
    events: Vec<ErrorEvent>,
}

/// Mock implementation of [`JobSubmissionGateway`].
///
/// Jobs start `Queued`. Tests move them with [`MockGateway::set_state`],
/// [`MockGateway::succeed`] and [`MockGateway::fail`].
///
/// ```rust,ignore
/// let gateway = MockGateway::new();
/// // ... orchestrator submits ...
/// let handle = gateway.last_handle().await.unwrap();
/// gateway.fail(&handle, Some(137)).await;
/// ```
#[derive(Debug, Default)]
pub struct MockGateway {
    submissions: Arc<RwLock<Vec<RecordedSubmission>>>,
    jobs: Arc<RwLock<HashMap<JobHandle, MockJob>>>,
    /// If set, the next submit fails with this error.
    next_submit_error: Arc<RwLock<Option<GatewayError>>>,
    /// If set, the next status call fails with this error.
    next_status_error: Arc<RwLock<Option<GatewayError>>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn submissions(&self) -> Vec<RecordedSubmission> {
        self.submissions.read().await.clone()
    }

    pub async fn submission_count(&self) -> usize {
        self.submissions.read().await.len()
    }

    pub async fn last_handle(&self) -> Option<JobHandle> {
        self.submissions
            .read()
            .await
            .last()
            .map(|s| s.handle.clone())
    }

    pub async fn set_state(&self, handle: &JobHandle, state: RemoteJobState) {
        if let Some(job) = self.jobs.write().await.get_mut(handle) {
            job.state = state;
        }
    }

    pub async fn succeed(&self, handle: &JobHandle) {
        if let Some(job) = self.jobs.write().await.get_mut(handle) {
            job.state = RemoteJobState::Succeeded;
            job.exit_code = Some(0);
        }
    }

    /// Fail the job with `exit_code` and a matching event.
    pub async fn fail(&self, handle: &JobHandle, exit_code: Option<i32>) {
        if let Some(job) = self.jobs.write().await.get_mut(handle) {
            job.state = RemoteJobState::Failed;
            job.exit_code = exit_code;
            let message = match exit_code {
                Some(code) => format!("Task failed with exit code {}", code),
                None => "Task failed".to_string(),
            };
            job.events.push(ErrorEvent {
                timestamp: Utc::now(),
                message,
            });
        }
    }

    pub async fn fail_next_submit(&self, error: GatewayError) {
        *self.next_submit_error.write().await = Some(error);
    }

    pub async fn fail_next_status(&self, error: GatewayError) {
        *self.next_status_error.write().await = Some(error);
    }

    async fn job(&self, handle: &JobHandle) -> Result<MockJob, GatewayError> {
        self.jobs
            .read()
            .await
            .get(handle)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(handle.to_string()))
    }
}

#[async_trait]
impl JobSubmissionGateway for MockGateway {
    async fn submit(&self, spec: &JobSpec) -> Result<JobHandle, GatewayError> {
        if let Some(error) = self.next_submit_error.write().await.take() {
            return Err(error);
        }

        let mut submissions = self.submissions.write().await;
        let handle = JobHandle::new(format!("mock-job-{}", submissions.len() + 1));
        submissions.push(RecordedSubmission {
            handle: handle.clone(),
            spec: spec.clone(),
        });
        self.jobs.write().await.insert(
            handle.clone(),
            MockJob {
                spec: spec.clone(),
                state: RemoteJobState::Queued,
                exit_code: None,
                events: Vec::new(),
            },
        );
        Ok(handle)
    }

    async fn status(&self, handle: &JobHandle) -> Result<JobStatus, GatewayError> {
        if let Some(error) = self.next_status_error.write().await.take() {
            return Err(error);
        }
        let job = self.job(handle).await?;
        Ok(JobStatus {
            state: job.state,
            updated_at: Some(Utc::now()),
        })
    }

    async fn exit_code(&self, handle: &JobHandle) -> Result<Option<i32>, GatewayError> {
        Ok(self.job(handle).await?.exit_code)
    }

    async fn error_events(&self, handle: &JobHandle) -> Result<Vec<ErrorEvent>, GatewayError> {
        Ok(self.job(handle).await?.events)
    }

    async fn resource_usage(&self, handle: &JobHandle) -> Result<ResourceUsage, GatewayError> {
        let resources = self.job(handle).await?.spec.resources;
        Ok(ResourceUsage {
            machine_type: resources.machine_type,
            cpu_milli: resources.core_count as u64 * 1000,
            memory_mib: resources.memory_gib as u64 * 1024,
            boot_disk_gib: 300,
        })
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobSummary>, GatewayError> {
        let jobs = self.jobs.read().await;
        let mut summaries: Vec<JobSummary> = jobs
            .iter()
            .filter(|(_, job)| {
                filter
                    .labels
                    .iter()
                    .all(|(k, v)| job.spec.labels.get(k) == Some(v))
            })
            .map(|(handle, job)| JobSummary {
                handle: handle.clone(),
                state: job.state,
                labels: job.spec.labels.clone(),
                created_at: None,
            })
            .collect();
        summaries.sort_by(|a, b| a.handle.as_str().cmp(b.handle.as_str()));
        if let Some(limit) = filter.limit {
            summaries.truncate(limit as usize);
        }
        Ok(summaries)
    }
}

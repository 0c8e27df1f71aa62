//! Cloud batch API gateway.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex_lite::Regex;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};
use uuid::Uuid;

use super::backoff::with_backoff;
use super::{
    ErrorEvent, GatewayError, JobFilter, JobHandle, JobSpec, JobStatus, JobSubmissionGateway,
    JobSummary, RemoteJobState, ResourceUsage,
};
use crate::config::BatchConfig;

static EXIT_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"exit code (\d+)").expect("valid exit code regex"));

/// Gateway backed by a cloud batch REST API.
pub struct BatchApiGateway {
    client: Client,
    config: BatchConfig,
}

impl BatchApiGateway {
    pub fn new(config: BatchConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs as u64))
            .build()
            .map_err(|e| GatewayError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    fn jobs_url(&self) -> String {
        format!(
            "{}/v1/projects/{}/locations/{}/jobs",
            self.config.api_url.trim_end_matches('/'),
            self.config.project_id,
            self.config.region
        )
    }

    fn job_url(&self, handle: &JobHandle) -> String {
        format!(
            "{}/v1/{}",
            self.config.api_url.trim_end_matches('/'),
            handle.as_str()
        )
    }

    fn job_name(&self, job_id: &str) -> String {
        format!(
            "projects/{}/locations/{}/jobs/{}",
            self.config.project_id, self.config.region, job_id
        )
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        if self.config.api_token.is_empty() {
            request
        } else {
            request.bearer_auth(&self.config.api_token)
        }
    }

    /// Build the create-job body for a spec.
    fn job_body(&self, spec: &JobSpec) -> Value {
        json!({
            "taskGroups": [{
                "taskCount": 1,
                "taskSpec": {
                    "runnables": [{
                        "container": {
                            "imageUri": spec.image,
                            "commands": spec.command,
                        },
                        "environment": { "variables": spec.env },
                    }],
                    "computeResource": {
                        "cpuMilli": spec.resources.core_count as u64 * 1000,
                        "memoryMib": spec.resources.memory_gib as u64 * 1024,
                        "bootDiskMib": self.config.boot_disk_gb as u64 * 1024,
                    },
                    "maxRetryCount": 0,
                },
            }],
            "allocationPolicy": {
                "instances": [{
                    "policy": {
                        "machineType": spec.resources.machine_type,
                        "bootDisk": { "sizeGb": self.config.boot_disk_gb },
                    },
                }],
            },
            "labels": spec.labels,
            "logsPolicy": { "destination": "CLOUD_LOGGING" },
        })
    }

    async fn fetch_job(&self, handle: &JobHandle) -> Result<BatchJob, GatewayError> {
        let url = self.job_url(handle);
        let url = url.as_str();
        with_backoff(&self.config.retry, "get_job", || async move {
            let response = self
                .authorize(self.client.get(url))
                .send()
                .await
                .map_err(transport_error)?;
            let response = check_status(response, handle.as_str()).await?;
            response
                .json::<BatchJob>()
                .await
                .map_err(|e| GatewayError::InvalidResponse(e.to_string()))
        })
        .await
    }
}

fn transport_error(e: reqwest::Error) -> GatewayError {
    GatewayError::Transport(e.to_string())
}

/// Map non-success HTTP statuses onto gateway errors.
async fn check_status(
    response: reqwest::Response,
    subject: &str,
) -> Result<reqwest::Response, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let detail = format!(
        "HTTP {}: {}",
        status,
        body.chars().take(200).collect::<String>()
    );

    Err(match status {
        StatusCode::NOT_FOUND => GatewayError::NotFound(subject.to_string()),
        StatusCode::CONFLICT => GatewayError::Rejected(detail),
        s if s.is_server_error()
            || s == StatusCode::TOO_MANY_REQUESTS
            || s == StatusCode::REQUEST_TIMEOUT
            || s == StatusCode::UNAUTHORIZED
            || s == StatusCode::FORBIDDEN =>
        {
            GatewayError::Transport(detail)
        }
        _ => GatewayError::Rejected(detail),
    })
}

fn map_state(state: &str) -> Result<RemoteJobState, GatewayError> {
    match state {
        "" | "STATE_UNSPECIFIED" | "QUEUED" | "SCHEDULED" => Ok(RemoteJobState::Queued),
        "RUNNING" => Ok(RemoteJobState::Running),
        "SUCCEEDED" => Ok(RemoteJobState::Succeeded),
        "FAILED" | "DELETION_IN_PROGRESS" => Ok(RemoteJobState::Failed),
        other => Err(GatewayError::InvalidResponse(format!(
            "unknown job state: {}",
            other
        ))),
    }
}

/// Last exit code reported by the job's events.
fn parse_exit_code(events: &[StatusEvent]) -> Option<i32> {
    events.iter().rev().find_map(|event| {
        event
            .task_execution
            .as_ref()
            .and_then(|t| t.exit_code)
            .or_else(|| {
                EXIT_CODE
                    .captures(&event.description)
                    .and_then(|caps| caps[1].parse().ok())
            })
    })
}

fn is_error_event(event: &StatusEvent) -> bool {
    let description = event.description.to_lowercase();
    event.event_type.contains("FAILED")
        || description.contains("fail")
        || description.contains("error")
        || event
            .task_execution
            .as_ref()
            .and_then(|t| t.exit_code)
            .is_some_and(|code| code != 0)
}

fn value_as_u64(value: Option<&Value>) -> u64 {
    match value {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

fn label_filter(filter: &JobFilter) -> String {
    filter
        .labels
        .iter()
        .map(|(k, v)| format!("labels.{}=\"{}\"", k, v))
        .collect::<Vec<_>>()
        .join(" AND ")
}

#[async_trait]
impl JobSubmissionGateway for BatchApiGateway {
    async fn submit(&self, spec: &JobSpec) -> Result<JobHandle, GatewayError> {
        // One id for every attempt so a retried create cannot launch twice
        let job_id = format!("cellingest-{}", Uuid::new_v4().simple());
        let url = format!("{}?job_id={}", self.jobs_url(), urlencoding::encode(&job_id));
        let body = self.job_body(spec);
        let expected = JobHandle::new(self.job_name(&job_id));
        let (url, body, expected, job_id) = (url.as_str(), &body, &expected, job_id.as_str());

        let handle = with_backoff(&self.config.retry, "submit", || async move {
            let response = self
                .authorize(self.client.post(url))
                .json(body)
                .send()
                .await
                .map_err(transport_error)?;

            if response.status() == StatusCode::CONFLICT {
                // Created by an earlier attempt whose response was lost
                return Ok(expected.clone());
            }

            let response = check_status(response, job_id).await?;
            let job: BatchJob = response
                .json()
                .await
                .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
            Ok(JobHandle::new(job.name))
        })
        .await?;

        info!(
            job = %handle,
            machine_type = %spec.resources.machine_type,
            "Submitted batch job"
        );
        Ok(handle)
    }

    async fn status(&self, handle: &JobHandle) -> Result<JobStatus, GatewayError> {
        let job = self.fetch_job(handle).await?;
        let state = map_state(&job.status.state)?;
        let updated_at = job
            .status
            .status_events
            .iter()
            .filter_map(|e| e.event_time)
            .max();
        debug!(job = %handle, state = state.as_str(), "Fetched job status");

        Ok(JobStatus { state, updated_at })
    }

    async fn exit_code(&self, handle: &JobHandle) -> Result<Option<i32>, GatewayError> {
        let job = self.fetch_job(handle).await?;
        Ok(parse_exit_code(&job.status.status_events))
    }

    async fn error_events(&self, handle: &JobHandle) -> Result<Vec<ErrorEvent>, GatewayError> {
        let job = self.fetch_job(handle).await?;
        let fallback = job.create_time.unwrap_or_else(Utc::now);

        let mut events: Vec<ErrorEvent> = job
            .status
            .status_events
            .iter()
            .filter(|e| is_error_event(e))
            .map(|e| ErrorEvent {
                timestamp: e.event_time.unwrap_or(fallback),
                message: e.description.clone(),
            })
            .collect();
        events.sort_by_key(|e| e.timestamp);

        Ok(events)
    }

    async fn resource_usage(&self, handle: &JobHandle) -> Result<ResourceUsage, GatewayError> {
        let job = self.fetch_job(handle).await?;

        let policy = job
            .allocation_policy
            .as_ref()
            .and_then(|a| a.instances.first())
            .and_then(|i| i.policy.as_ref());
        let compute = job
            .task_groups
            .first()
            .and_then(|g| g.task_spec.as_ref())
            .and_then(|t| t.compute_resource.as_ref());

        Ok(ResourceUsage {
            machine_type: policy
                .and_then(|p| p.machine_type.clone())
                .unwrap_or_default(),
            cpu_milli: value_as_u64(compute.and_then(|c| c.cpu_milli.as_ref())),
            memory_mib: value_as_u64(compute.and_then(|c| c.memory_mib.as_ref())),
            boot_disk_gib: value_as_u64(
                policy
                    .and_then(|p| p.boot_disk.as_ref())
                    .and_then(|d| d.size_gb.as_ref()),
            ),
        })
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobSummary>, GatewayError> {
        let limit = filter.limit.unwrap_or(100) as usize;
        let mut jobs = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = format!("{}?pageSize={}", self.jobs_url(), limit.min(100));
            let expr = label_filter(filter);
            if !expr.is_empty() {
                url.push_str(&format!("&filter={}", urlencoding::encode(&expr)));
            }
            if let Some(token) = &page_token {
                url.push_str(&format!("&pageToken={}", urlencoding::encode(token)));
            }

            let url = url.as_str();
            let page: ListJobsResponse = with_backoff(&self.config.retry, "list_jobs", || async move {
                let response = self
                    .authorize(self.client.get(url))
                    .send()
                    .await
                    .map_err(transport_error)?;
                let response = check_status(response, "jobs").await?;
                response
                    .json()
                    .await
                    .map_err(|e| GatewayError::InvalidResponse(e.to_string()))
            })
            .await?;

            for job in page.jobs {
                jobs.push(JobSummary {
                    state: map_state(&job.status.state)?,
                    handle: JobHandle::new(job.name),
                    labels: job.labels,
                    created_at: job.create_time,
                });
                if jobs.len() >= limit {
                    return Ok(jobs);
                }
            }

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => return Ok(jobs),
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchJob {
    name: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    status: BatchJobStatus,
    create_time: Option<DateTime<Utc>>,
    allocation_policy: Option<AllocationPolicy>,
    #[serde(default)]
    task_groups: Vec<TaskGroup>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchJobStatus {
    #[serde(default)]
    state: String,
    #[serde(default)]
    status_events: Vec<StatusEvent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusEvent {
    #[serde(rename = "type", default)]
    event_type: String,
    #[serde(default)]
    description: String,
    event_time: Option<DateTime<Utc>>,
    task_execution: Option<TaskExecution>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskExecution {
    exit_code: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct AllocationPolicy {
    #[serde(default)]
    instances: Vec<InstancePolicyOrTemplate>,
}

#[derive(Debug, Deserialize)]
struct InstancePolicyOrTemplate {
    policy: Option<InstancePolicy>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstancePolicy {
    machine_type: Option<String>,
    boot_disk: Option<Disk>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Disk {
    size_gb: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskGroup {
    task_spec: Option<TaskSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskSpec {
    compute_resource: Option<ComputeResource>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ComputeResource {
    cpu_milli: Option<Value>,
    memory_mib: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListJobsResponse {
    #[serde(default)]
    jobs: Vec<BatchJob>,
    next_page_token: Option<String>,
}

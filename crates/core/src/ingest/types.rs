//! Ingest request, job run and step outcome types.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::ParameterSet;
use crate::gateway::JobHandle;
use crate::records::{FileKind, OutputTarget, RecordError};

/// Closed set of remote job actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    IngestExpression,
    IngestCluster,
    IngestCellMetadata,
    #[serde(rename = "ingest_anndata")]
    IngestAnnData,
    IngestDifferentialExpression,
    IngestSubsample,
    DifferentialExpression,
    RenderExpressionArrays,
    ImagePipeline,
}

impl Action {
    pub const ALL: [Action; 9] = [
        Action::IngestExpression,
        Action::IngestCluster,
        Action::IngestCellMetadata,
        Action::IngestAnnData,
        Action::IngestDifferentialExpression,
        Action::IngestSubsample,
        Action::DifferentialExpression,
        Action::RenderExpressionArrays,
        Action::ImagePipeline,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::IngestExpression => "ingest_expression",
            Action::IngestCluster => "ingest_cluster",
            Action::IngestCellMetadata => "ingest_cell_metadata",
            Action::IngestAnnData => "ingest_anndata",
            Action::IngestDifferentialExpression => "ingest_differential_expression",
            Action::IngestSubsample => "ingest_subsample",
            Action::DifferentialExpression => "differential_expression",
            Action::RenderExpressionArrays => "render_expression_arrays",
            Action::ImagePipeline => "image_pipeline",
        }
    }

    /// Actions that write no primary records and report to admins.
    pub fn is_special(&self) -> bool {
        matches!(
            self,
            Action::DifferentialExpression | Action::RenderExpressionArrays | Action::ImagePipeline
        )
    }

    /// Actions that read an already-ingested file. Their failure never
    /// removes the source from storage.
    pub fn is_derived(&self) -> bool {
        self.is_special() || *self == Action::IngestSubsample
    }

    /// File kinds whose parse status this action owns.
    pub fn primary_kinds(&self) -> &'static [FileKind] {
        match self {
            Action::IngestExpression => &[FileKind::ExpressionMatrix, FileKind::MmCoordinateMatrix],
            Action::IngestCluster => &[FileKind::Cluster],
            Action::IngestCellMetadata => &[FileKind::Metadata],
            Action::IngestAnnData => &[FileKind::AnnData],
            Action::IngestDifferentialExpression => &[FileKind::DifferentialExpression],
            Action::IngestSubsample
            | Action::DifferentialExpression
            | Action::RenderExpressionArrays
            | Action::ImagePipeline => &[],
        }
    }

    /// Whether a request for this action on a file of `kind` is the
    /// authoritative ingest of that file.
    pub fn owns_source(&self, kind: FileKind) -> bool {
        self.primary_kinds().contains(&kind)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Action::ALL
            .iter()
            .copied()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| format!("unknown action: {}", s))
    }
}

/// Immutable description of one launch attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestRequest {
    pub id: String,
    pub study_id: String,
    pub file_id: String,
    /// Email of the user the request acts for.
    pub user_email: String,
    pub params: ParameterSet,
    /// Discard prior output before running.
    pub reparse: bool,
    /// Keep the source object in storage when the job fails.
    pub persist_on_fail: bool,
    /// 1-based attempt number across retries.
    pub attempt: u32,
    pub previous_attempt: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl IngestRequest {
    pub fn new(
        study_id: impl Into<String>,
        file_id: impl Into<String>,
        user_email: impl Into<String>,
        params: ParameterSet,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            study_id: study_id.into(),
            file_id: file_id.into(),
            user_email: user_email.into(),
            params,
            reparse: false,
            persist_on_fail: false,
            attempt: 1,
            previous_attempt: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_reparse(mut self, reparse: bool) -> Self {
        self.reparse = reparse;
        self
    }

    pub fn with_persist_on_fail(mut self, persist: bool) -> Self {
        self.persist_on_fail = persist;
        self
    }

    pub fn action(&self) -> Action {
        self.params.action()
    }

    pub fn machine_type(&self) -> &str {
        self.params.machine_type()
    }

    /// Next attempt of this request on escalated parameters.
    pub fn retry_with(&self, params: ParameterSet) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            study_id: self.study_id.clone(),
            file_id: self.file_id.clone(),
            user_email: self.user_email.clone(),
            params,
            reparse: false,
            persist_on_fail: self.persist_on_fail,
            attempt: self.attempt + 1,
            previous_attempt: Some(self.id.clone()),
            created_at: Utc::now(),
        }
    }

    /// Records this request writes.
    pub fn output_target(&self) -> OutputTarget {
        OutputTarget {
            file_id: self.file_id.clone(),
            action: self.action(),
            name: self.params.params().output_name().map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Created,
    Uploading,
    Submitted,
    Polling,
    Succeeded,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Created => "created",
            RunState::Uploading => "uploading",
            RunState::Submitted => "submitted",
            RunState::Polling => "polling",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed)
    }

    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (Created, Uploading) => true,
            (Uploading, Uploading | Submitted) => true,
            (Submitted, Polling) => true,
            (Polling, Polling | Succeeded) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// Source never reached storage.
    Upload,
    /// Parameters were invalid or the gateway could not be reached.
    Submission,
    /// The remote job finished unsuccessfully.
    Job { exit_code: Option<i32> },
    /// The remote job reported failure with a zero exit code.
    Inconsistent,
    /// The owning file went away while the job was in flight.
    Abandoned,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Upload => "upload",
            FailureKind::Submission => "submission",
            FailureKind::Job { .. } => "job",
            FailureKind::Inconsistent => "inconsistent",
            FailureKind::Abandoned => "abandoned",
        }
    }
}

/// Mutable record of one remote submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    pub request_id: String,
    pub state: RunState,
    pub job_handle: Option<JobHandle>,
    pub machine_type: String,
    pub attempt: u32,
    /// Failed upload attempts so far.
    pub upload_attempts: u32,
    pub exit_code: Option<i32>,
    pub failure: Option<FailureKind>,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRun {
    pub fn new(request: &IngestRequest) -> Self {
        Self {
            request_id: request.id.clone(),
            state: RunState::Created,
            job_handle: None,
            machine_type: request.machine_type().to_string(),
            attempt: request.attempt,
            upload_attempts: 0,
            exit_code: None,
            failure: None,
            created_at: Utc::now(),
            submitted_at: None,
            finished_at: None,
        }
    }

    pub fn advance(&mut self, next: RunState) -> Result<(), OrchestratorError> {
        if !self.state.can_transition_to(next) {
            return Err(OrchestratorError::InvalidTransition {
                request_id: self.request_id.clone(),
                from: self.state,
                to: next,
            });
        }
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        self.state = next;
        Ok(())
    }

    /// Fail the run from any non-terminal state.
    pub fn fail(&mut self, kind: FailureKind) -> Result<(), OrchestratorError> {
        self.advance(RunState::Failed)?;
        self.failure = Some(kind);
        Ok(())
    }

    /// Wall-clock time between submission and completion.
    pub fn runtime_ms(&self) -> u64 {
        match (self.submitted_at, self.finished_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as u64,
            _ => 0,
        }
    }
}

/// One independently schedulable piece of a request's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// Upload, admission and submission.
    Launch,
    /// One status query.
    Poll,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Launch => "launch",
            Step::Poll => "poll",
        }
    }
}

impl FromStr for Step {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "launch" => Ok(Step::Launch),
            "poll" => Ok(Step::Poll),
            other => Err(format!("unknown step: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RescheduleReason {
    UploadRetry { attempt: u32 },
    AdmissionDeferred,
    AwaitingCompletion,
    StatusUnavailable,
}

/// How a request ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Succeeded { chained: Vec<IngestRequest> },
    Retried { next: IngestRequest },
    Failed { kind: FailureKind },
    Abandoned,
}

impl Completion {
    /// Requests to launch because of this completion.
    pub fn into_follow_ups(self) -> Vec<IngestRequest> {
        match self {
            Completion::Succeeded { chained } => chained,
            Completion::Retried { next } => vec![next],
            Completion::Failed { .. } | Completion::Abandoned => Vec::new(),
        }
    }
}

/// Result of running one step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Run `step` again after `after`.
    Reschedule {
        step: Step,
        after: Duration,
        reason: RescheduleReason,
    },
    Finished(Completion),
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Invalid transition for request {request_id}: {from} -> {to}")]
    InvalidTransition {
        request_id: String,
        from: RunState,
        to: RunState,
    },

    #[error("Request {0} has no job handle to poll")]
    MissingHandle(String),

    #[error("Record store error: {0}")]
    Record(#[from] RecordError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::params::{ClusterParams, JobParams};
    use crate::sizing::MachineCatalog;

    fn request() -> IngestRequest {
        let params = ParameterSet::new(
            JobParams::IngestCluster(ClusterParams {
                cluster_file: "gs://fc-1234/cluster.txt".to_string(),
                name: "UMAP".to_string(),
                machine_type: "n2d-highmem-4".to_string(),
            }),
            &MachineCatalog::full(),
        )
        .unwrap();
        IngestRequest::new("study-1", "file-1", "user@example.org", params)
    }

    #[test]
    fn test_action_round_trip() {
        for action in Action::ALL {
            assert_eq!(action.as_str().parse::<Action>().unwrap(), action);
            let json = serde_json::to_string(&action).unwrap();
            assert_eq!(json, format!("\"{}\"", action.as_str()));
        }
    }

    #[test]
    fn test_special_and_derived() {
        let special: Vec<_> = Action::ALL.iter().filter(|a| a.is_special()).collect();
        assert_eq!(
            special,
            vec![
                &Action::DifferentialExpression,
                &Action::RenderExpressionArrays,
                &Action::ImagePipeline
            ]
        );
        assert!(Action::IngestSubsample.is_derived());
        assert!(!Action::IngestCluster.is_derived());
    }

    #[test]
    fn test_owns_source() {
        assert!(Action::IngestCluster.owns_source(FileKind::Cluster));
        assert!(!Action::IngestCluster.owns_source(FileKind::AnnData));
        assert!(Action::IngestExpression.owns_source(FileKind::MmCoordinateMatrix));
        assert!(!Action::IngestSubsample.owns_source(FileKind::Cluster));
    }

    #[test]
    fn test_retry_with_creates_new_request() {
        let original = request();
        let escalated = original.params.escalated(&MachineCatalog::full()).unwrap();
        let retry = original.clone().with_reparse(true).retry_with(escalated);

        assert_ne!(retry.id, original.id);
        assert_eq!(retry.file_id, original.file_id);
        assert_eq!(retry.attempt, 2);
        assert_eq!(retry.previous_attempt.as_deref(), Some(original.id.as_str()));
        assert!(!retry.reparse);
        assert_eq!(retry.machine_type(), "n2d-highmem-8");
        assert_eq!(original.machine_type(), "n2d-highmem-4");
    }

    #[test]
    fn test_output_target_uses_cluster_name() {
        let target = request().output_target();
        assert_eq!(target.action, Action::IngestCluster);
        assert_eq!(target.name.as_deref(), Some("UMAP"));
    }

    #[test]
    fn test_run_state_transitions() {
        let mut run = JobRun::new(&request());
        run.advance(RunState::Uploading).unwrap();
        run.advance(RunState::Submitted).unwrap();
        assert!(run.advance(RunState::Succeeded).is_err());
        run.advance(RunState::Polling).unwrap();
        run.advance(RunState::Polling).unwrap();
        run.advance(RunState::Succeeded).unwrap();
        assert!(run.finished_at.is_some());
        assert!(run.fail(FailureKind::Abandoned).is_err());
    }

    #[test]
    fn test_fail_from_created() {
        let mut run = JobRun::new(&request());
        run.fail(FailureKind::Submission).unwrap();
        assert_eq!(run.state, RunState::Failed);
        assert_eq!(run.failure, Some(FailureKind::Submission));
    }

    #[test]
    fn test_completion_follow_ups() {
        let next = request();
        let follow_ups = Completion::Retried { next: next.clone() }.into_follow_ups();
        assert_eq!(follow_ups, vec![next]);
        assert!(Completion::Abandoned.into_follow_ups().is_empty());
    }
}

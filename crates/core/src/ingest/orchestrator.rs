//! Ingest orchestrator.
//!
//! Runs one step of one request at a time and reports what should happen
//! next as a [`StepOutcome`]. It never sleeps: waits are returned as
//! `Reschedule` values for the scheduler to persist.
//!
//! - Launch: upload, admission, job spec, submission
//! - Poll: one status query, then success or failure handling

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

use super::params::JobParams;
use super::retry::{ExitClass, RetryDecision, RetryPolicy};
use super::{
    Action, ActionPlanner, Admission, ChainIntent, Completion, ConcurrencyGate, FailureKind,
    GateConfig, IngestRequest, JobRun, OrchestratorConfig, OrchestratorError, RescheduleReason,
    RunState, Step, StepOutcome,
};
use crate::gateway::{ErrorEvent, JobHandle, JobSubmissionGateway, RemoteJobState};
use crate::metrics::{
    ADMISSION_DEFERRALS, GATEWAY_ERRORS, JOBS_COMPLETED, JOBS_SUBMITTED, JOB_DURATION,
    JOB_RETRIES, UPLOAD_FAILURES,
};
use crate::notify::{AnalyticsSink, NotificationSink, Recipient};
use crate::records::{ClusterGroup, ParseStatus, RecordStore, StudyFile, StudySnapshot};
use crate::storage::{RemoteLocation, StorageError, StorageGateway};

pub struct IngestOrchestrator {
    config: OrchestratorConfig,
    planner: ActionPlanner,
    gate: ConcurrencyGate,
    retry: RetryPolicy,
    gateway: Arc<dyn JobSubmissionGateway>,
    storage: Arc<dyn StorageGateway>,
    records: Arc<dyn RecordStore>,
    notifier: Arc<dyn NotificationSink>,
    analytics: Option<Arc<dyn AnalyticsSink>>,
}

impl IngestOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        planner: ActionPlanner,
        gateway: Arc<dyn JobSubmissionGateway>,
        storage: Arc<dyn StorageGateway>,
        records: Arc<dyn RecordStore>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        let retry = RetryPolicy::new(config.retryable_exit_codes.clone(), config.max_job_attempts);
        Self {
            config,
            planner,
            gate: ConcurrencyGate::new(GateConfig::default()),
            retry,
            gateway,
            storage,
            records,
            notifier,
            analytics: None,
        }
    }

    pub fn with_gate(mut self, config: GateConfig) -> Self {
        self.gate = ConcurrencyGate::new(config);
        self
    }

    pub fn with_analytics(mut self, analytics: Arc<dyn AnalyticsSink>) -> Self {
        self.analytics = Some(analytics);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn planner(&self) -> &ActionPlanner {
        &self.planner
    }

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    /// Execute `step` for `request`, updating `run` in place.
    pub async fn run_step(
        &self,
        request: &IngestRequest,
        run: &mut JobRun,
        step: Step,
    ) -> Result<StepOutcome, OrchestratorError> {
        debug!(
            "Running {} step for request {} ({})",
            step.as_str(),
            request.id,
            request.action()
        );
        match step {
            Step::Launch => self.launch(request, run).await,
            Step::Poll => self.poll(request, run).await,
        }
    }

    // =========================================================================
    // Launch
    // =========================================================================

    async fn launch(
        &self,
        request: &IngestRequest,
        run: &mut JobRun,
    ) -> Result<StepOutcome, OrchestratorError> {
        match run.state {
            RunState::Created => run.advance(RunState::Uploading)?,
            RunState::Uploading => {}
            other => {
                return Err(OrchestratorError::InvalidTransition {
                    request_id: request.id.clone(),
                    from: other,
                    to: RunState::Uploading,
                })
            }
        }

        let Some(file) = self.live_file(&request.file_id)? else {
            info!(
                "File {} is gone, abandoning request {} before launch",
                request.file_id, request.id
            );
            run.fail(FailureKind::Abandoned)?;
            self.count_completion(request, run, "abandoned");
            return Ok(StepOutcome::Finished(Completion::Abandoned));
        };

        if let Err(e) = self.ensure_uploaded(&file).await {
            UPLOAD_FAILURES.inc();
            run.upload_attempts += 1;
            if run.upload_attempts < self.config.max_upload_attempts {
                let after = self.config.upload_retry_delay(run.upload_attempts);
                warn!(
                    "Upload of {} failed (attempt {}), retrying in {:?}: {}",
                    file.name, run.upload_attempts, after, e
                );
                return Ok(StepOutcome::Reschedule {
                    step: Step::Launch,
                    after,
                    reason: RescheduleReason::UploadRetry {
                        attempt: run.upload_attempts,
                    },
                });
            }
            let detail = format!(
                "Upload of {} failed after {} attempts: {}",
                file.name, run.upload_attempts, e
            );
            return self
                .fail_before_submit(request, run, &file, FailureKind::Upload, detail)
                .await;
        }

        let study_files = self.records.list_files(&request.study_id)?;
        if let Admission::Defer {
            retry_after,
            blocking_file_id,
        } = self.gate.admit(request, &file, &study_files, Utc::now())
        {
            ADMISSION_DEFERRALS.inc();
            info!(
                "Deferring {} for {}: waiting on matrix {}",
                request.action(),
                file.name,
                blocking_file_id
            );
            self.track(
                "ingest:admission-deferred",
                request,
                run,
                json!({ "blocking_file_id": blocking_file_id }),
            )
            .await;
            return Ok(StepOutcome::Reschedule {
                step: Step::Launch,
                after: retry_after,
                reason: RescheduleReason::AdmissionDeferred,
            });
        }

        let study = self.records.get_study(&request.study_id)?;

        if request.reparse {
            let removed = self.records.delete_partial_output(&request.output_target())?;
            debug!("Removed {} prior records before reparse of {}", removed, file.name);
        }

        let spec = match self.planner.job_spec(request, &study) {
            Ok(spec) => spec,
            Err(e) => {
                let detail = format!("Invalid job parameters: {}", e);
                return self
                    .fail_before_submit(request, run, &file, FailureKind::Submission, detail)
                    .await;
            }
        };

        let handle = match self.gateway.submit(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                GATEWAY_ERRORS.with_label_values(&["submit"]).inc();
                let detail = format!("Job submission failed: {}\n{}", e, spec.command_line());
                return self
                    .fail_before_submit(request, run, &file, FailureKind::Submission, detail)
                    .await;
            }
        };

        info!(
            "Submitted {} for {} as {} on {}",
            request.action(),
            file.name,
            handle,
            spec.resources.machine_type
        );
        run.job_handle = Some(handle);
        run.machine_type = spec.resources.machine_type.clone();
        run.submitted_at = Some(Utc::now());
        run.advance(RunState::Submitted)?;

        // The job is running remotely now. Nothing below may fail the step,
        // or a replay would submit it a second time.
        if request.action().owns_source(file.kind) {
            if let Err(e) = self.records.set_parse_status(&file.id, ParseStatus::Parsing) {
                warn!("Failed to mark {} as parsing: {}", file.name, e);
            }
        }

        JOBS_SUBMITTED
            .with_label_values(&[request.action().as_str()])
            .inc();
        self.track("ingest:job-submitted", request, run, json!({})).await;

        Ok(StepOutcome::Reschedule {
            step: Step::Poll,
            after: self.config.poll_interval(),
            reason: RescheduleReason::AwaitingCompletion,
        })
    }

    /// Make sure the source object is in the bucket, pushing the local copy if needed.
    async fn ensure_uploaded(&self, file: &StudyFile) -> Result<(), StorageError> {
        let location: RemoteLocation = file.location.parse()?;
        if self.storage.exists(&location).await? {
            return Ok(());
        }
        match &file.local_path {
            Some(local) => {
                self.storage.push(local, &location).await?;
                info!("Pushed {} to {}", file.name, location);
                Ok(())
            }
            None => Err(StorageError::NotFound {
                location: location.to_string(),
            }),
        }
    }

    /// Terminal failure before a job ran. Only admins hear about it.
    async fn fail_before_submit(
        &self,
        request: &IngestRequest,
        run: &mut JobRun,
        file: &StudyFile,
        kind: FailureKind,
        detail: String,
    ) -> Result<StepOutcome, OrchestratorError> {
        warn!("Request {} failed before submission: {}", request.id, detail);
        run.fail(kind.clone())?;

        let subject = format!(
            "Unable to launch {} for {}",
            request.action(),
            file.name
        );
        let body = format!(
            "<p>Study: {}<br/>File: {} ({})<br/>Request: {}</p><pre>{}</pre>",
            request.study_id,
            file.name,
            file.id,
            request.id,
            escape_html(&detail)
        );
        self.send_failure(&Recipient::Admins, &subject, &body).await;
        self.track(
            "ingest:job-failed",
            request,
            run,
            json!({ "failure": kind.as_str() }),
        )
        .await;
        self.count_completion(request, run, "failed");

        Ok(StepOutcome::Finished(Completion::Failed { kind }))
    }

    // =========================================================================
    // Poll
    // =========================================================================

    async fn poll(
        &self,
        request: &IngestRequest,
        run: &mut JobRun,
    ) -> Result<StepOutcome, OrchestratorError> {
        if !matches!(run.state, RunState::Submitted | RunState::Polling) {
            return Err(OrchestratorError::InvalidTransition {
                request_id: request.id.clone(),
                from: run.state,
                to: RunState::Polling,
            });
        }
        let handle = run
            .job_handle
            .clone()
            .ok_or_else(|| OrchestratorError::MissingHandle(request.id.clone()))?;

        let Some(file) = self.live_file(&request.file_id)? else {
            return self.abandon(request, run).await;
        };

        let status = match self.gateway.status(&handle).await {
            Ok(status) => status,
            Err(e) => {
                GATEWAY_ERRORS.with_label_values(&["status"]).inc();
                warn!("Status of {} unavailable: {}", handle, e);
                return Ok(self.poll_again(RescheduleReason::StatusUnavailable));
            }
        };

        match status.state {
            RemoteJobState::Queued | RemoteJobState::Running => {
                run.advance(RunState::Polling)?;
                Ok(self.poll_again(RescheduleReason::AwaitingCompletion))
            }
            RemoteJobState::Succeeded => self.on_success(request, run, &file).await,
            RemoteJobState::Failed => self.on_failure(request, run, &file, &handle).await,
        }
    }

    fn poll_again(&self, reason: RescheduleReason) -> StepOutcome {
        StepOutcome::Reschedule {
            step: Step::Poll,
            after: self.config.poll_interval(),
            reason,
        }
    }

    /// The file was deleted under a running job: clean up without telling anyone.
    async fn abandon(
        &self,
        request: &IngestRequest,
        run: &mut JobRun,
    ) -> Result<StepOutcome, OrchestratorError> {
        info!(
            "File {} was removed while {} ran, abandoning request {}",
            request.file_id,
            request.action(),
            request.id
        );
        run.fail(FailureKind::Abandoned)?;
        self.cleanup_output(request)?;
        self.count_completion(request, run, "abandoned");
        Ok(StepOutcome::Finished(Completion::Abandoned))
    }

    async fn on_success(
        &self,
        request: &IngestRequest,
        run: &mut JobRun,
        file: &StudyFile,
    ) -> Result<StepOutcome, OrchestratorError> {
        if run.state == RunState::Submitted {
            run.advance(RunState::Polling)?;
        }
        run.advance(RunState::Succeeded)?;
        let action = request.action();

        if action.owns_source(file.kind) {
            self.records.set_parse_status(&file.id, ParseStatus::Parsed)?;
        }
        if action == Action::IngestSubsample {
            if let Some(cluster) = self.subsample_cluster(request)? {
                self.records.finish_subsampling(&cluster.id, true)?;
            }
        }
        if action == Action::IngestCellMetadata {
            if !action.owns_source(file.kind) {
                if let JobParams::IngestCellMetadata(p) = request.params.params() {
                    self.records
                        .set_bundled_metadata(&file.id, Some(&p.cell_metadata_file))?;
                }
            }
            self.records.rebuild_cell_index(&request.study_id)?;
        }

        let snapshot = StudySnapshot::load(self.records.as_ref(), &request.study_id)?;
        let plan = self.planner.chain_for(request, &snapshot, run.runtime_ms());
        for (next, e) in &plan.rejected {
            warn!("Skipping {} after {}: {}", next, file.name, e);
        }

        let mut chained = Vec::with_capacity(plan.intents.len());
        for intent in plan.intents {
            match intent {
                ChainIntent::Launch(planned) => chained.push(planned.into_request()),
                ChainIntent::Subsample {
                    cluster_id,
                    request: planned,
                } => {
                    // Once one claim is taken the step must finish, or the
                    // claim would be stranded. A failed claim leaves the
                    // cluster free for the next success to pick up.
                    match self.records.try_claim_subsampling(&cluster_id) {
                        Ok(true) => chained.push(planned.into_request()),
                        Ok(false) => {
                            debug!("Cluster {} already claimed for subsampling", cluster_id)
                        }
                        Err(e) => warn!("Failed to claim cluster {} for subsampling: {}", cluster_id, e),
                    }
                }
            }
        }

        info!(
            "{} for {} succeeded, chaining {} request(s)",
            action,
            file.name,
            chained.len()
        );

        let subject = format!("{} completed for {}", describe(action), file.name);
        let mut lines = vec![format!(
            "{} finished in {}",
            describe(action),
            format_runtime(run.runtime_ms())
        )];
        lines.extend(chained.iter().map(|r| format!("Queued {}", describe(r.action()))));
        self.send_success(&self.recipient(request), &subject, &lines)
            .await;

        self.track(
            "ingest:job-completed",
            request,
            run,
            json!({ "chained": chained.len() }),
        )
        .await;
        self.count_completion(request, run, "succeeded");

        Ok(StepOutcome::Finished(Completion::Succeeded { chained }))
    }

    async fn on_failure(
        &self,
        request: &IngestRequest,
        run: &mut JobRun,
        file: &StudyFile,
        handle: &JobHandle,
    ) -> Result<StepOutcome, OrchestratorError> {
        let exit_code = match self.gateway.exit_code(handle).await {
            Ok(code) => code,
            Err(e) => {
                GATEWAY_ERRORS.with_label_values(&["exit_code"]).inc();
                warn!("Exit code of {} unavailable: {}", handle, e);
                return Ok(self.poll_again(RescheduleReason::StatusUnavailable));
            }
        };
        run.exit_code = exit_code;

        let events = match self.gateway.error_events(handle).await {
            Ok(events) => events,
            Err(e) => {
                GATEWAY_ERRORS.with_label_values(&["error_events"]).inc();
                warn!("Error events of {} unavailable: {}", handle, e);
                Vec::new()
            }
        };

        let code = match ExitClass::classify(exit_code) {
            ExitClass::Inconsistent => {
                warn!("Job {} reported failure with exit code 0", handle);
                return self
                    .fail_terminally(request, run, file, handle, FailureKind::Inconsistent, &events)
                    .await;
            }
            ExitClass::Failure(code) => code,
        };

        match self
            .retry
            .decide(code, request.attempt, &request.params, self.planner.catalog())
        {
            RetryDecision::Retry { params } => {
                run.fail(FailureKind::Job { exit_code: code })?;
                let removed = self.records.prepare_for_retry(&request.output_target())?;
                let next = request.retry_with(params);
                info!(
                    "{} for {} exited with {:?}, retrying on {} (attempt {}, {} records reset)",
                    request.action(),
                    file.name,
                    code,
                    next.machine_type(),
                    next.attempt,
                    removed
                );
                JOB_RETRIES
                    .with_label_values(&[request.action().as_str()])
                    .inc();
                self.track(
                    "ingest:job-retried",
                    request,
                    run,
                    json!({ "next_machine_type": next.machine_type() }),
                )
                .await;
                self.count_completion(request, run, "retried");
                Ok(StepOutcome::Finished(Completion::Retried { next }))
            }
            RetryDecision::Fail { reason } => {
                debug!("Not retrying {}: {}", request.id, reason.as_str());
                self.fail_terminally(
                    request,
                    run,
                    file,
                    handle,
                    FailureKind::Job { exit_code: code },
                    &events,
                )
                .await
            }
        }
    }

    async fn fail_terminally(
        &self,
        request: &IngestRequest,
        run: &mut JobRun,
        file: &StudyFile,
        handle: &JobHandle,
        kind: FailureKind,
        events: &[ErrorEvent],
    ) -> Result<StepOutcome, OrchestratorError> {
        run.fail(kind.clone())?;
        let action = request.action();

        self.cleanup_output(request)?;

        if !request.persist_on_fail && !action.is_derived() && action.owns_source(file.kind) {
            match file.location.parse::<RemoteLocation>() {
                Ok(location) => {
                    if let Err(e) = self.storage.delete(&location).await {
                        warn!("Failed to remove {} after failed ingest: {}", location, e);
                    }
                }
                Err(e) => warn!("Cannot remove {}: {}", file.location, e),
            }
        }

        if action.owns_source(file.kind) {
            self.records.set_parse_status(&file.id, ParseStatus::Failed)?;
        }

        let subject = format!("Error: {} failed for {}", describe(action), file.name);
        let user_body = format!(
            "<p>{} of {} did not complete. Please check the file format and try again.</p>",
            describe(action),
            escape_html(&file.name)
        );
        self.send_failure(&self.recipient(request), &subject, &user_body)
            .await;

        let admin_body = self.admin_report(request, run, file, handle, events).await;
        self.send_failure(&Recipient::Admins, &subject, &admin_body)
            .await;

        self.track(
            "ingest:job-failed",
            request,
            run,
            json!({ "failure": kind.as_str() }),
        )
        .await;
        self.count_completion(request, run, "failed");

        Ok(StepOutcome::Finished(Completion::Failed { kind }))
    }

    async fn admin_report(
        &self,
        request: &IngestRequest,
        run: &JobRun,
        file: &StudyFile,
        handle: &JobHandle,
        events: &[ErrorEvent],
    ) -> String {
        let command = match self.records.get_study(&request.study_id) {
            Ok(study) => self
                .planner
                .job_spec(request, &study)
                .map(|spec| spec.command_line())
                .unwrap_or_else(|e| format!("(unavailable: {})", e)),
            Err(e) => format!("(unavailable: {})", e),
        };
        let resources = match self.gateway.resource_usage(handle).await {
            Ok(usage) => format!(
                "{} ({} mCPU, {} MiB, {} GiB disk)",
                usage.machine_type, usage.cpu_milli, usage.memory_mib, usage.boot_disk_gib
            ),
            Err(e) => {
                GATEWAY_ERRORS.with_label_values(&["resource_usage"]).inc();
                format!("(unavailable: {})", e)
            }
        };
        let exit = run
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "none".to_string());
        let log: Vec<String> = events
            .iter()
            .map(|e| format!("{} {}", e.timestamp.to_rfc3339(), e.message))
            .collect();

        format!(
            "<p>Study: {}<br/>File: {} ({})<br/>Request: {} attempt {}<br/>Job: {}<br/>Exit code: {}<br/>Resources: {}</p>\
             <p>Command:</p><pre>{}</pre><p>Events:</p><pre>{}</pre>",
            request.study_id,
            escape_html(&file.name),
            file.id,
            request.id,
            request.attempt,
            handle,
            exit,
            escape_html(&resources),
            escape_html(&command),
            escape_html(&log.join("\n"))
        )
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// The request's file, unless it is gone or queued for deletion.
    fn live_file(&self, file_id: &str) -> Result<Option<StudyFile>, OrchestratorError> {
        Ok(self
            .records
            .get_file(file_id)?
            .filter(|f| !f.queued_for_deletion))
    }

    /// Remove what a failed or abandoned request left behind.
    fn cleanup_output(&self, request: &IngestRequest) -> Result<(), OrchestratorError> {
        if request.action() == Action::IngestSubsample {
            if let Some(cluster) = self.subsample_cluster(request)? {
                self.records.finish_subsampling(&cluster.id, false)?;
            }
            return Ok(());
        }
        let removed = self.records.delete_partial_output(&request.output_target())?;
        if removed > 0 {
            debug!("Removed {} partial records for request {}", removed, request.id);
        }
        Ok(())
    }

    fn subsample_cluster(&self, request: &IngestRequest) -> Result<Option<ClusterGroup>, OrchestratorError> {
        let name = request.params.params().output_name();
        Ok(self
            .records
            .list_clusters(&request.study_id)?
            .into_iter()
            .find(|c| c.file_id == request.file_id && Some(c.name.as_str()) == name))
    }

    fn recipient(&self, request: &IngestRequest) -> Recipient {
        if request.action().is_special() {
            Recipient::Admins
        } else {
            Recipient::User(request.user_email.clone())
        }
    }

    async fn send_success(&self, recipient: &Recipient, subject: &str, lines: &[String]) {
        if let Err(e) = self.notifier.notify_success(recipient, subject, lines).await {
            warn!("Failed to notify {}: {}", recipient, e);
        }
    }

    async fn send_failure(&self, recipient: &Recipient, subject: &str, body: &str) {
        if let Err(e) = self.notifier.notify_failure(recipient, subject, body).await {
            warn!("Failed to notify {}: {}", recipient, e);
        }
    }

    async fn track(
        &self,
        name: &str,
        request: &IngestRequest,
        run: &JobRun,
        extra: serde_json::Value,
    ) {
        let Some(analytics) = &self.analytics else {
            return;
        };
        let mut properties = json!({
            "request_id": request.id,
            "action": request.action().as_str(),
            "study_id": request.study_id,
            "file_id": request.file_id,
            "machine_type": run.machine_type,
            "attempt": request.attempt,
            "runtime_ms": run.runtime_ms(),
            "exit_code": run.exit_code,
        });
        if let (Some(base), serde_json::Value::Object(extra)) = (properties.as_object_mut(), extra) {
            base.extend(extra);
        }
        if let Err(e) = analytics
            .record(name, properties, Some(&request.user_email))
            .await
        {
            warn!("Failed to record {}: {}", name, e);
        }
    }

    fn count_completion(&self, request: &IngestRequest, run: &JobRun, result: &str) {
        let action = request.action().as_str();
        JOBS_COMPLETED.with_label_values(&[action, result]).inc();
        if run.submitted_at.is_some() {
            JOB_DURATION
                .with_label_values(&[action, result])
                .observe(run.runtime_ms() as f64 / 1000.0);
        }
    }
}

/// Human-readable action name for messages.
fn describe(action: Action) -> &'static str {
    match action {
        Action::IngestExpression => "Expression matrix ingest",
        Action::IngestCluster => "Clustering ingest",
        Action::IngestCellMetadata => "Metadata ingest",
        Action::IngestAnnData => "AnnData ingest",
        Action::IngestDifferentialExpression => "Differential expression ingest",
        Action::IngestSubsample => "Cluster subsampling",
        Action::DifferentialExpression => "Differential expression",
        Action::RenderExpressionArrays => "Expression array rendering",
        Action::ImagePipeline => "Image pipeline",
    }
}

fn format_runtime(ms: u64) -> String {
    let secs = ms / 1000;
    format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_runtime() {
        assert_eq!(format_runtime(0), "0h 0m 0s");
        assert_eq!(format_runtime(3_723_000), "1h 2m 3s");
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("a<b>&c"), "a&lt;b&gt;&amp;c");
    }

    #[test]
    fn test_describe_covers_every_action() {
        for action in Action::ALL {
            assert!(!describe(action).is_empty());
        }
    }
}

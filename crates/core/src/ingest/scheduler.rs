//! Ingest scheduler.
//!
//! Drives requests through the orchestrator one persisted step at a time:
//! - a tick claims due steps from the [`JobStore`]
//! - each claimed step runs in its own task
//! - the outcome is written back as a due time or a completion

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::job_store::{ClaimedStep, JobStore, JobStoreError};
use super::{
    Completion, IngestOrchestrator, IngestRequest, JobRun, OrchestratorConfig, Step, StepOutcome,
};
use crate::audit::{AuditEvent, AuditHandle};
use crate::metrics::STEPS_EXECUTED;

/// Snapshot of scheduler activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub enabled: bool,
    /// Requests waiting for their next step.
    pub scheduled: usize,
    /// Steps currently executing.
    pub in_flight: usize,
    /// Requests that reached an outcome.
    pub completed: usize,
}

pub struct IngestScheduler {
    config: OrchestratorConfig,
    orchestrator: Arc<IngestOrchestrator>,
    store: Arc<dyn JobStore>,
    audit: Option<AuditHandle>,

    running: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
}

impl IngestScheduler {
    pub fn new(
        orchestrator: Arc<IngestOrchestrator>,
        store: Arc<dyn JobStore>,
        audit: Option<AuditHandle>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config: orchestrator.config().clone(),
            orchestrator,
            store,
            audit,
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
        }
    }

    /// Persist a request with its launch step due now.
    pub async fn enqueue(&self, request: IngestRequest) -> Result<String, JobStoreError> {
        let id = request.id.clone();
        Self::persist_request(&self.store, &self.audit, &request).await?;
        Ok(id)
    }

    /// Run every step that is due right now and wait for all of them.
    ///
    /// Returns how many steps ran.
    pub async fn run_due(&self) -> Result<usize, JobStoreError> {
        let handles = Self::dispatch_due(&self.orchestrator, &self.store, &self.audit, &self.config)?;
        let count = handles.len();
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!("Step task panicked: {}", e);
            }
        }
        Ok(count)
    }

    /// Start the tick loop. Claims left behind by a previous process are released first.
    pub async fn start(&self) {
        if !self.config.enabled {
            info!("Ingest scheduler disabled, not starting");
            return;
        }
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Scheduler already running");
            return;
        }

        info!("Starting ingest scheduler");

        match self.store.release_claims() {
            Ok(0) => {}
            Ok(n) => info!("Recovered {} interrupted steps", n),
            Err(e) => error!("Failed to recover interrupted steps: {}", e),
        }

        self.spawn_tick_loop();

        info!("Ingest scheduler started");
    }

    /// Stop the tick loop. Steps already running finish on their own.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("Scheduler not running");
            return;
        }

        info!("Stopping ingest scheduler");

        let _ = self.shutdown_tx.send(());

        // Give in-flight steps a moment to write back
        tokio::time::sleep(Duration::from_millis(500)).await;

        info!("Ingest scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub async fn status(&self) -> SchedulerStatus {
        let counts = self.store.counts().unwrap_or_else(|e| {
            warn!("Failed to count scheduled steps: {}", e);
            Default::default()
        });

        SchedulerStatus {
            running: self.is_running(),
            enabled: self.config.enabled,
            scheduled: counts.scheduled,
            in_flight: counts.running,
            completed: counts.completed,
        }
    }

    fn spawn_tick_loop(&self) {
        let running = Arc::clone(&self.running);
        let orchestrator = Arc::clone(&self.orchestrator);
        let store = Arc::clone(&self.store);
        let audit = self.audit.clone();
        let config = self.config.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            info!("Scheduler loop started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Scheduler loop received shutdown signal");
                        break;
                    }
                    _ = tokio::time::sleep(Duration::from_millis(config.tick_interval_ms)) => {
                        if !running.load(Ordering::Relaxed) {
                            break;
                        }
                        match Self::dispatch_due(&orchestrator, &store, &audit, &config) {
                            Ok(handles) if !handles.is_empty() => {
                                debug!("Dispatched {} steps", handles.len());
                            }
                            Ok(_) => {}
                            Err(e) => warn!("Failed to claim due steps: {}", e),
                        }
                    }
                }
            }
            info!("Scheduler loop stopped");
        });
    }

    /// Claim due steps and spawn one task per step.
    fn dispatch_due(
        orchestrator: &Arc<IngestOrchestrator>,
        store: &Arc<dyn JobStore>,
        audit: &Option<AuditHandle>,
        config: &OrchestratorConfig,
    ) -> Result<Vec<JoinHandle<()>>, JobStoreError> {
        let claimed = store.claim_due(Utc::now(), config.max_steps_per_tick)?;

        Ok(claimed
            .into_iter()
            .map(|claim| {
                let orchestrator = Arc::clone(orchestrator);
                let store = Arc::clone(store);
                let audit = audit.clone();
                let backoff = config.step_error_backoff();
                tokio::spawn(async move {
                    Self::execute(&orchestrator, &store, &audit, backoff, claim).await;
                })
            })
            .collect())
    }

    async fn execute(
        orchestrator: &IngestOrchestrator,
        store: &Arc<dyn JobStore>,
        audit: &Option<AuditHandle>,
        error_backoff: Duration,
        claim: ClaimedStep,
    ) {
        let ClaimedStep {
            request,
            mut run,
            step,
        } = claim;

        let result = match orchestrator.run_step(&request, &mut run, step).await {
            Ok(StepOutcome::Reschedule {
                step: next,
                after,
                reason,
            }) => {
                STEPS_EXECUTED
                    .with_label_values(&[step.as_str(), "rescheduled"])
                    .inc();
                debug!(
                    "Request {} next {} in {:?} ({:?})",
                    request.id,
                    next.as_str(),
                    after,
                    reason
                );
                store
                    .save_run(&run)
                    .and_then(|_| store.schedule(&request.id, next, due_after(after)))
            }
            Ok(StepOutcome::Finished(completion)) => {
                STEPS_EXECUTED
                    .with_label_values(&[step.as_str(), "finished"])
                    .inc();
                Self::finish(store, audit, &request, &run, completion).await
            }
            Err(e) => {
                STEPS_EXECUTED
                    .with_label_values(&[step.as_str(), "error"])
                    .inc();
                warn!(
                    "{} step of request {} failed, retrying in {:?}: {}",
                    step.as_str(),
                    request.id,
                    error_backoff,
                    e
                );
                if let Some(audit) = audit {
                    audit
                        .emit(AuditEvent::StepErrored {
                            request_id: request.id.clone(),
                            step: step.as_str().to_string(),
                            error: e.to_string(),
                        })
                        .await;
                }
                // the run is not saved; the step replays from the persisted state
                store.schedule(&request.id, step, due_after(error_backoff))
            }
        };

        if let Err(e) = result {
            error!("Failed to write back request {}: {}", request.id, e);
        }
    }

    async fn finish(
        store: &Arc<dyn JobStore>,
        audit: &Option<AuditHandle>,
        request: &IngestRequest,
        run: &JobRun,
        completion: Completion,
    ) -> Result<(), JobStoreError> {
        store.save_run(run)?;

        let outcome = completion_label(&completion);
        let follow_ups = completion.into_follow_ups();
        for next in &follow_ups {
            if let Err(e) = Self::persist_request(store, audit, next).await {
                error!(
                    "Failed to enqueue {} after request {}: {}",
                    next.action(),
                    request.id,
                    e
                );
            }
        }

        store.complete(&request.id, outcome)?;
        info!(
            "Request {} ({}) {} with {} follow-up(s)",
            request.id,
            request.action(),
            outcome,
            follow_ups.len()
        );

        if let Some(audit) = audit {
            audit
                .emit(AuditEvent::RequestFinished {
                    request_id: request.id.clone(),
                    study_id: request.study_id.clone(),
                    file_id: request.file_id.clone(),
                    action: request.action().as_str().to_string(),
                    outcome: outcome.to_string(),
                    follow_ups: follow_ups.len(),
                })
                .await;
        }
        Ok(())
    }

    async fn persist_request(
        store: &Arc<dyn JobStore>,
        audit: &Option<AuditHandle>,
        request: &IngestRequest,
    ) -> Result<(), JobStoreError> {
        let run = JobRun::new(request);
        store.insert(request, &run, Step::Launch, Utc::now())?;
        debug!(
            "Enqueued {} for file {} (attempt {})",
            request.action(),
            request.file_id,
            request.attempt
        );

        if let Some(audit) = audit {
            audit
                .emit(AuditEvent::RequestEnqueued {
                    request_id: request.id.clone(),
                    study_id: request.study_id.clone(),
                    file_id: request.file_id.clone(),
                    action: request.action().as_str().to_string(),
                    attempt: request.attempt,
                    user_email: request.user_email.clone(),
                    previous_attempt: request.previous_attempt.clone(),
                })
                .await;
        }
        Ok(())
    }
}

fn completion_label(completion: &Completion) -> &'static str {
    match completion {
        Completion::Succeeded { .. } => "succeeded",
        Completion::Retried { .. } => "retried",
        Completion::Failed { .. } => "failed",
        Completion::Abandoned => "abandoned",
    }
}

fn due_after(after: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(after)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::FailureKind;

    #[test]
    fn test_completion_labels() {
        assert_eq!(
            completion_label(&Completion::Succeeded { chained: vec![] }),
            "succeeded"
        );
        assert_eq!(
            completion_label(&Completion::Failed {
                kind: FailureKind::Upload
            }),
            "failed"
        );
        assert_eq!(completion_label(&Completion::Abandoned), "abandoned");
    }

    #[test]
    fn test_due_after_is_in_the_future() {
        let before = Utc::now();
        let due = due_after(Duration::from_secs(60));
        assert!(due >= before + chrono::Duration::seconds(59));
    }
}

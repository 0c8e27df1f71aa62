//! Ingest job orchestration.
//!
//! A request for one action on one study file moves through persisted steps:
//! - **Launch**: push the source, pass the admission gate, submit the job
//! - **Poll**: check the remote job until it is terminal
//!
//! On success the planner chains follow-up requests. On an out-of-memory
//! exit the retry policy escalates to a larger machine.

pub mod chain;
mod config;
mod gate;
mod job_store;
mod orchestrator;
pub mod params;
mod planner;
mod retry;
mod scheduler;
mod types;

pub use config::{GateConfig, OrchestratorConfig};
pub use gate::{Admission, ConcurrencyGate};
pub use job_store::{ClaimedStep, JobCounts, JobStore, JobStoreError, SqliteJobStore};
pub use orchestrator::IngestOrchestrator;
pub use params::{JobParams, ParameterSet, ValidationError};
pub use planner::{
    ActionPlanner, ChainIntent, ChainPlan, PlanError, PlannedRequest, PlannerSettings,
};
pub use retry::{ExitClass, RetryDecision, RetryPolicy, RetryRefusal};
pub use scheduler::{IngestScheduler, SchedulerStatus};
pub use types::{
    Action, Completion, FailureKind, IngestRequest, JobRun, OrchestratorError, RescheduleReason,
    RunState, Step, StepOutcome,
};

pub mod audit;
pub mod config;
pub mod gateway;
pub mod ingest;
pub mod metrics;
pub mod notify;
pub mod records;
pub mod sizing;
pub mod storage;
pub mod testing;

pub use audit::{
    create_audit_system, AuditError, AuditEvent, AuditFilter, AuditHandle, AuditRecord,
    AuditStore, AuditWriter, SqliteAuditStore,
};
pub use config::{
    config_path, load_config, load_config_from_str, validate_config, BatchConfig, Config,
    ConfigError, DatabaseConfig, NotificationConfig, RetryConfig, SanitizedConfig, ServerConfig,
    StorageConfig,
};
pub use gateway::{
    BatchApiGateway, ErrorEvent, GatewayError, JobFilter, JobHandle, JobSpec, JobStatus,
    JobSubmissionGateway, JobSummary, RemoteJobState, ResourceUsage,
};
pub use ingest::{
    Action, ActionPlanner, Admission, ChainIntent, ChainPlan, Completion, ConcurrencyGate,
    ExitClass, FailureKind, GateConfig, IngestOrchestrator, IngestRequest, IngestScheduler,
    JobParams, JobRun, JobStore, JobStoreError, OrchestratorConfig, OrchestratorError,
    ParameterSet, PlanError, PlannedRequest, PlannerSettings, RescheduleReason, RetryDecision,
    RetryPolicy, RetryRefusal, RunState, SchedulerStatus, SqliteJobStore, Step, StepOutcome, ValidationError,
};
pub use notify::{
    AnalyticsSink, AuditAnalytics, LogNotifier, NotificationSink, NotifyError, Recipient,
};
pub use records::{
    Annotation, AnnotationKind, AnnotationScope, ClusterGroup, DeResultKey, FileKind, OutputTarget,
    ParseStatus, RecordError, RecordStore, SqliteRecordStore, Study, StudyFile, StudySnapshot,
};
pub use sizing::{MachineCatalog, MachineSpec, ResourceSizer, SizingConfig, SizingError};
pub use storage::{FsBucketStorage, RemoteLocation, StorageError, StorageGateway};

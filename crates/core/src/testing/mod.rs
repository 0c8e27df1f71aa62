//! Testing utilities and mock implementations of every collaborator.
//!
//! The mocks let the orchestrator and scheduler run end to end without a
//! batch service, a bucket or a database.
//!
//! # Example
//!
//! ```rust,ignore
//! use cellingest_core::testing::fixtures::{self, Harness};
//!
//! let harness = Harness::new();
//! let file = fixtures::study_file("matrix-1", FileKind::ExpressionMatrix);
//! harness.add_uploaded(file.clone()).await;
//! let request = harness.request_for(&file.id);
//! ```

mod memory_records;
mod mock_gateway;
mod mock_notifier;
mod mock_storage;

pub use memory_records::MemoryRecordStore;
pub use mock_gateway::{MockGateway, RecordedSubmission};
pub use mock_notifier::{MockAnalytics, MockNotifier, RecordedEvent, SentNotification};
pub use mock_storage::MockStorage;

/// Test fixtures and helper functions.
pub mod fixtures {
    use std::sync::Arc;

    use chrono::{Duration, Utc};

    use super::{MemoryRecordStore, MockAnalytics, MockGateway, MockNotifier, MockStorage};
    use crate::ingest::{
        ActionPlanner, GateConfig, IngestOrchestrator, IngestRequest, OrchestratorConfig,
        PlannerSettings,
    };
    use crate::records::{
        Annotation, AnnotationKind, AnnotationScope, ClusterGroup, FileKind, ParseStatus,
        RecordStore, Study, StudyFile,
    };
    use crate::sizing::{ResourceSizer, SizingConfig};

    pub const STUDY_ID: &str = "study-1";
    pub const BUCKET: &str = "fc-1234";
    pub const USER_EMAIL: &str = "user@example.org";

    pub fn study() -> Study {
        Study {
            id: STUDY_ID.to_string(),
            accession: "SCP1".to_string(),
            name: "Retina atlas".to_string(),
            bucket: BUCKET.to_string(),
            owner_email: USER_EMAIL.to_string(),
        }
    }

    /// An unparsed 1 MB file uploaded an hour ago.
    pub fn study_file(id: &str, kind: FileKind) -> StudyFile {
        StudyFile {
            id: id.to_string(),
            study_id: STUDY_ID.to_string(),
            name: format!("{}.txt", id),
            kind,
            location: format!("gs://{}/{}.txt", BUCKET, id),
            local_path: None,
            size_bytes: 1_000_000,
            raw_counts: false,
            parse_status: ParseStatus::Unparsed,
            queued_for_deletion: false,
            has_validated_output: false,
            genes_location: None,
            barcodes_location: None,
            bundled_metadata: None,
            created_at: Utc::now() - Duration::hours(1),
        }
    }

    pub fn cluster(id: &str, file_id: &str, name: &str, points: u64) -> ClusterGroup {
        ClusterGroup {
            id: id.to_string(),
            study_id: STUDY_ID.to_string(),
            file_id: file_id.to_string(),
            name: name.to_string(),
            points,
            source_location: format!("gs://{}/{}.txt", BUCKET, file_id),
            is_subsampling: false,
            subsampled: false,
        }
    }

    /// Study-wide group annotation with `values` distinct labels.
    pub fn group_annotation(file_id: &str, name: &str, values: usize) -> Annotation {
        Annotation {
            study_id: STUDY_ID.to_string(),
            file_id: file_id.to_string(),
            name: name.to_string(),
            scope: AnnotationScope::Study,
            cluster_id: None,
            kind: AnnotationKind::Group,
            values: (0..values).map(|i| format!("group-{}", i)).collect(),
        }
    }

    pub fn planner_settings() -> PlannerSettings {
        PlannerSettings {
            image: "gcr.io/test/ingest:1.0".to_string(),
            image_pipeline_image: Some("gcr.io/test/scatter:1.0".to_string()),
            database_name: "cellingest_test".to_string(),
            project_id: "test-project".to_string(),
            subsample_threshold: 1000,
            max_de_groups: 200,
        }
    }

    pub fn planner() -> ActionPlanner {
        let sizer = ResourceSizer::new(SizingConfig::default()).expect("default sizing config");
        ActionPlanner::new(sizer, planner_settings())
    }

    /// Orchestrator config with every delay set to zero.
    pub fn immediate_config() -> OrchestratorConfig {
        OrchestratorConfig {
            poll_interval_ms: 0,
            tick_interval_ms: 10,
            upload_retry_base_ms: 0,
            step_error_backoff_ms: 0,
            subsample_threshold: 1000,
            ..OrchestratorConfig::default()
        }
    }

    /// Every mock wired into one orchestrator.
    pub struct Harness {
        pub gateway: Arc<MockGateway>,
        pub storage: Arc<MockStorage>,
        pub records: Arc<MemoryRecordStore>,
        pub notifier: Arc<MockNotifier>,
        pub analytics: Arc<MockAnalytics>,
        pub orchestrator: Arc<IngestOrchestrator>,
    }

    impl Default for Harness {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Harness {
        pub fn new() -> Self {
            Self::with_config(immediate_config(), GateConfig::default())
        }

        pub fn with_config(config: OrchestratorConfig, gate: GateConfig) -> Self {
            let gateway = Arc::new(MockGateway::new());
            let storage = Arc::new(MockStorage::new());
            let records = Arc::new(MemoryRecordStore::new());
            let notifier = Arc::new(MockNotifier::new());
            let analytics = Arc::new(MockAnalytics::new());
            records.insert_study(study());

            let orchestrator = IngestOrchestrator::new(
                config,
                planner(),
                gateway.clone(),
                storage.clone(),
                records.clone(),
                notifier.clone(),
            )
            .with_gate(gate)
            .with_analytics(analytics.clone());

            Self {
                gateway,
                storage,
                records,
                notifier,
                analytics,
                orchestrator: Arc::new(orchestrator),
            }
        }

        /// Register `file` and place its object in the bucket.
        pub async fn add_uploaded(&self, file: StudyFile) {
            self.storage.insert_object(&file.location, b"data").await;
            self.records.insert_file(file);
        }

        /// The primary ingest request for a registered file.
        pub fn request_for(&self, file_id: &str) -> IngestRequest {
            let study = self.records.get_study(STUDY_ID).expect("fixture study");
            let file = self.records.file(file_id).expect("registered file");
            self.orchestrator
                .planner()
                .request_for_upload(&study, &file, USER_EMAIL)
                .expect("plannable file")
        }
    }
}

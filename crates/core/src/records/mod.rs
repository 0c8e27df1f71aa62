//! Record store collaborator: studies, files, clusters, annotations and
//! differential expression results.
//!
//! The orchestrator needs only existence checks, field reads and
//! single-field updates. The one compare-and-set is the subsampling claim.

mod sqlite;
mod types;

pub use sqlite::SqliteRecordStore;
pub use types::*;

/// Trait for record storage.
pub trait RecordStore: Send + Sync {
    fn get_study(&self, study_id: &str) -> Result<Study, RecordError>;

    /// Returns `None` when the file no longer exists.
    fn get_file(&self, file_id: &str) -> Result<Option<StudyFile>, RecordError>;

    fn list_files(&self, study_id: &str) -> Result<Vec<StudyFile>, RecordError>;

    fn list_clusters(&self, study_id: &str) -> Result<Vec<ClusterGroup>, RecordError>;

    fn list_annotations(&self, study_id: &str) -> Result<Vec<Annotation>, RecordError>;

    fn list_de_results(&self, study_id: &str) -> Result<Vec<DeResultKey>, RecordError>;

    fn set_parse_status(&self, file_id: &str, status: ParseStatus) -> Result<(), RecordError>;

    /// Record (or clear) the cell metadata an AnnData bundle provides.
    fn set_bundled_metadata(&self, file_id: &str, location: Option<&str>) -> Result<(), RecordError>;

    /// Atomically set `is_subsampling` if it is clear and the cluster has not
    /// been subsampled yet. Returns `true` only for the caller that set it.
    fn try_claim_subsampling(&self, cluster_id: &str) -> Result<bool, RecordError>;

    /// Clear `is_subsampling`; mark the cluster subsampled when `succeeded`.
    fn finish_subsampling(&self, cluster_id: &str, succeeded: bool) -> Result<(), RecordError>;

    /// Remove everything `target` wrote, including entity rows.
    /// Returns the number of records removed.
    fn delete_partial_output(&self, target: &OutputTarget) -> Result<usize, RecordError>;

    /// Remove only the data rows written by a failed attempt so a retry can
    /// rewrite them. Entity rows and other actions' output are kept.
    fn prepare_for_retry(&self, target: &OutputTarget) -> Result<usize, RecordError>;

    /// Recompute the study's cell name index.
    fn rebuild_cell_index(&self, study_id: &str) -> Result<(), RecordError>;
}

impl StudySnapshot {
    /// Read a consistent-enough view of the study for chaining.
    pub fn load(store: &dyn RecordStore, study_id: &str) -> Result<Self, RecordError> {
        Ok(Self {
            study: store.get_study(study_id)?,
            files: store.list_files(study_id)?,
            clusters: store.list_clusters(study_id)?,
            annotations: store.list_annotations(study_id)?,
            de_results: store.list_de_results(study_id)?,
        })
    }
}

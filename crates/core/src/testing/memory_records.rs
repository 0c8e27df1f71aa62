//! In-memory record store for testing.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::ingest::Action;
use crate::records::{
    Annotation, AnnotationScope, ClusterGroup, DeResultKey, OutputTarget, ParseStatus,
    RecordError, RecordStore, Study, StudyFile,
};

#[derive(Debug, Default)]
struct Inner {
    studies: HashMap<String, Study>,
    files: Vec<StudyFile>,
    clusters: Vec<ClusterGroup>,
    annotations: Vec<Annotation>,
    /// `(study_id, file_id, key)`
    de_results: Vec<(String, String, DeResultKey)>,
    outputs: Vec<(String, OutputTarget)>,
    cell_index_rebuilds: HashMap<String, usize>,
    /// Operations whose next call fails, with the number of failures left.
    failing: HashMap<&'static str, u32>,
}

impl Inner {
    fn injected_failure(&mut self, operation: &'static str) -> Result<(), RecordError> {
        match self.failing.get_mut(operation) {
            Some(left) if *left > 0 => {
                *left -= 1;
                Err(RecordError::Database(format!("injected {} failure", operation)))
            }
            _ => Ok(()),
        }
    }
}

/// [`RecordStore`] backed by vectors behind one mutex.
///
/// Holding the mutex across check and set makes the subsampling claim
/// atomic, matching the single conditional UPDATE of the SQLite store.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    inner: Mutex<Inner>,
}

fn matches_target(target: &OutputTarget, candidate: &OutputTarget) -> bool {
    candidate.file_id == target.file_id
        && candidate.action == target.action
        && (target.name.is_none() || candidate.name == target.name)
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // a panicking test thread must not hide the data from the others
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert_study(&self, study: Study) {
        self.lock().studies.insert(study.id.clone(), study);
    }

    pub fn insert_file(&self, file: StudyFile) {
        self.lock().files.push(file);
    }

    pub fn insert_cluster(&self, cluster: ClusterGroup) {
        self.lock().clusters.push(cluster);
    }

    pub fn insert_annotation(&self, annotation: Annotation) {
        self.lock().annotations.push(annotation);
    }

    pub fn insert_de_result(&self, study_id: &str, file_id: &str, key: DeResultKey) {
        self.lock()
            .de_results
            .push((study_id.to_string(), file_id.to_string(), key));
    }

    /// Record a data row as if a job had written it.
    pub fn record_output(&self, study_id: &str, target: OutputTarget) {
        self.lock().outputs.push((study_id.to_string(), target));
    }

    pub fn count_outputs(&self, target: &OutputTarget) -> usize {
        self.lock()
            .outputs
            .iter()
            .filter(|(_, t)| matches_target(target, t))
            .count()
    }

    pub fn file(&self, file_id: &str) -> Option<StudyFile> {
        self.lock().files.iter().find(|f| f.id == file_id).cloned()
    }

    pub fn cluster(&self, cluster_id: &str) -> Option<ClusterGroup> {
        self.lock()
            .clusters
            .iter()
            .find(|c| c.id == cluster_id)
            .cloned()
    }

    pub fn mark_for_deletion(&self, file_id: &str) {
        if let Some(file) = self.lock().files.iter_mut().find(|f| f.id == file_id) {
            file.queued_for_deletion = true;
        }
    }

    pub fn set_validated_output(&self, file_id: &str, validated: bool) {
        if let Some(file) = self.lock().files.iter_mut().find(|f| f.id == file_id) {
            file.has_validated_output = validated;
        }
    }

    /// Make the next `count` calls of `operation` fail with a database error.
    ///
    /// Supported: `set_parse_status`, `try_claim_subsampling`.
    pub fn fail_next(&self, operation: &'static str, count: u32) {
        self.lock().failing.insert(operation, count);
    }

    pub fn cell_index_rebuilds(&self, study_id: &str) -> usize {
        self.lock()
            .cell_index_rebuilds
            .get(study_id)
            .copied()
            .unwrap_or(0)
    }
}

impl RecordStore for MemoryRecordStore {
    fn get_study(&self, study_id: &str) -> Result<Study, RecordError> {
        self.lock()
            .studies
            .get(study_id)
            .cloned()
            .ok_or_else(|| RecordError::StudyNotFound(study_id.to_string()))
    }

    fn get_file(&self, file_id: &str) -> Result<Option<StudyFile>, RecordError> {
        Ok(self.file(file_id))
    }

    fn list_files(&self, study_id: &str) -> Result<Vec<StudyFile>, RecordError> {
        Ok(self
            .lock()
            .files
            .iter()
            .filter(|f| f.study_id == study_id)
            .cloned()
            .collect())
    }

    fn list_clusters(&self, study_id: &str) -> Result<Vec<ClusterGroup>, RecordError> {
        Ok(self
            .lock()
            .clusters
            .iter()
            .filter(|c| c.study_id == study_id)
            .cloned()
            .collect())
    }

    fn list_annotations(&self, study_id: &str) -> Result<Vec<Annotation>, RecordError> {
        Ok(self
            .lock()
            .annotations
            .iter()
            .filter(|a| a.study_id == study_id)
            .cloned()
            .collect())
    }

    fn list_de_results(&self, study_id: &str) -> Result<Vec<DeResultKey>, RecordError> {
        Ok(self
            .lock()
            .de_results
            .iter()
            .filter(|(s, _, _)| s == study_id)
            .map(|(_, _, key)| key.clone())
            .collect())
    }

    fn set_parse_status(&self, file_id: &str, status: ParseStatus) -> Result<(), RecordError> {
        let mut inner = self.lock();
        inner.injected_failure("set_parse_status")?;
        let file = inner
            .files
            .iter_mut()
            .find(|f| f.id == file_id)
            .ok_or_else(|| RecordError::FileNotFound(file_id.to_string()))?;
        file.parse_status = status;
        Ok(())
    }

    fn set_bundled_metadata(&self, file_id: &str, location: Option<&str>) -> Result<(), RecordError> {
        let mut inner = self.lock();
        let file = inner
            .files
            .iter_mut()
            .find(|f| f.id == file_id)
            .ok_or_else(|| RecordError::FileNotFound(file_id.to_string()))?;
        file.bundled_metadata = location.map(str::to_string);
        Ok(())
    }

    fn try_claim_subsampling(&self, cluster_id: &str) -> Result<bool, RecordError> {
        let mut inner = self.lock();
        inner.injected_failure("try_claim_subsampling")?;
        match inner.clusters.iter_mut().find(|c| c.id == cluster_id) {
            Some(cluster) if !cluster.is_subsampling && !cluster.subsampled => {
                cluster.is_subsampling = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn finish_subsampling(&self, cluster_id: &str, succeeded: bool) -> Result<(), RecordError> {
        let mut inner = self.lock();
        let cluster = inner
            .clusters
            .iter_mut()
            .find(|c| c.id == cluster_id)
            .ok_or_else(|| RecordError::ClusterNotFound(cluster_id.to_string()))?;
        cluster.is_subsampling = false;
        cluster.subsampled |= succeeded;
        Ok(())
    }

    fn delete_partial_output(&self, target: &OutputTarget) -> Result<usize, RecordError> {
        let mut inner = self.lock();
        let before = inner.outputs.len();
        inner.outputs.retain(|(_, t)| !matches_target(target, t));
        let mut removed = before - inner.outputs.len();

        let name_matches =
            |name: &str| target.name.as_deref().map_or(true, |wanted| wanted == name);

        match target.action {
            Action::IngestCluster => {
                let doomed: Vec<String> = inner
                    .clusters
                    .iter()
                    .filter(|c| c.file_id == target.file_id && name_matches(&c.name))
                    .map(|c| c.id.clone())
                    .collect();
                let before = inner.annotations.len();
                inner.annotations.retain(|a| {
                    !(a.scope == AnnotationScope::Cluster
                        && a.cluster_id.as_ref().map_or(false, |id| doomed.contains(id)))
                });
                removed += before - inner.annotations.len();
                let before = inner.clusters.len();
                inner.clusters.retain(|c| !doomed.contains(&c.id));
                removed += before - inner.clusters.len();
            }
            Action::IngestCellMetadata => {
                let before = inner.annotations.len();
                inner.annotations.retain(|a| {
                    !(a.file_id == target.file_id && a.scope == AnnotationScope::Study)
                });
                removed += before - inner.annotations.len();
            }
            Action::IngestDifferentialExpression | Action::DifferentialExpression => {
                let before = inner.de_results.len();
                inner.de_results.retain(|(_, file_id, key)| {
                    !(file_id == &target.file_id && name_matches(&key.annotation_name))
                });
                removed += before - inner.de_results.len();
            }
            _ => {}
        }

        Ok(removed)
    }

    fn prepare_for_retry(&self, target: &OutputTarget) -> Result<usize, RecordError> {
        let mut inner = self.lock();
        let before = inner.outputs.len();
        inner.outputs.retain(|(_, t)| !matches_target(target, t));
        Ok(before - inner.outputs.len())
    }

    fn rebuild_cell_index(&self, study_id: &str) -> Result<(), RecordError> {
        let mut inner = self.lock();
        if !inner.studies.contains_key(study_id) {
            return Err(RecordError::StudyNotFound(study_id.to_string()));
        }
        *inner
            .cell_index_rebuilds
            .entry(study_id.to_string())
            .or_insert(0) += 1;
        Ok(())
    }
}

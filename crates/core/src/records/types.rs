//! Study, file, and derived-entity records read by the orchestrator.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ingest::Action;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("Study not found: {0}")]
    StudyNotFound(String),

    #[error("Study file not found: {0}")]
    FileNotFound(String),

    #[error("Cluster not found: {0}")]
    ClusterNotFound(String),

    #[error("Database error: {0}")]
    Database(String),
}

/// Kind of an uploaded study file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    ExpressionMatrix,
    MmCoordinateMatrix,
    Cluster,
    Metadata,
    AnnData,
    DifferentialExpression,
    Other,
}

impl FileKind {
    pub const ALL: [FileKind; 7] = [
        FileKind::ExpressionMatrix,
        FileKind::MmCoordinateMatrix,
        FileKind::Cluster,
        FileKind::Metadata,
        FileKind::AnnData,
        FileKind::DifferentialExpression,
        FileKind::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::ExpressionMatrix => "expression_matrix",
            FileKind::MmCoordinateMatrix => "mm_coordinate_matrix",
            FileKind::Cluster => "cluster",
            FileKind::Metadata => "metadata",
            FileKind::AnnData => "anndata",
            FileKind::DifferentialExpression => "differential_expression",
            FileKind::Other => "other",
        }
    }

    /// Dense or sparse expression matrix.
    pub fn is_matrix(&self) -> bool {
        matches!(self, FileKind::ExpressionMatrix | FileKind::MmCoordinateMatrix)
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileKind {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FileKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| RecordError::Database(format!("unknown file kind: {}", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseStatus {
    Unparsed,
    Parsing,
    Parsed,
    Failed,
}

impl ParseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseStatus::Unparsed => "unparsed",
            ParseStatus::Parsing => "parsing",
            ParseStatus::Parsed => "parsed",
            ParseStatus::Failed => "failed",
        }
    }
}

impl FromStr for ParseStatus {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unparsed" => Ok(ParseStatus::Unparsed),
            "parsing" => Ok(ParseStatus::Parsing),
            "parsed" => Ok(ParseStatus::Parsed),
            "failed" => Ok(ParseStatus::Failed),
            other => Err(RecordError::Database(format!("unknown parse status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Study {
    pub id: String,
    /// Public accession, e.g. "SCP123".
    pub accession: String,
    pub name: String,
    /// Workspace bucket holding every file of the study.
    pub bucket: String,
    pub owner_email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyFile {
    pub id: String,
    pub study_id: String,
    pub name: String,
    pub kind: FileKind,
    /// `gs://` URL of the object in the study bucket.
    pub location: String,
    /// Local copy awaiting push, if the upload has not reached the bucket yet.
    pub local_path: Option<PathBuf>,
    pub size_bytes: u64,
    pub raw_counts: bool,
    pub parse_status: ParseStatus,
    pub queued_for_deletion: bool,
    /// At least one record from this file passed validation inside its job.
    pub has_validated_output: bool,
    /// Bundled gene list for sparse matrices.
    pub genes_location: Option<String>,
    /// Bundled barcode list for sparse matrices.
    pub barcodes_location: Option<String>,
    /// Cell metadata extracted from an AnnData bundle, set once it is ingested.
    pub bundled_metadata: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl StudyFile {
    pub fn is_parsed(&self) -> bool {
        self.parse_status == ParseStatus::Parsed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterGroup {
    pub id: String,
    pub study_id: String,
    /// File the cluster was ingested from (a cluster file or an AnnData bundle).
    pub file_id: String,
    pub name: String,
    pub points: u64,
    /// Cluster coordinates as ingested, used as the subsample input.
    pub source_location: String,
    pub is_subsampling: bool,
    pub subsampled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationScope {
    Study,
    Cluster,
}

impl AnnotationScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnnotationScope::Study => "study",
            AnnotationScope::Cluster => "cluster",
        }
    }
}

impl FromStr for AnnotationScope {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "study" => Ok(AnnotationScope::Study),
            "cluster" => Ok(AnnotationScope::Cluster),
            other => Err(RecordError::Database(format!("unknown annotation scope: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationKind {
    Group,
    Numeric,
}

impl AnnotationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnnotationKind::Group => "group",
            AnnotationKind::Numeric => "numeric",
        }
    }
}

impl FromStr for AnnotationKind {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "group" => Ok(AnnotationKind::Group),
            "numeric" => Ok(AnnotationKind::Numeric),
            other => Err(RecordError::Database(format!("unknown annotation kind: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub study_id: String,
    /// Metadata or cluster file that defined the annotation.
    pub file_id: String,
    pub name: String,
    pub scope: AnnotationScope,
    /// Owning cluster for cluster-scoped annotations.
    pub cluster_id: Option<String>,
    pub kind: AnnotationKind,
    /// Distinct values for group annotations.
    pub values: Vec<String>,
}

/// Identity of an existing differential expression result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeResultKey {
    pub cluster_id: String,
    pub annotation_name: String,
    pub annotation_scope: AnnotationScope,
}

/// The slice of output written by one action for one file.
///
/// `name` narrows it further when several requests of the same action share
/// a file, e.g. one cluster per embedding of an AnnData bundle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputTarget {
    pub file_id: String,
    pub action: Action,
    pub name: Option<String>,
}

/// Point-in-time view of a study used for chaining decisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudySnapshot {
    pub study: Study,
    pub files: Vec<StudyFile>,
    pub clusters: Vec<ClusterGroup>,
    pub annotations: Vec<Annotation>,
    pub de_results: Vec<DeResultKey>,
}

impl StudySnapshot {
    pub fn file(&self, file_id: &str) -> Option<&StudyFile> {
        self.files.iter().find(|f| f.id == file_id)
    }

    /// Earliest parsed metadata file that is not being deleted.
    pub fn parsed_metadata(&self) -> Option<&StudyFile> {
        self.live_files()
            .filter(|f| f.kind == FileKind::Metadata && f.is_parsed())
            .min_by_key(|f| f.created_at)
    }

    /// Location of the study's ingested cell metadata.
    ///
    /// A standalone metadata file wins over metadata bundled in AnnData.
    pub fn metadata_location(&self) -> Option<&str> {
        if let Some(file) = self.parsed_metadata() {
            return Some(file.location.as_str());
        }
        self.live_files()
            .filter(|f| f.kind == FileKind::AnnData)
            .filter_map(|f| f.bundled_metadata.as_deref().map(|loc| (f.created_at, loc)))
            .min_by_key(|(created_at, _)| *created_at)
            .map(|(_, loc)| loc)
    }

    /// Earliest parsed raw-counts matrix that is not being deleted.
    pub fn parsed_raw_matrix(&self) -> Option<&StudyFile> {
        self.live_files()
            .filter(|f| f.kind.is_matrix() && f.raw_counts && f.is_parsed())
            .min_by_key(|f| f.created_at)
    }

    pub fn clusters_for_file<'a>(
        &'a self,
        file_id: &'a str,
    ) -> impl Iterator<Item = &'a ClusterGroup> + 'a {
        self.clusters.iter().filter(move |c| c.file_id == file_id)
    }

    pub fn has_de_result(&self, cluster_id: &str, annotation: &Annotation) -> bool {
        self.de_results.iter().any(|r| {
            r.cluster_id == cluster_id
                && r.annotation_name == annotation.name
                && r.annotation_scope == annotation.scope
        })
    }

    fn live_files(&self) -> impl Iterator<Item = &StudyFile> {
        self.files.iter().filter(|f| !f.queued_for_deletion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_kind_round_trips_through_str() {
        for kind in FileKind::ALL {
            assert_eq!(kind.as_str().parse::<FileKind>().unwrap(), kind);
        }
        assert!("bam".parse::<FileKind>().is_err());
    }

    #[test]
    fn test_parse_status_serializes_snake_case() {
        let json = serde_json::to_string(&ParseStatus::Parsing).unwrap();
        assert_eq!(json, "\"parsing\"");
    }

    fn snapshot_file(id: &str, kind: FileKind, minutes_ago: i64) -> StudyFile {
        StudyFile {
            id: id.to_string(),
            study_id: "study-1".to_string(),
            name: id.to_string(),
            kind,
            location: format!("gs://fc-1234/{}", id),
            local_path: None,
            size_bytes: 0,
            raw_counts: false,
            parse_status: ParseStatus::Parsed,
            queued_for_deletion: false,
            has_validated_output: false,
            genes_location: None,
            barcodes_location: None,
            bundled_metadata: None,
            created_at: Utc::now() - chrono::Duration::minutes(minutes_ago),
        }
    }

    fn snapshot(files: Vec<StudyFile>, clusters: Vec<ClusterGroup>) -> StudySnapshot {
        StudySnapshot {
            study: Study {
                id: "study-1".to_string(),
                accession: "SCP1".to_string(),
                name: "Retina atlas".to_string(),
                bucket: "fc-1234".to_string(),
                owner_email: "owner@example.org".to_string(),
            },
            files,
            clusters,
            annotations: vec![],
            de_results: vec![],
        }
    }

    #[test]
    fn test_metadata_location_prefers_metadata_file() {
        let mut bundle = snapshot_file("h5ad", FileKind::AnnData, 30);
        bundle.bundled_metadata = Some("gs://fc-1234/h5ad_frag.metadata.tsv".to_string());
        let metadata = snapshot_file("meta.tsv", FileKind::Metadata, 10);

        let snap = snapshot(vec![bundle.clone(), metadata], vec![]);
        assert_eq!(snap.metadata_location(), Some("gs://fc-1234/meta.tsv"));

        let snap = snapshot(vec![bundle], vec![]);
        assert_eq!(
            snap.metadata_location(),
            Some("gs://fc-1234/h5ad_frag.metadata.tsv")
        );
    }

    #[test]
    fn test_metadata_location_ignores_unextracted_and_deleted_bundles() {
        let plain = snapshot_file("h5ad-a", FileKind::AnnData, 30);
        let mut deleted = snapshot_file("h5ad-b", FileKind::AnnData, 20);
        deleted.bundled_metadata = Some("gs://fc-1234/b.tsv".to_string());
        deleted.queued_for_deletion = true;

        let snap = snapshot(vec![plain, deleted], vec![]);
        assert_eq!(snap.metadata_location(), None);
    }

    #[test]
    fn test_clusters_for_file() {
        let cluster = |id: &str, file_id: &str| ClusterGroup {
            id: id.to_string(),
            study_id: "study-1".to_string(),
            file_id: file_id.to_string(),
            name: id.to_string(),
            points: 10,
            source_location: format!("gs://fc-1234/{}", file_id),
            is_subsampling: false,
            subsampled: false,
        };
        let snap = snapshot(vec![], vec![cluster("c1", "f1"), cluster("c2", "f2"), cluster("c3", "f1")]);
        let file_id = String::from("f1");
        let ids: Vec<&str> = snap.clusters_for_file(&file_id).map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c3"]);
    }

    #[test]
    fn test_is_matrix() {
        assert!(FileKind::ExpressionMatrix.is_matrix());
        assert!(FileKind::MmCoordinateMatrix.is_matrix());
        assert!(!FileKind::AnnData.is_matrix());
        assert!(!FileKind::Cluster.is_matrix());
    }
}

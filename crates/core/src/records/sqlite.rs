//! SQLite-backed record store.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{
    Annotation, ClusterGroup, DeResultKey, OutputTarget, ParseStatus, RecordError, RecordStore,
    Study, StudyFile,
};
use crate::ingest::Action;

/// SQLite-backed record store.
pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
}

fn db_err(e: impl std::fmt::Display) -> RecordError {
    RecordError::Database(e.to_string())
}

impl SqliteRecordStore {
    /// Create a new store, creating the database file and tables if needed.
    pub fn new(path: &Path) -> Result<Self, RecordError> {
        let conn = Connection::open(path).map_err(db_err)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (useful for testing).
    pub fn in_memory() -> Result<Self, RecordError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), RecordError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS studies (
                id TEXT PRIMARY KEY,
                accession TEXT NOT NULL,
                name TEXT NOT NULL,
                bucket TEXT NOT NULL,
                owner_email TEXT NOT NULL,
                cell_index_rebuilt_at TEXT
            );

            CREATE TABLE IF NOT EXISTS study_files (
                id TEXT PRIMARY KEY,
                study_id TEXT NOT NULL REFERENCES studies(id),
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                location TEXT NOT NULL,
                local_path TEXT,
                size_bytes INTEGER NOT NULL DEFAULT 0,
                raw_counts INTEGER NOT NULL DEFAULT 0,
                parse_status TEXT NOT NULL DEFAULT 'unparsed',
                queued_for_deletion INTEGER NOT NULL DEFAULT 0,
                has_validated_output INTEGER NOT NULL DEFAULT 0,
                genes_location TEXT,
                barcodes_location TEXT,
                bundled_metadata TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_study_files_study ON study_files(study_id);

            CREATE TABLE IF NOT EXISTS clusters (
                id TEXT PRIMARY KEY,
                study_id TEXT NOT NULL,
                file_id TEXT NOT NULL,
                name TEXT NOT NULL,
                points INTEGER NOT NULL,
                source_location TEXT NOT NULL,
                is_subsampling INTEGER NOT NULL DEFAULT 0,
                subsampled INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_clusters_study ON clusters(study_id);

            CREATE TABLE IF NOT EXISTS annotations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                study_id TEXT NOT NULL,
                file_id TEXT NOT NULL,
                name TEXT NOT NULL,
                scope TEXT NOT NULL,
                cluster_id TEXT,
                kind TEXT NOT NULL,
                values_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_annotations_study ON annotations(study_id);

            CREATE TABLE IF NOT EXISTS de_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                study_id TEXT NOT NULL,
                file_id TEXT NOT NULL,
                cluster_id TEXT NOT NULL,
                annotation_name TEXT NOT NULL,
                annotation_scope TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_de_results_study ON de_results(study_id);

            -- Data rows written by jobs (gene arrays, cell arrays, coordinates)
            CREATE TABLE IF NOT EXISTS output_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                study_id TEXT NOT NULL,
                file_id TEXT NOT NULL,
                action TEXT NOT NULL,
                name TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_output_records_file ON output_records(file_id, action);
            "#,
        )
        .map_err(db_err)?;

        Ok(())
    }

    pub fn insert_study(&self, study: &Study) -> Result<(), RecordError> {
        let conn = self.conn.lock().map_err(db_err)?;
        conn.execute(
            "INSERT INTO studies (id, accession, name, bucket, owner_email) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![study.id, study.accession, study.name, study.bucket, study.owner_email],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn insert_file(&self, file: &StudyFile) -> Result<(), RecordError> {
        let conn = self.conn.lock().map_err(db_err)?;
        conn.execute(
            "INSERT INTO study_files (id, study_id, name, kind, location, local_path, size_bytes,
                raw_counts, parse_status, queued_for_deletion, has_validated_output,
                genes_location, barcodes_location, bundled_metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                file.id,
                file.study_id,
                file.name,
                file.kind.as_str(),
                file.location,
                file.local_path.as_ref().map(|p| p.display().to_string()),
                file.size_bytes as i64,
                file.raw_counts,
                file.parse_status.as_str(),
                file.queued_for_deletion,
                file.has_validated_output,
                file.genes_location,
                file.barcodes_location,
                file.bundled_metadata,
                file.created_at.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn insert_cluster(&self, cluster: &ClusterGroup) -> Result<(), RecordError> {
        let conn = self.conn.lock().map_err(db_err)?;
        conn.execute(
            "INSERT INTO clusters (id, study_id, file_id, name, points, source_location, is_subsampling, subsampled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                cluster.id,
                cluster.study_id,
                cluster.file_id,
                cluster.name,
                cluster.points as i64,
                cluster.source_location,
                cluster.is_subsampling,
                cluster.subsampled,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn insert_annotation(&self, annotation: &Annotation) -> Result<(), RecordError> {
        let values_json = serde_json::to_string(&annotation.values).map_err(db_err)?;
        let conn = self.conn.lock().map_err(db_err)?;
        conn.execute(
            "INSERT INTO annotations (study_id, file_id, name, scope, cluster_id, kind, values_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                annotation.study_id,
                annotation.file_id,
                annotation.name,
                annotation.scope.as_str(),
                annotation.cluster_id,
                annotation.kind.as_str(),
                values_json,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn insert_de_result(
        &self,
        study_id: &str,
        file_id: &str,
        key: &DeResultKey,
    ) -> Result<(), RecordError> {
        let conn = self.conn.lock().map_err(db_err)?;
        conn.execute(
            "INSERT INTO de_results (study_id, file_id, cluster_id, annotation_name, annotation_scope)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                study_id,
                file_id,
                key.cluster_id,
                key.annotation_name,
                key.annotation_scope.as_str()
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Record a data row written by a job.
    pub fn record_output(&self, study_id: &str, target: &OutputTarget) -> Result<(), RecordError> {
        let conn = self.conn.lock().map_err(db_err)?;
        conn.execute(
            "INSERT INTO output_records (study_id, file_id, action, name, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                study_id,
                target.file_id,
                target.action.as_str(),
                target.name,
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn count_outputs(&self, target: &OutputTarget) -> Result<usize, RecordError> {
        let conn = self.conn.lock().map_err(db_err)?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM output_records
                 WHERE file_id = ?1 AND action = ?2 AND (?3 IS NULL OR name = ?3)",
                params![target.file_id, target.action.as_str(), target.name],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(count as usize)
    }

    pub fn mark_for_deletion(&self, file_id: &str) -> Result<(), RecordError> {
        self.update_file_flag(file_id, "queued_for_deletion", true)
    }

    pub fn set_validated_output(&self, file_id: &str, validated: bool) -> Result<(), RecordError> {
        self.update_file_flag(file_id, "has_validated_output", validated)
    }

    /// When the cell index was last rebuilt for a study.
    pub fn cell_index_rebuilt_at(
        &self,
        study_id: &str,
    ) -> Result<Option<DateTime<Utc>>, RecordError> {
        let conn = self.conn.lock().map_err(db_err)?;
        let value: Option<Option<String>> = conn
            .query_row(
                "SELECT cell_index_rebuilt_at FROM studies WHERE id = ?1",
                params![study_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;

        let raw = value.ok_or_else(|| RecordError::StudyNotFound(study_id.to_string()))?;
        Ok(raw.and_then(|s| parse_timestamp(&s)))
    }

    fn update_file_flag(&self, file_id: &str, column: &str, value: bool) -> Result<(), RecordError> {
        let conn = self.conn.lock().map_err(db_err)?;
        let sql = format!("UPDATE study_files SET {} = ?1 WHERE id = ?2", column);
        let changed = conn.execute(&sql, params![value, file_id]).map_err(db_err)?;
        if changed == 0 {
            return Err(RecordError::FileNotFound(file_id.to_string()));
        }
        Ok(())
    }

    fn row_to_file(row: &rusqlite::Row) -> rusqlite::Result<StudyFile> {
        let kind: String = row.get(3)?;
        let local_path: Option<String> = row.get(5)?;
        let size_bytes: i64 = row.get(6)?;
        let parse_status: String = row.get(8)?;
        let created_at: String = row.get(14)?;

        Ok(StudyFile {
            id: row.get(0)?,
            study_id: row.get(1)?,
            name: row.get(2)?,
            kind: kind.parse().map_err(|e| conversion_err(3, e))?,
            location: row.get(4)?,
            local_path: local_path.map(Into::into),
            size_bytes: size_bytes.max(0) as u64,
            raw_counts: row.get(7)?,
            parse_status: parse_status.parse().map_err(|e| conversion_err(8, e))?,
            queued_for_deletion: row.get(9)?,
            has_validated_output: row.get(10)?,
            genes_location: row.get(11)?,
            barcodes_location: row.get(12)?,
            bundled_metadata: row.get(13)?,
            created_at: parse_timestamp(&created_at).unwrap_or_else(Utc::now),
        })
    }

    fn row_to_cluster(row: &rusqlite::Row) -> rusqlite::Result<ClusterGroup> {
        let points: i64 = row.get(4)?;
        Ok(ClusterGroup {
            id: row.get(0)?,
            study_id: row.get(1)?,
            file_id: row.get(2)?,
            name: row.get(3)?,
            points: points.max(0) as u64,
            source_location: row.get(5)?,
            is_subsampling: row.get(6)?,
            subsampled: row.get(7)?,
        })
    }
}

const FILE_COLUMNS: &str = "id, study_id, name, kind, location, local_path, size_bytes, raw_counts,
    parse_status, queued_for_deletion, has_validated_output, genes_location, barcodes_location, bundled_metadata,
    created_at";

const CLUSTER_COLUMNS: &str =
    "id, study_id, file_id, name, points, source_location, is_subsampling, subsampled";

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

fn conversion_err(column: usize, e: RecordError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
}

impl RecordStore for SqliteRecordStore {
    fn get_study(&self, study_id: &str) -> Result<Study, RecordError> {
        let conn = self.conn.lock().map_err(db_err)?;
        conn.query_row(
            "SELECT id, accession, name, bucket, owner_email FROM studies WHERE id = ?1",
            params![study_id],
            |row| {
                Ok(Study {
                    id: row.get(0)?,
                    accession: row.get(1)?,
                    name: row.get(2)?,
                    bucket: row.get(3)?,
                    owner_email: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(db_err)?
        .ok_or_else(|| RecordError::StudyNotFound(study_id.to_string()))
    }

    fn get_file(&self, file_id: &str) -> Result<Option<StudyFile>, RecordError> {
        let conn = self.conn.lock().map_err(db_err)?;
        let sql = format!("SELECT {} FROM study_files WHERE id = ?1", FILE_COLUMNS);
        conn.query_row(&sql, params![file_id], Self::row_to_file)
            .optional()
            .map_err(db_err)
    }

    fn list_files(&self, study_id: &str) -> Result<Vec<StudyFile>, RecordError> {
        let conn = self.conn.lock().map_err(db_err)?;
        let sql = format!(
            "SELECT {} FROM study_files WHERE study_id = ?1 ORDER BY created_at",
            FILE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params![study_id], Self::row_to_file)
            .map_err(db_err)?;

        let mut files = Vec::new();
        for row in rows {
            files.push(row.map_err(db_err)?);
        }
        Ok(files)
    }

    fn list_clusters(&self, study_id: &str) -> Result<Vec<ClusterGroup>, RecordError> {
        let conn = self.conn.lock().map_err(db_err)?;
        let sql = format!(
            "SELECT {} FROM clusters WHERE study_id = ?1 ORDER BY name",
            CLUSTER_COLUMNS
        );
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params![study_id], Self::row_to_cluster)
            .map_err(db_err)?;

        let mut clusters = Vec::new();
        for row in rows {
            clusters.push(row.map_err(db_err)?);
        }
        Ok(clusters)
    }

    fn list_annotations(&self, study_id: &str) -> Result<Vec<Annotation>, RecordError> {
        let conn = self.conn.lock().map_err(db_err)?;
        let mut stmt = conn
            .prepare(
                "SELECT study_id, file_id, name, scope, cluster_id, kind, values_json
                 FROM annotations WHERE study_id = ?1 ORDER BY id",
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map(params![study_id], |row| {
                let scope: String = row.get(3)?;
                let kind: String = row.get(5)?;
                let values_json: String = row.get(6)?;
                Ok(Annotation {
                    study_id: row.get(0)?,
                    file_id: row.get(1)?,
                    name: row.get(2)?,
                    scope: scope.parse().map_err(|e| conversion_err(3, e))?,
                    cluster_id: row.get(4)?,
                    kind: kind.parse().map_err(|e| conversion_err(5, e))?,
                    values: serde_json::from_str(&values_json).unwrap_or_default(),
                })
            })
            .map_err(db_err)?;

        let mut annotations = Vec::new();
        for row in rows {
            annotations.push(row.map_err(db_err)?);
        }
        Ok(annotations)
    }

    fn list_de_results(&self, study_id: &str) -> Result<Vec<DeResultKey>, RecordError> {
        let conn = self.conn.lock().map_err(db_err)?;
        let mut stmt = conn
            .prepare(
                "SELECT cluster_id, annotation_name, annotation_scope
                 FROM de_results WHERE study_id = ?1 ORDER BY id",
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map(params![study_id], |row| {
                let scope: String = row.get(2)?;
                Ok(DeResultKey {
                    cluster_id: row.get(0)?,
                    annotation_name: row.get(1)?,
                    annotation_scope: scope.parse().map_err(|e| conversion_err(2, e))?,
                })
            })
            .map_err(db_err)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row.map_err(db_err)?);
        }
        Ok(results)
    }

    fn set_parse_status(&self, file_id: &str, status: ParseStatus) -> Result<(), RecordError> {
        let conn = self.conn.lock().map_err(db_err)?;
        let changed = conn
            .execute(
                "UPDATE study_files SET parse_status = ?1 WHERE id = ?2",
                params![status.as_str(), file_id],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(RecordError::FileNotFound(file_id.to_string()));
        }
        Ok(())
    }

    fn set_bundled_metadata(&self, file_id: &str, location: Option<&str>) -> Result<(), RecordError> {
        let conn = self.conn.lock().map_err(db_err)?;
        let changed = conn
            .execute(
                "UPDATE study_files SET bundled_metadata = ?1 WHERE id = ?2",
                params![location, file_id],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(RecordError::FileNotFound(file_id.to_string()));
        }
        Ok(())
    }

    fn try_claim_subsampling(&self, cluster_id: &str) -> Result<bool, RecordError> {
        let conn = self.conn.lock().map_err(db_err)?;
        let changed = conn
            .execute(
                "UPDATE clusters SET is_subsampling = 1
                 WHERE id = ?1 AND is_subsampling = 0 AND subsampled = 0",
                params![cluster_id],
            )
            .map_err(db_err)?;
        Ok(changed == 1)
    }

    fn finish_subsampling(&self, cluster_id: &str, succeeded: bool) -> Result<(), RecordError> {
        let conn = self.conn.lock().map_err(db_err)?;
        let changed = conn
            .execute(
                "UPDATE clusters SET is_subsampling = 0, subsampled = (subsampled OR ?1) WHERE id = ?2",
                params![succeeded, cluster_id],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(RecordError::ClusterNotFound(cluster_id.to_string()));
        }
        Ok(())
    }

    fn delete_partial_output(&self, target: &OutputTarget) -> Result<usize, RecordError> {
        let mut conn = self.conn.lock().map_err(db_err)?;
        let tx = conn.transaction().map_err(db_err)?;

        let mut removed = tx
            .execute(
                "DELETE FROM output_records
                 WHERE file_id = ?1 AND action = ?2 AND (?3 IS NULL OR name = ?3)",
                params![target.file_id, target.action.as_str(), target.name],
            )
            .map_err(db_err)?;

        match target.action {
            Action::IngestCluster => {
                removed += tx
                    .execute(
                        "DELETE FROM annotations WHERE scope = 'cluster' AND cluster_id IN
                            (SELECT id FROM clusters WHERE file_id = ?1 AND (?2 IS NULL OR name = ?2))",
                        params![target.file_id, target.name],
                    )
                    .map_err(db_err)?;
                removed += tx
                    .execute(
                        "DELETE FROM clusters WHERE file_id = ?1 AND (?2 IS NULL OR name = ?2)",
                        params![target.file_id, target.name],
                    )
                    .map_err(db_err)?;
            }
            Action::IngestCellMetadata => {
                removed += tx
                    .execute(
                        "DELETE FROM annotations WHERE file_id = ?1 AND scope = 'study'",
                        params![target.file_id],
                    )
                    .map_err(db_err)?;
            }
            Action::IngestDifferentialExpression | Action::DifferentialExpression => {
                removed += tx
                    .execute(
                        "DELETE FROM de_results WHERE file_id = ?1 AND (?2 IS NULL OR annotation_name = ?2)",
                        params![target.file_id, target.name],
                    )
                    .map_err(db_err)?;
            }
            _ => {}
        }

        tx.commit().map_err(db_err)?;
        Ok(removed)
    }

    fn prepare_for_retry(&self, target: &OutputTarget) -> Result<usize, RecordError> {
        let conn = self.conn.lock().map_err(db_err)?;
        conn.execute(
            "DELETE FROM output_records
             WHERE file_id = ?1 AND action = ?2 AND (?3 IS NULL OR name = ?3)",
            params![target.file_id, target.action.as_str(), target.name],
        )
        .map_err(db_err)
    }

    fn rebuild_cell_index(&self, study_id: &str) -> Result<(), RecordError> {
        let conn = self.conn.lock().map_err(db_err)?;
        let changed = conn
            .execute(
                "UPDATE studies SET cell_index_rebuilt_at = ?1 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), study_id],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(RecordError::StudyNotFound(study_id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{AnnotationKind, AnnotationScope, FileKind};

    fn create_test_store() -> SqliteRecordStore {
        let store = SqliteRecordStore::in_memory().unwrap();
        store
            .insert_study(&Study {
                id: "study-1".to_string(),
                accession: "SCP1".to_string(),
                name: "Retina atlas".to_string(),
                bucket: "fc-1234".to_string(),
                owner_email: "owner@example.org".to_string(),
            })
            .unwrap();
        store
    }

    fn file(id: &str, kind: FileKind) -> StudyFile {
        StudyFile {
            id: id.to_string(),
            study_id: "study-1".to_string(),
            name: format!("{}.txt", id),
            kind,
            location: format!("gs://fc-1234/{}.txt", id),
            local_path: None,
            size_bytes: 1024,
            raw_counts: false,
            parse_status: ParseStatus::Unparsed,
            queued_for_deletion: false,
            has_validated_output: false,
            genes_location: None,
            barcodes_location: None,
            bundled_metadata: None,
            created_at: Utc::now(),
        }
    }

    fn cluster(id: &str, file_id: &str, name: &str) -> ClusterGroup {
        ClusterGroup {
            id: id.to_string(),
            study_id: "study-1".to_string(),
            file_id: file_id.to_string(),
            name: name.to_string(),
            points: 5000,
            source_location: format!("gs://fc-1234/{}.txt", file_id),
            is_subsampling: false,
            subsampled: false,
        }
    }

    #[test]
    fn test_get_study_not_found() {
        let store = create_test_store();
        assert!(matches!(
            store.get_study("missing"),
            Err(RecordError::StudyNotFound(_))
        ));
    }

    #[test]
    fn test_file_round_trip_and_parse_status() {
        let store = create_test_store();
        let mut f = file("matrix-1", FileKind::MmCoordinateMatrix);
        f.raw_counts = true;
        f.genes_location = Some("gs://fc-1234/genes.tsv".to_string());
        store.insert_file(&f).unwrap();

        let loaded = store.get_file("matrix-1").unwrap().unwrap();
        assert_eq!(loaded.kind, FileKind::MmCoordinateMatrix);
        assert!(loaded.raw_counts);
        assert_eq!(loaded.genes_location.as_deref(), Some("gs://fc-1234/genes.tsv"));

        store.set_parse_status("matrix-1", ParseStatus::Parsing).unwrap();
        let loaded = store.get_file("matrix-1").unwrap().unwrap();
        assert_eq!(loaded.parse_status, ParseStatus::Parsing);

        assert!(store.get_file("nope").unwrap().is_none());
        assert!(matches!(
            store.set_parse_status("nope", ParseStatus::Parsed),
            Err(RecordError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_bundled_metadata_round_trip() {
        let store = create_test_store();
        store.insert_file(&file("h5ad-1", FileKind::AnnData)).unwrap();
        assert_eq!(store.get_file("h5ad-1").unwrap().unwrap().bundled_metadata, None);

        let location = "gs://fc-1234/_scp_internal/anndata_ingest/h5ad-1/h5ad_frag.metadata.tsv";
        store.set_bundled_metadata("h5ad-1", Some(location)).unwrap();
        let loaded = store.get_file("h5ad-1").unwrap().unwrap();
        assert_eq!(loaded.bundled_metadata.as_deref(), Some(location));

        store.set_bundled_metadata("h5ad-1", None).unwrap();
        assert_eq!(store.get_file("h5ad-1").unwrap().unwrap().bundled_metadata, None);
        assert!(matches!(
            store.set_bundled_metadata("nope", None),
            Err(RecordError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_try_claim_subsampling_once() {
        let store = create_test_store();
        store.insert_cluster(&cluster("c1", "cluster-1", "UMAP")).unwrap();

        assert!(store.try_claim_subsampling("c1").unwrap());
        assert!(!store.try_claim_subsampling("c1").unwrap());

        store.finish_subsampling("c1", false).unwrap();
        assert!(store.try_claim_subsampling("c1").unwrap());

        store.finish_subsampling("c1", true).unwrap();
        assert!(!store.try_claim_subsampling("c1").unwrap());
        let clusters = store.list_clusters("study-1").unwrap();
        assert!(clusters[0].subsampled);
        assert!(!clusters[0].is_subsampling);
    }

    #[test]
    fn test_claim_unknown_cluster_is_false() {
        let store = create_test_store();
        assert!(!store.try_claim_subsampling("ghost").unwrap());
    }

    #[test]
    fn test_delete_partial_output_is_selective() {
        let store = create_test_store();
        store.insert_file(&file("anndata-1", FileKind::AnnData)).unwrap();
        store.insert_cluster(&cluster("c-umap", "anndata-1", "X_umap")).unwrap();
        store.insert_cluster(&cluster("c-tsne", "anndata-1", "X_tsne")).unwrap();

        let umap = OutputTarget {
            file_id: "anndata-1".to_string(),
            action: Action::IngestCluster,
            name: Some("X_umap".to_string()),
        };
        let tsne = OutputTarget {
            name: Some("X_tsne".to_string()),
            ..umap.clone()
        };
        store.record_output("study-1", &umap).unwrap();
        store.record_output("study-1", &tsne).unwrap();

        let removed = store.delete_partial_output(&umap).unwrap();
        assert_eq!(removed, 2);

        let clusters = store.list_clusters("study-1").unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].name, "X_tsne");
        assert_eq!(store.count_outputs(&tsne).unwrap(), 1);
    }

    #[test]
    fn test_prepare_for_retry_keeps_entities() {
        let store = create_test_store();
        store.insert_file(&file("meta-1", FileKind::Metadata)).unwrap();
        store
            .insert_annotation(&Annotation {
                study_id: "study-1".to_string(),
                file_id: "meta-1".to_string(),
                name: "cell_type".to_string(),
                scope: AnnotationScope::Study,
                cluster_id: None,
                kind: AnnotationKind::Group,
                values: vec!["B".to_string(), "T".to_string()],
            })
            .unwrap();
        let target = OutputTarget {
            file_id: "meta-1".to_string(),
            action: Action::IngestCellMetadata,
            name: None,
        };
        store.record_output("study-1", &target).unwrap();
        store.record_output("study-1", &target).unwrap();

        assert_eq!(store.prepare_for_retry(&target).unwrap(), 2);
        assert_eq!(store.count_outputs(&target).unwrap(), 0);
        assert_eq!(store.list_annotations("study-1").unwrap().len(), 1);
    }

    #[test]
    fn test_de_results_and_cell_index() {
        let store = create_test_store();
        let key = DeResultKey {
            cluster_id: "c1".to_string(),
            annotation_name: "cell_type".to_string(),
            annotation_scope: AnnotationScope::Study,
        };
        store.insert_de_result("study-1", "cluster-1", &key).unwrap();
        assert_eq!(store.list_de_results("study-1").unwrap(), vec![key]);

        assert!(store.cell_index_rebuilt_at("study-1").unwrap().is_none());
        store.rebuild_cell_index("study-1").unwrap();
        assert!(store.cell_index_rebuilt_at("study-1").unwrap().is_some());
    }

    #[test]
    fn test_mark_for_deletion() {
        let store = create_test_store();
        store.insert_file(&file("cluster-1", FileKind::Cluster)).unwrap();
        store.mark_for_deletion("cluster-1").unwrap();
        assert!(store.get_file("cluster-1").unwrap().unwrap().queued_for_deletion);
    }
}

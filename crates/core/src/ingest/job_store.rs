//! Persistent store for requests, their runs and the next due step.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{IngestRequest, JobRun, Step};

#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Request not found: {0}")]
    NotFound(String),

    #[error("Request already exists: {0}")]
    AlreadyExists(String),
}

/// A step whose due time has passed, claimed for execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedStep {
    pub request: IngestRequest,
    pub run: JobRun,
    pub step: Step,
}

/// Request counts by scheduling state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    /// Waiting for their next step to come due.
    pub scheduled: usize,
    /// Claimed by a scheduler tick and not yet written back.
    pub running: usize,
    /// Finished with any outcome.
    pub completed: usize,
}

/// Storage for the scheduler.
///
/// Every request has at most one scheduled step. Completing a request
/// removes its step and records the outcome.
pub trait JobStore: Send + Sync {
    /// Persist a new request with its first step.
    fn insert(
        &self,
        request: &IngestRequest,
        run: &JobRun,
        step: Step,
        due_at: DateTime<Utc>,
    ) -> Result<(), JobStoreError>;

    fn get(&self, request_id: &str) -> Result<Option<(IngestRequest, JobRun)>, JobStoreError>;

    fn save_run(&self, run: &JobRun) -> Result<(), JobStoreError>;

    /// Set the request's next step and release its claim.
    fn schedule(&self, request_id: &str, step: Step, due_at: DateTime<Utc>)
        -> Result<(), JobStoreError>;

    /// Drop the request's step and record how it ended.
    fn complete(&self, request_id: &str, outcome: &str) -> Result<(), JobStoreError>;

    /// Outcome recorded by [`JobStore::complete`], if any.
    fn outcome(&self, request_id: &str) -> Result<Option<String>, JobStoreError>;

    /// Claim up to `limit` unclaimed steps due at or before `now`, oldest first.
    fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ClaimedStep>, JobStoreError>;

    /// Release every claim. Used on startup, when no step can be running.
    fn release_claims(&self) -> Result<usize, JobStoreError>;

    fn counts(&self) -> Result<JobCounts, JobStoreError>;
}

/// SQLite-backed job store.
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

fn db_err(e: impl std::fmt::Display) -> JobStoreError {
    JobStoreError::Database(e.to_string())
}

fn ser_err(e: serde_json::Error) -> JobStoreError {
    JobStoreError::Serialization(e.to_string())
}

impl SqliteJobStore {
    /// Create a new store, creating the database file and tables if needed.
    pub fn new(path: &Path) -> Result<Self, JobStoreError> {
        let conn = Connection::open(path).map_err(db_err)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self, JobStoreError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), JobStoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS requests (
                id TEXT PRIMARY KEY,
                study_id TEXT NOT NULL,
                file_id TEXT NOT NULL,
                action TEXT NOT NULL,
                data TEXT NOT NULL,
                outcome TEXT,
                created_at TEXT NOT NULL,
                finished_at TEXT
            );

            CREATE TABLE IF NOT EXISTS runs (
                request_id TEXT PRIMARY KEY REFERENCES requests(id),
                state TEXT NOT NULL,
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS scheduled_steps (
                request_id TEXT PRIMARY KEY REFERENCES requests(id),
                step TEXT NOT NULL,
                due_at INTEGER NOT NULL,
                claimed INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_requests_file ON requests(file_id);
            CREATE INDEX IF NOT EXISTS idx_scheduled_steps_due ON scheduled_steps(claimed, due_at);
            "#,
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, JobStoreError> {
        self.conn
            .lock()
            .map_err(|_| JobStoreError::Database("job store connection poisoned".to_string()))
    }

    fn load(conn: &Connection, request_id: &str) -> Result<Option<(IngestRequest, JobRun)>, JobStoreError> {
        let row = conn
            .query_row(
                "SELECT r.data, j.data FROM requests r JOIN runs j ON j.request_id = r.id WHERE r.id = ?1",
                params![request_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .map_err(db_err)?;

        match row {
            Some((request_json, run_json)) => {
                let request: IngestRequest = serde_json::from_str(&request_json).map_err(ser_err)?;
                let run: JobRun = serde_json::from_str(&run_json).map_err(ser_err)?;
                Ok(Some((request, run)))
            }
            None => Ok(None),
        }
    }
}

impl JobStore for SqliteJobStore {
    fn insert(
        &self,
        request: &IngestRequest,
        run: &JobRun,
        step: Step,
        due_at: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let mut conn = self.lock()?;
        let request_json = serde_json::to_string(request).map_err(ser_err)?;
        let run_json = serde_json::to_string(run).map_err(ser_err)?;
        let now = Utc::now().to_rfc3339();

        let tx = conn.transaction().map_err(db_err)?;
        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO requests (id, study_id, file_id, action, data, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    request.id,
                    request.study_id,
                    request.file_id,
                    request.action().as_str(),
                    request_json,
                    request.created_at.to_rfc3339(),
                ],
            )
            .map_err(db_err)?;
        if inserted == 0 {
            return Err(JobStoreError::AlreadyExists(request.id.clone()));
        }
        tx.execute(
            "INSERT INTO runs (request_id, state, data, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![request.id, run.state.as_str(), run_json, now],
        )
        .map_err(db_err)?;
        tx.execute(
            "INSERT INTO scheduled_steps (request_id, step, due_at) VALUES (?1, ?2, ?3)",
            params![request.id, step.as_str(), due_at.timestamp_millis()],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)
    }

    fn get(&self, request_id: &str) -> Result<Option<(IngestRequest, JobRun)>, JobStoreError> {
        let conn = self.lock()?;
        Self::load(&conn, request_id)
    }

    fn save_run(&self, run: &JobRun) -> Result<(), JobStoreError> {
        let conn = self.lock()?;
        let run_json = serde_json::to_string(run).map_err(ser_err)?;
        let changed = conn
            .execute(
                "UPDATE runs SET state = ?1, data = ?2, updated_at = ?3 WHERE request_id = ?4",
                params![run.state.as_str(), run_json, Utc::now().to_rfc3339(), run.request_id],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(JobStoreError::NotFound(run.request_id.clone()));
        }
        Ok(())
    }

    fn schedule(
        &self,
        request_id: &str,
        step: Step,
        due_at: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "INSERT INTO scheduled_steps (request_id, step, due_at, claimed)
                 SELECT ?1, ?2, ?3, 0 WHERE EXISTS (SELECT 1 FROM requests WHERE id = ?1 AND outcome IS NULL)
                 ON CONFLICT(request_id) DO UPDATE SET step = excluded.step, due_at = excluded.due_at, claimed = 0",
                params![request_id, step.as_str(), due_at.timestamp_millis()],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(JobStoreError::NotFound(request_id.to_string()));
        }
        Ok(())
    }

    fn complete(&self, request_id: &str, outcome: &str) -> Result<(), JobStoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        let changed = tx
            .execute(
                "UPDATE requests SET outcome = ?1, finished_at = ?2 WHERE id = ?3",
                params![outcome, Utc::now().to_rfc3339(), request_id],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(JobStoreError::NotFound(request_id.to_string()));
        }
        tx.execute(
            "DELETE FROM scheduled_steps WHERE request_id = ?1",
            params![request_id],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)
    }

    fn outcome(&self, request_id: &str) -> Result<Option<String>, JobStoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT outcome FROM requests WHERE id = ?1",
            params![request_id],
            |row| row.get::<_, Option<String>>(0),
        )
        .optional()
        .map_err(db_err)
        .map(Option::flatten)
    }

    fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ClaimedStep>, JobStoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;

        let due: Vec<(String, String)> = {
            let mut stmt = tx
                .prepare(
                    "SELECT request_id, step FROM scheduled_steps
                     WHERE claimed = 0 AND due_at <= ?1
                     ORDER BY due_at ASC LIMIT ?2",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![now.timestamp_millis(), limit as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })
                .map_err(db_err)?;
            rows.collect::<Result<_, _>>().map_err(db_err)?
        };

        let mut claimed = Vec::with_capacity(due.len());
        for (request_id, step) in due {
            tx.execute(
                "UPDATE scheduled_steps SET claimed = 1 WHERE request_id = ?1",
                params![request_id],
            )
            .map_err(db_err)?;
            let step: Step = step.parse().map_err(JobStoreError::Serialization)?;
            match Self::load(&tx, &request_id)? {
                Some((request, run)) => claimed.push(ClaimedStep { request, run, step }),
                None => return Err(JobStoreError::NotFound(request_id)),
            }
        }

        tx.commit().map_err(db_err)?;
        Ok(claimed)
    }

    fn release_claims(&self) -> Result<usize, JobStoreError> {
        let conn = self.lock()?;
        conn.execute("UPDATE scheduled_steps SET claimed = 0 WHERE claimed = 1", [])
            .map_err(db_err)
    }

    fn counts(&self) -> Result<JobCounts, JobStoreError> {
        let conn = self.lock()?;
        let (scheduled, running): (i64, i64) = conn
            .query_row(
                "SELECT COALESCE(SUM(claimed = 0), 0), COALESCE(SUM(claimed = 1), 0) FROM scheduled_steps",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(db_err)?;
        let completed: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM requests WHERE outcome IS NOT NULL",
                [],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(JobCounts {
            scheduled: scheduled as usize,
            running: running as usize,
            completed: completed as usize,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::params::{ClusterParams, JobParams};
    use crate::ingest::{FailureKind, ParameterSet, RunState};
    use crate::sizing::MachineCatalog;
    use chrono::Duration;

    fn request(file_id: &str) -> IngestRequest {
        let params = ParameterSet::new(
            JobParams::IngestCluster(ClusterParams {
                cluster_file: format!("gs://fc-1234/{}.tsv", file_id),
                name: "UMAP".to_string(),
                machine_type: "n2d-highmem-4".to_string(),
            }),
            &MachineCatalog::default(),
        )
        .unwrap();
        IngestRequest::new("study-1", file_id, "user@example.org", params)
    }

    #[test]
    fn test_insert_and_get() {
        let store = SqliteJobStore::in_memory().unwrap();
        let req = request("file-1");
        let run = JobRun::new(&req);
        store.insert(&req, &run, Step::Launch, Utc::now()).unwrap();

        let (loaded, loaded_run) = store.get(&req.id).unwrap().unwrap();
        assert_eq!(loaded, req);
        assert_eq!(loaded_run.state, RunState::Created);
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let store = SqliteJobStore::in_memory().unwrap();
        let req = request("file-1");
        let run = JobRun::new(&req);
        store.insert(&req, &run, Step::Launch, Utc::now()).unwrap();
        assert!(matches!(
            store.insert(&req, &run, Step::Launch, Utc::now()),
            Err(JobStoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_claim_due_respects_time_and_claims() {
        let store = SqliteJobStore::in_memory().unwrap();
        let now = Utc::now();
        let due = request("file-1");
        let later = request("file-2");
        store.insert(&due, &JobRun::new(&due), Step::Launch, now).unwrap();
        store
            .insert(&later, &JobRun::new(&later), Step::Launch, now + Duration::minutes(5))
            .unwrap();

        let claimed = store.claim_due(now, 10).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].request.id, due.id);
        assert_eq!(claimed[0].step, Step::Launch);

        // already claimed
        assert!(store.claim_due(now, 10).unwrap().is_empty());
        assert_eq!(store.counts().unwrap().running, 1);

        store.release_claims().unwrap();
        assert_eq!(store.claim_due(now, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_schedule_then_complete() {
        let store = SqliteJobStore::in_memory().unwrap();
        let req = request("file-1");
        let mut run = JobRun::new(&req);
        let now = Utc::now();
        store.insert(&req, &run, Step::Launch, now).unwrap();
        store.claim_due(now, 1).unwrap();

        run.advance(RunState::Uploading).unwrap();
        store.save_run(&run).unwrap();
        store.schedule(&req.id, Step::Poll, now).unwrap();

        let claimed = store.claim_due(now, 1).unwrap();
        assert_eq!(claimed[0].step, Step::Poll);
        assert_eq!(claimed[0].run.state, RunState::Uploading);

        run.fail(FailureKind::Abandoned).unwrap();
        store.save_run(&run).unwrap();
        store.complete(&req.id, "abandoned").unwrap();

        assert_eq!(store.outcome(&req.id).unwrap().as_deref(), Some("abandoned"));
        let counts = store.counts().unwrap();
        assert_eq!(counts, JobCounts { scheduled: 0, running: 0, completed: 1 });

        // completed requests cannot be rescheduled
        assert!(store.schedule(&req.id, Step::Poll, now).is_err());
    }

    #[test]
    fn test_survives_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("jobs.db");
        let req = request("file-1");
        let now = Utc::now();

        {
            let store = SqliteJobStore::new(&db_path).unwrap();
            store.insert(&req, &JobRun::new(&req), Step::Launch, now).unwrap();
            store.claim_due(now, 1).unwrap();
        }

        let reopened = SqliteJobStore::new(&db_path).unwrap();
        assert_eq!(reopened.release_claims().unwrap(), 1);
        let claimed = reopened.claim_due(now, 1).unwrap();
        assert_eq!(claimed[0].request, req);
    }
}

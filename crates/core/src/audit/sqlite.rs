use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use super::{AuditError, AuditEvent, AuditFilter, AuditRecord, AuditStore};

/// SQLite-backed audit store
pub struct SqliteAuditStore {
    conn: Mutex<Connection>,
}

fn db_err(e: rusqlite::Error) -> AuditError {
    AuditError::Database(e.to_string())
}

impl SqliteAuditStore {
    /// Open or create the audit database at `path`.
    pub fn new(path: &Path) -> Result<Self, AuditError> {
        let conn = Connection::open(path).map_err(db_err)?;
        Self::initialize(conn)
    }

    pub fn in_memory() -> Result<Self, AuditError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::initialize(conn)
    }

    fn initialize(conn: Connection) -> Result<Self, AuditError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS audit_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                event_type TEXT NOT NULL,
                request_id TEXT,
                actor TEXT,
                data TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_audit_events_timestamp ON audit_events(timestamp);
            CREATE INDEX IF NOT EXISTS idx_audit_events_request_id ON audit_events(request_id);
            CREATE INDEX IF NOT EXISTS idx_audit_events_event_type ON audit_events(event_type);
            "#,
        )
        .map_err(db_err)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, AuditError> {
        self.conn
            .lock()
            .map_err(|_| AuditError::Database("audit connection poisoned".to_string()))
    }

    fn build_where_clause(filter: &AuditFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(ref request_id) = filter.request_id {
            conditions.push("request_id = ?");
            params.push(Box::new(request_id.clone()));
        }
        if let Some(ref event_type) = filter.event_type {
            conditions.push("event_type = ?");
            params.push(Box::new(event_type.clone()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        (where_clause, params)
    }
}

impl AuditStore for SqliteAuditStore {
    fn insert(&self, record: &AuditRecord) -> Result<i64, AuditError> {
        let conn = self.lock()?;

        let data_json = serde_json::to_string(&record.data)
            .map_err(|e| AuditError::Serialization(e.to_string()))?;

        conn.execute(
            "INSERT INTO audit_events (timestamp, event_type, request_id, actor, data) VALUES (?, ?, ?, ?, ?)",
            params![
                record.timestamp.to_rfc3339(),
                record.event_type,
                record.request_id,
                record.actor,
                data_json,
            ],
        )
        .map_err(db_err)?;

        Ok(conn.last_insert_rowid())
    }

    fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>, AuditError> {
        let conn = self.lock()?;

        let (where_clause, params) = Self::build_where_clause(filter);
        let sql = format!(
            "SELECT id, timestamp, event_type, request_id, actor, data FROM audit_events {} ORDER BY id DESC LIMIT ?",
            where_clause
        );

        let mut stmt = conn.prepare(&sql).map_err(db_err)?;

        let mut all_params = params;
        all_params.push(Box::new(filter.limit));
        let param_refs: Vec<&dyn rusqlite::ToSql> = all_params.iter().map(|p| p.as_ref()).collect();

        let rows = stmt
            .query_map(param_refs.as_slice(), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .map_err(db_err)?;

        let mut records = Vec::new();
        for row in rows {
            let (id, timestamp, event_type, request_id, actor, data_json) = row.map_err(db_err)?;

            let timestamp: DateTime<Utc> = DateTime::parse_from_rfc3339(&timestamp)
                .map_err(|e| AuditError::Database(format!("Invalid timestamp: {}", e)))?
                .into();
            let data: AuditEvent = serde_json::from_str(&data_json)
                .map_err(|e| AuditError::Serialization(e.to_string()))?;

            records.push(AuditRecord {
                id,
                timestamp,
                event_type,
                request_id,
                actor,
                data,
            });
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(event: AuditEvent) -> AuditRecord {
        AuditRecord {
            id: 0,
            timestamp: Utc::now(),
            event_type: event.event_type().to_string(),
            request_id: event.request_id().map(String::from),
            actor: event.actor().map(String::from),
            data: event,
        }
    }

    fn finished(request_id: &str, outcome: &str) -> AuditRecord {
        record(AuditEvent::RequestFinished {
            request_id: request_id.to_string(),
            study_id: "study-1".to_string(),
            file_id: "file-1".to_string(),
            action: "ingest_expression".to_string(),
            outcome: outcome.to_string(),
            follow_ups: 0,
        })
    }

    fn analytics(actor: &str) -> AuditRecord {
        record(AuditEvent::Analytics {
            name: "ingest:job-submitted".to_string(),
            request_id: None,
            actor: Some(actor.to_string()),
            properties: serde_json::json!({"machine_type": "n2d-highmem-4"}),
        })
    }

    #[test]
    fn test_insert_and_query() {
        let store = SqliteAuditStore::in_memory().unwrap();
        let id = store.insert(&finished("req-1", "succeeded")).unwrap();
        assert!(id > 0);

        let results = store.query(&AuditFilter::new()).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].event_type, "request_finished");
        assert_eq!(results[0].request_id.as_deref(), Some("req-1"));
    }

    #[test]
    fn test_filters() {
        let store = SqliteAuditStore::in_memory().unwrap();
        store.insert(&finished("req-1", "failed")).unwrap();
        store.insert(&finished("req-2", "succeeded")).unwrap();
        store.insert(&analytics("user@example.org")).unwrap();

        let by_request = store.query(&AuditFilter::new().with_request_id("req-1")).unwrap();
        assert_eq!(by_request.len(), 1);
        assert!(matches!(
            &by_request[0].data,
            AuditEvent::RequestFinished { outcome, .. } if outcome == "failed"
        ));

        let by_type = store
            .query(&AuditFilter::new().with_event_type("request_finished"))
            .unwrap();
        assert_eq!(by_type.len(), 2);
        assert_eq!(by_type[0].request_id.as_deref(), Some("req-2"));

        let none = store
            .query(&AuditFilter::new().with_request_id("req-2").with_event_type("analytics"))
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_limit_keeps_newest() {
        let store = SqliteAuditStore::in_memory().unwrap();
        for i in 0..5 {
            store.insert(&finished(&format!("req-{}", i), "succeeded")).unwrap();
        }

        let page = store.query(&AuditFilter::new().with_limit(2)).unwrap();
        let ids: Vec<&str> = page.iter().filter_map(|r| r.request_id.as_deref()).collect();
        assert_eq!(ids, vec!["req-4", "req-3"]);
    }

    #[test]
    fn test_file_based_store() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("audit.db");

        {
            let store = SqliteAuditStore::new(&db_path).unwrap();
            store.insert(&analytics("user@example.org")).unwrap();
        }

        let reopened = SqliteAuditStore::new(&db_path).unwrap();
        assert_eq!(reopened.query(&AuditFilter::new()).unwrap().len(), 1);
    }
}

use std::sync::Arc;

use axum::{middleware, routing::get, Router};
use tower_http::trace::TraceLayer;

use super::{audit, handlers, middleware::metrics_middleware};
use crate::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/status", get(handlers::status))
        .route("/metrics", get(handlers::metrics))
        .route("/audit", get(audit::query_audit))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use chrono::Utc;

    use cellingest_core::{
        load_config_from_str,
        testing::fixtures::{self, Harness},
        AuditEvent, AuditRecord, AuditStore, FileKind, IngestScheduler, JobStore, SqliteAuditStore,
        SqliteJobStore,
    };

    struct TestApp {
        router: Router,
        harness: Harness,
        scheduler: Arc<IngestScheduler>,
        audit_store: Arc<dyn AuditStore>,
    }

    fn test_app() -> TestApp {
        let config = load_config_from_str(
            r#"
[batch]
project_id = "sc-portal"
image = "gcr.io/sc-portal/ingest-pipeline:1.30.0"
api_token = "super-secret"
"#,
        )
        .unwrap();
        let harness = Harness::new();
        let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::in_memory().unwrap());
        let scheduler = Arc::new(IngestScheduler::new(
            Arc::clone(&harness.orchestrator),
            store,
            None,
        ));
        let audit_store: Arc<dyn AuditStore> = Arc::new(SqliteAuditStore::in_memory().unwrap());
        let state = Arc::new(AppState::new(
            config,
            Arc::clone(&scheduler),
            Arc::clone(&audit_store),
        ));
        TestApp {
            router: create_router(state),
            harness,
            scheduler,
            audit_store,
        }
    }

    async fn get(router: Router, uri: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let app = test_app();
        let (status, body) = get(app.router, "/health").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_status_reports_scheduler_and_redacts_token() {
        let app = test_app();
        app.harness
            .add_uploaded(fixtures::study_file("matrix-1", FileKind::ExpressionMatrix))
            .await;
        app.scheduler
            .enqueue(app.harness.request_for("matrix-1"))
            .await
            .unwrap();

        let (status, body) = get(app.router, "/status").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["scheduler"]["running"], false);
        assert_eq!(json["scheduler"]["scheduled"], 1);
        assert_eq!(json["scheduler"]["completed"], 0);
        assert_eq!(json["config"]["batch"]["api_token_configured"], true);
        assert!(!body.contains("super-secret"));
    }

    #[tokio::test]
    async fn test_metrics_exposition() {
        let app = test_app();
        let (status, body) = get(app.router.clone(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert!(!body.is_empty());

        let (status, body) = get(app.router, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("cellingest_http_requests_total"));
        assert!(body.contains("cellingest_scheduler_running"));
    }

    fn record_finished(store: &dyn AuditStore, request_id: &str) {
        let event = AuditEvent::RequestFinished {
            request_id: request_id.to_string(),
            study_id: "study-1".to_string(),
            file_id: "file-1".to_string(),
            action: "ingest_cluster".to_string(),
            outcome: "succeeded".to_string(),
            follow_ups: 0,
        };
        store
            .insert(&AuditRecord {
                id: 0,
                timestamp: Utc::now(),
                event_type: event.event_type().to_string(),
                request_id: event.request_id().map(String::from),
                actor: None,
                data: event,
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_audit_filters_by_request() {
        let app = test_app();
        record_finished(app.audit_store.as_ref(), "req-1");
        record_finished(app.audit_store.as_ref(), "req-2");
        record_finished(app.audit_store.as_ref(), "req-2");

        let (status, body) = get(app.router.clone(), "/audit?request_id=req-2").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        let events = json["events"].as_array().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e["request_id"] == "req-2"));
        assert_eq!(json["limit"], 100);

        let (_, body) = get(app.router, "/audit?event_type=analytics").await;
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert!(json["events"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_audit_limit_is_clamped() {
        let app = test_app();
        for i in 0..3 {
            record_finished(app.audit_store.as_ref(), &format!("req-{}", i));
        }

        let (_, body) = get(app.router.clone(), "/audit?limit=0").await;
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["limit"], 1);
        assert_eq!(json["events"].as_array().unwrap().len(), 1);
        assert_eq!(json["events"][0]["request_id"], "req-2");

        let (_, body) = get(app.router, "/audit?limit=5000").await;
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["limit"], 1000);
        assert_eq!(json["events"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let app = test_app();
        let (status, _) = get(app.router, "/requests").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}

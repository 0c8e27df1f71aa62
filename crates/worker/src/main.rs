mod api;
mod metrics;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cellingest_core::{
    config_path, create_audit_system, load_config, validate_config, ActionPlanner, AuditAnalytics,
    AuditEvent, AuditStore, BatchApiGateway, FsBucketStorage, IngestOrchestrator, IngestScheduler,
    JobStore, LogNotifier, PlannerSettings, ResourceSizer, SqliteAuditStore, SqliteJobStore,
    SqliteRecordStore,
};

use api::create_router;
use state::AppState;

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Buffer size for audit event channel
const AUDIT_BUFFER_SIZE: usize = 1000;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = config_path();

    info!("Loading configuration from {:?}", config_path);
    let config = load_config(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    validate_config(&config).context("Configuration validation failed")?;

    info!("Configuration loaded successfully");
    info!("Batch project: {} ({})", config.batch.project_id, config.batch.region);
    info!("Database path: {:?}", config.database.path);

    // Hash the sanitized form so the token never reaches the audit log
    let config_json =
        serde_json::to_string(&cellingest_core::SanitizedConfig::from(&config)).unwrap_or_default();
    let config_hash = format!("{:x}", Sha256::digest(config_json.as_bytes()));
    let config_hash_short = &config_hash[..16];

    let audit_store: Arc<dyn AuditStore> = Arc::new(
        SqliteAuditStore::new(&config.database.path).context("Failed to create audit store")?,
    );
    let job_store: Arc<dyn JobStore> = Arc::new(
        SqliteJobStore::new(&config.database.path).context("Failed to create job store")?,
    );
    let records = Arc::new(
        SqliteRecordStore::new(&config.database.path).context("Failed to create record store")?,
    );
    info!("SQLite stores initialized");

    let (audit_handle, audit_writer) =
        create_audit_system(Arc::clone(&audit_store), AUDIT_BUFFER_SIZE);
    let writer_handle = tokio::spawn(audit_writer.run());

    audit_handle
        .emit(AuditEvent::ServiceStarted {
            version: VERSION.to_string(),
            config_hash: config_hash_short.to_string(),
        })
        .await;
    info!("Emitted ServiceStarted audit event");

    let gateway = Arc::new(
        BatchApiGateway::new(config.batch.clone()).context("Failed to create batch gateway")?,
    );
    info!("Batch gateway targeting {}", config.batch.api_url);

    let storage = Arc::new(FsBucketStorage::new(config.storage.root.clone()));
    info!("Bucket storage rooted at {:?}", config.storage.root);

    let notifier = Arc::new(LogNotifier::new(config.notifications.admin_email.clone()));

    let sizer = ResourceSizer::new(config.sizing.clone()).context("Invalid sizing config")?;
    let planner = ActionPlanner::new(
        sizer,
        PlannerSettings {
            image: config.batch.image.clone(),
            image_pipeline_image: config.batch.image_pipeline_image.clone(),
            database_name: config.batch.database_name.clone(),
            project_id: config.batch.project_id.clone(),
            subsample_threshold: config.orchestrator.subsample_threshold,
            max_de_groups: config.orchestrator.max_de_groups,
        },
    );

    let orchestrator = IngestOrchestrator::new(
        config.orchestrator.clone(),
        planner,
        gateway,
        storage,
        records,
        notifier,
    )
    .with_gate(config.gate.clone())
    .with_analytics(Arc::new(AuditAnalytics::new(audit_handle.clone())));

    let scheduler = Arc::new(IngestScheduler::new(
        Arc::new(orchestrator),
        job_store,
        Some(audit_handle.clone()),
    ));
    scheduler.start().await;

    let state = Arc::new(AppState::new(
        config.clone(),
        Arc::clone(&scheduler),
        Arc::clone(&audit_store),
    ));
    let app = create_router(state);

    let addr = SocketAddr::new(config.server.host, config.server.port);
    info!("Starting status server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Stopping scheduler...");
    scheduler.stop().await;

    info!("Worker shutting down...");
    audit_handle
        .emit(AuditEvent::ServiceStopped {
            reason: "graceful_shutdown".to_string(),
        })
        .await;

    // The scheduler and the analytics sink hold handle clones; the writer
    // only exits once every sender is gone.
    drop(scheduler);
    drop(audit_handle);

    let _ = writer_handle.await;
    info!("Audit writer stopped");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

use std::sync::Arc;

use cellingest_core::{AuditStore, Config, IngestScheduler, SanitizedConfig};

/// Shared application state
pub struct AppState {
    config: Config,
    scheduler: Arc<IngestScheduler>,
    audit_store: Arc<dyn AuditStore>,
}

impl AppState {
    pub fn new(
        config: Config,
        scheduler: Arc<IngestScheduler>,
        audit_store: Arc<dyn AuditStore>,
    ) -> Self {
        Self {
            config,
            scheduler,
            audit_store,
        }
    }

    pub fn sanitized_config(&self) -> SanitizedConfig {
        SanitizedConfig::from(&self.config)
    }

    pub fn scheduler(&self) -> &IngestScheduler {
        self.scheduler.as_ref()
    }

    pub fn audit_store(&self) -> &dyn AuditStore {
        self.audit_store.as_ref()
    }
}

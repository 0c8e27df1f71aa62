use async_trait::async_trait;

use super::{AnalyticsSink, NotifyError};
use crate::audit::{AuditEvent, AuditHandle};

/// Stores analytics events in the audit log.
#[derive(Clone)]
pub struct AuditAnalytics {
    audit: AuditHandle,
}

impl AuditAnalytics {
    pub fn new(audit: AuditHandle) -> Self {
        Self { audit }
    }
}

#[async_trait]
impl AnalyticsSink for AuditAnalytics {
    async fn record(
        &self,
        event_name: &str,
        properties: serde_json::Value,
        actor: Option<&str>,
    ) -> Result<(), NotifyError> {
        let request_id = properties
            .get("request_id")
            .and_then(|v| v.as_str())
            .map(String::from);

        let event = AuditEvent::Analytics {
            name: event_name.to_string(),
            request_id,
            actor: actor.map(String::from),
            properties,
        };
        if self.audit.try_emit(event) {
            Ok(())
        } else {
            Err(NotifyError::Unavailable("audit channel full or closed".to_string()))
        }
    }
}

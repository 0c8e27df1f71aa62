use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Events persisted to the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    ServiceStarted {
        version: String,
        config_hash: String,
    },
    ServiceStopped {
        reason: String,
    },

    RequestEnqueued {
        request_id: String,
        study_id: String,
        file_id: String,
        action: String,
        attempt: u32,
        user_email: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_attempt: Option<String>,
    },
    RequestFinished {
        request_id: String,
        study_id: String,
        file_id: String,
        action: String,
        /// succeeded, retried, failed or abandoned
        outcome: String,
        #[serde(default)]
        follow_ups: usize,
    },
    /// A step hit an internal error and was pushed back.
    StepErrored {
        request_id: String,
        step: String,
        error: String,
    },

    /// Job telemetry forwarded from the analytics sink.
    Analytics {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        actor: Option<String>,
        properties: serde_json::Value,
    },
}

impl AuditEvent {
    /// Returns the event type as a string for storage
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ServiceStarted { .. } => "service_started",
            Self::ServiceStopped { .. } => "service_stopped",
            Self::RequestEnqueued { .. } => "request_enqueued",
            Self::RequestFinished { .. } => "request_finished",
            Self::StepErrored { .. } => "step_errored",
            Self::Analytics { .. } => "analytics",
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::RequestEnqueued { request_id, .. }
            | Self::RequestFinished { request_id, .. }
            | Self::StepErrored { request_id, .. } => Some(request_id),
            Self::Analytics { request_id, .. } => request_id.as_deref(),
            Self::ServiceStarted { .. } | Self::ServiceStopped { .. } => None,
        }
    }

    /// User the event acted for, if any.
    pub fn actor(&self) -> Option<&str> {
        match self {
            Self::RequestEnqueued { user_email, .. } => Some(user_email),
            Self::Analytics { actor, .. } => actor.as_deref(),
            _ => None,
        }
    }
}

/// A stored audit record with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub request_id: Option<String>,
    pub actor: Option<String>,
    pub data: AuditEvent,
}

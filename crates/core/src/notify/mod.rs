//! Outbound notifications and job telemetry.
//!
//! Delivery is best-effort: callers log a [`NotifyError`] and carry on.

mod analytics;
mod log;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use analytics::AuditAnalytics;
pub use log::LogNotifier;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Sink unavailable: {0}")]
    Unavailable(String),
}

/// Who a message is for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "email", rename_all = "snake_case")]
pub enum Recipient {
    User(String),
    Admins,
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recipient::User(email) => f.write_str(email),
            Recipient::Admins => f.write_str("admins"),
        }
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Short summary of what an ingest produced.
    async fn notify_success(
        &self,
        recipient: &Recipient,
        subject: &str,
        lines: &[String],
    ) -> Result<(), NotifyError>;

    /// Failure report. Admin reports carry the full diagnostics.
    async fn notify_failure(
        &self,
        recipient: &Recipient,
        subject: &str,
        body: &str,
    ) -> Result<(), NotifyError>;
}

#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    async fn record(
        &self,
        event_name: &str,
        properties: serde_json::Value,
        actor: Option<&str>,
    ) -> Result<(), NotifyError>;
}

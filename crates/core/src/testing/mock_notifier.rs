//! Recording notification and analytics sinks for testing.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::notify::{AnalyticsSink, NotificationSink, NotifyError, Recipient};

/// A delivered notification.
#[derive(Debug, Clone, PartialEq)]
pub struct SentNotification {
    pub recipient: Recipient,
    pub subject: String,
    /// Success lines joined with newlines, or the failure body.
    pub body: String,
    pub success: bool,
}

#[derive(Debug, Default)]
pub struct MockNotifier {
    sent: Arc<RwLock<Vec<SentNotification>>>,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<SentNotification> {
        self.sent.read().await.clone()
    }

    /// Failure messages addressed to `recipient`.
    pub async fn failures_to(&self, recipient: &Recipient) -> Vec<SentNotification> {
        self.sent
            .read()
            .await
            .iter()
            .filter(|n| !n.success && &n.recipient == recipient)
            .cloned()
            .collect()
    }

    /// Success messages addressed to `recipient`.
    pub async fn successes_to(&self, recipient: &Recipient) -> Vec<SentNotification> {
        self.sent
            .read()
            .await
            .iter()
            .filter(|n| n.success && &n.recipient == recipient)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl NotificationSink for MockNotifier {
    async fn notify_success(
        &self,
        recipient: &Recipient,
        subject: &str,
        lines: &[String],
    ) -> Result<(), NotifyError> {
        self.sent.write().await.push(SentNotification {
            recipient: recipient.clone(),
            subject: subject.to_string(),
            body: lines.join("\n"),
            success: true,
        });
        Ok(())
    }

    async fn notify_failure(
        &self,
        recipient: &Recipient,
        subject: &str,
        body: &str,
    ) -> Result<(), NotifyError> {
        self.sent.write().await.push(SentNotification {
            recipient: recipient.clone(),
            subject: subject.to_string(),
            body: body.to_string(),
            success: false,
        });
        Ok(())
    }
}

/// A recorded analytics event.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub name: String,
    pub properties: serde_json::Value,
    pub actor: Option<String>,
}

#[derive(Debug, Default)]
pub struct MockAnalytics {
    events: Arc<RwLock<Vec<RecordedEvent>>>,
}

impl MockAnalytics {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<RecordedEvent> {
        self.events.read().await.clone()
    }

    pub async fn names(&self) -> Vec<String> {
        self.events
            .read()
            .await
            .iter()
            .map(|e| e.name.clone())
            .collect()
    }
}

#[async_trait]
impl AnalyticsSink for MockAnalytics {
    async fn record(
        &self,
        event_name: &str,
        properties: serde_json::Value,
        actor: Option<&str>,
    ) -> Result<(), NotifyError> {
        self.events.write().await.push(RecordedEvent {
            name: event_name.to_string(),
            properties,
            actor: actor.map(String::from),
        });
        Ok(())
    }
}

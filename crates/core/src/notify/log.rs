use async_trait::async_trait;
use tracing::{info, warn};

use super::{NotificationSink, NotifyError, Recipient};

/// Writes notifications to the log instead of sending mail.
#[derive(Debug, Clone)]
pub struct LogNotifier {
    admin_email: String,
}

impl LogNotifier {
    pub fn new(admin_email: impl Into<String>) -> Self {
        Self {
            admin_email: admin_email.into(),
        }
    }

    /// Mail address a recipient resolves to.
    pub fn address<'a>(&'a self, recipient: &'a Recipient) -> &'a str {
        match recipient {
            Recipient::User(email) => email,
            Recipient::Admins => &self.admin_email,
        }
    }
}

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn notify_success(
        &self,
        recipient: &Recipient,
        subject: &str,
        lines: &[String],
    ) -> Result<(), NotifyError> {
        info!(
            to = self.address(recipient),
            subject,
            body = %lines.join("\n"),
            "Notification"
        );
        Ok(())
    }

    async fn notify_failure(
        &self,
        recipient: &Recipient,
        subject: &str,
        body: &str,
    ) -> Result<(), NotifyError> {
        warn!(to = self.address(recipient), subject, body, "Failure notification");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_resolution() {
        let notifier = LogNotifier::new("admin@example.org");
        assert_eq!(notifier.address(&Recipient::Admins), "admin@example.org");
        let user = Recipient::User("user@example.org".to_string());
        assert_eq!(notifier.address(&user), "user@example.org");
    }

    #[tokio::test]
    async fn test_log_notifier_never_fails() {
        let notifier = LogNotifier::new("admin@example.org");
        notifier
            .notify_success(&Recipient::Admins, "done", &["1 cluster".to_string()])
            .await
            .unwrap();
        notifier
            .notify_failure(&Recipient::Admins, "failed", "<p>exit code 1</p>")
            .await
            .unwrap();
    }
}

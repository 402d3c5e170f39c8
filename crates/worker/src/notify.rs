//! Notification delivery seam used by report, alert, email, and pulse
//! handlers. Concrete transports (SMTP, webhooks) live behind this trait
//! in the host application.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use vantage_core::error::CoreError;
use vantage_core::types::EntityId;

/// One outbound notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    /// Entity the notification is about (report, alert, dashboard).
    pub entity_id: EntityId,
    pub subject: String,
    pub body: String,
}

/// Delivery transport. Failures map to `NotifyFailed` (transient).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notice: Notice) -> Result<(), CoreError>;
}

/// Records every delivery; test double and local-dev default.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notice>>,
    fail_sends: AtomicU32,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` sends with a transient error.
    pub fn fail_next_sends(&self, n: u32) {
        self.fail_sends.store(n, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Notice> {
        self.sent.lock().expect("notifier lock poisoned").clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notice: Notice) -> Result<(), CoreError> {
        let remaining = self.fail_sends.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_sends.store(remaining - 1, Ordering::SeqCst);
            return Err(CoreError::NotifyFailed("transport unavailable".into()));
        }
        tracing::info!(entity_id = %notice.entity_id, subject = %notice.subject, "Notification sent");
        self.sent.lock().expect("notifier lock poisoned").push(notice);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notice() -> Notice {
        Notice {
            entity_id: uuid::Uuid::now_v7(),
            subject: "s".into(),
            body: "b".into(),
        }
    }

    #[tokio::test]
    async fn recording_notifier_captures_sends() {
        let n = RecordingNotifier::new();
        n.send(notice()).await.unwrap();
        assert_eq!(n.sent().len(), 1);
    }

    #[tokio::test]
    async fn failed_send_is_transient_and_not_recorded() {
        let n = RecordingNotifier::new();
        n.fail_next_sends(1);
        let err = n.send(notice()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(n.sent().is_empty());
        assert!(n.send(notice()).await.is_ok());
    }
}

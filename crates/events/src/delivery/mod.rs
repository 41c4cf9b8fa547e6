//! Delivery of stored notifications to their recipients.
//!
//! [`NotificationDelivery`] polls the notification store for undelivered
//! rows, emails every recipient through [`EmailDelivery`] when SMTP is
//! configured (otherwise it only logs), and marks each row delivered.

pub mod email;

use std::sync::Arc;
use std::time::Duration;

use pipewright_db::models::notification::Notification;
use pipewright_db::store::{NotificationStore, StoreResult};
use tokio_util::sync::CancellationToken;

use self::email::EmailDelivery;

/// Notifications fetched per poll.
const BATCH_SIZE: i64 = 100;

/// Background loop draining the notification store.
pub struct NotificationDelivery {
    store: Arc<dyn NotificationStore>,
    email: Option<EmailDelivery>,
    interval: Duration,
}

impl NotificationDelivery {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        email: Option<EmailDelivery>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            email,
            interval,
        }
    }

    /// Run until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            email_enabled = self.email.is_some(),
            "Notification delivery started"
        );
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Notification delivery stopping");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.deliver_pending().await {
                        tracing::error!(error = %e, "Notification delivery cycle failed");
                    }
                }
            }
        }
    }

    /// Deliver one batch of undelivered notifications. Returns how many were
    /// marked delivered.
    ///
    /// A notification that could not be emailed to every recipient stays
    /// undelivered and is retried on the next cycle.
    pub async fn deliver_pending(&self) -> StoreResult<usize> {
        let pending = self.store.list_undelivered(BATCH_SIZE).await?;
        let mut delivered = 0;

        for notification in pending {
            if !self.send(&notification).await {
                continue;
            }
            if self.store.mark_delivered(notification.id).await? {
                delivered += 1;
            }
        }

        Ok(delivered)
    }

    /// Returns `true` when every recipient was reached (or there is no mailer).
    async fn send(&self, notification: &Notification) -> bool {
        let Some(email) = &self.email else {
            tracing::info!(
                notification_id = notification.id,
                service_id = notification.service_id,
                event_name = %notification.event_name,
                stage = %notification.stage,
                recipients = ?notification.recipients,
                "Notification (email not configured)"
            );
            return true;
        };

        let mut all_sent = true;
        for recipient in &notification.recipients {
            if let Err(e) = email.deliver(recipient, notification).await {
                tracing::warn!(
                    error = %e,
                    notification_id = notification.id,
                    to = %recipient,
                    "Notification email failed"
                );
                all_sent = false;
            }
        }
        all_sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewright_core::lifecycle::LifecycleStage;
    use pipewright_db::models::notification::NewNotification;
    use pipewright_db::MemoryStore;

    fn new_notification(service_id: i64) -> NewNotification {
        NewNotification {
            service_id,
            event_name: "done".into(),
            stage: LifecycleStage::SuccessfulProcessing,
            recipients: vec!["ops@example.org".into()],
            data: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn without_smtp_notifications_are_logged_and_marked() {
        let store = Arc::new(MemoryStore::new());
        store.save(new_notification(1)).await.unwrap();
        store.save(new_notification(2)).await.unwrap();
        let delivery = NotificationDelivery::new(store.clone(), None, Duration::from_millis(10));

        assert_eq!(delivery.deliver_pending().await.unwrap(), 2);
        assert!(store.list_undelivered(10).await.unwrap().is_empty());
        assert_eq!(delivery.deliver_pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let store = Arc::new(MemoryStore::new());
        store.save(new_notification(1)).await.unwrap();
        let delivery = Arc::new(NotificationDelivery::new(
            store.clone(),
            None,
            Duration::from_millis(5),
        ));
        let cancel = CancellationToken::new();

        let handle = tokio::spawn({
            let delivery = delivery.clone();
            let cancel = cancel.clone();
            async move { delivery.run(cancel).await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert!(store.list_undelivered(10).await.unwrap().is_empty());
    }
}

//! Lifecycle notifications.
//!
//! [`NotificationDispatcher`] looks up a record's registration for a stage
//! (falling back to its default registration), builds the payload and stores
//! it. Delivery happens later in [`NotificationDelivery`](crate::delivery::NotificationDelivery).

use std::sync::Arc;

use chrono::Utc;
use pipewright_core::lifecycle::LifecycleStage;
use pipewright_db::models::notification::{NewNotification, Notification};
use pipewright_db::models::service::{NotificationConfig, ServiceRecord};
use pipewright_db::store::{NotificationStore, StoreResult};
use serde_json::{json, Value};

use crate::bus::{EngineEvent, EventBus, NOTIFICATION_CREATED};

/// Build the `{eventName, stage, timestamp, data}` payload for one stage.
///
/// `data` is the registration's own data with the record's `serviceId`,
/// `serviceName`, `state` and `args` layered on top.
pub fn build_payload(
    record: &ServiceRecord,
    stage: LifecycleStage,
    config: &NotificationConfig,
) -> Value {
    let mut data = config.data.clone();
    data.insert("serviceId".into(), json!(record.id()));
    data.insert("serviceName".into(), json!(record.name));
    data.insert("state".into(), json!(record.state.as_str()));
    data.insert("args".into(), json!(record.args));

    json!({
        "eventName": config.event_name,
        "stage": stage.as_str(),
        "timestamp": Utc::now(),
        "data": data,
    })
}

/// Posts lifecycle notifications to the notification store.
pub struct NotificationDispatcher {
    store: Arc<dyn NotificationStore>,
    bus: Option<Arc<EventBus>>,
}

impl NotificationDispatcher {
    pub fn new(store: Arc<dyn NotificationStore>) -> Self {
        Self { store, bus: None }
    }

    /// Also publish a [`NOTIFICATION_CREATED`] event for every stored notification.
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Store the notification for `stage`, if the record registered one.
    pub async fn notify(
        &self,
        record: &ServiceRecord,
        stage: LifecycleStage,
    ) -> StoreResult<Option<Notification>> {
        let Some(config) = record.notifications.for_stage(stage) else {
            return Ok(None);
        };

        let notification = self
            .store
            .save(NewNotification {
                service_id: record.id(),
                event_name: config.event_name.clone(),
                stage,
                recipients: config.recipients.clone(),
                data: build_payload(record, stage, config),
            })
            .await?;

        tracing::debug!(
            service_id = record.id(),
            stage = %stage,
            event_name = %notification.event_name,
            "Notification stored"
        );

        if let Some(bus) = &self.bus {
            bus.publish(
                EngineEvent::new(NOTIFICATION_CREATED)
                    .with_service(record.id(), record.state)
                    .with_payload(json!({
                        "notificationId": notification.id,
                        "stage": stage.as_str(),
                    })),
            );
        }

        Ok(Some(notification))
    }

    /// Like [`notify`](Self::notify) but only logs failures, for callers
    /// whose own work must not fail because a notification could not be stored.
    pub async fn notify_logged(&self, record: &ServiceRecord, stage: LifecycleStage) {
        if let Err(e) = self.notify(record, stage).await {
            tracing::error!(
                error = %e,
                service_id = record.id(),
                stage = %stage,
                "Failed to store notification"
            );
        }
    }
}

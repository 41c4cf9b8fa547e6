//! Lifecycle notification models.

use pipewright_core::lifecycle::LifecycleStage;
use pipewright_core::types::{DbId, ServiceId, Timestamp};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A row from the `service_notifications` table.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
pub struct Notification {
    pub id: DbId,
    pub service_id: ServiceId,
    pub event_name: String,
    pub stage: String,
    pub recipients: Vec<String>,
    pub data: serde_json::Value,
    pub delivered_at: Option<Timestamp>,
    pub created_at: Timestamp,
}

impl Notification {
    pub fn is_delivered(&self) -> bool {
        self.delivered_at.is_some()
    }
}

/// DTO for storing a notification.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct NewNotification {
    pub service_id: ServiceId,
    pub event_name: String,
    pub stage: LifecycleStage,
    pub recipients: Vec<String>,
    /// `{eventName, stage, timestamp, data}` payload.
    pub data: serde_json::Value,
}

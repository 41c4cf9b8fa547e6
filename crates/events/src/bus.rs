//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] fans out [`EngineEvent`]s to any number of subscribers. It is
//! shared via `Arc<EventBus>` between the engine, dispatcher and scheduler.

use chrono::{DateTime, Utc};
use pipewright_core::scheduling::ServiceState;
use pipewright_core::types::ServiceId;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// A service was persisted.
pub const SERVICE_SUBMITTED: &str = "service.submitted";

/// A service changed state.
pub const SERVICE_STATE_CHANGED: &str = "service.state_changed";

/// A service (and its subtree) was re-prioritized.
pub const SERVICE_PRIORITY_CHANGED: &str = "service.priority_changed";

/// A lifecycle notification was stored.
pub const NOTIFICATION_CREATED: &str = "notification.created";

// ---------------------------------------------------------------------------
// EngineEvent
// ---------------------------------------------------------------------------

/// Something that happened to a service record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    /// Dot-separated event name, e.g. `"service.state_changed"`.
    pub event_type: String,

    pub service_id: Option<ServiceId>,

    /// State of the record after the change.
    pub state: Option<ServiceState>,

    /// Free-form JSON payload carrying event-specific data.
    pub payload: serde_json::Value,

    pub timestamp: DateTime<Utc>,
}

impl EngineEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            service_id: None,
            state: None,
            payload: serde_json::Value::Object(Default::default()),
            timestamp: Utc::now(),
        }
    }

    /// Attach the affected record and its new state.
    pub fn with_service(mut self, service_id: ServiceId, state: ServiceState) -> Self {
        self.service_id = Some(service_id);
        self.state = Some(state);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Shorthand for a [`SERVICE_STATE_CHANGED`] event.
    pub fn state_changed(service_id: ServiceId, state: ServiceState) -> Self {
        Self::new(SERVICE_STATE_CHANGED).with_service(service_id, state)
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out event bus.
///
/// When the buffer is full the oldest messages are dropped and slow
/// receivers observe `RecvError::Lagged`.
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no active subscribers the event is silently dropped.
    pub fn publish(&self, event: EngineEvent) {
        // A SendError only means there are zero receivers.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

//! Lifecycle events and notifications for the service engine.
//!
//! - [`EventBus`]: in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`.
//! - [`EngineEvent`]: the envelope published for every lifecycle change.
//! - [`NotificationDispatcher`]: turns lifecycle stages into stored
//!   notifications according to a record's registrations.
//! - [`delivery`]: the loop that emails stored notifications.

pub mod bus;
pub mod delivery;
pub mod notifier;

pub use bus::{EngineEvent, EventBus};
pub use delivery::email::{EmailConfig, EmailDelivery, EmailError};
pub use delivery::NotificationDelivery;
pub use notifier::NotificationDispatcher;

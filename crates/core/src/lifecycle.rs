//! Lifecycle notification stages and service event type constants.
//!
//! Event types are the `type` field of entries in a service record's
//! append-only event log.

use crate::define_text_enum;

define_text_enum! {
    /// Stage of service processing at which a notification may be emitted.
    LifecycleStage {
        StartProcessing => "START_PROCESSING",
        SuccessfulProcessing => "SUCCESSFUL_PROCESSING",
        FailedProcessing => "FAILED_PROCESSING",
        SuspendProcessing => "SUSPEND_PROCESSING",
        ResumeProcessing => "RESUME_PROCESSING",
        RetryProcessing => "RETRY_PROCESSING",
    }
}

/// Record persisted for the first time.
pub const EVENT_CREATED: &str = "CREATED";

/// Record placed on a dispatcher queue.
pub const EVENT_QUEUED: &str = "QUEUED";

/// Record claimed by a dispatcher.
pub const EVENT_DISPATCHED: &str = "DISPATCHED";

/// Processor invoked.
pub const EVENT_RUN: &str = "RUN";

/// Processor waiting for dependencies to finish.
pub const EVENT_WAIT_FOR_DEPENDENCIES: &str = "WAIT_FOR_DEPENDENCIES";

/// Processing finished with a result.
pub const EVENT_COMPLETED: &str = "COMPLETED";

/// Processing failed.
pub const EVENT_FAILED: &str = "FAILED";

/// Processing exceeded its declared timeout.
pub const EVENT_TIMEOUT: &str = "TIMEOUT";

/// Record canceled by an operator or by cascade.
pub const EVENT_CANCELED: &str = "CANCELED";

/// Record suspended.
pub const EVENT_SUSPEND: &str = "SUSPEND";

/// Record resumed.
pub const EVENT_RESUME: &str = "RESUME";

/// Explicit state change requested through the management API.
pub const EVENT_UPDATE_STATE: &str = "UPDATE_STATE";

/// Priority re-numbered.
pub const EVENT_UPDATE_PRIORITY: &str = "UPDATE_PRIORITY";

/// An upstream dependency finished unsuccessfully.
pub const EVENT_DEPENDENCY_FAILED: &str = "DEPENDENCY_FAILED";

/// Message recorded on dependents killed by an upstream cancellation.
pub const MSG_KILLED_BY_DEPENDENCY_CANCELLATION: &str = "killed by dependency cancellation";

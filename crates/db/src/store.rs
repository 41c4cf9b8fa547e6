//! Persistence ports consumed by the engine.
//!
//! The engine only mutates shared state through these traits: conditional
//! state transitions, event appends, single-field updates and batch priority
//! updates. Two implementations exist: [`PgStore`](crate::postgres::PgStore)
//! for shared deployments and [`MemoryStore`](crate::memory::MemoryStore)
//! for tests and single-process embedding.

use async_trait::async_trait;
use pipewright_core::error::CoreError;
use pipewright_core::scheduling::ServiceState;
use pipewright_core::types::{DbId, ServiceId, Timestamp};

use crate::models::notification::{NewNotification, Notification};
use crate::models::scheduled::{NewScheduledService, ScheduledService};
use crate::models::search::{Page, PageRequest, ServicePattern, TimeRange};
use crate::models::service::{
    ClaimRequest, Claimed, FieldUpdate, NewService, ServiceEvent, ServiceRecord, StateChange,
};
use crate::models::workflow::{NewWorkflow, Workflow};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{entity} with id {id} not found")]
    NotFound { entity: &'static str, id: DbId },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => CoreError::NotFound { entity, id },
            StoreError::Validation(msg) => CoreError::Validation(msg),
            other => CoreError::Internal(other.to_string()),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A queued record blocked by a dependency that finished unsuccessfully.
#[derive(Debug, Clone)]
pub struct BlockedService {
    pub service: ServiceRecord,
    pub failed_dependency: ServiceId,
    pub dependency_state: ServiceState,
}

// ---------------------------------------------------------------------------
// ServiceStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ServiceStore: Send + Sync {
    /// Persist a new record in state `CREATED`.
    ///
    /// Every dependency must already exist. A child inherits its parent's
    /// root and queue, gets a priority strictly above the parent's, and is
    /// attached to the parent's dependency set.
    async fn save_hierarchy(&self, service: NewService) -> StoreResult<ServiceRecord>;

    async fn find_by_id(&self, id: ServiceId) -> StoreResult<Option<ServiceRecord>>;

    /// Records listed in `record.dependencies`.
    async fn find_dependencies(&self, record: &ServiceRecord) -> StoreResult<Vec<ServiceRecord>>;

    /// Records that list `id` as a dependency.
    async fn find_dependents(&self, id: ServiceId) -> StoreResult<Vec<ServiceRecord>>;

    /// Records whose parent is `id`.
    async fn find_children(&self, id: ServiceId) -> StoreResult<Vec<ServiceRecord>>;

    /// `id` plus everything reachable through children and dependencies.
    async fn find_subtree(&self, id: ServiceId) -> StoreResult<Vec<ServiceRecord>>;

    /// Atomically move up to `limit` eligible records to `DISPATCHED`.
    ///
    /// A record is eligible when its state is listed in the request, its
    /// queue matches, its scope matches and every dependency is
    /// `SUCCESSFUL` (or terminal, for force-independent records). Ordering is
    /// priority descending, then creation time, then id. Concurrent callers
    /// never receive the same record.
    async fn claim_by_queue_and_state(&self, claim: &ClaimRequest) -> StoreResult<Vec<Claimed>>;

    /// Conditional transition; `None` when the current state was not in
    /// `allowed_from` (or the record does not exist).
    async fn update_state(
        &self,
        id: ServiceId,
        change: StateChange,
    ) -> StoreResult<Option<ServiceRecord>>;

    async fn append_event(&self, id: ServiceId, event: ServiceEvent) -> StoreResult<()>;

    async fn update_field(&self, id: ServiceId, update: FieldUpdate) -> StoreResult<()>;

    /// Set several priorities in one atomic batch.
    async fn update_priorities(&self, updates: &[(ServiceId, i32)]) -> StoreResult<()>;

    async fn search(
        &self,
        pattern: &ServicePattern,
        range: &TimeRange,
        page: &PageRequest,
    ) -> StoreResult<Page<ServiceRecord>>;

    async fn count(&self, pattern: &ServicePattern, range: &TimeRange) -> StoreResult<i64>;

    /// Count records in `states` visible to `queue_id` (stamped with it or
    /// unstamped).
    async fn count_in_states(&self, queue_id: &str, states: &[ServiceState]) -> StoreResult<i64>;

    /// Promote up to `limit` `CREATED` roots to `QUEUED`, highest priority
    /// first, stamping `event` on each.
    async fn promote_created(
        &self,
        queue_id: &str,
        limit: usize,
        only_pre_assigned: bool,
        event: ServiceEvent,
    ) -> StoreResult<Vec<ServiceRecord>>;

    /// `QUEUED`/`RESUMED` records visible to `queue_id` with a dependency in a
    /// failed terminal state. Force-independent records are excluded.
    async fn find_blocked_by_failure(
        &self,
        queue_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<BlockedService>>;

    /// In-flight records on `queue_id` that have outlived their timeout.
    async fn find_expired(
        &self,
        queue_id: &str,
        now: Timestamp,
        limit: usize,
    ) -> StoreResult<Vec<ServiceRecord>>;
}

// ---------------------------------------------------------------------------
// NotificationStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn save(&self, notification: NewNotification) -> StoreResult<Notification>;

    /// Oldest undelivered notifications first.
    async fn list_undelivered(&self, limit: i64) -> StoreResult<Vec<Notification>>;

    /// Returns `false` if already delivered.
    async fn mark_delivered(&self, id: DbId) -> StoreResult<bool>;

    async fn list_for_service(&self, service_id: ServiceId) -> StoreResult<Vec<Notification>>;
}

// ---------------------------------------------------------------------------
// WorkflowStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn save_workflow(&self, workflow: NewWorkflow) -> StoreResult<Workflow>;

    async fn find_workflow(&self, id: DbId) -> StoreResult<Option<Workflow>>;

    async fn record_node_service(
        &self,
        workflow_id: DbId,
        node_id: &str,
        service_id: ServiceId,
    ) -> StoreResult<()>;

    async fn record_skipped_node(&self, workflow_id: DbId, node_id: &str) -> StoreResult<()>;

    /// Take the lock on `key` for `holder`. Re-entrant for the same holder.
    async fn try_lock(&self, key: &str, holder: &str) -> StoreResult<bool>;

    /// Returns `false` when `holder` did not hold the lock.
    async fn unlock(&self, key: &str, holder: &str) -> StoreResult<bool>;
}

// ---------------------------------------------------------------------------
// ScheduledServiceStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ScheduledServiceStore: Send + Sync {
    async fn create_scheduled(
        &self,
        template: NewScheduledService,
        next_start_time: Option<Timestamp>,
    ) -> StoreResult<ScheduledService>;

    async fn find_scheduled(&self, id: DbId) -> StoreResult<Option<ScheduledService>>;

    /// Enabled templates whose next start time is at or before `now`, plus
    /// enabled templates that were never scheduled.
    async fn list_due(&self, now: Timestamp, limit: i64) -> StoreResult<Vec<ScheduledService>>;

    /// Advance a template's schedule if its next start time is still
    /// `expected_next`. Returns `false` when another instance won.
    async fn advance_schedule(
        &self,
        id: DbId,
        expected_next: Option<Timestamp>,
        started_at: Timestamp,
        next: Option<Timestamp>,
    ) -> StoreResult<bool>;

    async fn set_disabled(&self, id: DbId, disabled: bool) -> StoreResult<bool>;
}

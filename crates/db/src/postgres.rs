//! Postgres-backed implementation of the store ports.

use async_trait::async_trait;
use pipewright_core::scheduling::ServiceState;
use pipewright_core::types::{DbId, ServiceId, Timestamp};

use crate::models::notification::{NewNotification, Notification};
use crate::models::scheduled::{NewScheduledService, ScheduledService};
use crate::models::search::{Page, PageRequest, ServicePattern, TimeRange};
use crate::models::service::{
    ClaimRequest, Claimed, FieldUpdate, NewService, ServiceEvent, ServiceRecord, StateChange,
};
use crate::models::workflow::{NewWorkflow, Workflow};
use crate::repositories::{NotificationRepo, ScheduledServiceRepo, ServiceRepo, WorkflowRepo};
use crate::store::{
    BlockedService, NotificationStore, ScheduledServiceStore, ServiceStore, StoreResult,
    WorkflowStore,
};
use crate::DbPool;

/// Shared store for multi-instance deployments.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl ServiceStore for PgStore {
    async fn save_hierarchy(&self, service: NewService) -> StoreResult<ServiceRecord> {
        ServiceRepo::save_hierarchy(&self.pool, service).await
    }

    async fn find_by_id(&self, id: ServiceId) -> StoreResult<Option<ServiceRecord>> {
        ServiceRepo::find_by_id(&self.pool, id).await
    }

    async fn find_dependencies(&self, record: &ServiceRecord) -> StoreResult<Vec<ServiceRecord>> {
        let ids: Vec<ServiceId> = record.dependencies.iter().copied().collect();
        ServiceRepo::find_by_ids(&self.pool, &ids).await
    }

    async fn find_dependents(&self, id: ServiceId) -> StoreResult<Vec<ServiceRecord>> {
        ServiceRepo::find_dependents(&self.pool, id).await
    }

    async fn find_children(&self, id: ServiceId) -> StoreResult<Vec<ServiceRecord>> {
        ServiceRepo::find_children(&self.pool, id).await
    }

    async fn find_subtree(&self, id: ServiceId) -> StoreResult<Vec<ServiceRecord>> {
        ServiceRepo::find_subtree(&self.pool, id).await
    }

    async fn claim_by_queue_and_state(&self, claim: &ClaimRequest) -> StoreResult<Vec<Claimed>> {
        ServiceRepo::claim(&self.pool, claim).await
    }

    async fn update_state(
        &self,
        id: ServiceId,
        change: StateChange,
    ) -> StoreResult<Option<ServiceRecord>> {
        ServiceRepo::update_state(&self.pool, id, &change).await
    }

    async fn append_event(&self, id: ServiceId, event: ServiceEvent) -> StoreResult<()> {
        ServiceRepo::append_event(&self.pool, id, &event).await
    }

    async fn update_field(&self, id: ServiceId, update: FieldUpdate) -> StoreResult<()> {
        ServiceRepo::update_field(&self.pool, id, &update).await
    }

    async fn update_priorities(&self, updates: &[(ServiceId, i32)]) -> StoreResult<()> {
        ServiceRepo::update_priorities(&self.pool, updates).await
    }

    async fn search(
        &self,
        pattern: &ServicePattern,
        range: &TimeRange,
        page: &PageRequest,
    ) -> StoreResult<Page<ServiceRecord>> {
        ServiceRepo::search(&self.pool, pattern, range, page).await
    }

    async fn count(&self, pattern: &ServicePattern, range: &TimeRange) -> StoreResult<i64> {
        ServiceRepo::count(&self.pool, pattern, range).await
    }

    async fn count_in_states(&self, queue_id: &str, states: &[ServiceState]) -> StoreResult<i64> {
        ServiceRepo::count_in_states(&self.pool, queue_id, states).await
    }

    async fn promote_created(
        &self,
        queue_id: &str,
        limit: usize,
        only_pre_assigned: bool,
        event: ServiceEvent,
    ) -> StoreResult<Vec<ServiceRecord>> {
        ServiceRepo::promote_created(&self.pool, queue_id, limit, only_pre_assigned, &event).await
    }

    async fn find_blocked_by_failure(
        &self,
        queue_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<BlockedService>> {
        ServiceRepo::find_blocked_by_failure(&self.pool, queue_id, limit).await
    }

    async fn find_expired(
        &self,
        queue_id: &str,
        now: Timestamp,
        limit: usize,
    ) -> StoreResult<Vec<ServiceRecord>> {
        ServiceRepo::find_expired(&self.pool, queue_id, now, limit).await
    }
}

#[async_trait]
impl NotificationStore for PgStore {
    async fn save(&self, notification: NewNotification) -> StoreResult<Notification> {
        NotificationRepo::create(&self.pool, &notification).await
    }

    async fn list_undelivered(&self, limit: i64) -> StoreResult<Vec<Notification>> {
        NotificationRepo::list_undelivered(&self.pool, limit).await
    }

    async fn mark_delivered(&self, id: DbId) -> StoreResult<bool> {
        NotificationRepo::mark_delivered(&self.pool, id).await
    }

    async fn list_for_service(&self, service_id: ServiceId) -> StoreResult<Vec<Notification>> {
        NotificationRepo::list_for_service(&self.pool, service_id).await
    }
}

#[async_trait]
impl WorkflowStore for PgStore {
    async fn save_workflow(&self, workflow: NewWorkflow) -> StoreResult<Workflow> {
        WorkflowRepo::create(&self.pool, &workflow).await
    }

    async fn find_workflow(&self, id: DbId) -> StoreResult<Option<Workflow>> {
        WorkflowRepo::find_by_id(&self.pool, id).await
    }

    async fn record_node_service(
        &self,
        workflow_id: DbId,
        node_id: &str,
        service_id: ServiceId,
    ) -> StoreResult<()> {
        WorkflowRepo::record_node_service(&self.pool, workflow_id, node_id, service_id).await
    }

    async fn record_skipped_node(&self, workflow_id: DbId, node_id: &str) -> StoreResult<()> {
        WorkflowRepo::record_skipped_node(&self.pool, workflow_id, node_id).await
    }

    async fn try_lock(&self, key: &str, holder: &str) -> StoreResult<bool> {
        WorkflowRepo::try_lock(&self.pool, key, holder).await
    }

    async fn unlock(&self, key: &str, holder: &str) -> StoreResult<bool> {
        WorkflowRepo::unlock(&self.pool, key, holder).await
    }
}

#[async_trait]
impl ScheduledServiceStore for PgStore {
    async fn create_scheduled(
        &self,
        template: NewScheduledService,
        next_start_time: Option<Timestamp>,
    ) -> StoreResult<ScheduledService> {
        ScheduledServiceRepo::create(&self.pool, &template, next_start_time).await
    }

    async fn find_scheduled(&self, id: DbId) -> StoreResult<Option<ScheduledService>> {
        ScheduledServiceRepo::find_by_id(&self.pool, id).await
    }

    async fn list_due(&self, now: Timestamp, limit: i64) -> StoreResult<Vec<ScheduledService>> {
        ScheduledServiceRepo::list_due(&self.pool, now, limit).await
    }

    async fn advance_schedule(
        &self,
        id: DbId,
        expected_next: Option<Timestamp>,
        started_at: Timestamp,
        next: Option<Timestamp>,
    ) -> StoreResult<bool> {
        ScheduledServiceRepo::advance_schedule(&self.pool, id, expected_next, started_at, next)
            .await
    }

    async fn set_disabled(&self, id: DbId, disabled: bool) -> StoreResult<bool> {
        ScheduledServiceRepo::set_disabled(&self.pool, id, disabled).await
    }
}

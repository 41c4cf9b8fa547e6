//! Queue facade over the store for one dispatcher instance.
//!
//! Ordering and atomic claim live in the store. This type adds the queue
//! identity, the waiting-capacity rule for roots and the promotion of
//! deferred roots as capacity frees.

use std::sync::Arc;

use pipewright_core::lifecycle::EVENT_QUEUED;
use pipewright_core::scheduling::ServiceState;
use pipewright_db::models::service::{
    ClaimRequest, ClaimScope, Claimed, ServiceEvent, ServiceRecord, StateChange,
};
use pipewright_db::store::{ServiceStore, StoreResult};

use crate::slots::SlotManager;

/// Deferred roots promoted per refresh when the waiting queue is unlimited.
const UNLIMITED_REFRESH_BATCH: usize = 1000;

pub struct JobQueue {
    store: Arc<dyn ServiceStore>,
    slots: Arc<SlotManager>,
    queue_id: String,
    only_pre_assigned: bool,
}

impl JobQueue {
    pub fn new(
        store: Arc<dyn ServiceStore>,
        slots: Arc<SlotManager>,
        queue_id: impl Into<String>,
        only_pre_assigned: bool,
    ) -> Self {
        Self {
            store,
            slots,
            queue_id: queue_id.into(),
            only_pre_assigned,
        }
    }

    pub fn queue_id(&self) -> &str {
        &self.queue_id
    }

    fn queued_event(&self) -> ServiceEvent {
        ServiceEvent::new(
            EVENT_QUEUED,
            format!("Waiting to be processed on '{}'", self.queue_id),
        )
    }

    /// Promote a `CREATED` record to `QUEUED`.
    ///
    /// Roots are deferred (left `CREATED`, `None` returned) when the waiting
    /// queue is full. Children always bypass the limit.
    pub async fn enqueue(&self, record: &ServiceRecord) -> StoreResult<Option<ServiceRecord>> {
        if record.is_root() {
            let waiting = self.waiting_count().await?;
            if self.slots.waiting_capacity(waiting) == Some(0) {
                tracing::debug!(
                    service_id = record.id(),
                    queue_id = %self.queue_id,
                    waiting,
                    "Waiting queue full, service deferred"
                );
                return Ok(None);
            }
        }

        self.store
            .update_state(
                record.id(),
                StateChange::from_states(&[ServiceState::Created], ServiceState::Queued)
                    .with_event(self.queued_event()),
            )
            .await
    }

    /// Promote deferred roots into freed waiting capacity, best first.
    pub async fn refresh(&self) -> StoreResult<Vec<ServiceRecord>> {
        let limit = match self.slots.waiting_capacity(self.waiting_count().await?) {
            Some(0) => return Ok(Vec::new()),
            Some(capacity) => capacity,
            None => UNLIMITED_REFRESH_BATCH,
        };
        let promoted = self
            .store
            .promote_created(
                &self.queue_id,
                limit,
                self.only_pre_assigned,
                self.queued_event(),
            )
            .await?;
        if !promoted.is_empty() {
            tracing::debug!(
                queue_id = %self.queue_id,
                promoted = promoted.len(),
                "Deferred services queued"
            );
        }
        Ok(promoted)
    }

    /// Atomically claim up to `limit` records for this queue.
    pub async fn claim(
        &self,
        states: &[ServiceState],
        limit: usize,
        scope: ClaimScope,
    ) -> StoreResult<Vec<Claimed>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let request = ClaimRequest::new(self.queue_id.clone(), states, limit)
            .scope(scope)
            .only_pre_assigned(self.only_pre_assigned);
        self.store.claim_by_queue_and_state(&request).await
    }

    /// Records waiting to be claimed.
    pub async fn waiting_count(&self) -> StoreResult<usize> {
        let count = self
            .store
            .count_in_states(&self.queue_id, ServiceState::CLAIMABLE)
            .await?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Records dispatched, running or waiting for dependencies.
    pub async fn running_count(&self) -> StoreResult<usize> {
        let count = self
            .store
            .count_in_states(&self.queue_id, ServiceState::IN_FLIGHT)
            .await?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewright_db::models::service::NewService;
    use pipewright_db::MemoryStore;

    fn queue(store: Arc<MemoryStore>, max_waiting: usize) -> JobQueue {
        JobQueue::new(store, Arc::new(SlotManager::new(10, max_waiting)), "q1", false)
    }

    // -- enqueue ---------------------------------------------------------

    #[tokio::test]
    async fn enqueue_records_waiting_event() {
        let store = Arc::new(MemoryStore::new());
        let jobs = queue(store.clone(), 0);
        let record = store.save_hierarchy(NewService::new("p")).await.unwrap();

        let queued = jobs.enqueue(&record).await.unwrap().expect("queued");

        assert_eq!(queued.state, ServiceState::Queued);
        assert_eq!(
            queued.last_event().map(|e| e.message.as_str()),
            Some("Waiting to be processed on 'q1'")
        );
    }

    #[tokio::test]
    async fn roots_beyond_waiting_limit_are_deferred_children_are_not() {
        let store = Arc::new(MemoryStore::new());
        let jobs = queue(store.clone(), 1);
        let first = store.save_hierarchy(NewService::new("p")).await.unwrap();
        let second = store.save_hierarchy(NewService::new("p")).await.unwrap();
        let child = store
            .save_hierarchy(NewService::new("p").child_of(first.id()))
            .await
            .unwrap();

        assert!(jobs.enqueue(&first).await.unwrap().is_some());
        assert!(jobs.enqueue(&second).await.unwrap().is_none());
        assert!(jobs.enqueue(&child).await.unwrap().is_some());

        let deferred = store.find_by_id(second.id()).await.unwrap().unwrap();
        assert_eq!(deferred.state, ServiceState::Created);
    }

    #[tokio::test]
    async fn refresh_promotes_when_capacity_frees() {
        let store = Arc::new(MemoryStore::new());
        let jobs = queue(store.clone(), 1);
        let first = store.save_hierarchy(NewService::new("p")).await.unwrap();
        let second = store
            .save_hierarchy(NewService::new("p").with_priority(5))
            .await
            .unwrap();
        jobs.enqueue(&first).await.unwrap();
        jobs.enqueue(&second).await.unwrap();

        assert!(jobs.refresh().await.unwrap().is_empty());

        let claimed = jobs
            .claim(ServiceState::CLAIMABLE, 5, ClaimScope::Roots)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);

        let promoted = jobs.refresh().await.unwrap();
        assert_eq!(promoted.iter().map(|r| r.id()).collect::<Vec<_>>(), vec![second.id()]);
        assert_eq!(jobs.waiting_count().await.unwrap(), 1);
        assert_eq!(jobs.running_count().await.unwrap(), 1);
    }

    // -- claim -----------------------------------------------------------

    #[tokio::test]
    async fn two_queues_never_share_a_claim() {
        let store = Arc::new(MemoryStore::new());
        let a = queue(store.clone(), 0);
        let b = queue(store.clone(), 0);
        let record = store.save_hierarchy(NewService::new("p")).await.unwrap();
        a.enqueue(&record).await.unwrap();

        let (ra, rb) = tokio::join!(
            a.claim(&[ServiceState::Queued], 1, ClaimScope::Any),
            b.claim(&[ServiceState::Queued], 1, ClaimScope::Any),
        );

        assert_eq!(ra.unwrap().len() + rb.unwrap().len(), 1);
    }
}

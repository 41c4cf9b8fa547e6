//! What a processor gets to work with: the record being processed, a
//! handle for submitting child services, the store and a cancel token.

use std::sync::Arc;
use std::time::Duration;

use pipewright_core::lifecycle::{EVENT_RUN, EVENT_WAIT_FOR_DEPENDENCIES};
use pipewright_core::scheduling::ServiceState;
use pipewright_core::types::ServiceId;
use pipewright_db::models::service::{NewService, ServiceEvent, ServiceRecord, StateChange};
use pipewright_db::store::ServiceStore;
use pipewright_events::bus::{EngineEvent, EventBus, SERVICE_SUBMITTED};
use serde_json::json;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::computation::{suspend_until, Computation, ComputationError, Cond, FnCond};
use crate::error::EngineResult;
use crate::job_queue::JobQueue;
use crate::registry::ProcessorRegistry;

// ---------------------------------------------------------------------------
// ServiceSubmitter
// ---------------------------------------------------------------------------

struct SubmitterInner {
    store: Arc<dyn ServiceStore>,
    registry: Arc<ProcessorRegistry>,
    job_queue: Arc<JobQueue>,
    bus: Arc<EventBus>,
    wake: Arc<Notify>,
}

/// Validates, persists and enqueues submissions. Cheap to clone.
#[derive(Clone)]
pub struct ServiceSubmitter {
    inner: Arc<SubmitterInner>,
}

impl ServiceSubmitter {
    pub fn new(
        store: Arc<dyn ServiceStore>,
        registry: Arc<ProcessorRegistry>,
        job_queue: Arc<JobQueue>,
        bus: Arc<EventBus>,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            inner: Arc::new(SubmitterInner {
                store,
                registry,
                job_queue,
                bus,
                wake,
            }),
        }
    }

    /// Check a submission against the registry without persisting it.
    pub fn validate(&self, service: &NewService) -> EngineResult<()> {
        self.inner.registry.validate(service)?;
        Ok(())
    }

    /// Validate, persist and enqueue one service.
    pub async fn submit(&self, service: NewService) -> EngineResult<ServiceRecord> {
        self.validate(&service)?;
        self.persist(service).await
    }

    /// Submit `child` under `parent`. The child joins the parent's
    /// dependency set, outranks it and stays on its queue.
    pub async fn submit_child(
        &self,
        parent: &ServiceRecord,
        child: NewService,
    ) -> EngineResult<ServiceRecord> {
        self.submit(child.child_of(parent.id())).await
    }

    /// Persist and enqueue an already validated submission.
    pub(crate) async fn persist(&self, service: NewService) -> EngineResult<ServiceRecord> {
        let record = self.inner.store.save_hierarchy(service).await?;
        let record = match self.inner.job_queue.enqueue(&record).await? {
            Some(queued) => queued,
            None => record,
        };

        tracing::info!(
            service_id = record.id(),
            name = %record.name,
            parent_id = ?record.identity.parent_id,
            priority = record.priority,
            state = %record.state,
            "Service submitted"
        );
        self.inner.bus.publish(
            EngineEvent::new(SERVICE_SUBMITTED)
                .with_service(record.id(), record.state)
                .with_payload(json!({ "name": record.name, "priority": record.priority })),
        );
        self.wake();
        Ok(record)
    }

    /// Wake the dispatcher loop before its next tick.
    pub fn wake(&self) {
        self.inner.wake.notify_one();
    }
}

// ---------------------------------------------------------------------------
// ProcessingContext
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ProcessingContext {
    /// The record as it was when processing started (state `RUNNING`).
    pub record: ServiceRecord,
    pub submitter: ServiceSubmitter,
    pub store: Arc<dyn ServiceStore>,
    /// Fired on cancellation, suspension or timeout.
    pub cancel: CancellationToken,
    /// Re-check interval used by [`wait_for_dependencies`](Self::wait_for_dependencies).
    pub dependency_poll: Duration,
}

impl ProcessingContext {
    pub fn service_id(&self) -> ServiceId {
        self.record.id()
    }

    pub async fn submit_child(&self, child: NewService) -> EngineResult<ServiceRecord> {
        self.submitter.submit_child(&self.record, child).await
    }

    /// Park the record in `WAITING_FOR_DEPENDENCIES` until every listed
    /// service is terminal, then move it back to `RUNNING`.
    ///
    /// Completes with the terminal records in the order given. Fails with
    /// `Canceled` if the record leaves the running states meanwhile.
    pub fn wait_for_dependencies(&self, ids: Vec<ServiceId>) -> Computation<Vec<ServiceRecord>> {
        let store = self.store.clone();
        let id = self.service_id();
        let poll = self.dependency_poll;

        let park = {
            let store = store.clone();
            let count = ids.len();
            Computation::from_future(async move {
                let change = StateChange::from_states(
                    &[ServiceState::Running, ServiceState::WaitingForDependencies],
                    ServiceState::WaitingForDependencies,
                )
                .with_event(ServiceEvent::new(
                    EVENT_WAIT_FOR_DEPENDENCIES,
                    format!("Waiting for {count} dependencies"),
                ));
                match store.update_state(id, change).await? {
                    Some(_) => Ok(()),
                    None => Err(ComputationError::Canceled),
                }
            })
        };

        let wait_store = store.clone();
        park.and_then(move |()| {
            suspend_until(
                FnCond(move || {
                    let store = wait_store.clone();
                    let ids = ids.clone();
                    async move {
                        let records = load_all(store.as_ref(), &ids).await?;
                        let done = records.iter().all(|r| r.state.is_terminal());
                        Ok::<_, ComputationError>(Cond {
                            state: records,
                            satisfied: done,
                        })
                    }
                }),
                poll,
            )
        })
        .and_then(move |records| {
            Computation::from_future(async move {
                let change = StateChange::from_states(
                    &[ServiceState::WaitingForDependencies],
                    ServiceState::Running,
                )
                .with_event(ServiceEvent::new(EVENT_RUN, "Dependencies finished"));
                match store.update_state(id, change).await? {
                    Some(_) => Ok(records),
                    None => Err(ComputationError::Canceled),
                }
            })
        })
    }
}

async fn load_all(
    store: &dyn ServiceStore,
    ids: &[ServiceId],
) -> Result<Vec<ServiceRecord>, ComputationError> {
    let mut records = Vec::with_capacity(ids.len());
    for &id in ids {
        let record = store
            .find_by_id(id)
            .await?
            .ok_or_else(|| ComputationError::failed(format!("Dependency {id} not found")))?;
        records.push(record);
    }
    Ok(records)
}

/// Fail with `DependencyFailed` for the first record that did not succeed.
pub fn require_success(records: &[ServiceRecord]) -> Result<(), ComputationError> {
    match records.iter().find(|r| !r.state.is_successful()) {
        Some(r) => Err(ComputationError::DependencyFailed {
            dependency_id: r.id(),
            state: r.state,
        }),
        None => Ok(()),
    }
}

//! Management surface of the engine.
//!
//! [`ServiceEngine`] wires the store, registry, queue, slots, dispatcher and
//! scheduler together and exposes the operator operations: submission,
//! state and priority updates, slot tuning, metadata, search and output
//! access.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use pipewright_core::error::CoreError;
use pipewright_core::graph::GraphSnapshot;
use pipewright_core::lifecycle::{
    LifecycleStage, EVENT_CANCELED, EVENT_DEPENDENCY_FAILED, EVENT_RESUME, EVENT_SUSPEND,
    EVENT_UPDATE_PRIORITY, EVENT_UPDATE_STATE, MSG_KILLED_BY_DEPENDENCY_CANCELLATION,
};
use pipewright_core::metadata::ProcessorMetadata;
use pipewright_core::scheduling::{state_machine, ServiceState};
use pipewright_core::types::{DbId, ServiceId};
use pipewright_db::models::search::{Page, PageRequest, ServicePattern, TimeRange};
use pipewright_db::models::service::{NewService, ServiceEvent, ServiceRecord, StateChange};
use pipewright_db::store::{NotificationStore, ScheduledServiceStore, ServiceStore, WorkflowStore};
use pipewright_db::{DbPool, MemoryStore, PgStore};
use pipewright_events::bus::{EngineEvent, EventBus, SERVICE_PRIORITY_CHANGED};
use pipewright_events::notifier::NotificationDispatcher;
use serde_json::json;
use tokio::sync::Notify;

use crate::config::EngineConfig;
use crate::context::ServiceSubmitter;
use crate::dispatcher::{DispatchSettings, Dispatcher, RunningJobs};
use crate::error::{EngineError, EngineResult};
use crate::job_queue::JobQueue;
use crate::output::{open_output, OutputStream};
use crate::registry::ProcessorRegistry;
use crate::scheduler::ServiceScheduler;
use crate::slots::{ServerStats, SlotManager};
use crate::task_queue::ComputationQueue;
use crate::workflow::workflow_snapshot;

// ---------------------------------------------------------------------------
// Stores
// ---------------------------------------------------------------------------

/// The persistence ports the engine runs against.
#[derive(Clone)]
pub struct Stores {
    pub services: Arc<dyn ServiceStore>,
    pub notifications: Arc<dyn NotificationStore>,
    pub workflows: Arc<dyn WorkflowStore>,
    pub scheduled: Arc<dyn ScheduledServiceStore>,
}

impl Stores {
    /// All ports backed by one in-process store.
    pub fn memory() -> Self {
        Self::shared(Arc::new(MemoryStore::new()))
    }

    /// All ports backed by PostgreSQL.
    pub fn postgres(pool: DbPool) -> Self {
        Self::shared(Arc::new(PgStore::new(pool)))
    }

    /// All ports backed by one store implementing every trait.
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: ServiceStore + NotificationStore + WorkflowStore + ScheduledServiceStore + 'static,
    {
        Self {
            services: store.clone(),
            notifications: store.clone(),
            workflows: store.clone(),
            scheduled: store,
        }
    }
}

// ---------------------------------------------------------------------------
// ServiceEngine
// ---------------------------------------------------------------------------

pub struct ServiceEngine {
    config: EngineConfig,
    stores: Stores,
    registry: Arc<ProcessorRegistry>,
    slots: Arc<SlotManager>,
    job_queue: Arc<JobQueue>,
    notifier: Arc<NotificationDispatcher>,
    bus: Arc<EventBus>,
    submitter: ServiceSubmitter,
    dispatcher: Dispatcher,
    scheduler: ServiceScheduler,
    running: Arc<RunningJobs>,
}

impl ServiceEngine {
    pub fn new(
        config: EngineConfig,
        stores: Stores,
        registry: ProcessorRegistry,
        bus: Arc<EventBus>,
    ) -> Self {
        let registry = Arc::new(registry);
        let slots = Arc::new(SlotManager::new(
            config.processing_slots,
            config.max_waiting_slots,
        ));
        let job_queue = Arc::new(JobQueue::new(
            stores.services.clone(),
            slots.clone(),
            config.queue_id.clone(),
            config.only_pre_assigned,
        ));
        let wake = Arc::new(Notify::new());
        let submitter = ServiceSubmitter::new(
            stores.services.clone(),
            registry.clone(),
            job_queue.clone(),
            bus.clone(),
            wake.clone(),
        );
        let notifier = Arc::new(
            NotificationDispatcher::new(stores.notifications.clone()).with_bus(bus.clone()),
        );
        let running = Arc::new(RunningJobs::default());

        let dispatcher = Dispatcher {
            store: stores.services.clone(),
            job_queue: job_queue.clone(),
            slots: slots.clone(),
            registry: registry.clone(),
            computations: ComputationQueue::new(config.task_pool_size),
            notifier: notifier.clone(),
            bus: bus.clone(),
            submitter: submitter.clone(),
            running: running.clone(),
            wake,
            settings: DispatchSettings {
                interval: config.dispatch_interval,
                batch_size: config.dispatch_batch_size,
                dependency_poll: config.dependency_poll,
            },
        };
        let scheduler = ServiceScheduler::new(
            stores.scheduled.clone(),
            submitter.clone(),
            config.scheduler_interval,
        );

        tracing::info!(
            queue_id = %config.queue_id,
            processing_slots = config.processing_slots,
            max_waiting_slots = config.max_waiting_slots,
            processors = registry.all_metadata().len(),
            "Service engine initialized"
        );

        Self {
            config,
            stores,
            registry,
            slots,
            job_queue,
            notifier,
            bus,
            submitter,
            dispatcher,
            scheduler,
            running,
        }
    }

    /// Configuration this engine was built with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Dispatch loop owner; exposes the locally running computations.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Cron template scheduler.
    pub fn scheduler(&self) -> &ServiceScheduler {
        &self.scheduler
    }

    /// Submission path shared with running processors.
    pub fn submitter(&self) -> &ServiceSubmitter {
        &self.submitter
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    // -- Submission ---------------------------------------------------------

    /// Validate, persist and enqueue one service.
    pub async fn submit_single_service(&self, service: NewService) -> EngineResult<ServiceRecord> {
        self.submitter.submit(service).await
    }

    /// Submit a chain: each service depends on its predecessor and an earlier
    /// service never ranks below a later one. Nothing is persisted unless
    /// every submission validates.
    pub async fn submit_multiple_services(
        &self,
        services: Vec<NewService>,
    ) -> EngineResult<Vec<ServiceRecord>> {
        for service in &services {
            self.submitter.validate(service)?;
        }

        let mut services = services;
        for i in (0..services.len().saturating_sub(1)).rev() {
            let next = services[i + 1].priority.saturating_add(1);
            services[i].priority = services[i].priority.max(next);
        }

        let mut records = Vec::with_capacity(services.len());
        let mut previous: Option<ServiceId> = None;
        for service in services {
            let service = match previous {
                Some(id) => service.depends_on(id),
                None => service,
            };
            let record = self.submitter.persist(service).await?;
            previous = Some(record.id());
            records.push(record);
        }
        Ok(records)
    }

    // -- State --------------------------------------------------------------

    /// Operator state change.
    ///
    /// Terminal records never change. Without `force` the transition must be
    /// an allowed edge. `CANCELED` cascades to children and dependents,
    /// `SUSPENDED` and `RESUMED` apply to the whole hierarchy.
    pub async fn update_service_state(
        &self,
        id: ServiceId,
        state: ServiceState,
        force: bool,
    ) -> EngineResult<ServiceRecord> {
        let record = self.require(id).await?;
        let invalid = EngineError::InvalidTransition {
            from: record.state,
            to: state,
        };
        if record.state.is_terminal() {
            return Err(invalid);
        }
        if !force && state_machine::validate_transition(record.state, state).is_err() {
            return Err(invalid);
        }

        let updated = match state {
            ServiceState::Canceled => self.cancel(record).await?,
            ServiceState::Suspended => self.suspend(record, force).await?,
            ServiceState::Resumed => self.resume(record).await?,
            _ => self.set_state(record, state).await?,
        };
        self.submitter.wake();
        Ok(updated)
    }

    async fn cancel(&self, record: ServiceRecord) -> EngineResult<ServiceRecord> {
        let store = &self.stores.services;
        let change = StateChange::forced(ServiceState::Canceled)
            .with_event(ServiceEvent::new(EVENT_CANCELED, "Canceled by operator"));
        let canceled = store
            .update_state(record.id(), change)
            .await?
            .ok_or_else(|| conflict(&record, ServiceState::Canceled))?;
        tracing::info!(service_id = canceled.id(), "Service canceled");
        self.interrupt(&canceled, LifecycleStage::FailedProcessing).await;

        // Children go down with their parent; dependents of anything that
        // went down fail unless force-independent.
        let mut seen = BTreeSet::from([canceled.id()]);
        let mut pending = VecDeque::from([canceled.id()]);
        while let Some(down) = pending.pop_front() {
            for child in store.find_children(down).await? {
                if child.state.is_terminal() || !seen.insert(child.id()) {
                    continue;
                }
                let change = StateChange::forced(ServiceState::Canceled)
                    .with_event(ServiceEvent::new(EVENT_CANCELED, "Parent canceled"));
                if let Some(child) = store.update_state(child.id(), change).await? {
                    self.interrupt(&child, LifecycleStage::FailedProcessing).await;
                    pending.push_back(child.id());
                }
            }

            for dependent in store.find_dependents(down).await? {
                if dependent.force_independent
                    || dependent.state.is_terminal()
                    || !seen.insert(dependent.id())
                {
                    continue;
                }
                let change = StateChange::forced(ServiceState::Error).with_event(
                    ServiceEvent::new(EVENT_DEPENDENCY_FAILED, MSG_KILLED_BY_DEPENDENCY_CANCELLATION),
                );
                if let Some(killed) = store.update_state(dependent.id(), change).await? {
                    tracing::info!(
                        service_id = killed.id(),
                        dependency_id = down,
                        "Dependent killed by cancellation"
                    );
                    self.interrupt(&killed, LifecycleStage::FailedProcessing).await;
                    pending.push_back(killed.id());
                }
            }
        }

        Ok(canceled)
    }

    async fn suspend(&self, record: ServiceRecord, force: bool) -> EngineResult<ServiceRecord> {
        let store = &self.stores.services;
        let event = ServiceEvent::new(EVENT_SUSPEND, "Suspended by operator");
        let change = if force {
            StateChange::forced(ServiceState::Suspended)
        } else {
            StateChange::guarded(ServiceState::Suspended)
        };
        let suspended = store
            .update_state(record.id(), change.with_event(event.clone()))
            .await?
            .ok_or_else(|| conflict(&record, ServiceState::Suspended))?;
        self.interrupt(&suspended, LifecycleStage::SuspendProcessing)
            .await;

        for descendant in self.descendants(record.id()).await? {
            let change = StateChange::guarded(ServiceState::Suspended).with_event(event.clone());
            if let Some(child) = store.update_state(descendant.id(), change).await? {
                self.interrupt(&child, LifecycleStage::SuspendProcessing).await;
            }
        }
        tracing::info!(service_id = suspended.id(), "Service hierarchy suspended");
        Ok(suspended)
    }

    async fn resume(&self, record: ServiceRecord) -> EngineResult<ServiceRecord> {
        let store = &self.stores.services;
        let event = ServiceEvent::new(EVENT_RESUME, "Resumed by operator");
        let resume = || {
            StateChange::from_states(&[ServiceState::Suspended], ServiceState::Resumed)
                .with_event(event.clone())
        };
        let resumed = store
            .update_state(record.id(), resume())
            .await?
            .ok_or_else(|| conflict(&record, ServiceState::Resumed))?;
        self.publish_state(&resumed);

        for descendant in self.descendants(record.id()).await? {
            if let Some(child) = store.update_state(descendant.id(), resume()).await? {
                self.publish_state(&child);
            }
        }
        tracing::info!(service_id = resumed.id(), "Service hierarchy resumed");
        Ok(resumed)
    }

    async fn set_state(
        &self,
        record: ServiceRecord,
        state: ServiceState,
    ) -> EngineResult<ServiceRecord> {
        let change = StateChange::from_states(&[record.state], state).with_event(ServiceEvent::new(
            EVENT_UPDATE_STATE,
            format!("State set to {state} by operator"),
        ));
        let updated = self
            .stores
            .services
            .update_state(record.id(), change)
            .await?
            .ok_or_else(|| conflict(&record, state))?;
        tracing::info!(service_id = updated.id(), from = %record.state, to = %state, "Service state updated");

        if state.is_terminal() {
            self.interrupt(&updated, LifecycleStage::FailedProcessing)
                .await;
        } else {
            self.publish_state(&updated);
        }
        Ok(updated)
    }

    /// Stop the record's computation if it runs here; otherwise send the
    /// notification the dispatcher would have sent when it stopped.
    async fn interrupt(&self, record: &ServiceRecord, stage: LifecycleStage) {
        self.publish_state(record);
        if self.running.cancel(record.id()) {
            return;
        }
        if stage == LifecycleStage::FailedProcessing && !record.state.is_failure() {
            return;
        }
        self.notifier.notify_logged(record, stage).await;
    }

    /// Children, grandchildren and so on, breadth first.
    async fn descendants(&self, id: ServiceId) -> EngineResult<Vec<ServiceRecord>> {
        let mut out = Vec::new();
        let mut pending = VecDeque::from([id]);
        while let Some(next) = pending.pop_front() {
            for child in self.stores.services.find_children(next).await? {
                pending.push_back(child.id());
                out.push(child);
            }
        }
        Ok(out)
    }

    // -- Priority -----------------------------------------------------------

    /// Re-prioritize a record. Everything reachable from it through children
    /// and dependencies shifts by the same difference, so the relative order
    /// inside the hierarchy is kept. Returns the updated records.
    pub async fn update_service_priority(
        &self,
        id: ServiceId,
        priority: i32,
    ) -> EngineResult<Vec<ServiceRecord>> {
        let record = self.require(id).await?;
        let diff = priority.saturating_sub(record.priority);
        let subtree = self.stores.services.find_subtree(id).await?;
        if diff == 0 {
            return Ok(subtree);
        }

        let updates: Vec<(ServiceId, i32)> = subtree
            .iter()
            .map(|r| (r.id(), r.priority.saturating_add(diff)))
            .collect();
        self.stores.services.update_priorities(&updates).await?;
        for &(service_id, new_priority) in &updates {
            self.stores
                .services
                .append_event(
                    service_id,
                    ServiceEvent::new(
                        EVENT_UPDATE_PRIORITY,
                        format!("Priority set to {new_priority}"),
                    ),
                )
                .await?;
        }

        tracing::info!(
            service_id = id,
            priority,
            diff,
            updated = updates.len(),
            "Service priority updated"
        );
        self.bus.publish(
            EngineEvent::new(SERVICE_PRIORITY_CHANGED)
                .with_service(id, record.state)
                .with_payload(json!({ "priority": priority, "updated": updates.len() })),
        );
        self.submitter.wake();
        Ok(self.stores.services.find_subtree(id).await?)
    }

    // -- Slots --------------------------------------------------------------

    /// Takes effect on the next dispatch cycle; running jobs are unaffected.
    pub fn set_processing_slots_count(&self, count: usize) {
        self.slots.set_processing_slots(count);
        tracing::info!(processing_slots = count, "Processing slots updated");
        self.submitter.wake();
    }

    /// 0 means unlimited.
    pub fn set_max_waiting_slots(&self, count: usize) {
        self.slots.set_max_waiting_slots(count);
        tracing::info!(max_waiting_slots = count, "Waiting slots updated");
        self.submitter.wake();
    }

    pub async fn get_server_stats(&self) -> EngineResult<ServerStats> {
        let waiting_count = self.job_queue.waiting_count().await?;
        let running_count = self.job_queue.running_count().await?;
        Ok(ServerStats {
            available_slots: self.slots.available(),
            used_slots: self.slots.used(),
            waiting_capacity: self.slots.waiting_capacity(waiting_count),
            waiting_count,
            running_count,
        })
    }

    // -- Metadata -----------------------------------------------------------

    /// Metadata of every registered processor, sorted by name.
    pub fn get_all_services_metadata(&self) -> Vec<ProcessorMetadata> {
        self.registry.all_metadata()
    }

    /// Metadata of the processor registered as `name`.
    pub fn get_service_metadata(&self, name: &str) -> Option<ProcessorMetadata> {
        self.registry.metadata(name)
    }

    // -- Queries ------------------------------------------------------------

    /// One page of records matching `pattern` within `range`.
    pub async fn search_services(
        &self,
        pattern: &ServicePattern,
        range: &TimeRange,
        page: &PageRequest,
    ) -> EngineResult<Page<ServiceRecord>> {
        Ok(self.stores.services.search(pattern, range, page).await?)
    }

    /// Number of records matching `pattern` within `range`.
    pub async fn count_services(
        &self,
        pattern: &ServicePattern,
        range: &TimeRange,
    ) -> EngineResult<i64> {
        Ok(self.stores.services.count(pattern, range).await?)
    }

    /// Current record for `id`, if it exists.
    pub async fn get_service(&self, id: ServiceId) -> EngineResult<Option<ServiceRecord>> {
        Ok(self.stores.services.find_by_id(id).await?)
    }

    /// Open one of the output logs a leaf processor wrote for `id`.
    pub async fn service_output(
        &self,
        id: ServiceId,
        stream: OutputStream,
    ) -> EngineResult<tokio::fs::File> {
        open_output(self.stores.services.as_ref(), id, stream).await
    }

    pub async fn workflow_snapshot(&self, workflow_id: DbId) -> EngineResult<Option<GraphSnapshot>> {
        workflow_snapshot(
            self.stores.workflows.as_ref(),
            self.stores.services.as_ref(),
            workflow_id,
        )
        .await
    }

    async fn require(&self, id: ServiceId) -> EngineResult<ServiceRecord> {
        self.stores
            .services
            .find_by_id(id)
            .await?
            .ok_or_else(|| EngineError::not_found("Service", id))
    }

    fn publish_state(&self, record: &ServiceRecord) {
        self.bus
            .publish(EngineEvent::state_changed(record.id(), record.state));
    }
}

fn conflict(record: &ServiceRecord, to: ServiceState) -> EngineError {
    EngineError::Core(CoreError::Conflict(format!(
        "Service {} changed state before it could move to {to}",
        record.id()
    )))
}

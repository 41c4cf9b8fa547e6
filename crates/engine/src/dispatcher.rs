//! Dispatcher loop.
//!
//! Runs on a fixed cadence or when woken through the shared [`Notify`].
//! Each cycle promotes deferred roots, fails records blocked by a failed
//! dependency, expires timeouts, claims roots within the free slots and
//! children without slots, and starts every claimed record on the
//! [`ComputationQueue`]. Completion is handled by a per-job task that applies
//! the terminal transition and the lifecycle notification.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use pipewright_core::lifecycle::{
    LifecycleStage, EVENT_CANCELED, EVENT_COMPLETED, EVENT_DEPENDENCY_FAILED, EVENT_FAILED,
    EVENT_RUN, EVENT_TIMEOUT,
};
use pipewright_core::scheduling::ServiceState;
use pipewright_core::types::ServiceId;
use pipewright_db::models::service::{
    ClaimScope, Claimed, ServiceEvent, ServiceRecord, StateChange,
};
use pipewright_db::store::ServiceStore;
use pipewright_events::bus::{EngineEvent, EventBus};
use pipewright_events::notifier::NotificationDispatcher;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::computation::{Computation, ComputationError};
use crate::context::{ProcessingContext, ServiceSubmitter};
use crate::error::EngineResult;
use crate::job_queue::JobQueue;
use crate::registry::ProcessorRegistry;
use crate::slots::SlotManager;
use crate::task_queue::ComputationQueue;

// ---------------------------------------------------------------------------
// Running jobs
// ---------------------------------------------------------------------------

struct RunningJob {
    token: CancellationToken,
    /// Stopped here through [`RunningJobs::cancel`]; this instance notifies
    /// when the computation ends.
    interrupted: bool,
    /// Stopped because the persisted record left the in-flight states
    /// elsewhere; whoever moved it has notified.
    detached: bool,
}

/// Cancel tokens of the computations this instance is running.
#[derive(Default)]
pub struct RunningJobs {
    jobs: Mutex<HashMap<ServiceId, RunningJob>>,
}

impl RunningJobs {
    fn insert(&self, id: ServiceId, token: CancellationToken) {
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.insert(
                id,
                RunningJob {
                    token,
                    interrupted: false,
                    detached: false,
                },
            );
        }
    }

    fn remove(&self, id: ServiceId) {
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.remove(&id);
        }
    }

    /// Fire the cancel token of `id`. Returns `false` when it is not running
    /// on this instance or was already detached, in which case the caller
    /// sends the lifecycle notification itself.
    pub fn cancel(&self, id: ServiceId) -> bool {
        let Ok(mut jobs) = self.jobs.lock() else {
            return false;
        };
        match jobs.get_mut(&id) {
            Some(job) if !job.detached => {
                job.interrupted = true;
                job.token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Stop `id` because its record was moved out of the in-flight states by
    /// another instance. Returns `false` when it was already stopped.
    fn detach(&self, id: ServiceId) -> bool {
        let Ok(mut jobs) = self.jobs.lock() else {
            return false;
        };
        match jobs.get_mut(&id) {
            Some(job) if !job.interrupted && !job.detached => {
                job.detached = true;
                job.token.cancel();
                true
            }
            _ => false,
        }
    }

    fn is_detached(&self, id: ServiceId) -> bool {
        self.jobs
            .lock()
            .map(|jobs| jobs.get(&id).is_some_and(|job| job.detached))
            .unwrap_or(false)
    }

    fn ids(&self) -> Vec<ServiceId> {
        self.jobs
            .lock()
            .map(|jobs| jobs.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, id: ServiceId) -> bool {
        self.jobs
            .lock()
            .map(|jobs| jobs.contains_key(&id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().map(|jobs| jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Tunables of one dispatcher instance.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub interval: Duration,
    /// Max records claimed per scope per cycle.
    pub batch_size: usize,
    pub dependency_poll: Duration,
}

/// What one cycle did; mostly for logs and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub promoted: usize,
    pub dependency_failures: usize,
    pub timed_out: usize,
    /// Local computations stopped because another instance moved their record.
    pub detached: usize,
    pub started_roots: usize,
    pub started_children: usize,
}

/// The main loop. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Dispatcher {
    pub(crate) store: Arc<dyn ServiceStore>,
    pub(crate) job_queue: Arc<JobQueue>,
    pub(crate) slots: Arc<SlotManager>,
    pub(crate) registry: Arc<ProcessorRegistry>,
    pub(crate) computations: ComputationQueue,
    pub(crate) notifier: Arc<NotificationDispatcher>,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) submitter: ServiceSubmitter,
    pub(crate) running: Arc<RunningJobs>,
    pub(crate) wake: Arc<Notify>,
    pub(crate) settings: DispatchSettings,
}

impl Dispatcher {
    pub fn computations(&self) -> &ComputationQueue {
        &self.computations
    }

    pub fn running(&self) -> &RunningJobs {
        &self.running
    }

    /// Run until `cancel` fires. Store errors are logged and the loop
    /// continues with the next cycle.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            queue_id = %self.job_queue.queue_id(),
            interval_ms = self.settings.interval.as_millis() as u64,
            batch_size = self.settings.batch_size,
            "Dispatcher started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Dispatcher shutting down");
                    break;
                }
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
            }

            if let Err(e) = self.run_cycle().await {
                tracing::error!(error = %e, "Dispatch cycle failed");
            }
        }
    }

    /// One dispatch cycle.
    pub async fn run_cycle(&self) -> EngineResult<CycleReport> {
        let mut report = CycleReport {
            promoted: self.job_queue.refresh().await?.len(),
            ..CycleReport::default()
        };
        report.dependency_failures = self.fail_blocked().await?;
        report.timed_out = self.expire_timeouts().await?;
        report.detached = self.detach_moved().await?;

        let batch = self.settings.batch_size;
        let free = self.slots.available();
        if free == 0 {
            tracing::debug!(
                queue_id = %self.job_queue.queue_id(),
                used = self.slots.used(),
                "No free processing slots"
            );
        } else {
            let roots = self
                .job_queue
                .claim(ServiceState::CLAIMABLE, free.min(batch), ClaimScope::Roots)
                .await?;
            report.started_roots = roots.len();
            for claimed in roots {
                self.slots.acquire();
                self.start(claimed).await;
            }
        }

        let children = self
            .job_queue
            .claim(ServiceState::CLAIMABLE, batch, ClaimScope::Children)
            .await?;
        report.started_children = children.len();
        for claimed in children {
            self.start(claimed).await;
        }

        if report != CycleReport::default() {
            tracing::debug!(?report, "Dispatch cycle finished");
        }
        Ok(report)
    }

    /// Move pending records whose dependency failed to `ERROR`.
    async fn fail_blocked(&self) -> EngineResult<usize> {
        let blocked = self
            .store
            .find_blocked_by_failure(self.job_queue.queue_id(), self.settings.batch_size)
            .await?;
        let mut failed = 0;

        for b in blocked {
            let message = format!(
                "Dependency {} finished in {}",
                b.failed_dependency, b.dependency_state
            );
            let change = StateChange::from_states(
                &[ServiceState::Created, ServiceState::Queued, ServiceState::Resumed],
                ServiceState::Error,
            )
            .with_event(ServiceEvent::new(EVENT_DEPENDENCY_FAILED, message));

            match self.store.update_state(b.service.id(), change).await {
                Ok(Some(record)) => {
                    tracing::info!(
                        service_id = record.id(),
                        dependency_id = b.failed_dependency,
                        dependency_state = %b.dependency_state,
                        "Service failed by dependency"
                    );
                    self.publish_state(&record);
                    self.notifier
                        .notify_logged(&record, LifecycleStage::FailedProcessing)
                        .await;
                    failed += 1;
                }
                Ok(None) => {}
                Err(e) => tracing::error!(
                    error = %e,
                    service_id = b.service.id(),
                    "Failed to apply dependency failure"
                ),
            }
        }
        Ok(failed)
    }

    /// Move in-flight records past their timeout to `TIMEOUT` and fire their
    /// cancel tokens. The CAS makes this happen once per record.
    async fn expire_timeouts(&self) -> EngineResult<usize> {
        let expired = self
            .store
            .find_expired(self.job_queue.queue_id(), Utc::now(), self.settings.batch_size)
            .await?;
        let mut timed_out = 0;

        for record in expired {
            let limit_ms = record.timeout().map(|t| t.as_millis()).unwrap_or_default();
            let change = StateChange::from_states(ServiceState::IN_FLIGHT, ServiceState::Timeout)
                .with_event(ServiceEvent::new(
                    EVENT_TIMEOUT,
                    format!("Timed out after {limit_ms} ms"),
                ));
            match self.store.update_state(record.id(), change).await {
                Ok(Some(updated)) => {
                    tracing::warn!(service_id = updated.id(), limit_ms, "Service timed out");
                    self.running.cancel(updated.id());
                    self.publish_state(&updated);
                    self.notifier
                        .notify_logged(&updated, LifecycleStage::FailedProcessing)
                        .await;
                    timed_out += 1;
                }
                Ok(None) => {}
                Err(e) => tracing::error!(
                    error = %e,
                    service_id = record.id(),
                    "Failed to expire service"
                ),
            }
        }
        Ok(timed_out)
    }

    /// Stop local computations whose record left the in-flight states
    /// without passing through this instance, e.g. canceled or suspended
    /// through another engine on the same store.
    async fn detach_moved(&self) -> EngineResult<usize> {
        let mut detached = 0;
        for id in self.running.ids() {
            let state = self.store.find_by_id(id).await?.map(|r| r.state);
            let moved = state.map_or(true, |s| !ServiceState::IN_FLIGHT.contains(&s));
            if moved && self.running.detach(id) {
                tracing::info!(
                    service_id = id,
                    state = ?state,
                    "Stopping service moved by another instance"
                );
                detached += 1;
            }
        }
        Ok(detached)
    }

    /// Move a claimed record to `RUNNING` and hand its computation to the pool.
    async fn start(&self, claimed: Claimed) {
        let Claimed {
            previous_state,
            service,
        } = claimed;
        let id = service.id();
        let run = StateChange::from_states(&[ServiceState::Dispatched], ServiceState::Running)
            .with_event(ServiceEvent::new(EVENT_RUN, format!("Running {}", service.name)));

        let record = match self.store.update_state(id, run).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::debug!(service_id = id, "Claimed service changed state before start");
                self.release(&service);
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, service_id = id, "Failed to start service");
                self.spawn_finish(service, Computation::failed(ComputationError::from(e)), None);
                return;
            }
        };

        tracing::info!(
            service_id = id,
            name = %record.name,
            previous_state = %previous_state,
            "Service started"
        );
        self.publish_state(&record);
        let stage = if previous_state == ServiceState::Resumed {
            LifecycleStage::ResumeProcessing
        } else if record.has_failed_before() {
            LifecycleStage::RetryProcessing
        } else {
            LifecycleStage::StartProcessing
        };
        self.notifier.notify_logged(&record, stage).await;

        let cancel = CancellationToken::new();
        let computation = match self.registry.get(&record.name) {
            Some(processor) => {
                let ctx = ProcessingContext {
                    record: record.clone(),
                    submitter: self.submitter.clone(),
                    store: self.store.clone(),
                    cancel: cancel.clone(),
                    dependency_poll: self.settings.dependency_poll,
                };
                let built = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    processor.process(ctx)
                }));
                built.unwrap_or_else(|_| {
                    Computation::failed(ComputationError::failed("Processor panicked"))
                })
            }
            None => Computation::failed(ComputationError::failed(format!(
                "No processor registered for '{}'",
                record.name
            ))),
        };

        let computation = match record.timeout() {
            Some(limit) => computation.with_timeout(limit, Instant::now()),
            None => computation,
        };
        self.spawn_finish(record, computation, Some(cancel));
    }

    fn spawn_finish(
        &self,
        record: ServiceRecord,
        computation: Computation<Value>,
        cancel: Option<CancellationToken>,
    ) {
        let cancel = cancel.unwrap_or_default();
        self.running.insert(record.id(), cancel.clone());
        let handle = self.computations.submit(computation, cancel);
        let this = self.clone();
        tokio::spawn(async move {
            let result = handle.join().await;
            this.finish(&record, result).await;
            this.release(&record);
        });
    }

    /// Give back the slot and the cancel token, then wake the loop.
    fn release(&self, record: &ServiceRecord) {
        if record.is_root() {
            self.slots.release();
        }
        self.running.remove(record.id());
        self.wake.notify_one();
    }

    /// Apply the terminal outcome of a computation.
    async fn finish(&self, record: &ServiceRecord, result: Result<Value, ComputationError>) {
        let id = record.id();
        // The instance that moved the record has applied the transition and
        // notified, and the record may already be running elsewhere.
        if self.running.is_detached(id) {
            tracing::debug!(service_id = id, "Detached computation finished");
            return;
        }
        let outcome = match result {
            Ok(value) => self.complete(id, value).await,
            Err(ComputationError::Timeout { elapsed_ms }) => {
                self.fail(
                    id,
                    ServiceState::Timeout,
                    EVENT_TIMEOUT,
                    format!("Timed out after {elapsed_ms} ms"),
                )
                .await
            }
            Err(ComputationError::Canceled) | Err(ComputationError::Suspended) => {
                self.interrupted(id).await
            }
            Err(e) => {
                let e = e.for_service(id);
                self.fail(id, ServiceState::Error, EVENT_FAILED, format!("Failed: {e}"))
                    .await
            }
        };

        if let Err(e) = outcome {
            tracing::error!(error = %e, service_id = id, "Failed to record service outcome");
            let change = StateChange::from_states(ServiceState::IN_FLIGHT, ServiceState::Error)
                .with_event(ServiceEvent::new(EVENT_FAILED, format!("Failed: {e}")));
            if let Err(e) = self.store.update_state(id, change).await {
                tracing::error!(error = %e, service_id = id, "Failed to mark service as failed");
            }
        }
    }

    async fn complete(&self, id: ServiceId, value: Value) -> EngineResult<()> {
        let change = StateChange::from_states(ServiceState::IN_FLIGHT, ServiceState::Successful)
            .with_event(ServiceEvent::new(EVENT_COMPLETED, "Completed"))
            .with_result(value);
        if let Some(record) = self.store.update_state(id, change).await? {
            tracing::info!(service_id = id, "Service completed");
            self.publish_state(&record);
            self.notifier
                .notify_logged(&record, LifecycleStage::SuccessfulProcessing)
                .await;
        }
        Ok(())
    }

    async fn fail(
        &self,
        id: ServiceId,
        state: ServiceState,
        kind: &str,
        message: String,
    ) -> EngineResult<()> {
        let change = StateChange::from_states(ServiceState::IN_FLIGHT, state)
            .with_event(ServiceEvent::new(kind, message.clone()));
        if let Some(record) = self.store.update_state(id, change).await? {
            tracing::warn!(service_id = id, state = %state, message = %message, "Service failed");
            self.publish_state(&record);
            self.notifier
                .notify_logged(&record, LifecycleStage::FailedProcessing)
                .await;
        }
        Ok(())
    }

    /// A computation stopped by its cancel token. If nobody moved the record
    /// yet it becomes `CANCELED`; otherwise the notification follows the
    /// state the operator (or the timeout sweep) left it in.
    async fn interrupted(&self, id: ServiceId) -> EngineResult<()> {
        let change = StateChange::from_states(ServiceState::IN_FLIGHT, ServiceState::Canceled)
            .with_event(ServiceEvent::new(EVENT_CANCELED, "Canceled"));
        if let Some(record) = self.store.update_state(id, change).await? {
            self.publish_state(&record);
            self.notifier
                .notify_logged(&record, LifecycleStage::FailedProcessing)
                .await;
            return Ok(());
        }

        let Some(record) = self.store.find_by_id(id).await? else {
            return Ok(());
        };
        match record.state {
            ServiceState::Suspended => {
                tracing::info!(service_id = id, "Service suspended");
                self.notifier
                    .notify_logged(&record, LifecycleStage::SuspendProcessing)
                    .await;
            }
            ServiceState::Canceled | ServiceState::Error => {
                self.notifier
                    .notify_logged(&record, LifecycleStage::FailedProcessing)
                    .await;
            }
            // The timeout sweep notifies where it applies the transition.
            _ => {}
        }
        Ok(())
    }

    fn publish_state(&self, record: &ServiceRecord) {
        self.bus
            .publish(EngineEvent::state_changed(record.id(), record.state));
    }
}

//! Cron-driven service templates.
//!
//! Every tick lists due templates and claims each by advancing its schedule
//! with a compare-and-set on the previous next-start time, so with several
//! instances against one store exactly one of them submits a firing.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pipewright_core::cron::CronSchedule;
use pipewright_core::types::{DbId, Timestamp};
use pipewright_db::models::scheduled::{NewScheduledService, ScheduledService};
use pipewright_db::models::service::ServiceRecord;
use pipewright_db::store::ScheduledServiceStore;
use tokio_util::sync::CancellationToken;

use crate::context::ServiceSubmitter;
use crate::error::{EngineError, EngineResult};

/// Templates examined per tick.
const DUE_BATCH_SIZE: i64 = 100;

#[derive(Clone)]
pub struct ServiceScheduler {
    store: Arc<dyn ScheduledServiceStore>,
    submitter: ServiceSubmitter,
    interval: Duration,
}

impl ServiceScheduler {
    pub fn new(
        store: Arc<dyn ScheduledServiceStore>,
        submitter: ServiceSubmitter,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            submitter,
            interval,
        }
    }

    /// Run until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            "Service scheduler started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Service scheduler shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        tracing::error!(error = %e, "Scheduler tick failed");
                    }
                }
            }
        }
    }

    /// Fire every template due at `now` that this instance manages to claim.
    /// Returns the submitted services.
    pub async fn tick(&self, now: Timestamp) -> EngineResult<Vec<ServiceRecord>> {
        let due = self.store.list_due(now, DUE_BATCH_SIZE).await?;
        let mut submitted = Vec::new();

        for template in due {
            let schedule = match CronSchedule::parse(&template.cron_schedule) {
                Ok(schedule) => schedule,
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        scheduled_id = template.id,
                        "Skipping template with invalid cron descriptor"
                    );
                    continue;
                }
            };
            let next = schedule.next_after(now);
            let won = self
                .store
                .advance_schedule(template.id, template.next_start_time, now, next)
                .await?;
            if !won {
                tracing::debug!(scheduled_id = template.id, "Template claimed by another instance");
                continue;
            }
            if next.is_none() {
                tracing::warn!(
                    scheduled_id = template.id,
                    cron = %template.cron_schedule,
                    "Cron descriptor has no further match, disabling template"
                );
                self.store.set_disabled(template.id, true).await?;
            }

            match self.submitter.submit(template.to_new_service()).await {
                Ok(record) => {
                    tracing::info!(
                        scheduled_id = template.id,
                        service_id = record.id(),
                        next_start_time = ?next,
                        "Scheduled service submitted"
                    );
                    submitted.push(record);
                }
                Err(e) => tracing::error!(
                    error = %e,
                    scheduled_id = template.id,
                    "Scheduled service rejected"
                ),
            }
        }
        Ok(submitted)
    }

    /// Store a template after checking its cron descriptor and processor.
    /// The first firing is the next cron match after now.
    pub async fn create(&self, template: NewScheduledService) -> EngineResult<ScheduledService> {
        let schedule = CronSchedule::parse(&template.cron_schedule)?;
        let candidate = ScheduledService {
            id: 0,
            name: template.name.clone(),
            description: template.description.clone(),
            service_name: template.service_name.clone(),
            service_priority: template.service_priority,
            service_queue_id: template.service_queue_id.clone(),
            run_as: template.run_as.clone(),
            service_args: template.service_args.clone(),
            service_dictionary_args: template.service_dictionary_args.clone(),
            service_resources: template.service_resources.clone(),
            cron_schedule: template.cron_schedule.clone(),
            last_start_time: None,
            next_start_time: None,
            disabled: template.disabled,
        };
        self.submitter.validate(&candidate.to_new_service())?;

        let next = schedule.next_after(Utc::now());
        let created = self.store.create_scheduled(template, next).await?;
        tracing::info!(
            scheduled_id = created.id,
            cron = %created.cron_schedule,
            next_start_time = ?next,
            "Scheduled service created"
        );
        Ok(created)
    }

    pub async fn set_disabled(&self, id: DbId, disabled: bool) -> EngineResult<()> {
        if !self.store.set_disabled(id, disabled).await? {
            return Err(EngineError::not_found("ScheduledService", id));
        }
        tracing::info!(scheduled_id = id, disabled, "Scheduled service toggled");
        Ok(())
    }
}

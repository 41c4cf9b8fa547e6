//! In-process implementation of every persistence port.
//!
//! All state sits behind one async mutex, so each port operation is atomic
//! with respect to every other: a claim is a single critical section, which
//! gives the same exactly-once guarantee `FOR UPDATE SKIP LOCKED` gives the
//! Postgres store. Used by the engine tests and by single-process embedding.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use async_trait::async_trait;
use chrono::Utc;
use pipewright_core::lifecycle::EVENT_CREATED;
use pipewright_core::scheduling::ServiceState;
use pipewright_core::types::{DbId, ServiceId, Timestamp};
use regex::Regex;
use tokio::sync::Mutex;

use crate::models::notification::{NewNotification, Notification};
use crate::models::scheduled::{NewScheduledService, ScheduledService};
use crate::models::search::{Page, PageRequest, ServicePattern, TimeRange};
use crate::models::service::{
    ClaimRequest, Claimed, FieldUpdate, Identity, NewService, ServiceEvent, ServiceRecord,
    StateChange,
};
use crate::models::workflow::{NewWorkflow, Workflow};
use crate::store::{
    BlockedService, NotificationStore, ScheduledServiceStore, ServiceStore, StoreError,
    StoreResult, WorkflowStore,
};

#[derive(Default)]
struct Inner {
    services: BTreeMap<ServiceId, ServiceRecord>,
    last_service_id: ServiceId,
    notifications: BTreeMap<DbId, Notification>,
    last_notification_id: DbId,
    workflows: BTreeMap<DbId, Workflow>,
    last_workflow_id: DbId,
    locks: HashMap<String, String>,
    scheduled: BTreeMap<DbId, ScheduledService>,
    last_scheduled_id: DbId,
}

impl Inner {
    fn service_mut(&mut self, id: ServiceId) -> StoreResult<&mut ServiceRecord> {
        self.services.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "Service",
            id,
        })
    }

    /// Whether every dependency of `record` allows it to start.
    fn dependencies_ready(&self, record: &ServiceRecord) -> bool {
        record.dependencies.iter().all(|dep| {
            self.services.get(dep).is_some_and(|d| {
                d.state.is_successful() || (record.force_independent && d.state.is_terminal())
            })
        })
    }

    fn first_failed_dependency(&self, record: &ServiceRecord) -> Option<(ServiceId, ServiceState)> {
        record.dependencies.iter().find_map(|dep| {
            self.services
                .get(dep)
                .filter(|d| d.state.is_failure())
                .map(|d| (d.id(), d.state))
        })
    }
}

/// Sort key shared by claims and promotions.
fn dispatch_order(a: &ServiceRecord, b: &ServiceRecord) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then(a.created_at.cmp(&b.created_at))
        .then(a.id().cmp(&b.id()))
}

fn visible_to(queue_id: &str, record: &ServiceRecord) -> bool {
    record.queue_id.as_deref().map_or(true, |q| q == queue_id)
}

/// Compile a `*` glob into an anchored regex.
fn glob_regex(glob: &str) -> Option<Regex> {
    let pattern = glob
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{pattern}$")).ok()
}

fn matches_pattern(
    record: &ServiceRecord,
    pattern: &ServicePattern,
    name: Option<&Regex>,
    range: &TimeRange,
) -> bool {
    name.map_or(true, |re| re.is_match(&record.name))
        && (pattern.states.is_empty() || pattern.states.contains(&record.state))
        && pattern
            .owner_key
            .as_ref()
            .map_or(true, |o| record.owner_key.as_ref() == Some(o))
        && pattern.tags.iter().all(|t| record.tags.contains(t))
        && pattern
            .parent_id
            .map_or(true, |p| record.identity.parent_id == Some(p))
        && pattern
            .root_id
            .map_or(true, |r| record.identity.root_id == Some(r))
        && pattern
            .queue_id
            .as_ref()
            .map_or(true, |q| record.queue_id.as_ref() == Some(q))
        && range.contains(record.created_at)
}

/// Store holding everything in memory. Cheap to construct; share via `Arc`.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn matching<'a>(
        inner: &'a Inner,
        pattern: &ServicePattern,
        range: &TimeRange,
    ) -> StoreResult<Vec<&'a ServiceRecord>> {
        let name = match pattern.name.as_deref() {
            Some(glob) => Some(glob_regex(glob).ok_or_else(|| {
                StoreError::Validation(format!("Invalid name pattern '{glob}'"))
            })?),
            None => None,
        };
        Ok(inner
            .services
            .values()
            .filter(|r| matches_pattern(r, pattern, name.as_ref(), range))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// ServiceStore
// ---------------------------------------------------------------------------

#[async_trait]
impl ServiceStore for MemoryStore {
    async fn save_hierarchy(&self, mut service: NewService) -> StoreResult<ServiceRecord> {
        let mut inner = self.inner.lock().await;

        if let Some(missing) = service
            .dependencies
            .iter()
            .find(|d| !inner.services.contains_key(*d))
        {
            return Err(StoreError::Validation(format!(
                "Dependency {missing} does not exist"
            )));
        }

        let root_id = match service.parent_id {
            Some(parent_id) => {
                let parent = inner.services.get(&parent_id).ok_or_else(|| {
                    StoreError::Validation(format!("Parent service {parent_id} does not exist"))
                })?;
                Some(service.adopt_parent(parent))
            }
            None => None,
        };

        inner.last_service_id += 1;
        let id = inner.last_service_id;
        let now = Utc::now();
        let identity = Identity {
            id,
            parent_id: service.parent_id,
            root_id,
        };
        let mut record = ServiceRecord::from_new(identity, service, now);
        record
            .events
            .push(ServiceEvent::new(EVENT_CREATED, format!("Created {}", record.name)));

        if let Some(parent_id) = identity.parent_id {
            let parent = inner.service_mut(parent_id)?;
            parent.dependencies.insert(id);
            parent.updated_at = now;
        }
        inner.services.insert(id, record.clone());
        Ok(record)
    }

    async fn find_by_id(&self, id: ServiceId) -> StoreResult<Option<ServiceRecord>> {
        Ok(self.inner.lock().await.services.get(&id).cloned())
    }

    async fn find_dependencies(&self, record: &ServiceRecord) -> StoreResult<Vec<ServiceRecord>> {
        let inner = self.inner.lock().await;
        Ok(record
            .dependencies
            .iter()
            .filter_map(|d| inner.services.get(d).cloned())
            .collect())
    }

    async fn find_dependents(&self, id: ServiceId) -> StoreResult<Vec<ServiceRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .services
            .values()
            .filter(|r| r.dependencies.contains(&id))
            .cloned()
            .collect())
    }

    async fn find_children(&self, id: ServiceId) -> StoreResult<Vec<ServiceRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .services
            .values()
            .filter(|r| r.identity.parent_id == Some(id))
            .cloned()
            .collect())
    }

    async fn find_subtree(&self, id: ServiceId) -> StoreResult<Vec<ServiceRecord>> {
        let inner = self.inner.lock().await;
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([id]);
        let mut out = Vec::new();
        while let Some(next) = queue.pop_front() {
            if !seen.insert(next) {
                continue;
            }
            let Some(record) = inner.services.get(&next) else {
                continue;
            };
            queue.extend(record.dependencies.iter().copied());
            queue.extend(
                inner
                    .services
                    .values()
                    .filter(|r| r.identity.parent_id == Some(next))
                    .map(|r| r.id()),
            );
            out.push(record.clone());
        }
        Ok(out)
    }

    async fn claim_by_queue_and_state(&self, claim: &ClaimRequest) -> StoreResult<Vec<Claimed>> {
        let mut inner = self.inner.lock().await;
        let mut candidates: Vec<&ServiceRecord> = inner
            .services
            .values()
            .filter(|r| {
                claim.states.contains(&r.state)
                    && claim.matches_queue(r.queue_id.as_deref())
                    && claim.matches_scope(&r.identity)
                    && inner.dependencies_ready(r)
            })
            .collect();
        candidates.sort_by(|a, b| dispatch_order(a, b));
        let ids: Vec<ServiceId> = candidates.iter().take(claim.limit).map(|r| r.id()).collect();

        let now = Utc::now();
        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            let record = inner.service_mut(id)?;
            let previous_state = record.state;
            record.state = ServiceState::Dispatched;
            record.queue_id = Some(claim.queue_id.clone());
            record.updated_at = now;
            record.events.push(ServiceEvent::new(
                pipewright_core::lifecycle::EVENT_DISPATCHED,
                format!("Dispatched on '{}'", claim.queue_id),
            ));
            claimed.push(Claimed {
                previous_state,
                service: record.clone(),
            });
        }
        Ok(claimed)
    }

    async fn update_state(
        &self,
        id: ServiceId,
        change: StateChange,
    ) -> StoreResult<Option<ServiceRecord>> {
        let mut inner = self.inner.lock().await;
        let Some(record) = inner.services.get_mut(&id) else {
            return Ok(None);
        };
        if !change.allowed_from.contains(&record.state) {
            return Ok(None);
        }
        let now = Utc::now();
        record.state = change.to;
        record.updated_at = now;
        match change.to {
            ServiceState::Running if record.process_started_at.is_none() => {
                record.process_started_at = Some(now);
            }
            ServiceState::Queued | ServiceState::Resumed => record.process_started_at = None,
            _ => {}
        }
        if let Some(event) = change.event {
            record.events.push(event);
        }
        if let Some(result) = change.result {
            record.result = Some(result);
        }
        Ok(Some(record.clone()))
    }

    async fn append_event(&self, id: ServiceId, event: ServiceEvent) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let record = inner.service_mut(id)?;
        record.events.push(event);
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn update_field(&self, id: ServiceId, update: FieldUpdate) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let record = inner.service_mut(id)?;
        match update {
            FieldUpdate::OutputPaths { stdout, stderr } => {
                record.output_path = stdout;
                record.error_path = stderr;
            }
            FieldUpdate::WorkflowId(workflow_id) => record.workflow_id = Some(workflow_id),
            FieldUpdate::QueueId(queue_id) => record.queue_id = queue_id,
            FieldUpdate::TimeoutMs(timeout_ms) => record.timeout_ms = timeout_ms,
        }
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn update_priorities(&self, updates: &[(ServiceId, i32)]) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some((missing, _)) = updates
            .iter()
            .find(|(id, _)| !inner.services.contains_key(id))
        {
            return Err(StoreError::NotFound {
                entity: "Service",
                id: *missing,
            });
        }
        let now = Utc::now();
        for (id, priority) in updates {
            let record = inner.service_mut(*id)?;
            record.priority = *priority;
            record.updated_at = now;
        }
        Ok(())
    }

    async fn search(
        &self,
        pattern: &ServicePattern,
        range: &TimeRange,
        page: &PageRequest,
    ) -> StoreResult<Page<ServiceRecord>> {
        let inner = self.inner.lock().await;
        let mut matching = Self::matching(&inner, pattern, range)?;
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id().cmp(&a.id())));
        let total = matching.len() as i64;
        let items = matching
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.limit() as usize)
            .cloned()
            .collect();
        Ok(Page {
            items,
            page: page.page,
            page_size: page.limit() as u32,
            total,
        })
    }

    async fn count(&self, pattern: &ServicePattern, range: &TimeRange) -> StoreResult<i64> {
        let inner = self.inner.lock().await;
        Ok(Self::matching(&inner, pattern, range)?.len() as i64)
    }

    async fn count_in_states(&self, queue_id: &str, states: &[ServiceState]) -> StoreResult<i64> {
        let inner = self.inner.lock().await;
        Ok(inner
            .services
            .values()
            .filter(|r| states.contains(&r.state) && visible_to(queue_id, r))
            .count() as i64)
    }

    async fn promote_created(
        &self,
        queue_id: &str,
        limit: usize,
        only_pre_assigned: bool,
        event: ServiceEvent,
    ) -> StoreResult<Vec<ServiceRecord>> {
        let mut inner = self.inner.lock().await;
        let claim = ClaimRequest::new(queue_id, &[ServiceState::Created], limit)
            .only_pre_assigned(only_pre_assigned);
        let mut candidates: Vec<&ServiceRecord> = inner
            .services
            .values()
            .filter(|r| {
                r.state == ServiceState::Created
                    && r.is_root()
                    && claim.matches_queue(r.queue_id.as_deref())
            })
            .collect();
        candidates.sort_by(|a, b| dispatch_order(a, b));
        let ids: Vec<ServiceId> = candidates.iter().take(limit).map(|r| r.id()).collect();

        let now = Utc::now();
        let mut promoted = Vec::with_capacity(ids.len());
        for id in ids {
            let record = inner.service_mut(id)?;
            record.state = ServiceState::Queued;
            record.updated_at = now;
            record.events.push(event.clone());
            promoted.push(record.clone());
        }
        Ok(promoted)
    }

    async fn find_blocked_by_failure(
        &self,
        queue_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<BlockedService>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .services
            .values()
            .filter(|r| {
                matches!(
                    r.state,
                    ServiceState::Created | ServiceState::Queued | ServiceState::Resumed
                ) && !r.force_independent
                    && visible_to(queue_id, r)
            })
            .filter_map(|r| {
                inner
                    .first_failed_dependency(r)
                    .map(|(failed_dependency, dependency_state)| BlockedService {
                        service: r.clone(),
                        failed_dependency,
                        dependency_state,
                    })
            })
            .take(limit)
            .collect())
    }

    async fn find_expired(
        &self,
        queue_id: &str,
        now: Timestamp,
        limit: usize,
    ) -> StoreResult<Vec<ServiceRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .services
            .values()
            .filter(|r| {
                ServiceState::IN_FLIGHT.contains(&r.state)
                    && r.queue_id.as_deref() == Some(queue_id)
                    && r.has_expired(now)
            })
            .take(limit)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// NotificationStore
// ---------------------------------------------------------------------------

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn save(&self, notification: NewNotification) -> StoreResult<Notification> {
        let mut inner = self.inner.lock().await;
        inner.last_notification_id += 1;
        let stored = Notification {
            id: inner.last_notification_id,
            service_id: notification.service_id,
            event_name: notification.event_name,
            stage: notification.stage.as_str().to_string(),
            recipients: notification.recipients,
            data: notification.data,
            delivered_at: None,
            created_at: Utc::now(),
        };
        inner.notifications.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn list_undelivered(&self, limit: i64) -> StoreResult<Vec<Notification>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .notifications
            .values()
            .filter(|n| !n.is_delivered())
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn mark_delivered(&self, id: DbId) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        match inner.notifications.get_mut(&id) {
            Some(n) if n.delivered_at.is_none() => {
                n.delivered_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_for_service(&self, service_id: ServiceId) -> StoreResult<Vec<Notification>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .notifications
            .values()
            .filter(|n| n.service_id == service_id)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// WorkflowStore
// ---------------------------------------------------------------------------

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn save_workflow(&self, workflow: NewWorkflow) -> StoreResult<Workflow> {
        let mut inner = self.inner.lock().await;
        inner.last_workflow_id += 1;
        let stored = Workflow {
            id: inner.last_workflow_id,
            name: workflow.name,
            service_id: workflow.service_id,
            graph: workflow.graph,
            node_services: BTreeMap::new(),
            skipped: BTreeSet::new(),
            created_at: Utc::now(),
        };
        inner.workflows.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn find_workflow(&self, id: DbId) -> StoreResult<Option<Workflow>> {
        Ok(self.inner.lock().await.workflows.get(&id).cloned())
    }

    async fn record_node_service(
        &self,
        workflow_id: DbId,
        node_id: &str,
        service_id: ServiceId,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let workflow = inner
            .workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::NotFound {
                entity: "Workflow",
                id: workflow_id,
            })?;
        workflow.node_services.insert(node_id.to_string(), service_id);
        Ok(())
    }

    async fn record_skipped_node(&self, workflow_id: DbId, node_id: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let workflow = inner
            .workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::NotFound {
                entity: "Workflow",
                id: workflow_id,
            })?;
        workflow.skipped.insert(node_id.to_string());
        Ok(())
    }

    async fn try_lock(&self, key: &str, holder: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let current = inner
            .locks
            .entry(key.to_string())
            .or_insert_with(|| holder.to_string());
        Ok(current == holder)
    }

    async fn unlock(&self, key: &str, holder: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        if inner.locks.get(key).map(String::as_str) == Some(holder) {
            inner.locks.remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

// ---------------------------------------------------------------------------
// ScheduledServiceStore
// ---------------------------------------------------------------------------

#[async_trait]
impl ScheduledServiceStore for MemoryStore {
    async fn create_scheduled(
        &self,
        template: NewScheduledService,
        next_start_time: Option<Timestamp>,
    ) -> StoreResult<ScheduledService> {
        let mut inner = self.inner.lock().await;
        inner.last_scheduled_id += 1;
        let stored = ScheduledService {
            id: inner.last_scheduled_id,
            name: template.name,
            description: template.description,
            service_name: template.service_name,
            service_priority: template.service_priority,
            service_queue_id: template.service_queue_id,
            run_as: template.run_as,
            service_args: template.service_args,
            service_dictionary_args: template.service_dictionary_args,
            service_resources: template.service_resources,
            cron_schedule: template.cron_schedule,
            last_start_time: None,
            next_start_time,
            disabled: template.disabled,
        };
        inner.scheduled.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn find_scheduled(&self, id: DbId) -> StoreResult<Option<ScheduledService>> {
        Ok(self.inner.lock().await.scheduled.get(&id).cloned())
    }

    async fn list_due(&self, now: Timestamp, limit: i64) -> StoreResult<Vec<ScheduledService>> {
        let inner = self.inner.lock().await;
        let mut due: Vec<&ScheduledService> = inner
            .scheduled
            .values()
            .filter(|s| !s.disabled && s.next_start_time.map_or(true, |next| next <= now))
            .collect();
        due.sort_by_key(|s| (s.next_start_time, s.id));
        Ok(due
            .into_iter()
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn advance_schedule(
        &self,
        id: DbId,
        expected_next: Option<Timestamp>,
        started_at: Timestamp,
        next: Option<Timestamp>,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        match inner.scheduled.get_mut(&id) {
            Some(s) if s.next_start_time == expected_next => {
                s.last_start_time = Some(started_at);
                s.next_start_time = next;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_disabled(&self, id: DbId, disabled: bool) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        match inner.scheduled.get_mut(&id) {
            Some(s) => {
                s.disabled = disabled;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

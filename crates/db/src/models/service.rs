//! Service record model: the persisted description and state of one job.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use pipewright_core::lifecycle::{LifecycleStage, EVENT_FAILED, EVENT_TIMEOUT};
use pipewright_core::resources::ResourceHints;
use pipewright_core::scheduling::{child_priority, ServiceState, PRIORITY_NORMAL};
use pipewright_core::types::{DbId, ServiceId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::FromRow;

use crate::store::StoreError;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Position of a record in its hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: ServiceId,
    /// Service that spawned this one.
    pub parent_id: Option<ServiceId>,
    /// Top of the hierarchy; `None` for roots.
    pub root_id: Option<ServiceId>,
}

impl Identity {
    pub fn root(id: ServiceId) -> Self {
        Self {
            id,
            parent_id: None,
            root_id: None,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Id of the hierarchy's top record (itself for roots).
    pub fn hierarchy_root(&self) -> ServiceId {
        self.root_id.unwrap_or(self.id)
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// One entry of a record's append-only history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub timestamp: Timestamp,
}

impl ServiceEvent {
    pub fn new(kind: &str, message: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            message: message.into(),
            timestamp: chrono::Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Notification registrations
// ---------------------------------------------------------------------------

/// What to post when a lifecycle stage is reached.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub event_name: String,
    /// Email addresses the stored notification is delivered to.
    #[serde(default)]
    pub recipients: Vec<String>,
    /// Merged into the notification payload.
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl NotificationConfig {
    pub fn new(event_name: impl Into<String>) -> Self {
        Self {
            event_name: event_name.into(),
            ..Self::default()
        }
    }

    pub fn with_recipient(mut self, address: impl Into<String>) -> Self {
        self.recipients.push(address.into());
        self
    }
}

/// Default registration plus per-stage overrides.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NotificationSettings {
    #[serde(default)]
    pub default: Option<NotificationConfig>,
    #[serde(default)]
    pub stages: BTreeMap<LifecycleStage, NotificationConfig>,
}

impl NotificationSettings {
    pub fn with_default(mut self, config: NotificationConfig) -> Self {
        self.default = Some(config);
        self
    }

    pub fn with_stage(mut self, stage: LifecycleStage, config: NotificationConfig) -> Self {
        self.stages.insert(stage, config);
        self
    }

    /// Stage config, falling back to the default registration.
    pub fn for_stage(&self, stage: LifecycleStage) -> Option<&NotificationConfig> {
        self.stages.get(&stage).or(self.default.as_ref())
    }
}

// ---------------------------------------------------------------------------
// NewService (submission)
// ---------------------------------------------------------------------------

/// A service not yet persisted. The id, root id and state are assigned by
/// [`ServiceStore::save_hierarchy`](crate::store::ServiceStore::save_hierarchy).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewService {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub owner_key: Option<String>,
    #[serde(default)]
    pub auth_key: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub dictionary_args: Map<String, Value>,
    #[serde(default)]
    pub resources: BTreeMap<String, String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub queue_id: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<i64>,
    #[serde(default)]
    pub parent_id: Option<ServiceId>,
    #[serde(default)]
    pub dependencies: BTreeSet<ServiceId>,
    #[serde(default)]
    pub force_independent: bool,
    #[serde(default)]
    pub notifications: NotificationSettings,
    #[serde(default)]
    pub workflow_id: Option<DbId>,
}

impl NewService {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            description: None,
            tags: Vec::new(),
            owner_key: None,
            auth_key: None,
            args: Vec::new(),
            dictionary_args: Map::new(),
            resources: BTreeMap::new(),
            priority: PRIORITY_NORMAL,
            queue_id: None,
            timeout_ms: None,
            parent_id: None,
            dependencies: BTreeSet::new(),
            force_independent: false,
            notifications: NotificationSettings::default(),
            workflow_id: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_dictionary_arg(mut self, name: impl Into<String>, value: Value) -> Self {
        self.dictionary_args.insert(name.into(), value);
        self
    }

    pub fn with_resource(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.resources.insert(key.into(), value.into());
        self
    }

    pub fn with_queue(mut self, queue_id: impl Into<String>) -> Self {
        self.queue_id = Some(queue_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX));
        self
    }

    pub fn depends_on(mut self, id: ServiceId) -> Self {
        self.dependencies.insert(id);
        self
    }

    pub fn child_of(mut self, parent: ServiceId) -> Self {
        self.parent_id = Some(parent);
        self
    }

    pub fn mark_force_independent(mut self) -> Self {
        self.force_independent = true;
        self
    }

    pub fn with_owner(mut self, owner_key: impl Into<String>) -> Self {
        self.owner_key = Some(owner_key.into());
        self
    }

    pub fn with_notifications(mut self, notifications: NotificationSettings) -> Self {
        self.notifications = notifications;
        self
    }

    /// Apply the hierarchy rules for a child of `parent` and return the
    /// hierarchy root id the child belongs to.
    ///
    /// The child outranks its parent and stays on the parent's queue unless
    /// it names its own.
    pub fn adopt_parent(&mut self, parent: &ServiceRecord) -> ServiceId {
        self.parent_id = Some(parent.id());
        self.priority = child_priority(self.priority, parent.priority);
        if self.queue_id.is_none() {
            self.queue_id = parent.queue_id.clone();
        }
        parent.identity.hierarchy_root()
    }
}

// ---------------------------------------------------------------------------
// ServiceRecord
// ---------------------------------------------------------------------------

/// A persisted service job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub identity: Identity,
    pub name: String,
    pub version: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub owner_key: Option<String>,
    pub auth_key: Option<String>,
    pub args: Vec<String>,
    pub dictionary_args: Map<String, Value>,
    pub resources: BTreeMap<String, String>,
    pub state: ServiceState,
    pub priority: i32,
    pub queue_id: Option<String>,
    pub timeout_ms: Option<i64>,
    pub dependencies: BTreeSet<ServiceId>,
    pub force_independent: bool,
    pub events: Vec<ServiceEvent>,
    pub result: Option<Value>,
    pub output_path: Option<String>,
    pub error_path: Option<String>,
    pub notifications: NotificationSettings,
    pub workflow_id: Option<DbId>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub process_started_at: Option<Timestamp>,
}

impl ServiceRecord {
    /// Materialize a submission with an assigned identity, in state `CREATED`.
    pub fn from_new(identity: Identity, new: NewService, now: Timestamp) -> Self {
        Self {
            identity,
            name: new.name,
            version: new.version,
            description: new.description,
            tags: new.tags,
            owner_key: new.owner_key,
            auth_key: new.auth_key,
            args: new.args,
            dictionary_args: new.dictionary_args,
            resources: new.resources,
            state: ServiceState::Created,
            priority: new.priority,
            queue_id: new.queue_id,
            timeout_ms: new.timeout_ms,
            dependencies: new.dependencies,
            force_independent: new.force_independent,
            events: Vec::new(),
            result: None,
            output_path: None,
            error_path: None,
            notifications: new.notifications,
            workflow_id: new.workflow_id,
            created_at: now,
            updated_at: now,
            process_started_at: None,
        }
    }

    pub fn id(&self) -> ServiceId {
        self.identity.id
    }

    pub fn is_root(&self) -> bool {
        self.identity.is_root()
    }

    /// Declared timeout, falling back to the `hardDurationSecs` resource hint.
    pub fn timeout(&self) -> Option<Duration> {
        match self.timeout_ms {
            Some(ms) if ms > 0 => Some(Duration::from_millis(ms as u64)),
            _ => ResourceHints::new(&self.resources).hard_duration(),
        }
    }

    /// Whether the record has been running longer than its timeout.
    pub fn has_expired(&self, now: Timestamp) -> bool {
        match (self.timeout(), self.process_started_at) {
            (Some(limit), Some(started)) => (now - started)
                .to_std()
                .map(|elapsed| elapsed >= limit)
                .unwrap_or(false),
            _ => false,
        }
    }

    pub fn last_event(&self) -> Option<&ServiceEvent> {
        self.events.last()
    }

    /// Whether an earlier run of this record failed or timed out.
    pub fn has_failed_before(&self) -> bool {
        self.events
            .iter()
            .any(|e| e.kind == EVENT_FAILED || e.kind == EVENT_TIMEOUT)
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

/// Raw `services` row, including the aggregated dependency ids.
#[derive(Debug, Clone, FromRow)]
pub struct ServiceRow {
    pub id: ServiceId,
    pub parent_id: Option<ServiceId>,
    pub root_id: Option<ServiceId>,
    pub name: String,
    pub version: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub owner_key: Option<String>,
    pub auth_key: Option<String>,
    pub args: Vec<String>,
    pub dictionary_args: Value,
    pub resources: Value,
    pub state: String,
    pub priority: i32,
    pub queue_id: Option<String>,
    pub timeout_ms: Option<i64>,
    pub force_independent: bool,
    pub events: Value,
    pub result: Option<Value>,
    pub output_path: Option<String>,
    pub error_path: Option<String>,
    pub notifications: Value,
    pub workflow_id: Option<DbId>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub process_started_at: Option<Timestamp>,
    pub dependency_ids: Vec<ServiceId>,
}

fn decode<T: serde::de::DeserializeOwned>(id: ServiceId, column: &str, value: Value) -> Result<T, StoreError> {
    serde_json::from_value(value)
        .map_err(|e| StoreError::Corrupt(format!("service {id} column {column}: {e}")))
}

impl TryFrom<ServiceRow> for ServiceRecord {
    type Error = StoreError;

    fn try_from(row: ServiceRow) -> Result<Self, Self::Error> {
        let id = row.id;
        let state = row
            .state
            .parse::<ServiceState>()
            .map_err(|e| StoreError::Corrupt(format!("service {id}: {e}")))?;

        Ok(Self {
            identity: Identity {
                id,
                parent_id: row.parent_id,
                root_id: row.root_id,
            },
            name: row.name,
            version: row.version,
            description: row.description,
            tags: row.tags,
            owner_key: row.owner_key,
            auth_key: row.auth_key,
            args: row.args,
            dictionary_args: decode(id, "dictionary_args", row.dictionary_args)?,
            resources: decode(id, "resources", row.resources)?,
            state,
            priority: row.priority,
            queue_id: row.queue_id,
            timeout_ms: row.timeout_ms,
            dependencies: row.dependency_ids.into_iter().collect(),
            force_independent: row.force_independent,
            events: decode(id, "events", row.events)?,
            result: row.result,
            output_path: row.output_path,
            error_path: row.error_path,
            notifications: decode(id, "notifications", row.notifications)?,
            workflow_id: row.workflow_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            process_started_at: row.process_started_at,
        })
    }
}

// ---------------------------------------------------------------------------
// Port request types
// ---------------------------------------------------------------------------

/// Which part of the hierarchy a claim may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimScope {
    /// Records without a parent; these consume processing slots.
    Roots,
    /// Records spawned by another service.
    Children,
    Any,
}

/// Parameters of an atomic claim.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub queue_id: String,
    pub states: Vec<ServiceState>,
    pub limit: usize,
    pub scope: ClaimScope,
    /// Only take records already stamped with `queue_id`.
    pub only_pre_assigned: bool,
}

impl ClaimRequest {
    pub fn new(queue_id: impl Into<String>, states: &[ServiceState], limit: usize) -> Self {
        Self {
            queue_id: queue_id.into(),
            states: states.to_vec(),
            limit,
            scope: ClaimScope::Any,
            only_pre_assigned: false,
        }
    }

    pub fn scope(mut self, scope: ClaimScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn only_pre_assigned(mut self, only: bool) -> Self {
        self.only_pre_assigned = only;
        self
    }

    /// Whether a record's queue stamp matches this request.
    pub fn matches_queue(&self, queue_id: Option<&str>) -> bool {
        match queue_id {
            Some(q) => q == self.queue_id,
            None => !self.only_pre_assigned,
        }
    }

    pub fn matches_scope(&self, identity: &Identity) -> bool {
        match self.scope {
            ClaimScope::Roots => identity.is_root(),
            ClaimScope::Children => !identity.is_root(),
            ClaimScope::Any => true,
        }
    }
}

/// A record taken by a claim, with the state it was claimed from.
#[derive(Debug, Clone)]
pub struct Claimed {
    pub previous_state: ServiceState,
    pub service: ServiceRecord,
}

/// Conditional state update: applied only when the current state is in
/// `allowed_from`.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub allowed_from: Vec<ServiceState>,
    pub to: ServiceState,
    pub event: Option<ServiceEvent>,
    /// Stored together with the transition, only when it applies.
    pub result: Option<Value>,
}

impl StateChange {
    /// Transition guarded by the state machine's allowed edges into `to`.
    pub fn guarded(to: ServiceState) -> Self {
        Self {
            allowed_from: pipewright_core::scheduling::state_machine::sources_of(to),
            to,
            event: None,
            result: None,
        }
    }

    /// Transition allowed only from the listed states.
    pub fn from_states(from: &[ServiceState], to: ServiceState) -> Self {
        Self {
            allowed_from: from.to_vec(),
            to,
            event: None,
            result: None,
        }
    }

    /// Transition from any non-terminal state.
    pub fn forced(to: ServiceState) -> Self {
        Self::from_states(&ServiceState::non_terminal(), to)
    }

    pub fn with_event(mut self, event: ServiceEvent) -> Self {
        self.event = Some(event);
        self
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }
}

/// Single-field update applied through the port.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldUpdate {
    OutputPaths {
        stdout: Option<String>,
        stderr: Option<String>,
    },
    WorkflowId(DbId),
    QueueId(Option<String>),
    TimeoutMs(Option<i64>),
}

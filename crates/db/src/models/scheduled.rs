//! Cron-scheduled service templates.

use std::collections::BTreeMap;

use pipewright_core::types::{DbId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::FromRow;

use crate::models::service::NewService;
use crate::store::StoreError;

/// A stored template materialized into a service on a cron schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledService {
    pub id: DbId,
    pub name: String,
    pub description: Option<String>,
    /// Processor name of the services created from this template.
    pub service_name: String,
    pub service_priority: i32,
    pub service_queue_id: Option<String>,
    /// Owner key stamped on created services.
    pub run_as: Option<String>,
    pub service_args: Vec<String>,
    pub service_dictionary_args: Map<String, Value>,
    pub service_resources: BTreeMap<String, String>,
    /// Five-field cron descriptor.
    pub cron_schedule: String,
    pub last_start_time: Option<Timestamp>,
    pub next_start_time: Option<Timestamp>,
    pub disabled: bool,
}

impl ScheduledService {
    /// Build the submission for one firing of this template.
    pub fn to_new_service(&self) -> NewService {
        let mut service = NewService::new(&self.service_name).with_priority(self.service_priority);
        service.description = self.description.clone();
        service.queue_id = self.service_queue_id.clone();
        service.owner_key = self.run_as.clone();
        service.args = self.service_args.clone();
        service.dictionary_args = self.service_dictionary_args.clone();
        service.resources = self.service_resources.clone();
        service.tags = vec![format!("scheduled:{}", self.name)];
        service
    }
}

/// DTO for creating a template.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NewScheduledService {
    pub name: String,
    pub description: Option<String>,
    pub service_name: String,
    #[serde(default)]
    pub service_priority: i32,
    pub service_queue_id: Option<String>,
    pub run_as: Option<String>,
    #[serde(default)]
    pub service_args: Vec<String>,
    #[serde(default)]
    pub service_dictionary_args: Map<String, Value>,
    #[serde(default)]
    pub service_resources: BTreeMap<String, String>,
    pub cron_schedule: String,
    #[serde(default)]
    pub disabled: bool,
}

impl NewScheduledService {
    pub fn new(
        name: impl Into<String>,
        service_name: impl Into<String>,
        cron_schedule: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: None,
            service_name: service_name.into(),
            service_priority: 0,
            service_queue_id: None,
            run_as: None,
            service_args: Vec::new(),
            service_dictionary_args: Map::new(),
            service_resources: BTreeMap::new(),
            cron_schedule: cron_schedule.into(),
            disabled: false,
        }
    }
}

/// A row from the `scheduled_services` table.
#[derive(Debug, Clone, FromRow)]
pub struct ScheduledServiceRow {
    pub id: DbId,
    pub name: String,
    pub description: Option<String>,
    pub service_name: String,
    pub service_priority: i32,
    pub service_queue_id: Option<String>,
    pub run_as: Option<String>,
    pub service_args: Vec<String>,
    pub service_dictionary_args: Value,
    pub service_resources: Value,
    pub cron_schedule: String,
    pub last_start_time: Option<Timestamp>,
    pub next_start_time: Option<Timestamp>,
    pub disabled: bool,
}

impl TryFrom<ScheduledServiceRow> for ScheduledService {
    type Error = StoreError;

    fn try_from(row: ScheduledServiceRow) -> Result<Self, Self::Error> {
        let id = row.id;
        let corrupt =
            |e: serde_json::Error| StoreError::Corrupt(format!("scheduled service {id}: {e}"));
        Ok(Self {
            id,
            name: row.name,
            description: row.description,
            service_name: row.service_name,
            service_priority: row.service_priority,
            service_queue_id: row.service_queue_id,
            run_as: row.run_as,
            service_args: row.service_args,
            service_dictionary_args: serde_json::from_value(row.service_dictionary_args)
                .map_err(corrupt)?,
            service_resources: serde_json::from_value(row.service_resources).map_err(corrupt)?,
            cron_schedule: row.cron_schedule,
            last_start_time: row.last_start_time,
            next_start_time: row.next_start_time,
            disabled: row.disabled,
        })
    }
}

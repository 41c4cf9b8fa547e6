//! Persisted workflow graphs and their node-to-service mapping.

use std::collections::{BTreeMap, BTreeSet};

use pipewright_core::graph::WorkflowGraph;
use pipewright_core::types::{DbId, ServiceId, Timestamp};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::store::StoreError;

/// A workflow graph as stored for inspection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Workflow {
    pub id: DbId,
    pub name: String,
    /// Service running the workflow executor.
    pub service_id: Option<ServiceId>,
    pub graph: WorkflowGraph,
    /// Service created for each submitted node.
    pub node_services: BTreeMap<String, ServiceId>,
    /// Nodes satisfied by existing outputs.
    pub skipped: BTreeSet<String>,
    pub created_at: Timestamp,
}

/// DTO for persisting a workflow.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NewWorkflow {
    pub name: String,
    pub service_id: Option<ServiceId>,
    pub graph: WorkflowGraph,
}

/// A row from the `workflows` table.
#[derive(Debug, Clone, FromRow)]
pub struct WorkflowRow {
    pub id: DbId,
    pub name: String,
    pub service_id: Option<ServiceId>,
    pub graph: serde_json::Value,
    pub node_services: serde_json::Value,
    pub skipped: Vec<String>,
    pub created_at: Timestamp,
}

impl TryFrom<WorkflowRow> for Workflow {
    type Error = StoreError;

    fn try_from(row: WorkflowRow) -> Result<Self, Self::Error> {
        let id = row.id;
        let corrupt = |column: &str, e: serde_json::Error| {
            StoreError::Corrupt(format!("workflow {id} column {column}: {e}"))
        };
        let graph = serde_json::from_value(row.graph).map_err(|e| corrupt("graph", e))?;
        let node_services =
            serde_json::from_value(row.node_services).map_err(|e| corrupt("node_services", e))?;
        Ok(Self {
            id: row.id,
            name: row.name,
            service_id: row.service_id,
            graph,
            node_services,
            skipped: row.skipped.into_iter().collect(),
            created_at: row.created_at,
        })
    }
}

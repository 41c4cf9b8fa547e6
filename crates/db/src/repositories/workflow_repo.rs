//! Repository for the `workflows` and `workflow_locks` tables.

use pipewright_core::types::{DbId, ServiceId};
use sqlx::PgPool;

use crate::models::workflow::{NewWorkflow, Workflow, WorkflowRow};
use crate::store::{StoreError, StoreResult};

/// Column list for `workflows` queries.
const COLUMNS: &str = "id, name, service_id, graph, node_services, skipped, created_at";

/// Provides persistence for workflow graphs and their target locks.
pub struct WorkflowRepo;

impl WorkflowRepo {
    pub async fn create(pool: &PgPool, input: &NewWorkflow) -> StoreResult<Workflow> {
        let graph = serde_json::to_value(&input.graph)
            .map_err(|e| StoreError::Corrupt(format!("workflow graph: {e}")))?;
        let query = format!(
            "INSERT INTO workflows (name, service_id, graph) \
             VALUES ($1, $2, $3) \
             RETURNING {COLUMNS}"
        );
        let row = sqlx::query_as::<_, WorkflowRow>(&query)
            .bind(&input.name)
            .bind(input.service_id)
            .bind(graph)
            .fetch_one(pool)
            .await?;

        if let Some(service_id) = input.service_id {
            sqlx::query("UPDATE services SET workflow_id = $2, updated_at = NOW() WHERE id = $1")
                .bind(service_id)
                .bind(row.id)
                .execute(pool)
                .await?;
        }
        Workflow::try_from(row)
    }

    pub async fn find_by_id(pool: &PgPool, id: DbId) -> StoreResult<Option<Workflow>> {
        let query = format!("SELECT {COLUMNS} FROM workflows WHERE id = $1");
        sqlx::query_as::<_, WorkflowRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await?
            .map(Workflow::try_from)
            .transpose()
    }

    /// Record the service created for `node_id`.
    pub async fn record_node_service(
        pool: &PgPool,
        workflow_id: DbId,
        node_id: &str,
        service_id: ServiceId,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE workflows \
             SET node_services = node_services || jsonb_build_object($2::text, $3::bigint) \
             WHERE id = $1",
        )
        .bind(workflow_id)
        .bind(node_id)
        .bind(service_id)
        .execute(pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "Workflow",
                id: workflow_id,
            });
        }
        Ok(())
    }

    /// Record that `node_id` was satisfied by existing outputs.
    pub async fn record_skipped_node(pool: &PgPool, workflow_id: DbId, node_id: &str) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE workflows \
             SET skipped = array_append(skipped, $2) \
             WHERE id = $1 AND NOT ($2 = ANY(skipped))",
        )
        .bind(workflow_id)
        .bind(node_id)
        .execute(pool)
        .await?;
        if result.rows_affected() == 0 {
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM workflows WHERE id = $1)")
                    .bind(workflow_id)
                    .fetch_one(pool)
                    .await?;
            if !exists {
                return Err(StoreError::NotFound {
                    entity: "Workflow",
                    id: workflow_id,
                });
            }
        }
        Ok(())
    }

    /// Take the lock on `key`. Re-entrant for the same holder.
    pub async fn try_lock(pool: &PgPool, key: &str, holder: &str) -> StoreResult<bool> {
        let acquired: Option<String> = sqlx::query_scalar(
            "INSERT INTO workflow_locks (lock_key, holder) VALUES ($1, $2) \
             ON CONFLICT (lock_key) DO UPDATE SET acquired_at = NOW() \
             WHERE workflow_locks.holder = EXCLUDED.holder \
             RETURNING holder",
        )
        .bind(key)
        .bind(holder)
        .fetch_optional(pool)
        .await?;
        Ok(acquired.is_some())
    }

    /// Release `key`. Returns `false` when `holder` did not hold it.
    pub async fn unlock(pool: &PgPool, key: &str, holder: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM workflow_locks WHERE lock_key = $1 AND holder = $2")
            .bind(key)
            .bind(holder)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

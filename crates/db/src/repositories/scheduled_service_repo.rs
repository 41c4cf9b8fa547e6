//! Repository for the `scheduled_services` table.

use pipewright_core::types::{DbId, Timestamp};
use sqlx::PgPool;

use crate::models::scheduled::{NewScheduledService, ScheduledService, ScheduledServiceRow};
use crate::store::{StoreError, StoreResult};

/// Column list for `scheduled_services` queries.
const COLUMNS: &str = "id, name, description, service_name, service_priority, \
    service_queue_id, run_as, service_args, service_dictionary_args, service_resources, \
    cron_schedule, last_start_time, next_start_time, disabled";

/// Provides persistence for cron-scheduled service templates.
pub struct ScheduledServiceRepo;

impl ScheduledServiceRepo {
    pub async fn create(
        pool: &PgPool,
        input: &NewScheduledService,
        next_start_time: Option<Timestamp>,
    ) -> StoreResult<ScheduledService> {
        let corrupt = |e: serde_json::Error| StoreError::Corrupt(format!("scheduled service: {e}"));
        let query = format!(
            "INSERT INTO scheduled_services \
                (name, description, service_name, service_priority, service_queue_id, run_as, \
                 service_args, service_dictionary_args, service_resources, cron_schedule, \
                 next_start_time, disabled) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             RETURNING {COLUMNS}"
        );
        let row = sqlx::query_as::<_, ScheduledServiceRow>(&query)
            .bind(&input.name)
            .bind(&input.description)
            .bind(&input.service_name)
            .bind(input.service_priority)
            .bind(&input.service_queue_id)
            .bind(&input.run_as)
            .bind(&input.service_args)
            .bind(serde_json::to_value(&input.service_dictionary_args).map_err(corrupt)?)
            .bind(serde_json::to_value(&input.service_resources).map_err(corrupt)?)
            .bind(&input.cron_schedule)
            .bind(next_start_time)
            .bind(input.disabled)
            .fetch_one(pool)
            .await?;
        ScheduledService::try_from(row)
    }

    pub async fn find_by_id(pool: &PgPool, id: DbId) -> StoreResult<Option<ScheduledService>> {
        let query = format!("SELECT {COLUMNS} FROM scheduled_services WHERE id = $1");
        sqlx::query_as::<_, ScheduledServiceRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await?
            .map(ScheduledService::try_from)
            .transpose()
    }

    /// Enabled templates that are due or were never scheduled.
    pub async fn list_due(pool: &PgPool, now: Timestamp, limit: i64) -> StoreResult<Vec<ScheduledService>> {
        let query = format!(
            "SELECT {COLUMNS} FROM scheduled_services \
             WHERE NOT disabled AND (next_start_time IS NULL OR next_start_time <= $1) \
             ORDER BY next_start_time ASC NULLS FIRST, id ASC \
             LIMIT $2"
        );
        let rows = sqlx::query_as::<_, ScheduledServiceRow>(&query)
            .bind(now)
            .bind(limit)
            .fetch_all(pool)
            .await?;
        rows.into_iter().map(ScheduledService::try_from).collect()
    }

    /// Compare-and-set on `next_start_time`.
    pub async fn advance_schedule(
        pool: &PgPool,
        id: DbId,
        expected_next: Option<Timestamp>,
        started_at: Timestamp,
        next: Option<Timestamp>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE scheduled_services \
             SET last_start_time = $3, next_start_time = $4 \
             WHERE id = $1 AND next_start_time IS NOT DISTINCT FROM $2",
        )
        .bind(id)
        .bind(expected_next)
        .bind(started_at)
        .bind(next)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_disabled(pool: &PgPool, id: DbId, disabled: bool) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE scheduled_services SET disabled = $2 WHERE id = $1")
            .bind(id)
            .bind(disabled)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

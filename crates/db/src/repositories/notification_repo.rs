//! Repository for the `service_notifications` table.

use pipewright_core::types::{DbId, ServiceId};
use sqlx::PgPool;

use crate::models::notification::{NewNotification, Notification};
use crate::store::StoreResult;

/// Column list for `service_notifications` queries.
const COLUMNS: &str =
    "id, service_id, event_name, stage, recipients, data, delivered_at, created_at";

/// Provides persistence for lifecycle notifications.
pub struct NotificationRepo;

impl NotificationRepo {
    /// Insert a notification, returning the created row.
    pub async fn create(pool: &PgPool, input: &NewNotification) -> StoreResult<Notification> {
        let query = format!(
            "INSERT INTO service_notifications (service_id, event_name, stage, recipients, data) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING {COLUMNS}"
        );
        let notification = sqlx::query_as::<_, Notification>(&query)
            .bind(input.service_id)
            .bind(&input.event_name)
            .bind(input.stage.as_str())
            .bind(&input.recipients)
            .bind(&input.data)
            .fetch_one(pool)
            .await?;
        Ok(notification)
    }

    /// Oldest undelivered notifications first.
    pub async fn list_undelivered(pool: &PgPool, limit: i64) -> StoreResult<Vec<Notification>> {
        let query = format!(
            "SELECT {COLUMNS} FROM service_notifications \
             WHERE delivered_at IS NULL \
             ORDER BY created_at ASC, id ASC \
             LIMIT $1"
        );
        let rows = sqlx::query_as::<_, Notification>(&query)
            .bind(limit)
            .fetch_all(pool)
            .await?;
        Ok(rows)
    }

    /// Stamp `delivered_at`. Returns `false` if it was already delivered.
    pub async fn mark_delivered(pool: &PgPool, id: DbId) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE service_notifications SET delivered_at = NOW() \
             WHERE id = $1 AND delivered_at IS NULL",
        )
        .bind(id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// All notifications raised for a service, oldest first.
    pub async fn list_for_service(
        pool: &PgPool,
        service_id: ServiceId,
    ) -> StoreResult<Vec<Notification>> {
        let query = format!(
            "SELECT {COLUMNS} FROM service_notifications \
             WHERE service_id = $1 \
             ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query_as::<_, Notification>(&query)
            .bind(service_id)
            .fetch_all(pool)
            .await?;
        Ok(rows)
    }
}

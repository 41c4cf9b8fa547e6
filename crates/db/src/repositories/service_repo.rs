//! Repository for the `services` and `service_dependencies` tables.

use pipewright_core::lifecycle::EVENT_CREATED;
use pipewright_core::scheduling::ServiceState;
use pipewright_core::types::{ServiceId, Timestamp};
use sqlx::PgPool;

use crate::models::search::{Page, PageRequest, ServicePattern, TimeRange};
use crate::models::service::{
    ClaimRequest, ClaimScope, Claimed, FieldUpdate, NewService, ServiceEvent, ServiceRecord,
    ServiceRow, StateChange,
};
use crate::store::{BlockedService, StoreError, StoreResult};

/// Column list for `services` queries; the table is always aliased `s`.
const COLUMNS: &str = "s.id, s.parent_id, s.root_id, s.name, s.version, s.description, s.tags, \
    s.owner_key, s.auth_key, s.args, s.dictionary_args, s.resources, s.state, s.priority, \
    s.queue_id, s.timeout_ms, s.force_independent, s.events, s.result, s.output_path, \
    s.error_path, s.notifications, s.workflow_id, s.created_at, s.updated_at, \
    s.process_started_at, \
    ARRAY(SELECT d.depends_on_id FROM service_dependencies d \
          WHERE d.service_id = s.id ORDER BY d.depends_on_id) AS dependency_ids";

/// Claim and promotion order.
const DISPATCH_ORDER: &str = "s.priority DESC, s.created_at ASC, s.id ASC";

/// A dependency blocks its dependent unless it succeeded, or the dependent is
/// force-independent and the dependency is terminal.
const DEPENDENCIES_READY: &str = "NOT EXISTS ( \
    SELECT 1 FROM service_dependencies d \
    JOIN services u ON u.id = d.depends_on_id \
    WHERE d.service_id = s.id \
      AND NOT (u.state = 'SUCCESSFUL' \
               OR (s.force_independent AND u.state IN ('CANCELED', 'TIMEOUT', 'ERROR'))))";

fn state_names(states: &[ServiceState]) -> Vec<String> {
    states.iter().map(|s| s.as_str().to_string()).collect()
}

fn event_json(event: &ServiceEvent) -> StoreResult<serde_json::Value> {
    serde_json::to_value(event).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn to_json<T: serde::Serialize>(value: &T) -> StoreResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn into_records(rows: Vec<ServiceRow>) -> StoreResult<Vec<ServiceRecord>> {
    rows.into_iter().map(ServiceRecord::try_from).collect()
}

// ---------------------------------------------------------------------------
// Search filter
// ---------------------------------------------------------------------------

/// Bind value of a dynamically built search condition.
enum FilterArg {
    Text(String),
    TextArray(Vec<String>),
    Id(ServiceId),
    Time(Timestamp),
}

/// Build the WHERE clause for a search; binds start at `$1`.
fn search_filter(pattern: &ServicePattern, range: &TimeRange) -> (String, Vec<FilterArg>) {
    let mut conditions: Vec<String> = Vec::new();
    let mut args = Vec::new();
    let mut push = |condition: &str, arg: FilterArg| {
        args.push(arg);
        conditions.push(condition.replace("$?", &format!("${}", args.len())));
    };

    if let Some(like) = pattern.name_like() {
        push("s.name LIKE $?", FilterArg::Text(like));
    }
    if !pattern.states.is_empty() {
        push("s.state = ANY($?)", FilterArg::TextArray(state_names(&pattern.states)));
    }
    if let Some(owner) = &pattern.owner_key {
        push("s.owner_key = $?", FilterArg::Text(owner.clone()));
    }
    if !pattern.tags.is_empty() {
        push("s.tags @> $?", FilterArg::TextArray(pattern.tags.clone()));
    }
    if let Some(parent) = pattern.parent_id {
        push("s.parent_id = $?", FilterArg::Id(parent));
    }
    if let Some(root) = pattern.root_id {
        push("s.root_id = $?", FilterArg::Id(root));
    }
    if let Some(queue) = &pattern.queue_id {
        push("s.queue_id = $?", FilterArg::Text(queue.clone()));
    }
    if let Some(from) = range.from {
        push("s.created_at >= $?", FilterArg::Time(from));
    }
    if let Some(to) = range.to {
        push("s.created_at < $?", FilterArg::Time(to));
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };
    (where_clause, args)
}

/// Provides persistence operations for service records.
pub struct ServiceRepo;

impl ServiceRepo {
    /// Insert a record (and its dependency edges) in one transaction.
    ///
    /// A child is attached to its parent's dependency set and inherits the
    /// parent's root, queue and a strictly higher priority.
    pub async fn save_hierarchy(pool: &PgPool, mut service: NewService) -> StoreResult<ServiceRecord> {
        let mut tx = pool.begin().await?;

        let dependencies: Vec<ServiceId> = service.dependencies.iter().copied().collect();
        let missing: Option<ServiceId> = sqlx::query_scalar(
            "SELECT u.id FROM unnest($1::bigint[]) AS u(id) \
             WHERE NOT EXISTS (SELECT 1 FROM services s WHERE s.id = u.id) \
             LIMIT 1",
        )
        .bind(&dependencies)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(missing) = missing {
            return Err(StoreError::Validation(format!(
                "Dependency {missing} does not exist"
            )));
        }

        let root_id = match service.parent_id {
            Some(parent_id) => {
                let query = format!("SELECT {COLUMNS} FROM services s WHERE s.id = $1 FOR UPDATE");
                let parent = sqlx::query_as::<_, ServiceRow>(&query)
                    .bind(parent_id)
                    .fetch_optional(&mut *tx)
                    .await?
                    .ok_or_else(|| {
                        StoreError::Validation(format!("Parent service {parent_id} does not exist"))
                    })?;
                let parent = ServiceRecord::try_from(parent)?;
                Some(service.adopt_parent(&parent))
            }
            None => None,
        };

        let created = ServiceEvent::new(EVENT_CREATED, format!("Created {}", service.name));
        let id: ServiceId = sqlx::query_scalar(
            "INSERT INTO services \
                (parent_id, root_id, name, version, description, tags, owner_key, auth_key, \
                 args, dictionary_args, resources, state, priority, queue_id, timeout_ms, \
                 force_independent, events, notifications, workflow_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
                     jsonb_build_array($17::jsonb), $18, $19) \
             RETURNING id",
        )
        .bind(service.parent_id)
        .bind(root_id)
        .bind(&service.name)
        .bind(&service.version)
        .bind(&service.description)
        .bind(&service.tags)
        .bind(&service.owner_key)
        .bind(&service.auth_key)
        .bind(&service.args)
        .bind(to_json(&service.dictionary_args)?)
        .bind(to_json(&service.resources)?)
        .bind(ServiceState::Created.as_str())
        .bind(service.priority)
        .bind(&service.queue_id)
        .bind(service.timeout_ms)
        .bind(service.force_independent)
        .bind(event_json(&created)?)
        .bind(to_json(&service.notifications)?)
        .bind(service.workflow_id)
        .fetch_one(&mut *tx)
        .await?;

        if !dependencies.is_empty() {
            sqlx::query(
                "INSERT INTO service_dependencies (service_id, depends_on_id) \
                 SELECT $1, unnest($2::bigint[])",
            )
            .bind(id)
            .bind(&dependencies)
            .execute(&mut *tx)
            .await?;
        }

        if let Some(parent_id) = service.parent_id {
            sqlx::query(
                "INSERT INTO service_dependencies (service_id, depends_on_id) \
                 VALUES ($1, $2) ON CONFLICT DO NOTHING",
            )
            .bind(parent_id)
            .bind(id)
            .execute(&mut *tx)
            .await?;
            sqlx::query("UPDATE services SET updated_at = NOW() WHERE id = $1")
                .bind(parent_id)
                .execute(&mut *tx)
                .await?;
        }

        let query = format!("SELECT {COLUMNS} FROM services s WHERE s.id = $1");
        let row = sqlx::query_as::<_, ServiceRow>(&query)
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        ServiceRecord::try_from(row)
    }

    /// Find a record by its internal id.
    pub async fn find_by_id(pool: &PgPool, id: ServiceId) -> StoreResult<Option<ServiceRecord>> {
        let query = format!("SELECT {COLUMNS} FROM services s WHERE s.id = $1");
        sqlx::query_as::<_, ServiceRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await?
            .map(ServiceRecord::try_from)
            .transpose()
    }

    /// Find the records with the given ids, ordered by id.
    pub async fn find_by_ids(pool: &PgPool, ids: &[ServiceId]) -> StoreResult<Vec<ServiceRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let query = format!("SELECT {COLUMNS} FROM services s WHERE s.id = ANY($1) ORDER BY s.id");
        let rows = sqlx::query_as::<_, ServiceRow>(&query)
            .bind(ids)
            .fetch_all(pool)
            .await?;
        into_records(rows)
    }

    /// Records that depend on `id`.
    pub async fn find_dependents(pool: &PgPool, id: ServiceId) -> StoreResult<Vec<ServiceRecord>> {
        let query = format!(
            "SELECT {COLUMNS} FROM services s \
             WHERE s.id IN (SELECT service_id FROM service_dependencies WHERE depends_on_id = $1) \
             ORDER BY s.id"
        );
        let rows = sqlx::query_as::<_, ServiceRow>(&query)
            .bind(id)
            .fetch_all(pool)
            .await?;
        into_records(rows)
    }

    /// Records spawned by `id`.
    pub async fn find_children(pool: &PgPool, id: ServiceId) -> StoreResult<Vec<ServiceRecord>> {
        let query = format!("SELECT {COLUMNS} FROM services s WHERE s.parent_id = $1 ORDER BY s.id");
        let rows = sqlx::query_as::<_, ServiceRow>(&query)
            .bind(id)
            .fetch_all(pool)
            .await?;
        into_records(rows)
    }

    /// `id` plus every record reachable through dependency and child edges.
    pub async fn find_subtree(pool: &PgPool, id: ServiceId) -> StoreResult<Vec<ServiceRecord>> {
        let query = format!(
            "WITH RECURSIVE tree(id) AS ( \
                 SELECT $1::bigint \
                 UNION \
                 SELECT e.next_id FROM tree t \
                 JOIN ( \
                     SELECT service_id AS from_id, depends_on_id AS next_id \
                     FROM service_dependencies \
                     UNION ALL \
                     SELECT parent_id AS from_id, id AS next_id \
                     FROM services WHERE parent_id IS NOT NULL \
                 ) e ON e.from_id = t.id \
             ) \
             SELECT {COLUMNS} FROM services s JOIN tree ON tree.id = s.id ORDER BY s.id"
        );
        let rows = sqlx::query_as::<_, ServiceRow>(&query)
            .bind(id)
            .fetch_all(pool)
            .await?;
        into_records(rows)
    }

    /// Atomically claim eligible records for a dispatcher.
    ///
    /// Uses `FOR UPDATE SKIP LOCKED` so concurrent dispatchers never claim the
    /// same record; rows locked by a competing claim are simply skipped.
    pub async fn claim(pool: &PgPool, claim: &ClaimRequest) -> StoreResult<Vec<Claimed>> {
        let scope = match claim.scope {
            ClaimScope::Roots => "AND s.parent_id IS NULL",
            ClaimScope::Children => "AND s.parent_id IS NOT NULL",
            ClaimScope::Any => "",
        };
        let query = format!(
            "WITH candidates AS ( \
                 SELECT s.id, s.state AS previous_state \
                 FROM services s \
                 WHERE s.state = ANY($1) \
                   AND (s.queue_id = $2 OR (s.queue_id IS NULL AND NOT $3)) \
                   {scope} \
                   AND {DEPENDENCIES_READY} \
                 ORDER BY {DISPATCH_ORDER} \
                 LIMIT $4 \
                 FOR UPDATE OF s SKIP LOCKED \
             ) \
             UPDATE services s \
             SET state = 'DISPATCHED', queue_id = $2, updated_at = NOW(), \
                 events = s.events || jsonb_build_array($5::jsonb) \
             FROM candidates c \
             WHERE s.id = c.id \
             RETURNING s.id, c.previous_state"
        );
        let event = ServiceEvent::new(
            pipewright_core::lifecycle::EVENT_DISPATCHED,
            format!("Dispatched on '{}'", claim.queue_id),
        );
        let taken: Vec<(ServiceId, String)> = sqlx::query_as(&query)
            .bind(state_names(&claim.states))
            .bind(&claim.queue_id)
            .bind(claim.only_pre_assigned)
            .bind(i64::try_from(claim.limit).unwrap_or(i64::MAX))
            .bind(event_json(&event)?)
            .fetch_all(pool)
            .await?;
        if !taken.is_empty() {
            tracing::debug!(queue_id = %claim.queue_id, claimed = taken.len(), "Claimed services");
        }

        let ids: Vec<ServiceId> = taken.iter().map(|(id, _)| *id).collect();
        let mut records = Self::find_by_ids(pool, &ids).await?;
        records.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id().cmp(&b.id()))
        });

        records
            .into_iter()
            .map(|service| {
                let previous = taken
                    .iter()
                    .find(|(id, _)| *id == service.id())
                    .map(|(_, state)| state.as_str())
                    .unwrap_or_default();
                let previous_state = previous
                    .parse()
                    .map_err(|e| StoreError::Corrupt(format!("service {}: {e}", service.id())))?;
                Ok(Claimed {
                    previous_state,
                    service,
                })
            })
            .collect()
    }

    /// Conditional state update. Returns `None` when the current state is not
    /// one of `allowed_from`.
    pub async fn update_state(
        pool: &PgPool,
        id: ServiceId,
        change: &StateChange,
    ) -> StoreResult<Option<ServiceRecord>> {
        let event = change.event.as_ref().map(event_json).transpose()?;
        let updated: Option<ServiceId> = sqlx::query_scalar(
            "UPDATE services SET \
                 state = $2, \
                 updated_at = NOW(), \
                 process_started_at = CASE \
                     WHEN $2 = 'RUNNING' THEN COALESCE(process_started_at, NOW()) \
                     WHEN $2 IN ('QUEUED', 'RESUMED') THEN NULL \
                     ELSE process_started_at END, \
                 events = CASE WHEN $4::jsonb IS NULL THEN events \
                               ELSE events || jsonb_build_array($4::jsonb) END, \
                 result = COALESCE($5::jsonb, result) \
             WHERE id = $1 AND state = ANY($3) \
             RETURNING id",
        )
        .bind(id)
        .bind(change.to.as_str())
        .bind(state_names(&change.allowed_from))
        .bind(event)
        .bind(change.result.clone())
        .fetch_optional(pool)
        .await?;

        match updated {
            Some(id) => Self::find_by_id(pool, id).await,
            None => Ok(None),
        }
    }

    /// Append one entry to the event log.
    pub async fn append_event(pool: &PgPool, id: ServiceId, event: &ServiceEvent) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE services \
             SET events = events || jsonb_build_array($2::jsonb), updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(event_json(event)?)
        .execute(pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "Service",
                id,
            });
        }
        Ok(())
    }

    /// Update a single column.
    pub async fn update_field(pool: &PgPool, id: ServiceId, update: &FieldUpdate) -> StoreResult<()> {
        let result = match update {
            FieldUpdate::OutputPaths { stdout, stderr } => {
                sqlx::query(
                    "UPDATE services SET output_path = $2, error_path = $3, updated_at = NOW() \
                     WHERE id = $1",
                )
                .bind(id)
                .bind(stdout)
                .bind(stderr)
                .execute(pool)
                .await?
            }
            FieldUpdate::WorkflowId(workflow_id) => {
                sqlx::query("UPDATE services SET workflow_id = $2, updated_at = NOW() WHERE id = $1")
                    .bind(id)
                    .bind(workflow_id)
                    .execute(pool)
                    .await?
            }
            FieldUpdate::QueueId(queue_id) => {
                sqlx::query("UPDATE services SET queue_id = $2, updated_at = NOW() WHERE id = $1")
                    .bind(id)
                    .bind(queue_id)
                    .execute(pool)
                    .await?
            }
            FieldUpdate::TimeoutMs(timeout_ms) => {
                sqlx::query("UPDATE services SET timeout_ms = $2, updated_at = NOW() WHERE id = $1")
                    .bind(id)
                    .bind(timeout_ms)
                    .execute(pool)
                    .await?
            }
        };
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "Service",
                id,
            });
        }
        Ok(())
    }

    /// Apply a batch of priority changes in one statement.
    ///
    /// Fails without changing anything if any id is unknown.
    pub async fn update_priorities(pool: &PgPool, updates: &[(ServiceId, i32)]) -> StoreResult<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let ids: Vec<ServiceId> = updates.iter().map(|(id, _)| *id).collect();
        let priorities: Vec<i32> = updates.iter().map(|(_, p)| *p).collect();

        let mut tx = pool.begin().await?;
        let result = sqlx::query(
            "UPDATE services s SET priority = u.priority, updated_at = NOW() \
             FROM unnest($1::bigint[], $2::int[]) AS u(id, priority) \
             WHERE s.id = u.id",
        )
        .bind(&ids)
        .bind(&priorities)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() != updates.len() as u64 {
            tx.rollback().await?;
            let existing = Self::find_by_ids(pool, &ids).await?;
            let missing = ids
                .iter()
                .copied()
                .find(|id| !existing.iter().any(|r| r.id() == *id))
                .unwrap_or_default();
            return Err(StoreError::NotFound {
                entity: "Service",
                id: missing,
            });
        }
        tx.commit().await?;
        Ok(())
    }

    /// Page through records matching `pattern`, newest first.
    pub async fn search(
        pool: &PgPool,
        pattern: &ServicePattern,
        range: &TimeRange,
        page: &PageRequest,
    ) -> StoreResult<Page<ServiceRecord>> {
        let (where_clause, args) = search_filter(pattern, range);
        let bind_idx = args.len() + 1;
        let query = format!(
            "SELECT {COLUMNS} FROM services s \
             {where_clause} \
             ORDER BY s.created_at DESC, s.id DESC \
             LIMIT ${bind_idx} OFFSET ${}",
            bind_idx + 1,
        );

        let mut q = sqlx::query_as::<_, ServiceRow>(&query);
        for arg in args {
            q = match arg {
                FilterArg::Text(v) => q.bind(v),
                FilterArg::TextArray(v) => q.bind(v),
                FilterArg::Id(v) => q.bind(v),
                FilterArg::Time(v) => q.bind(v),
            };
        }
        let rows = q.bind(page.limit()).bind(page.offset()).fetch_all(pool).await?;

        Ok(Page {
            items: into_records(rows)?,
            page: page.page,
            page_size: page.limit() as u32,
            total: Self::count(pool, pattern, range).await?,
        })
    }

    /// Count records matching `pattern`.
    pub async fn count(pool: &PgPool, pattern: &ServicePattern, range: &TimeRange) -> StoreResult<i64> {
        let (where_clause, args) = search_filter(pattern, range);
        let query = format!("SELECT COUNT(*) FROM services s {where_clause}");
        let mut q = sqlx::query_scalar::<_, i64>(&query);
        for arg in args {
            q = match arg {
                FilterArg::Text(v) => q.bind(v),
                FilterArg::TextArray(v) => q.bind(v),
                FilterArg::Id(v) => q.bind(v),
                FilterArg::Time(v) => q.bind(v),
            };
        }
        Ok(q.fetch_one(pool).await?)
    }

    /// Count records in `states` stamped with `queue_id` or not stamped at all.
    pub async fn count_in_states(
        pool: &PgPool,
        queue_id: &str,
        states: &[ServiceState],
    ) -> StoreResult<i64> {
        let count = sqlx::query_scalar(
            "SELECT COUNT(*) FROM services \
             WHERE state = ANY($1) AND (queue_id = $2 OR queue_id IS NULL)",
        )
        .bind(state_names(states))
        .bind(queue_id)
        .fetch_one(pool)
        .await?;
        Ok(count)
    }

    /// Move the best `limit` deferred roots from `CREATED` to `QUEUED`.
    pub async fn promote_created(
        pool: &PgPool,
        queue_id: &str,
        limit: usize,
        only_pre_assigned: bool,
        event: &ServiceEvent,
    ) -> StoreResult<Vec<ServiceRecord>> {
        let query = format!(
            "WITH candidates AS ( \
                 SELECT s.id FROM services s \
                 WHERE s.state = 'CREATED' AND s.parent_id IS NULL \
                   AND (s.queue_id = $1 OR (s.queue_id IS NULL AND NOT $2)) \
                 ORDER BY {DISPATCH_ORDER} \
                 LIMIT $3 \
                 FOR UPDATE OF s SKIP LOCKED \
             ) \
             UPDATE services s \
             SET state = 'QUEUED', updated_at = NOW(), \
                 events = s.events || jsonb_build_array($4::jsonb) \
             FROM candidates c \
             WHERE s.id = c.id \
             RETURNING s.id"
        );
        let ids: Vec<ServiceId> = sqlx::query_scalar(&query)
            .bind(queue_id)
            .bind(only_pre_assigned)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .bind(event_json(event)?)
            .fetch_all(pool)
            .await?;
        Self::find_by_ids(pool, &ids).await
    }

    /// Pending records blocked by a dependency in a failed terminal state.
    pub async fn find_blocked_by_failure(
        pool: &PgPool,
        queue_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<BlockedService>> {
        let blocked: Vec<(ServiceId, ServiceId, String)> = sqlx::query_as(
            "SELECT DISTINCT ON (s.id) s.id, u.id, u.state \
             FROM services s \
             JOIN service_dependencies d ON d.service_id = s.id \
             JOIN services u ON u.id = d.depends_on_id \
             WHERE s.state IN ('CREATED', 'QUEUED', 'RESUMED') \
               AND NOT s.force_independent \
               AND (s.queue_id = $1 OR s.queue_id IS NULL) \
               AND u.state IN ('CANCELED', 'TIMEOUT', 'ERROR') \
             ORDER BY s.id, u.id \
             LIMIT $2",
        )
        .bind(queue_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(pool)
        .await?;

        let ids: Vec<ServiceId> = blocked.iter().map(|(id, _, _)| *id).collect();
        let records = Self::find_by_ids(pool, &ids).await?;
        records
            .into_iter()
            .filter_map(|service| {
                blocked
                    .iter()
                    .find(|(id, _, _)| *id == service.id())
                    .map(|(_, dep, state)| (service, *dep, state.clone()))
            })
            .map(|(service, failed_dependency, state)| {
                let dependency_state = state
                    .parse()
                    .map_err(|e| StoreError::Corrupt(format!("service {failed_dependency}: {e}")))?;
                Ok(BlockedService {
                    service,
                    failed_dependency,
                    dependency_state,
                })
            })
            .collect()
    }

    /// In-flight records on `queue_id` whose timeout has elapsed at `now`.
    ///
    /// Mirrors [`ServiceRecord::timeout`]: an explicit `timeout_ms` wins,
    /// otherwise the `hardDurationSecs` resource hint applies.
    pub async fn find_expired(
        pool: &PgPool,
        queue_id: &str,
        now: Timestamp,
        limit: usize,
    ) -> StoreResult<Vec<ServiceRecord>> {
        let query = format!(
            "SELECT {COLUMNS} FROM services s \
             WHERE s.state IN ('DISPATCHED', 'RUNNING', 'WAITING_FOR_DEPENDENCIES') \
               AND s.queue_id = $1 \
               AND s.process_started_at IS NOT NULL \
               AND COALESCE( \
                     CASE WHEN s.timeout_ms > 0 THEN s.timeout_ms END, \
                     CASE WHEN s.resources->>'hardDurationSecs' ~ '^\\s*[0-9]+\\s*$' \
                          THEN trim(s.resources->>'hardDurationSecs')::bigint * 1000 END \
                   ) IS NOT NULL \
               AND s.process_started_at + make_interval(secs => COALESCE( \
                     CASE WHEN s.timeout_ms > 0 THEN s.timeout_ms END, \
                     CASE WHEN s.resources->>'hardDurationSecs' ~ '^\\s*[0-9]+\\s*$' \
                          THEN trim(s.resources->>'hardDurationSecs')::bigint * 1000 END \
                   ) / 1000.0) <= $2 \
             ORDER BY s.process_started_at \
             LIMIT $3"
        );
        let rows = sqlx::query_as::<_, ServiceRow>(&query)
            .bind(queue_id)
            .bind(now)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(pool)
            .await?;
        into_records(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_pattern_has_no_where_clause() {
        let (clause, args) = search_filter(&ServicePattern::default(), &TimeRange::default());
        assert!(clause.is_empty());
        assert!(args.is_empty());
    }

    #[test]
    fn filter_numbers_binds_in_order() {
        let pattern = ServicePattern {
            owner_key: Some("alice".into()),
            tags: vec!["lsm".into()],
            ..ServicePattern::named("stitch*").in_states(&[ServiceState::Queued])
        };
        let (clause, args) = search_filter(&pattern, &TimeRange::default());
        assert_eq!(
            clause,
            "WHERE s.name LIKE $1 AND s.state = ANY($2) AND s.owner_key = $3 AND s.tags @> $4"
        );
        assert_eq!(args.len(), 4);
    }
}

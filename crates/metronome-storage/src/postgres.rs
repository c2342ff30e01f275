//! PostgreSQL implementation of WorkStore
//!
//! Production persistence using PostgreSQL with:
//! - Skip-locked leasing so concurrent workers never block on each other
//! - Transactional complete/fail that rejects commits from lost leases
//! - Idempotent occurrence inserts guarded by (task_id, run_at)

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use metronome_core::{Task, TaskStatus};

use crate::models::*;
use crate::store::{StoreError, WorkStore};

const TASK_COLUMNS: &str = "id, title, description, created_by, schedule_kind, schedule_expr, \
     timezone, payload, status, priority, max_retries, backoff_strategy, dedupe_key, \
     dedupe_window_seconds, concurrency_key, catch_up, next_run, last_enqueued_at, \
     snoozed_until, created_at, updated_at";

const RUN_COLUMNS: &str = "id, task_id, lease_owner, leased_until, attempt, started_at, \
     finished_at, success, skipped, error_kind, error, output, created_at";

/// PostgreSQL implementation of WorkStore
///
/// Uses a connection pool for efficient database access.
#[derive(Clone)]
pub struct PostgresWorkStore {
    pool: PgPool,
}

impl PostgresWorkStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create database connection from URL
    pub async fn from_url(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(Self { pool })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn db_err(e: sqlx::Error) -> StoreError {
        StoreError::Database(e.to_string())
    }

    async fn insert_run(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        run: &NewRun,
    ) -> Result<Uuid, StoreError> {
        let run_id = Uuid::now_v7();
        sqlx::query(
            r#"
            INSERT INTO run (id, task_id, lease_owner, leased_until, attempt, started_at,
                             finished_at, success, skipped, error_kind, error, output)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(run_id)
        .bind(run.task_id)
        .bind(&run.lease_owner)
        .bind(run.leased_until)
        .bind(run.attempt)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.success)
        .bind(run.skipped)
        .bind(run.error_kind.map(|k| k.to_string()))
        .bind(&run.error)
        .bind(&run.output)
        .execute(&mut **tx)
        .await
        .map_err(Self::db_err)?;
        Ok(run_id)
    }
}

#[async_trait]
impl WorkStore for PostgresWorkStore {
    // =========================================================================
    // Tasks
    // =========================================================================

    #[instrument(skip(self, task), fields(task_id = %task.id))]
    async fn create_task(&self, task: &Task) -> Result<(), StoreError> {
        let payload = serde_json::to_value(&task.payload)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO task (id, title, description, created_by, schedule_kind, schedule_expr,
                              timezone, payload, status, priority, max_retries, backoff_strategy,
                              dedupe_key, dedupe_window_seconds, concurrency_key, catch_up,
                              next_run, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(task.id)
        .bind(&task.title)
        .bind(&task.description)
        .bind(&task.created_by)
        .bind(task.schedule.kind.to_string())
        .bind(&task.schedule.expression)
        .bind(&task.schedule.timezone)
        .bind(&payload)
        .bind(task.status.to_string())
        .bind(task.policy.priority)
        .bind(task.policy.max_retries as i32)
        .bind(task.policy.backoff_strategy.to_string())
        .bind(&task.policy.dedupe_key)
        .bind(task.policy.dedupe_window_seconds.map(|w| w as i32))
        .bind(&task.policy.concurrency_key)
        .bind(task.catch_up.to_string())
        .bind(task.next_run)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create task: {}", e);
            Self::db_err(e)
        })?;

        debug!(task_id = %task.id, "created task");
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM task WHERE id = $1",
            TASK_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::db_err)?;

        row.map(Task::try_from).transpose()
    }

    async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            r#"
            SELECT {}
            FROM task
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR created_by = $2)
            ORDER BY created_at DESC
            OFFSET $3
            LIMIT $4
            "#,
            TASK_COLUMNS
        ))
        .bind(filter.status.map(|s| s.to_string()))
        .bind(&filter.created_by)
        .bind(filter.offset)
        .bind(filter.limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Self::db_err)?;

        rows.into_iter().map(Task::try_from).collect()
    }

    #[instrument(skip(self, task), fields(task_id = %task.id))]
    async fn update_task(&self, task: &Task) -> Result<bool, StoreError> {
        let payload = serde_json::to_value(&task.payload)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let result = sqlx::query(
            r#"
            UPDATE task
            SET title = $2,
                description = $3,
                schedule_kind = $4,
                schedule_expr = $5,
                timezone = $6,
                payload = $7,
                priority = $8,
                max_retries = $9,
                backoff_strategy = $10,
                dedupe_key = $11,
                dedupe_window_seconds = $12,
                concurrency_key = $13,
                catch_up = $14,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(task.id)
        .bind(&task.title)
        .bind(&task.description)
        .bind(task.schedule.kind.to_string())
        .bind(&task.schedule.expression)
        .bind(&task.schedule.timezone)
        .bind(&payload)
        .bind(task.policy.priority)
        .bind(task.policy.max_retries as i32)
        .bind(task.policy.backoff_strategy.to_string())
        .bind(&task.policy.dedupe_key)
        .bind(task.policy.dedupe_window_seconds.map(|w| w as i32))
        .bind(&task.policy.concurrency_key)
        .bind(task.catch_up.to_string())
        .execute(&self.pool)
        .await
        .map_err(Self::db_err)?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn set_task_status(&self, id: Uuid, status: TaskStatus) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE task SET status = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(status.to_string())
        .execute(&self.pool)
        .await
        .map_err(Self::db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_task_schedule_marks(
        &self,
        id: Uuid,
        next_run: Option<DateTime<Utc>>,
        last_enqueued_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        // The watermark only moves forward; a backward clock jump must not
        // rewind it.
        let result = sqlx::query(
            r#"
            UPDATE task
            SET next_run = $2,
                last_enqueued_at = CASE
                    WHEN $3::timestamptz IS NULL THEN last_enqueued_at
                    ELSE GREATEST($3, COALESCE(last_enqueued_at, $3))
                END
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(next_run)
        .bind(last_enqueued_at)
        .execute(&self.pool)
        .await
        .map_err(Self::db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_task_snooze(
        &self,
        id: Uuid,
        snoozed_until: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE task SET snoozed_until = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(snoozed_until)
        .execute(&self.pool)
        .await
        .map_err(Self::db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_tasks_updated_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM task WHERE updated_at > $1 ORDER BY updated_at ASC",
            TASK_COLUMNS
        ))
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(Self::db_err)?;

        rows.into_iter().map(Task::try_from).collect()
    }

    // =========================================================================
    // Due-work queue
    // =========================================================================

    #[instrument(skip(self, item), fields(task_id = %item.task_id))]
    async fn enqueue_due_work(
        &self,
        item: NewDueWork,
        dedupe: Option<DedupeGuard>,
    ) -> Result<EnqueueOutcome, StoreError> {
        let id = Uuid::now_v7();
        let guarded = dedupe.is_some();
        let window_secs = dedupe.and_then(|g| g.window).map(|w| w.num_seconds() as f64);

        let result = sqlx::query(
            r#"
            INSERT INTO due_work (id, task_id, run_at, priority, attempt, params)
            SELECT $1, $2, $3, $4, $5, $8
            WHERE NOT EXISTS (
                SELECT 1 FROM due_work occ
                WHERE occ.task_id = $2 AND occ.run_at = $3
            )
            AND NOT (
                $6::boolean AND (
                    EXISTS (
                        SELECT 1 FROM due_work w
                        WHERE w.task_id = $2
                          AND (w.lease_owner IS NULL OR w.locked_until < NOW())
                    )
                    OR (
                        $7::float8 IS NOT NULL AND EXISTS (
                            SELECT 1 FROM run r
                            WHERE r.task_id = $2
                              AND r.finished_at >= NOW() - make_interval(secs => $7)
                        )
                    )
                )
            )
            "#,
        )
        .bind(id)
        .bind(item.task_id)
        .bind(item.run_at)
        .bind(item.priority)
        .bind(item.attempt)
        .bind(guarded)
        .bind(window_secs)
        .bind(&item.params)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to enqueue due work: {}", e);
            Self::db_err(e)
        })?;

        if result.rows_affected() > 0 {
            debug!(%id, run_at = %item.run_at, "enqueued due work");
            Ok(EnqueueOutcome::Created(id))
        } else {
            Ok(EnqueueOutcome::Duplicate)
        }
    }

    #[instrument(skip(self))]
    async fn lease_due_work(
        &self,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<LeasedWork>, StoreError> {
        // Single atomic statement: pick the best available row with SKIP
        // LOCKED so concurrent leasers silently pass over each other's
        // candidates, then stamp the lease in the same command.
        let row = sqlx::query(
            r#"
            WITH candidate AS (
                SELECT w.id
                FROM due_work w
                JOIN task t ON t.id = w.task_id
                WHERE w.run_at <= NOW()
                  AND (w.lease_owner IS NULL OR w.locked_until < NOW())
                  AND (t.concurrency_key IS NULL OR NOT EXISTS (
                        SELECT 1
                        FROM due_work held
                        JOIN task ht ON ht.id = held.task_id
                        WHERE held.id <> w.id
                          AND ht.concurrency_key = t.concurrency_key
                          AND held.lease_owner IS NOT NULL
                          AND held.locked_until >= NOW()
                  ))
                ORDER BY w.priority DESC, w.run_at ASC, w.seq ASC
                LIMIT 1
                FOR UPDATE OF w SKIP LOCKED
            )
            UPDATE due_work w
            SET lease_owner = $1,
                locked_until = NOW() + ($2 || ' milliseconds')::INTERVAL
            FROM candidate c
            WHERE w.id = c.id
            RETURNING w.id, w.task_id, w.run_at, w.priority, w.attempt, w.params, w.locked_until
            "#,
        )
        .bind(worker_id)
        .bind(lease_duration.as_millis().to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to lease due work: {}", e);
            Self::db_err(e)
        })?;

        Ok(row.map(|r| LeasedWork {
            id: r.get("id"),
            task_id: r.get("task_id"),
            run_at: r.get("run_at"),
            priority: r.get("priority"),
            attempt: r.get("attempt"),
            params: r.get("params"),
            locked_until: r.get("locked_until"),
        }))
    }

    async fn extend_lease(
        &self,
        work_id: Uuid,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<bool, StoreError> {
        // An expired lease must not be extended; the row already belongs to
        // whoever leases it next.
        let result = sqlx::query(
            r#"
            UPDATE due_work
            SET locked_until = NOW() + ($3 || ' milliseconds')::INTERVAL
            WHERE id = $1 AND lease_owner = $2 AND locked_until >= NOW()
            "#,
        )
        .bind(work_id)
        .bind(worker_id)
        .bind(lease_duration.as_millis().to_string())
        .execute(&self.pool)
        .await
        .map_err(Self::db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_lease(&self, work_id: Uuid, worker_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE due_work
            SET lease_owner = NULL, locked_until = NULL
            WHERE id = $1 AND lease_owner = $2
            "#,
        )
        .bind(work_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(Self::db_err)?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, run))]
    async fn complete_due_work(
        &self,
        work_id: Uuid,
        worker_id: &str,
        run: NewRun,
    ) -> Result<CommitOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(Self::db_err)?;

        let deleted = sqlx::query(
            "DELETE FROM due_work WHERE id = $1 AND lease_owner = $2 AND locked_until >= NOW()",
        )
        .bind(work_id)
        .bind(worker_id)
        .execute(&mut *tx)
        .await
        .map_err(Self::db_err)?;

        if deleted.rows_affected() == 0 {
            tx.rollback().await.map_err(Self::db_err)?;
            debug!(%work_id, worker_id, "commit rejected: lease lost");
            return Ok(CommitOutcome::LeaseLost);
        }

        let run_id = Self::insert_run(&mut tx, &run).await?;
        tx.commit().await.map_err(Self::db_err)?;

        debug!(%work_id, %run_id, "completed due work");
        Ok(CommitOutcome::Committed)
    }

    #[instrument(skip(self, run))]
    async fn fail_due_work_terminal(
        &self,
        work_id: Uuid,
        worker_id: &str,
        run: NewRun,
    ) -> Result<CommitOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(Self::db_err)?;

        let deleted = sqlx::query(
            "DELETE FROM due_work WHERE id = $1 AND lease_owner = $2 AND locked_until >= NOW()",
        )
        .bind(work_id)
        .bind(worker_id)
        .execute(&mut *tx)
        .await
        .map_err(Self::db_err)?;

        if deleted.rows_affected() == 0 {
            tx.rollback().await.map_err(Self::db_err)?;
            return Ok(CommitOutcome::LeaseLost);
        }

        let run_id = Self::insert_run(&mut tx, &run).await?;
        tx.commit().await.map_err(Self::db_err)?;

        debug!(%work_id, %run_id, "recorded terminal failure");
        Ok(CommitOutcome::Committed)
    }

    #[instrument(skip(self, run))]
    async fn fail_due_work_rearm(
        &self,
        work_id: Uuid,
        worker_id: &str,
        retry_at: DateTime<Utc>,
        run: NewRun,
    ) -> Result<CommitOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(Self::db_err)?;

        let updated = sqlx::query(
            r#"
            UPDATE due_work
            SET run_at = $3,
                lease_owner = NULL,
                locked_until = NULL,
                attempt = attempt + 1
            WHERE id = $1 AND lease_owner = $2 AND locked_until >= NOW()
            "#,
        )
        .bind(work_id)
        .bind(worker_id)
        .bind(retry_at)
        .execute(&mut *tx)
        .await
        .map_err(Self::db_err)?;

        if updated.rows_affected() == 0 {
            tx.rollback().await.map_err(Self::db_err)?;
            return Ok(CommitOutcome::LeaseLost);
        }

        Self::insert_run(&mut tx, &run).await?;
        tx.commit().await.map_err(Self::db_err)?;

        debug!(%work_id, %retry_at, "re-armed due work after failure");
        Ok(CommitOutcome::Committed)
    }

    async fn drop_unleased_work_for_task(&self, task_id: Uuid) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM due_work
            WHERE task_id = $1
              AND (lease_owner IS NULL OR locked_until < NOW())
            "#,
        )
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(Self::db_err)?;

        Ok(result.rows_affected())
    }

    async fn shift_unleased_work_for_task(
        &self,
        task_id: Uuid,
        delta: chrono::Duration,
        cap: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE due_work
            SET run_at = LEAST(run_at + make_interval(secs => $2), $3)
            WHERE task_id = $1
              AND (lease_owner IS NULL OR locked_until < NOW())
            "#,
        )
        .bind(task_id)
        .bind(delta.num_milliseconds() as f64 / 1000.0)
        .bind(cap)
        .execute(&self.pool)
        .await
        .map_err(Self::db_err)?;

        Ok(result.rows_affected())
    }

    async fn list_due_work_for_task(&self, task_id: Uuid) -> Result<Vec<DueWork>, StoreError> {
        let rows = sqlx::query_as::<_, DueWork>(
            r#"
            SELECT id, task_id, run_at, priority, attempt, params, lease_owner, locked_until, created_at
            FROM due_work
            WHERE task_id = $1
            ORDER BY run_at ASC
            "#,
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Self::db_err)?;

        Ok(rows)
    }

    // =========================================================================
    // Runs
    // =========================================================================

    async fn get_run(&self, id: Uuid) -> Result<Option<Run>, StoreError> {
        let row = sqlx::query_as::<_, Run>(&format!(
            "SELECT {} FROM run WHERE id = $1",
            RUN_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::db_err)?;

        Ok(row)
    }

    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<Run>, StoreError> {
        let rows = sqlx::query_as::<_, Run>(&format!(
            r#"
            SELECT {}
            FROM run
            WHERE ($1::uuid IS NULL OR task_id = $1)
              AND ($2::boolean IS NULL OR success = $2)
            ORDER BY started_at DESC
            OFFSET $3
            LIMIT $4
            "#,
            RUN_COLUMNS
        ))
        .bind(filter.task_id)
        .bind(filter.success)
        .bind(filter.offset)
        .bind(filter.limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Self::db_err)?;

        Ok(rows)
    }

    // =========================================================================
    // Events
    // =========================================================================

    #[instrument(skip(self, event), fields(event_id = %event.id, topic = %event.topic))]
    async fn publish_event(&self, event: NewEvent) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO event (id, topic, payload, source)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&event.id)
        .bind(&event.topic)
        .bind(&event.payload)
        .bind(&event.source)
        .execute(&self.pool)
        .await
        .map_err(Self::db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn fetch_undispatched_events(&self, limit: i64) -> Result<Vec<Event>, StoreError> {
        let rows = sqlx::query_as::<_, Event>(
            r#"
            SELECT id, topic, payload, source, published_at, dispatched_at
            FROM event
            WHERE dispatched_at IS NULL
            ORDER BY published_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Self::db_err)?;

        Ok(rows)
    }

    async fn mark_event_dispatched(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE event SET dispatched_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(Self::db_err)?;

        Ok(())
    }

    async fn prune_events(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM event WHERE published_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await
            .map_err(Self::db_err)?;

        Ok(result.rows_affected())
    }

    // =========================================================================
    // Worker heartbeats
    // =========================================================================

    async fn record_worker_heartbeat(
        &self,
        worker_id: &str,
        started_at: DateTime<Utc>,
        inflight: i32,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO worker_heartbeat (worker_id, started_at, last_seen, inflight)
            VALUES ($1, $2, NOW(), $3)
            ON CONFLICT (worker_id) DO UPDATE SET
                last_seen = NOW(),
                inflight = EXCLUDED.inflight
            "#,
        )
        .bind(worker_id)
        .bind(started_at)
        .bind(inflight)
        .execute(&self.pool)
        .await
        .map_err(Self::db_err)?;

        Ok(())
    }

    async fn list_worker_heartbeats(&self) -> Result<Vec<WorkerHeartbeat>, StoreError> {
        let rows = sqlx::query_as::<_, WorkerHeartbeat>(
            r#"
            SELECT worker_id, started_at, last_seen, inflight
            FROM worker_heartbeat
            ORDER BY last_seen DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Self::db_err)?;

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    // The leasing protocol is exercised against the in-memory store in
    // tests/queue_protocol.rs; running this implementation requires a
    // PostgreSQL database (DATABASE_URL) and the migrations applied.
}

// WorkStore trait definition
//
// The single rendezvous between the scheduler and the workers. Both the
// Postgres implementation and the in-memory test twin provide the same
// atomicity guarantees: leasing never hands one row to two workers, and
// commit-time operations refuse to act on a lost lease.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use metronome_core::{Task, TaskStatus};

use crate::models::*;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Task not found
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    /// Due-work row not found
    #[error("due work not found: {0}")]
    WorkNotFound(Uuid),

    /// Database error; retried at the worker loop level
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Store I/O failures are transient and never consume a task retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Database(_))
    }
}

/// Store for tasks, the due-work queue, runs, events, and heartbeats.
///
/// Implementations must be thread-safe and support concurrent access.
#[async_trait]
pub trait WorkStore: Send + Sync + 'static {
    // =========================================================================
    // Tasks
    // =========================================================================

    /// Insert a new task.
    async fn create_task(&self, task: &Task) -> Result<(), StoreError>;

    /// Fetch a task by id.
    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, StoreError>;

    /// List tasks matching a filter, newest first.
    async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>, StoreError>;

    /// Replace a task's mutable definition fields (title, description,
    /// schedule, payload, policy, catch-up) and bump `updated_at`.
    async fn update_task(&self, task: &Task) -> Result<bool, StoreError>;

    /// Transition a task's lifecycle state. Returns false if the task does
    /// not exist.
    async fn set_task_status(&self, id: Uuid, status: TaskStatus) -> Result<bool, StoreError>;

    /// Write the scheduler's cached `next_run` and the `last_enqueued_at`
    /// high-watermark. Does not bump `updated_at` (scheduler bookkeeping is
    /// not a definition change).
    async fn set_task_schedule_marks(
        &self,
        id: Uuid,
        next_run: Option<DateTime<Utc>>,
        last_enqueued_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError>;

    /// Set or clear the snooze point.
    async fn set_task_snooze(
        &self,
        id: Uuid,
        snoozed_until: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError>;

    /// All tasks whose `updated_at` is strictly newer than `since` — the
    /// scheduler's change feed.
    async fn list_tasks_updated_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<Task>, StoreError>;

    // =========================================================================
    // Due-work queue
    // =========================================================================

    /// Insert a due-work row, subject to the `(task_id, run_at)` uniqueness
    /// guard and, when `dedupe` is present, the per-task dedupe admission.
    async fn enqueue_due_work(
        &self,
        item: NewDueWork,
        dedupe: Option<DedupeGuard>,
    ) -> Result<EnqueueOutcome, StoreError>;

    /// Atomically select and lock the best available row.
    ///
    /// Candidate: `run_at <= now()` and not held. Order: priority DESC,
    /// run_at ASC, insertion order. Rows whose task shares a
    /// `concurrency_key` with another currently-leased row are skipped.
    /// Uses SELECT ... FOR UPDATE SKIP LOCKED in the Postgres
    /// implementation; never blocks on another leaser.
    async fn lease_due_work(
        &self,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<LeasedWork>, StoreError>;

    /// Extend a still-valid lease. Returns false (and changes nothing) when
    /// the lease has already expired or belongs to someone else.
    async fn extend_lease(
        &self,
        work_id: Uuid,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<bool, StoreError>;

    /// Release a held lease so another worker can pick the row up
    /// immediately (graceful shutdown path).
    async fn release_lease(&self, work_id: Uuid, worker_id: &str) -> Result<bool, StoreError>;

    /// Within one transaction: append the run and delete the row — iff the
    /// caller still holds an unexpired lease.
    async fn complete_due_work(
        &self,
        work_id: Uuid,
        worker_id: &str,
        run: NewRun,
    ) -> Result<CommitOutcome, StoreError>;

    /// Terminal failure: append the failed run and delete the row.
    async fn fail_due_work_terminal(
        &self,
        work_id: Uuid,
        worker_id: &str,
        run: NewRun,
    ) -> Result<CommitOutcome, StoreError>;

    /// Non-terminal failure: append the failed-attempt run, then re-arm the
    /// row at `retry_at` with the lease cleared and attempt incremented.
    async fn fail_due_work_rearm(
        &self,
        work_id: Uuid,
        worker_id: &str,
        retry_at: DateTime<Utc>,
        run: NewRun,
    ) -> Result<CommitOutcome, StoreError>;

    /// Drop unleased rows for a task (cancellation). Leased rows are left
    /// for their holder, whose commit will record a skipped run.
    async fn drop_unleased_work_for_task(&self, task_id: Uuid) -> Result<u64, StoreError>;

    /// Shift unleased rows of a task by a delay, clamping each `run_at`
    /// into `[now, cap]` (snooze support).
    async fn shift_unleased_work_for_task(
        &self,
        task_id: Uuid,
        delta: chrono::Duration,
        cap: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Pending (not yet completed) rows for one task, soonest first.
    async fn list_due_work_for_task(&self, task_id: Uuid) -> Result<Vec<DueWork>, StoreError>;

    // =========================================================================
    // Runs
    // =========================================================================

    /// Fetch one run.
    async fn get_run(&self, id: Uuid) -> Result<Option<Run>, StoreError>;

    /// List runs matching a filter, most recent `started_at` first.
    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<Run>, StoreError>;

    // =========================================================================
    // Events
    // =========================================================================

    /// Publish an event. Returns false when the bus id was already seen
    /// (at-least-once delivery collapsing to one row).
    async fn publish_event(&self, event: NewEvent) -> Result<bool, StoreError>;

    /// Events not yet handed to the scheduler, in publication order.
    async fn fetch_undispatched_events(&self, limit: i64) -> Result<Vec<Event>, StoreError>;

    /// Mark an event as dispatched.
    async fn mark_event_dispatched(&self, id: &str) -> Result<(), StoreError>;

    /// Remove events published before `older_than`, bounding the dedupe
    /// window's storage.
    async fn prune_events(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError>;

    // =========================================================================
    // Worker heartbeats (observability only)
    // =========================================================================

    /// Upsert a worker's heartbeat record.
    async fn record_worker_heartbeat(
        &self,
        worker_id: &str,
        started_at: DateTime<Utc>,
        inflight: i32,
    ) -> Result<(), StoreError>;

    /// List known workers with their last-seen times.
    async fn list_worker_heartbeats(&self) -> Result<Vec<WorkerHeartbeat>, StoreError>;
}

// Database models (internal, may differ from public DTOs)

use chrono::{DateTime, Utc};
use metronome_core::{
    ErrorKind, Schedule, ScheduleKind, Task, TaskPayload, TaskPolicy, TaskStatus,
};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::store::StoreError;

// ============================================
// Task models
// ============================================

/// Task row from database. Policy and schedule fields are flattened into
/// columns; the payload (pipeline + params) stays JSONB.
#[derive(Debug, Clone, FromRow)]
pub struct TaskRow {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub created_by: String,
    pub schedule_kind: String,
    pub schedule_expr: String,
    pub timezone: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub priority: i32,
    pub max_retries: i32,
    pub backoff_strategy: String,
    pub dedupe_key: Option<String>,
    pub dedupe_window_seconds: Option<i32>,
    pub concurrency_key: Option<String>,
    pub catch_up: String,
    pub next_run: Option<DateTime<Utc>>,
    pub last_enqueued_at: Option<DateTime<Utc>>,
    pub snoozed_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for Task {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> Result<Task, StoreError> {
        let payload: TaskPayload = serde_json::from_value(row.payload)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(Task {
            id: row.id,
            title: row.title,
            description: row.description,
            created_by: row.created_by,
            schedule: Schedule {
                kind: row
                    .schedule_kind
                    .parse::<ScheduleKind>()
                    .map_err(StoreError::Serialization)?,
                expression: row.schedule_expr,
                timezone: row.timezone,
            },
            payload,
            policy: TaskPolicy {
                priority: row.priority,
                max_retries: row.max_retries as u32,
                backoff_strategy: row
                    .backoff_strategy
                    .parse()
                    .map_err(StoreError::Serialization)?,
                dedupe_key: row.dedupe_key,
                dedupe_window_seconds: row.dedupe_window_seconds.map(|w| w as u32),
                concurrency_key: row.concurrency_key,
            },
            status: row.status.parse().map_err(StoreError::Serialization)?,
            catch_up: row.catch_up.parse().map_err(StoreError::Serialization)?,
            next_run: row.next_run,
            last_enqueued_at: row.last_enqueued_at,
            snoozed_until: row.snoozed_until,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Filter for listing tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub created_by: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl TaskFilter {
    pub fn active() -> Self {
        Self {
            status: Some(TaskStatus::Active),
            created_by: None,
            limit: i64::MAX,
            offset: 0,
        }
    }
}

// ============================================
// Due work models
// ============================================

/// One scheduled occurrence awaiting a worker.
#[derive(Debug, Clone, FromRow)]
pub struct DueWork {
    pub id: Uuid,
    pub task_id: Uuid,
    pub run_at: DateTime<Utc>,
    pub priority: i32,
    pub attempt: i32,
    pub params: Option<serde_json::Value>,
    pub lease_owner: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl DueWork {
    /// A row is held while an unexpired lease exists on it.
    pub fn is_held(&self, now: DateTime<Utc>) -> bool {
        self.lease_owner.is_some() && self.locked_until.map(|t| t >= now).unwrap_or(false)
    }
}

/// Input for inserting a new due-work row.
#[derive(Debug, Clone)]
pub struct NewDueWork {
    pub task_id: Uuid,
    pub run_at: DateTime<Utc>,
    pub priority: i32,
    pub attempt: i32,
    /// Per-run parameter overrides (run_now path).
    pub params: Option<serde_json::Value>,
}

/// Dedupe admission for an insert: present when the owning task carries a
/// `dedupe_key`. Suppression is per task (see DESIGN.md).
#[derive(Debug, Clone, Copy)]
pub struct DedupeGuard {
    /// How long a finished Run keeps suppressing new rows.
    pub window: Option<chrono::Duration>,
}

impl DedupeGuard {
    pub fn from_policy(policy: &TaskPolicy) -> Option<Self> {
        policy.dedupe_key.as_ref()?;
        Some(Self {
            window: policy
                .dedupe_window_seconds
                .map(|s| chrono::Duration::seconds(s as i64)),
        })
    }
}

/// Result of an enqueue that handles idempotency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Row was inserted.
    Created(Uuid),
    /// Suppressed by the dedupe guard or the `(task_id, run_at)` uniqueness.
    Duplicate,
}

impl EnqueueOutcome {
    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueOutcome::Created(_))
    }
}

/// A due-work row held under a lease.
#[derive(Debug, Clone)]
pub struct LeasedWork {
    pub id: Uuid,
    pub task_id: Uuid,
    pub run_at: DateTime<Utc>,
    pub priority: i32,
    pub attempt: i32,
    pub params: Option<serde_json::Value>,
    pub locked_until: DateTime<Utc>,
}

/// Outcome of a commit-time operation that requires a live lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// The caller's lease expired or was taken over; nothing was written.
    LeaseLost,
}

// ============================================
// Run models
// ============================================

/// Immutable record of one execution attempt.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub task_id: Uuid,
    pub lease_owner: Option<String>,
    pub leased_until: Option<DateTime<Utc>>,
    pub attempt: i32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub success: bool,
    pub skipped: bool,
    pub error_kind: Option<String>,
    pub error: Option<String>,
    pub output: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Input for appending a run.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub task_id: Uuid,
    pub lease_owner: Option<String>,
    pub leased_until: Option<DateTime<Utc>>,
    pub attempt: i32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub skipped: bool,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
    pub output: Option<serde_json::Value>,
}

impl NewRun {
    /// A skipped run: the task was no longer active when the row was leased.
    pub fn skipped(task_id: Uuid, lease_owner: &str, attempt: i32, now: DateTime<Utc>) -> Self {
        Self {
            task_id,
            lease_owner: Some(lease_owner.to_string()),
            leased_until: None,
            attempt,
            started_at: now,
            finished_at: now,
            success: false,
            skipped: true,
            error_kind: Some(ErrorKind::Canceled),
            error: None,
            output: None,
        }
    }
}

/// Filter for listing runs.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub task_id: Option<Uuid>,
    pub success: Option<bool>,
    pub limit: i64,
    pub offset: i64,
}

// ============================================
// Event models
// ============================================

/// An event record from the bus. The bus-stable `id` is the primary key,
/// which is what makes re-delivery idempotent.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub topic: String,
    pub payload: serde_json::Value,
    pub source: Option<String>,
    pub published_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
}

/// Input for publishing an event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvent {
    pub id: String,
    pub topic: String,
    pub payload: serde_json::Value,
    pub source: Option<String>,
}

// ============================================
// Worker heartbeat models
// ============================================

/// Observability-only record of a live worker.
#[derive(Debug, Clone, FromRow)]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    pub started_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub inflight: i32,
}

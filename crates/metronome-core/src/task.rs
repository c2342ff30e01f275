// Task: the persistent declarative unit (schedule + pipeline + policy)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::ValidationError;
use crate::pipeline::Pipeline;
use crate::policy::BackoffStrategy;
use crate::schedule::Schedule;

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Active,
    Paused,
    Canceled,
    Completed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Active => "active",
            TaskStatus::Paused => "paused",
            TaskStatus::Canceled => "canceled",
            TaskStatus::Completed => "completed",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(TaskStatus::Active),
            "paused" => Ok(TaskStatus::Paused),
            "canceled" => Ok(TaskStatus::Canceled),
            "completed" => Ok(TaskStatus::Completed),
            other => Err(format!("unknown task status: {}", other)),
        }
    }
}

/// What the scheduler does with occurrences missed during downtime or a
/// forward clock jump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CatchUpPolicy {
    /// Emit every missed occurrence, in order.
    #[default]
    All,
    /// Emit only the most recent missed occurrence.
    Latest,
}

impl std::fmt::Display for CatchUpPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatchUpPolicy::All => write!(f, "all"),
            CatchUpPolicy::Latest => write!(f, "latest"),
        }
    }
}

impl FromStr for CatchUpPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(CatchUpPolicy::All),
            "latest" => Ok(CatchUpPolicy::Latest),
            other => Err(format!("unknown catch-up policy: {}", other)),
        }
    }
}

/// Retry, ordering, and admission policy attached to a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPolicy {
    /// 1-9, higher leases earlier.
    pub priority: i32,
    pub max_retries: u32,
    pub backoff_strategy: BackoffStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_window_seconds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_key: Option<String>,
}

impl Default for TaskPolicy {
    fn default() -> Self {
        Self {
            priority: 5,
            max_retries: 3,
            backoff_strategy: BackoffStrategy::default(),
            dedupe_key: None,
            dedupe_window_seconds: None,
            concurrency_key: None,
        }
    }
}

impl TaskPolicy {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(1..=9).contains(&self.priority) {
            return Err(ValidationError::new(
                "priority",
                self.priority.to_string(),
                "an integer between 1 and 9",
            ));
        }
        Ok(())
    }

    /// Total attempts allowed for one occurrence (initial + retries).
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

/// Declarative payload: the pipeline plus seed parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub pipeline: Pipeline,
    #[serde(default)]
    pub params: serde_json::Map<String, Value>,
}

/// A persistent task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    /// Opaque principal that owns the task.
    pub created_by: String,
    pub schedule: Schedule,
    pub payload: TaskPayload,
    pub policy: TaskPolicy,
    pub status: TaskStatus,
    #[serde(default)]
    pub catch_up: CatchUpPolicy,
    /// Cached next fire time, for observability only; the scheduler
    /// re-derives the authoritative value.
    pub next_run: Option<DateTime<Utc>>,
    /// Greatest `run_at` the scheduler has enqueued for this task. Guards
    /// against re-firing emitted occurrences after a backward clock jump.
    pub last_enqueued_at: Option<DateTime<Utc>>,
    /// Effective next fire is `max(computed, snoozed_until)`.
    pub snoozed_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn is_active(&self) -> bool {
        self.status == TaskStatus::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::ScheduleKind;
    use serde_json::json;

    #[test]
    fn policy_priority_bounds() {
        let mut policy = TaskPolicy::default();
        assert!(policy.validate().is_ok());
        policy.priority = 0;
        assert!(policy.validate().is_err());
        policy.priority = 10;
        assert!(policy.validate().is_err());
        policy.priority = 9;
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn max_attempts_includes_initial() {
        let policy = TaskPolicy {
            max_retries: 3,
            ..Default::default()
        };
        assert_eq!(policy.max_attempts(), 4);
    }

    #[test]
    fn payload_parses_pipeline_and_params() {
        let payload: TaskPayload = serde_json::from_value(json!({
            "pipeline": [{"id": "a", "uses": "echo", "with": {"message": "hi"}}],
            "params": {"who": "world"}
        }))
        .unwrap();
        assert_eq!(payload.pipeline.steps.len(), 1);
        assert_eq!(payload.params["who"], json!("world"));
    }

    #[test]
    fn status_round_trips() {
        for status in [
            TaskStatus::Active,
            TaskStatus::Paused,
            TaskStatus::Canceled,
            TaskStatus::Completed,
        ] {
            let parsed: TaskStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn schedule_union_serializes() {
        let task_schedule = Schedule::new(ScheduleKind::Event, "orders.created", "UTC");
        let v = serde_json::to_value(&task_schedule).unwrap();
        assert_eq!(v, json!({"kind": "event", "expression": "orders.created", "timezone": "UTC"}));
    }
}

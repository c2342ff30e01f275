// Work queue: the §lease/complete/fail contract over a WorkStore
//
// The queue owns the policy half of the protocol (dedupe admission on
// enqueue, retry-budget and backoff decisions on failure); the store
// supplies the atomic primitives.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use metronome_core::{Backoff, ErrorKind, Task, TaskPolicy};

use crate::models::*;
use crate::store::{StoreError, WorkStore};

/// Outcome of failing a leased work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Re-armed for another attempt at `retry_at`.
    Rearmed { retry_at: DateTime<Utc> },
    /// No retries remaining (or the error kind never retries); a terminal
    /// failed run was recorded and the row deleted.
    Terminal,
    /// The lease was lost; nothing was recorded.
    LeaseLost,
}

/// Durable rendezvous between the scheduler and workers.
#[derive(Clone)]
pub struct WorkQueue {
    store: Arc<dyn WorkStore>,
    backoff: Backoff,
}

impl WorkQueue {
    pub fn new(store: Arc<dyn WorkStore>) -> Self {
        Self {
            store,
            backoff: Backoff::default(),
        }
    }

    /// Override the backoff base/cap (tests shrink these).
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn store(&self) -> &Arc<dyn WorkStore> {
        &self.store
    }

    /// Enqueue one occurrence of a task, applying its dedupe admission.
    pub async fn enqueue(
        &self,
        task: &Task,
        run_at: DateTime<Utc>,
        attempt: i32,
    ) -> Result<EnqueueOutcome, StoreError> {
        self.enqueue_with_params(task, run_at, attempt, None).await
    }

    /// Enqueue with per-run parameter overrides (the run_now path).
    pub async fn enqueue_with_params(
        &self,
        task: &Task,
        run_at: DateTime<Utc>,
        attempt: i32,
        params: Option<serde_json::Value>,
    ) -> Result<EnqueueOutcome, StoreError> {
        let outcome = self
            .store
            .enqueue_due_work(
                NewDueWork {
                    task_id: task.id,
                    run_at,
                    priority: task.policy.priority,
                    attempt,
                    params,
                },
                DedupeGuard::from_policy(&task.policy),
            )
            .await?;

        if let EnqueueOutcome::Duplicate = outcome {
            debug!(task_id = %task.id, %run_at, "enqueue suppressed as duplicate");
        }
        Ok(outcome)
    }

    /// Lease the best available item, if any.
    pub async fn lease(
        &self,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<LeasedWork>, StoreError> {
        self.store.lease_due_work(worker_id, lease_duration).await
    }

    /// Extend a still-live lease.
    pub async fn extend_lease(
        &self,
        work_id: Uuid,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<bool, StoreError> {
        self.store
            .extend_lease(work_id, worker_id, lease_duration)
            .await
    }

    /// Release a lease without recording anything (shutdown path).
    pub async fn release(&self, work_id: Uuid, worker_id: &str) -> Result<bool, StoreError> {
        self.store.release_lease(work_id, worker_id).await
    }

    /// Commit a terminal run and drop the row. Rejected when the lease has
    /// been lost, in which case no run is recorded.
    pub async fn complete(
        &self,
        work_id: Uuid,
        worker_id: &str,
        run: NewRun,
    ) -> Result<CommitOutcome, StoreError> {
        self.store.complete_due_work(work_id, worker_id, run).await
    }

    /// Record a failed attempt: terminal when the error kind never retries
    /// or the attempt budget is exhausted, otherwise re-armed with the
    /// task's backoff.
    pub async fn fail(
        &self,
        work: &LeasedWork,
        worker_id: &str,
        policy: &TaskPolicy,
        kind: ErrorKind,
        run: NewRun,
    ) -> Result<FailOutcome, StoreError> {
        let terminal = !kind.is_retryable() || work.attempt as u32 >= policy.max_attempts();

        if terminal {
            match self
                .store
                .fail_due_work_terminal(work.id, worker_id, run)
                .await?
            {
                CommitOutcome::Committed => {
                    debug!(work_id = %work.id, attempt = work.attempt, %kind, "terminal failure");
                    Ok(FailOutcome::Terminal)
                }
                CommitOutcome::LeaseLost => {
                    warn!(work_id = %work.id, "lease lost before terminal failure commit");
                    Ok(FailOutcome::LeaseLost)
                }
            }
        } else {
            let delay = self.backoff.delay(policy.backoff_strategy, work.attempt as u32);
            let retry_at = Utc::now()
                + chrono::Duration::from_std(delay)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
            match self
                .store
                .fail_due_work_rearm(work.id, worker_id, retry_at, run)
                .await?
            {
                CommitOutcome::Committed => {
                    debug!(
                        work_id = %work.id,
                        attempt = work.attempt,
                        %retry_at,
                        "re-armed after failure"
                    );
                    Ok(FailOutcome::Rearmed { retry_at })
                }
                CommitOutcome::LeaseLost => {
                    warn!(work_id = %work.id, "lease lost before re-arm");
                    Ok(FailOutcome::LeaseLost)
                }
            }
        }
    }
}

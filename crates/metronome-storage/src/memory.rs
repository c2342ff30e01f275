//! In-memory implementation of WorkStore for testing
//!
//! Provides the same observable semantics as the PostgreSQL implementation:
//! one mutex around the whole state makes every trait method atomic, which
//! is what SKIP LOCKED plus single-statement updates give the real store.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use metronome_core::{Task, TaskStatus};

use crate::models::*;
use crate::store::{StoreError, WorkStore};

#[derive(Debug, Clone)]
struct WorkRow {
    id: Uuid,
    task_id: Uuid,
    run_at: DateTime<Utc>,
    priority: i32,
    attempt: i32,
    params: Option<serde_json::Value>,
    lease_owner: Option<String>,
    locked_until: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    seq: u64,
}

impl WorkRow {
    fn is_held(&self, now: DateTime<Utc>) -> bool {
        self.lease_owner.is_some() && self.locked_until.map(|t| t >= now).unwrap_or(false)
    }

    fn to_due_work(&self) -> DueWork {
        DueWork {
            id: self.id,
            task_id: self.task_id,
            run_at: self.run_at,
            priority: self.priority,
            attempt: self.attempt,
            params: self.params.clone(),
            lease_owner: self.lease_owner.clone(),
            locked_until: self.locked_until,
            created_at: self.created_at,
        }
    }
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<Uuid, Task>,
    work: HashMap<Uuid, WorkRow>,
    runs: Vec<Run>,
    events: Vec<Event>,
    heartbeats: HashMap<String, WorkerHeartbeat>,
    next_seq: u64,
}

/// In-memory implementation of WorkStore
pub struct InMemoryWorkStore {
    inner: Mutex<Inner>,
}

impl InMemoryWorkStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Number of rows currently in the queue (testing helper).
    pub fn due_work_count(&self) -> usize {
        self.inner.lock().work.len()
    }

    /// Number of recorded runs (testing helper).
    pub fn run_count(&self) -> usize {
        self.inner.lock().runs.len()
    }

    fn append_run(inner: &mut Inner, run: &NewRun) -> Uuid {
        let id = Uuid::now_v7();
        inner.runs.push(Run {
            id,
            task_id: run.task_id,
            lease_owner: run.lease_owner.clone(),
            leased_until: run.leased_until,
            attempt: run.attempt,
            started_at: run.started_at,
            finished_at: Some(run.finished_at),
            success: run.success,
            skipped: run.skipped,
            error_kind: run.error_kind.map(|k| k.to_string()),
            error: run.error.clone(),
            output: run.output.clone(),
            created_at: Utc::now(),
        });
        id
    }

    fn lease_is_live(row: &WorkRow, worker_id: &str, now: DateTime<Utc>) -> bool {
        row.lease_owner.as_deref() == Some(worker_id)
            && row.locked_until.map(|t| t >= now).unwrap_or(false)
    }
}

impl Default for InMemoryWorkStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkStore for InMemoryWorkStore {
    async fn create_task(&self, task: &Task) -> Result<(), StoreError> {
        self.inner.lock().tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        Ok(self.inner.lock().tasks.get(&id).cloned())
    }

    async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>, StoreError> {
        let inner = self.inner.lock();
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| filter.status.map(|s| t.status == s).unwrap_or(true))
            .filter(|t| {
                filter
                    .created_by
                    .as_ref()
                    .map(|c| &t.created_by == c)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let offset = filter.offset.max(0) as usize;
        Ok(tasks
            .into_iter()
            .skip(offset)
            .take(filter.limit.max(0) as usize)
            .collect())
    }

    async fn update_task(&self, task: &Task) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        match inner.tasks.get_mut(&task.id) {
            Some(existing) => {
                existing.title = task.title.clone();
                existing.description = task.description.clone();
                existing.schedule = task.schedule.clone();
                existing.payload = task.payload.clone();
                existing.policy = task.policy.clone();
                existing.catch_up = task.catch_up;
                existing.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_task_status(&self, id: Uuid, status: TaskStatus) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        match inner.tasks.get_mut(&id) {
            Some(task) => {
                task.status = status;
                task.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_task_schedule_marks(
        &self,
        id: Uuid,
        next_run: Option<DateTime<Utc>>,
        last_enqueued_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        match inner.tasks.get_mut(&id) {
            Some(task) => {
                task.next_run = next_run;
                if let Some(mark) = last_enqueued_at {
                    task.last_enqueued_at =
                        Some(task.last_enqueued_at.map_or(mark, |prev| prev.max(mark)));
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_task_snooze(
        &self,
        id: Uuid,
        snoozed_until: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        match inner.tasks.get_mut(&id) {
            Some(task) => {
                task.snoozed_until = snoozed_until;
                task.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_tasks_updated_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<Task>, StoreError> {
        let inner = self.inner.lock();
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.updated_at > since)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.updated_at);
        Ok(tasks)
    }

    async fn enqueue_due_work(
        &self,
        item: NewDueWork,
        dedupe: Option<DedupeGuard>,
    ) -> Result<EnqueueOutcome, StoreError> {
        let mut inner = self.inner.lock();
        let now = Utc::now();

        // (task_id, run_at) occurrence guard
        if inner
            .work
            .values()
            .any(|w| w.task_id == item.task_id && w.run_at == item.run_at)
        {
            return Ok(EnqueueOutcome::Duplicate);
        }

        if let Some(guard) = dedupe {
            let unleased_exists = inner
                .work
                .values()
                .any(|w| w.task_id == item.task_id && !w.is_held(now));
            if unleased_exists {
                return Ok(EnqueueOutcome::Duplicate);
            }
            if let Some(window) = guard.window {
                let cutoff = now - window;
                let recent_run = inner.runs.iter().any(|r| {
                    r.task_id == item.task_id
                        && r.finished_at.map(|f| f >= cutoff).unwrap_or(false)
                });
                if recent_run {
                    return Ok(EnqueueOutcome::Duplicate);
                }
            }
        }

        let id = Uuid::now_v7();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.work.insert(
            id,
            WorkRow {
                id,
                task_id: item.task_id,
                run_at: item.run_at,
                priority: item.priority,
                attempt: item.attempt,
                params: item.params,
                lease_owner: None,
                locked_until: None,
                created_at: now,
                seq,
            },
        );
        Ok(EnqueueOutcome::Created(id))
    }

    async fn lease_due_work(
        &self,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<LeasedWork>, StoreError> {
        let mut inner = self.inner.lock();
        let now = Utc::now();

        // Concurrency keys currently held by live leases
        let held_keys: Vec<String> = inner
            .work
            .values()
            .filter(|w| w.is_held(now))
            .filter_map(|w| {
                inner
                    .tasks
                    .get(&w.task_id)
                    .and_then(|t| t.policy.concurrency_key.clone())
            })
            .collect();

        let mut candidates: Vec<&WorkRow> = inner
            .work
            .values()
            .filter(|w| w.run_at <= now && !w.is_held(now))
            .filter(|w| {
                match inner
                    .tasks
                    .get(&w.task_id)
                    .and_then(|t| t.policy.concurrency_key.as_ref())
                {
                    Some(key) => !held_keys.contains(key),
                    None => true,
                }
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.run_at.cmp(&b.run_at))
                .then(a.seq.cmp(&b.seq))
        });

        let Some(id) = candidates.first().map(|w| w.id) else {
            return Ok(None);
        };

        let locked_until = now
            + chrono::Duration::from_std(lease_duration)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let row = inner.work.get_mut(&id).expect("candidate row exists");
        row.lease_owner = Some(worker_id.to_string());
        row.locked_until = Some(locked_until);

        Ok(Some(LeasedWork {
            id: row.id,
            task_id: row.task_id,
            run_at: row.run_at,
            priority: row.priority,
            attempt: row.attempt,
            params: row.params.clone(),
            locked_until,
        }))
    }

    async fn extend_lease(
        &self,
        work_id: Uuid,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        match inner.work.get_mut(&work_id) {
            Some(row) if Self::lease_is_live(row, worker_id, now) => {
                row.locked_until = Some(
                    now + chrono::Duration::from_std(lease_duration)
                        .map_err(|e| StoreError::Serialization(e.to_string()))?,
                );
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lease(&self, work_id: Uuid, worker_id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        match inner.work.get_mut(&work_id) {
            Some(row) if row.lease_owner.as_deref() == Some(worker_id) => {
                row.lease_owner = None;
                row.locked_until = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete_due_work(
        &self,
        work_id: Uuid,
        worker_id: &str,
        run: NewRun,
    ) -> Result<CommitOutcome, StoreError> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        let live = inner
            .work
            .get(&work_id)
            .map(|row| Self::lease_is_live(row, worker_id, now))
            .unwrap_or(false);
        if !live {
            return Ok(CommitOutcome::LeaseLost);
        }
        inner.work.remove(&work_id);
        Self::append_run(&mut inner, &run);
        Ok(CommitOutcome::Committed)
    }

    async fn fail_due_work_terminal(
        &self,
        work_id: Uuid,
        worker_id: &str,
        run: NewRun,
    ) -> Result<CommitOutcome, StoreError> {
        self.complete_due_work(work_id, worker_id, run).await
    }

    async fn fail_due_work_rearm(
        &self,
        work_id: Uuid,
        worker_id: &str,
        retry_at: DateTime<Utc>,
        run: NewRun,
    ) -> Result<CommitOutcome, StoreError> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        let live = inner
            .work
            .get(&work_id)
            .map(|row| Self::lease_is_live(row, worker_id, now))
            .unwrap_or(false);
        if !live {
            return Ok(CommitOutcome::LeaseLost);
        }
        {
            let row = inner.work.get_mut(&work_id).expect("row checked above");
            row.run_at = retry_at;
            row.lease_owner = None;
            row.locked_until = None;
            row.attempt += 1;
        }
        Self::append_run(&mut inner, &run);
        Ok(CommitOutcome::Committed)
    }

    async fn drop_unleased_work_for_task(&self, task_id: Uuid) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        let before = inner.work.len();
        inner
            .work
            .retain(|_, w| !(w.task_id == task_id && !w.is_held(now)));
        Ok((before - inner.work.len()) as u64)
    }

    async fn shift_unleased_work_for_task(
        &self,
        task_id: Uuid,
        delta: chrono::Duration,
        cap: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        let mut shifted = 0;
        for row in inner.work.values_mut() {
            if row.task_id == task_id && !row.is_held(now) {
                row.run_at = (row.run_at + delta).min(cap);
                shifted += 1;
            }
        }
        Ok(shifted)
    }

    async fn list_due_work_for_task(&self, task_id: Uuid) -> Result<Vec<DueWork>, StoreError> {
        let inner = self.inner.lock();
        let mut rows: Vec<DueWork> = inner
            .work
            .values()
            .filter(|w| w.task_id == task_id)
            .map(|w| w.to_due_work())
            .collect();
        rows.sort_by_key(|w| w.run_at);
        Ok(rows)
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<Run>, StoreError> {
        Ok(self.inner.lock().runs.iter().find(|r| r.id == id).cloned())
    }

    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<Run>, StoreError> {
        let inner = self.inner.lock();
        let mut runs: Vec<Run> = inner
            .runs
            .iter()
            .filter(|r| filter.task_id.map(|t| r.task_id == t).unwrap_or(true))
            .filter(|r| filter.success.map(|s| r.success == s).unwrap_or(true))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        let offset = filter.offset.max(0) as usize;
        Ok(runs
            .into_iter()
            .skip(offset)
            .take(filter.limit.max(0) as usize)
            .collect())
    }

    async fn publish_event(&self, event: NewEvent) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        if inner.events.iter().any(|e| e.id == event.id) {
            return Ok(false);
        }
        inner.events.push(Event {
            id: event.id,
            topic: event.topic,
            payload: event.payload,
            source: event.source,
            published_at: Utc::now(),
            dispatched_at: None,
        });
        Ok(true)
    }

    async fn fetch_undispatched_events(&self, limit: i64) -> Result<Vec<Event>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .events
            .iter()
            .filter(|e| e.dispatched_at.is_none())
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn mark_event_dispatched(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if let Some(event) = inner.events.iter_mut().find(|e| e.id == id) {
            event.dispatched_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn prune_events(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        let before = inner.events.len();
        inner.events.retain(|e| e.published_at >= older_than);
        Ok((before - inner.events.len()) as u64)
    }

    async fn record_worker_heartbeat(
        &self,
        worker_id: &str,
        started_at: DateTime<Utc>,
        inflight: i32,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.heartbeats.insert(
            worker_id.to_string(),
            WorkerHeartbeat {
                worker_id: worker_id.to_string(),
                started_at,
                last_seen: Utc::now(),
                inflight,
            },
        );
        Ok(())
    }

    async fn list_worker_heartbeats(&self) -> Result<Vec<WorkerHeartbeat>, StoreError> {
        let inner = self.inner.lock();
        let mut rows: Vec<WorkerHeartbeat> = inner.heartbeats.values().cloned().collect();
        rows.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        Ok(rows)
    }
}

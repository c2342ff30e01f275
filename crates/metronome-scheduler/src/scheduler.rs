// The scheduler: trigger set, tick loop, change feed, event matching
//
// Exactly one scheduler instance is active at a time (single-writer). The
// invariant it maintains: for every active, non-event task there is either
// an unleased future due-work row or a pending in-memory fire that will
// create one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use metronome_core::{CatchUpPolicy, ScheduleKind, Task, TaskStatus};
use metronome_storage::{StoreError, TaskFilter, WorkQueue, WorkStore};

use crate::events::EventDedupe;
use crate::trigger::{next_occurrence, NextFire};

/// Scheduler tuning knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the task change feed and event table are polled when no
    /// fire is nearer.
    pub poll_interval: Duration,
    /// Event-id dedupe window.
    pub event_dedupe_window: Duration,
    /// Upper bound on missed occurrences emitted in one fire (forward
    /// clock-jump safety valve).
    pub max_catchup_per_fire: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            event_dedupe_window: Duration::from_secs(300),
            max_catchup_per_fire: 1000,
        }
    }
}

struct Trigger {
    task: Task,
    /// None for event-kind tasks.
    next_fire: Option<DateTime<Utc>>,
}

/// Singleton time source: expands schedules into due-work rows.
pub struct Scheduler {
    queue: WorkQueue,
    config: SchedulerConfig,
    triggers: Mutex<HashMap<Uuid, Trigger>>,
    dedupe: Mutex<EventDedupe>,
    change_mark: Mutex<DateTime<Utc>>,
}

impl Scheduler {
    pub fn new(queue: WorkQueue) -> Self {
        Self::with_config(queue, SchedulerConfig::default())
    }

    pub fn with_config(queue: WorkQueue, config: SchedulerConfig) -> Self {
        let dedupe = EventDedupe::new(config.event_dedupe_window);
        Self {
            queue,
            config,
            triggers: Mutex::new(HashMap::new()),
            dedupe: Mutex::new(dedupe),
            change_mark: Mutex::new(Utc::now()),
        }
    }

    fn store(&self) -> &Arc<dyn WorkStore> {
        self.queue.store()
    }

    /// Rebuild the trigger set from the task table. Pre-existing unleased
    /// rows are not duplicated: inserts are guarded by the per-task
    /// watermark and the insert-only-if-absent occurrence check.
    pub async fn start(&self) -> Result<(), StoreError> {
        *self.change_mark.lock() = Utc::now();
        let tasks = self.store().list_tasks(TaskFilter::active()).await?;
        let count = tasks.len();
        for task in tasks {
            self.register(task).await?;
        }
        info!(triggers = count, "scheduler started");
        Ok(())
    }

    /// Idempotent: derive (or re-derive) the trigger for a task.
    pub async fn on_task_created(&self, task: &Task) -> Result<(), StoreError> {
        self.register(task.clone()).await
    }

    /// Idempotent: re-derive or drop the trigger after an update.
    pub async fn on_task_updated(&self, task: &Task) -> Result<(), StoreError> {
        if task.is_active() {
            self.register(task.clone()).await
        } else {
            self.on_task_paused_or_canceled(task.id);
            Ok(())
        }
    }

    /// Drop the trigger; stale due-work rows short-circuit at the worker.
    pub fn on_task_paused_or_canceled(&self, task_id: Uuid) {
        if self.triggers.lock().remove(&task_id).is_some() {
            debug!(%task_id, "trigger dropped");
        }
    }

    /// Match an event against active event-kind tasks; one due-work row per
    /// matching task, deduped by event id within the window.
    pub async fn on_event(&self, event_id: &str, topic: &str) -> Result<usize, StoreError> {
        let now = Utc::now();
        if !self.dedupe.lock().first_seen(event_id, now) {
            debug!(event_id, topic, "event already dispatched, skipping");
            return Ok(0);
        }

        let matching: Vec<Task> = self
            .triggers
            .lock()
            .values()
            .filter(|t| {
                t.task.schedule.kind == ScheduleKind::Event
                    && t.task.schedule.expression == topic
                    && t.task.is_active()
            })
            .map(|t| t.task.clone())
            .collect();

        let mut created = 0;
        for task in matching {
            if self.queue.enqueue(&task, now, 1).await?.is_created() {
                created += 1;
            }
        }
        if created > 0 {
            info!(event_id, topic, created, "event matched tasks");
        }
        Ok(created)
    }

    /// Fire every trigger that is due at `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        let due: Vec<Task> = self
            .triggers
            .lock()
            .values()
            .filter(|t| t.next_fire.map(|f| f <= now).unwrap_or(false))
            .map(|t| t.task.clone())
            .collect();

        for task in due {
            self.fire(task, now).await?;
        }
        Ok(())
    }

    /// Instant of the nearest registered fire, if any.
    pub fn nearest_fire(&self) -> Option<DateTime<Utc>> {
        self.triggers.lock().values().filter_map(|t| t.next_fire).min()
    }

    /// Run until shutdown: change feed, event drain, due fires.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), StoreError> {
        self.start().await?;

        loop {
            if *shutdown.borrow() {
                info!("scheduler shutting down");
                return Ok(());
            }

            // Transient store errors back off and retry; they must not kill
            // the loop.
            if let Err(e) = self.pass(Utc::now()).await {
                warn!("scheduler pass failed: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }

            let sleep_for = self.sleep_until_next_work(Utc::now());
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// One pass of the loop: sync task changes, drain events, fire.
    async fn pass(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.sync_changes().await?;
        self.drain_events(now).await?;
        self.tick(now).await
    }

    fn sleep_until_next_work(&self, now: DateTime<Utc>) -> Duration {
        let until_fire = self
            .nearest_fire()
            .map(|f| (f - now).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(self.config.poll_interval);
        until_fire.min(self.config.poll_interval)
    }

    /// Pull task rows changed since the last pass and re-derive triggers —
    /// the multi-process transport for on_task_created/updated/....
    async fn sync_changes(&self) -> Result<(), StoreError> {
        let since = *self.change_mark.lock();
        let changed = self.store().list_tasks_updated_since(since).await?;

        for task in changed {
            {
                let mut mark = self.change_mark.lock();
                if task.updated_at > *mark {
                    *mark = task.updated_at;
                }
            }
            if task.is_active() {
                self.register(task).await?;
            } else {
                self.on_task_paused_or_canceled(task.id);
            }
        }
        Ok(())
    }

    /// Drain undispatched events in publication order.
    async fn drain_events(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        let events = self.store().fetch_undispatched_events(100).await?;
        for event in events {
            self.on_event(&event.id, &event.topic).await?;
            self.store().mark_event_dispatched(&event.id).await?;
        }

        let window = chrono::Duration::from_std(self.config.event_dedupe_window)
            .unwrap_or(chrono::Duration::minutes(5));
        self.store().prune_events(now - window).await?;
        Ok(())
    }

    /// Compute a task's trigger and store it. Exhausted recurrences
    /// transition the task to completed.
    async fn register(&self, task: Task) -> Result<(), StoreError> {
        let fire = match next_occurrence(&task, task.last_enqueued_at) {
            Ok(fire) => fire,
            Err(e) => {
                // Expressions are validated at the boundary; reaching this
                // means the task row was edited out-of-band.
                warn!(task_id = %task.id, "unschedulable task: {}", e);
                return Ok(());
            }
        };

        match fire {
            NextFire::At(at) => {
                self.store()
                    .set_task_schedule_marks(task.id, Some(at), None)
                    .await?;
                debug!(task_id = %task.id, next_fire = %at, "trigger registered");
                self.triggers.lock().insert(
                    task.id,
                    Trigger {
                        next_fire: Some(at),
                        task,
                    },
                );
            }
            NextFire::EventDriven => {
                self.triggers.lock().insert(
                    task.id,
                    Trigger {
                        next_fire: None,
                        task,
                    },
                );
            }
            NextFire::Exhausted => {
                self.triggers.lock().remove(&task.id);
                if task.schedule.kind == ScheduleKind::Rrule {
                    info!(task_id = %task.id, "recurrence exhausted, task completed");
                    self.store()
                        .set_task_status(task.id, TaskStatus::Completed)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Emit the missed occurrences of one due task, then register the
    /// following occurrence so the scheduler stays one step ahead.
    async fn fire(&self, task: Task, now: DateTime<Utc>) -> Result<(), StoreError> {
        // Snooze defers the whole fire; the watermark stays put so nothing
        // is lost, and un-snoozing (negative delay) restores the original
        // fire time.
        if let Some(snoozed_until) = task.snoozed_until {
            if snoozed_until > now {
                if let Some(trigger) = self.triggers.lock().get_mut(&task.id) {
                    trigger.next_fire = Some(snoozed_until);
                }
                return Ok(());
            }
        }

        let mut watermark = task.last_enqueued_at;
        let mut missed: Vec<DateTime<Utc>> = Vec::new();
        let mut following: Option<DateTime<Utc>> = None;
        let mut exhausted = false;

        loop {
            match next_occurrence(&task, watermark) {
                Ok(NextFire::At(at)) if at <= now => {
                    watermark = Some(at);
                    missed.push(at);
                    if missed.len() >= self.config.max_catchup_per_fire {
                        warn!(
                            task_id = %task.id,
                            limit = self.config.max_catchup_per_fire,
                            "catch-up truncated at safety limit"
                        );
                        break;
                    }
                }
                Ok(NextFire::At(at)) => {
                    following = Some(at);
                    break;
                }
                Ok(NextFire::Exhausted) => {
                    exhausted = true;
                    break;
                }
                Ok(NextFire::EventDriven) => break,
                Err(e) => {
                    warn!(task_id = %task.id, "fire aborted: {}", e);
                    return Ok(());
                }
            }
        }

        // Catch-up policy: emit all missed occurrences in order, or only
        // the most recent one. Either way the watermark covers them all.
        let to_emit: Vec<DateTime<Utc>> = match task.catch_up {
            CatchUpPolicy::All => missed,
            CatchUpPolicy::Latest => missed.into_iter().last().into_iter().collect(),
        };

        for run_at in &to_emit {
            self.queue.enqueue(&task, *run_at, 1).await?;
        }
        if !to_emit.is_empty() {
            debug!(task_id = %task.id, emitted = to_emit.len(), "occurrences enqueued");
        }

        self.store()
            .set_task_schedule_marks(task.id, following, watermark)
            .await?;

        if exhausted {
            self.triggers.lock().remove(&task.id);
            if task.schedule.kind == ScheduleKind::Rrule {
                info!(task_id = %task.id, "recurrence exhausted, task completed");
                self.store()
                    .set_task_status(task.id, TaskStatus::Completed)
                    .await?;
            }
        } else if let Some(trigger) = self.triggers.lock().get_mut(&task.id) {
            trigger.next_fire = following;
            trigger.task.last_enqueued_at = watermark;
        }

        Ok(())
    }
}

// Worker loop: heartbeat, lease, execute, commit
//
// A worker is stateless glue: horizontal scaling is just more worker
// processes. The only correctness-relevant state is the lease, and every
// commit path re-checks it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use metronome_core::{ErrorKind, ScheduleKind, Task, TaskStatus};
use metronome_engine::PipelineExecutor;
use metronome_observability::Metrics;
use metronome_storage::{
    CommitOutcome, FailOutcome, LeasedWork, NewRun, StoreError, WorkQueue, WorkStore,
};

/// Worker tuning knobs.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub lease_duration: Duration,
    /// Wall-clock budget for a run is lease_duration - safety_margin.
    pub safety_margin: Duration,
    /// Sleep between empty polls (a small jitter is added).
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    /// How long a transient store error backs off before the next poll.
    pub store_retry_backoff: Duration,
    /// In-flight work gets this long to finish after a shutdown signal.
    pub drain_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            lease_duration: Duration::from_secs(60),
            safety_margin: Duration::from_secs(5),
            poll_interval: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(5),
            store_retry_backoff: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }
}

/// One worker: leases one due-work row at a time and drives it to a run.
pub struct Worker {
    queue: WorkQueue,
    executor: PipelineExecutor,
    config: WorkerConfig,
    metrics: Metrics,
    started_at: DateTime<Utc>,
}

impl Worker {
    pub fn new(queue: WorkQueue, executor: PipelineExecutor, metrics: Metrics) -> Self {
        Self {
            queue,
            executor,
            config: WorkerConfig::default(),
            metrics,
            started_at: Utc::now(),
        }
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Work loop: runs until shutdown, then drains in-flight work.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.config.worker_id, "worker started");
        let mut last_heartbeat = self.started_at - chrono::Duration::days(1);

        loop {
            if *shutdown.borrow() {
                break;
            }

            if (Utc::now() - last_heartbeat).to_std().unwrap_or_default()
                >= self.config.heartbeat_interval
            {
                // Heartbeats are observability only; failures must not stop
                // the loop.
                if let Err(e) = self
                    .queue
                    .store()
                    .record_worker_heartbeat(&self.config.worker_id, self.started_at, 0)
                    .await
                {
                    warn!("heartbeat failed: {}", e);
                }
                last_heartbeat = Utc::now();
            }

            match self.poll_once(Some(&mut shutdown)).await {
                Ok(true) => {} // worked an item; poll again immediately
                Ok(false) => {
                    let jitter = rand::thread_rng().gen_range(0.8..1.2);
                    let sleep_for = self.config.poll_interval.mul_f64(jitter);
                    tokio::select! {
                        _ = tokio::time::sleep(sleep_for) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) if e.is_transient() => {
                    // transient_store: retried locally, never consumes the
                    // task's retry budget
                    warn!("transient store error, backing off: {}", e);
                    tokio::time::sleep(self.config.store_retry_backoff).await;
                }
                Err(e) => {
                    warn!("store error: {}", e);
                    tokio::time::sleep(self.config.store_retry_backoff).await;
                }
            }
        }

        info!(worker_id = %self.config.worker_id, "worker stopped");
    }

    /// Lease and process at most one item. Returns whether an item was
    /// worked. Public so tests can drive the loop deterministically.
    pub async fn poll_once(
        &self,
        shutdown: Option<&mut watch::Receiver<bool>>,
    ) -> Result<bool, StoreError> {
        let Some(work) = self
            .queue
            .lease(&self.config.worker_id, self.config.lease_duration)
            .await?
        else {
            return Ok(false);
        };

        self.metrics.leases_taken.inc();
        let lag = (Utc::now() - work.run_at).num_seconds().max(0);
        self.metrics.scheduler_lag_seconds.set(lag);

        self.process(work, shutdown).await?;
        Ok(true)
    }

    #[instrument(skip(self, work, shutdown), fields(work_id = %work.id, task_id = %work.task_id, attempt = work.attempt))]
    async fn process(
        &self,
        work: LeasedWork,
        shutdown: Option<&mut watch::Receiver<bool>>,
    ) -> Result<(), StoreError> {
        let task = match self.queue.store().get_task(work.task_id).await? {
            Some(task) => task,
            None => {
                // Task row vanished; record a skipped run so the queue row
                // is consumed.
                warn!("owning task missing, skipping");
                self.queue
                    .complete(
                        work.id,
                        &self.config.worker_id,
                        NewRun::skipped(work.task_id, &self.config.worker_id, work.attempt, Utc::now()),
                    )
                    .await?;
                return Ok(());
            }
        };

        if !task.is_active() {
            debug!(status = %task.status, "task no longer active, recording skipped run");
            self.queue
                .complete(
                    work.id,
                    &self.config.worker_id,
                    NewRun::skipped(task.id, &self.config.worker_id, work.attempt, Utc::now()),
                )
                .await?;
            return Ok(());
        }

        let started_at = Utc::now();
        self.metrics.runs_started.inc();
        let pipeline_timer = std::time::Instant::now();

        let overrides = work
            .params
            .as_ref()
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let outcome = self
            .execute_within_lease(&task, &overrides, &work, started_at, shutdown)
            .await?;
        self.metrics
            .pipeline_duration_seconds
            .observe(pipeline_timer.elapsed().as_secs_f64());

        let finished_at = Utc::now();
        match outcome {
            ExecutionOutcome::Succeeded(steps) => {
                let run = NewRun {
                    task_id: task.id,
                    lease_owner: Some(self.config.worker_id.clone()),
                    leased_until: Some(work.locked_until),
                    attempt: work.attempt,
                    started_at,
                    finished_at,
                    success: true,
                    skipped: false,
                    error_kind: None,
                    error: None,
                    output: Some(Value::Object(steps)),
                };
                match self.queue.complete(work.id, &self.config.worker_id, run).await? {
                    CommitOutcome::Committed => {
                        self.metrics.runs_succeeded.inc();
                        info!("run succeeded");
                        // A one-shot task is done after its single success.
                        if task.schedule.kind == ScheduleKind::Once {
                            self.queue
                                .store()
                                .set_task_status(task.id, TaskStatus::Completed)
                                .await?;
                        }
                    }
                    CommitOutcome::LeaseLost => {
                        // The attempt is discarded silently; the next
                        // leaser's run is authoritative.
                        self.metrics.leases_expired.inc();
                        warn!("lease lost at commit, run discarded");
                    }
                }
            }
            ExecutionOutcome::Failed { kind, error, steps } => {
                let run = NewRun {
                    task_id: task.id,
                    lease_owner: Some(self.config.worker_id.clone()),
                    leased_until: Some(work.locked_until),
                    attempt: work.attempt,
                    started_at,
                    finished_at,
                    success: false,
                    skipped: false,
                    error_kind: Some(kind),
                    error: Some(error),
                    output: Some(Value::Object(steps)),
                };
                match self
                    .queue
                    .fail(&work, &self.config.worker_id, &task.policy, kind, run)
                    .await?
                {
                    FailOutcome::Rearmed { retry_at } => {
                        self.metrics.runs_failed.inc();
                        info!(%retry_at, "run failed, re-armed");
                    }
                    FailOutcome::Terminal => {
                        self.metrics.runs_failed.inc();
                        info!("run failed terminally");
                    }
                    FailOutcome::LeaseLost => {
                        self.metrics.leases_expired.inc();
                        warn!("lease lost before failure commit");
                    }
                }
            }
            ExecutionOutcome::Aborted => {
                // Budget exceeded after the one allowed renewal, or shutdown
                // drain expired: release so another worker takes over, and
                // commit nothing.
                self.metrics.leases_expired.inc();
                warn!("run aborted, releasing lease");
                self.queue.release(work.id, &self.config.worker_id).await?;
            }
        }

        Ok(())
    }

    /// Drive the pipeline with a wall-clock budget of
    /// lease_duration - safety_margin, renewing the lease at most once.
    async fn execute_within_lease(
        &self,
        task: &Task,
        overrides: &Map<String, Value>,
        work: &LeasedWork,
        started_at: DateTime<Utc>,
        mut shutdown: Option<&mut watch::Receiver<bool>>,
    ) -> Result<ExecutionOutcome, StoreError> {
        let budget = self
            .config
            .lease_duration
            .saturating_sub(self.config.safety_margin);

        let exec = self.executor.execute(
            &task.payload.pipeline,
            &task.payload.params,
            overrides,
            started_at,
        );
        tokio::pin!(exec);

        let mut renewed = false;
        let mut draining = false;
        loop {
            let drain_deadline = if draining {
                self.config.drain_timeout
            } else {
                budget
            };

            let shutdown_changed = async {
                match shutdown.as_mut() {
                    Some(rx) => {
                        let _ = rx.changed().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                result = &mut exec => {
                    return Ok(match result {
                        Ok(report) => ExecutionOutcome::Succeeded(report.steps),
                        Err(failure) => ExecutionOutcome::Failed {
                            kind: failure.error.kind(),
                            error: failure.error.to_string(),
                            steps: failure.steps,
                        },
                    });
                }
                _ = tokio::time::sleep(drain_deadline) => {
                    if draining {
                        return Ok(ExecutionOutcome::Aborted);
                    }
                    if !renewed
                        && self
                            .queue
                            .extend_lease(work.id, &self.config.worker_id, self.config.lease_duration)
                            .await?
                    {
                        debug!("lease renewed once, continuing");
                        renewed = true;
                    } else {
                        return Ok(ExecutionOutcome::Aborted);
                    }
                }
                _ = shutdown_changed => {
                    // Let the in-flight pipeline finish up to the drain
                    // deadline, then abort without committing.
                    debug!("shutdown received mid-run, draining");
                    draining = true;
                }
            }
        }
    }
}

enum ExecutionOutcome {
    Succeeded(Map<String, Value>),
    Failed {
        kind: ErrorKind,
        error: String,
        steps: Map<String, Value>,
    },
    Aborted,
}

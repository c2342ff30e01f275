// Task CRUD and state-transition HTTP routes

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

use metronome_core::{
    CatchUpPolicy, Schedule, ScheduleKind, Task, TaskPayload, TaskPolicy, TaskStatus,
    ValidationError,
};
use metronome_observability::Metrics;
use metronome_storage::{TaskFilter, WorkQueue, WorkStore};

use crate::common::{agent_id, ApiError, ListResponse};

/// App state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn WorkStore>,
    pub queue: WorkQueue,
    pub metrics: Metrics,
}

/// Snooze shifts are capped at one week.
fn max_snooze() -> chrono::Duration {
    chrono::Duration::days(7)
}

/// Request to create a task
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateTaskRequest {
    pub title: String,
    pub description: String,
    pub schedule_kind: String,
    /// Cron string, RRULE body, ISO timestamp, or event topic.
    pub schedule_expr: Option<String>,
    /// IANA zone; defaults to UTC.
    pub timezone: Option<String>,
    /// Object with `pipeline` (array of steps) and optional `params`.
    #[schema(value_type = Object)]
    pub payload: Value,
    pub priority: Option<i32>,
    pub max_retries: Option<i32>,
    pub backoff_strategy: Option<String>,
    pub dedupe_key: Option<String>,
    pub dedupe_window_seconds: Option<i32>,
    pub concurrency_key: Option<String>,
    /// "all" (default) or "latest".
    pub catch_up: Option<String>,
}

/// Request to update a task; absent fields keep their values.
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct UpdateTaskRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub schedule_kind: Option<String>,
    pub schedule_expr: Option<String>,
    pub timezone: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub payload: Option<Value>,
    pub priority: Option<i32>,
    pub max_retries: Option<i32>,
    pub backoff_strategy: Option<String>,
    pub dedupe_key: Option<String>,
    pub dedupe_window_seconds: Option<i32>,
    pub concurrency_key: Option<String>,
    pub catch_up: Option<String>,
}

/// Public view of a task
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TaskResponse {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub created_by: String,
    pub schedule_kind: String,
    pub schedule_expr: String,
    pub timezone: String,
    #[schema(value_type = Object)]
    pub payload: Value,
    pub status: String,
    pub priority: i32,
    pub max_retries: u32,
    pub backoff_strategy: String,
    pub dedupe_key: Option<String>,
    pub dedupe_window_seconds: Option<u32>,
    pub concurrency_key: Option<String>,
    pub catch_up: String,
    pub next_run: Option<DateTime<Utc>>,
    pub snoozed_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Task> for TaskResponse {
    fn from(task: Task) -> Self {
        Self {
            id: task.id,
            title: task.title,
            description: task.description,
            created_by: task.created_by,
            schedule_kind: task.schedule.kind.to_string(),
            schedule_expr: task.schedule.expression,
            timezone: task.schedule.timezone,
            payload: serde_json::to_value(&task.payload).unwrap_or(Value::Null),
            status: task.status.to_string(),
            priority: task.policy.priority,
            max_retries: task.policy.max_retries,
            backoff_strategy: task.policy.backoff_strategy.to_string(),
            dedupe_key: task.policy.dedupe_key,
            dedupe_window_seconds: task.policy.dedupe_window_seconds,
            concurrency_key: task.policy.concurrency_key,
            catch_up: task.catch_up.to_string(),
            next_run: task.next_run,
            snoozed_until: task.snoozed_until,
            created_at: task.created_at,
            updated_at: task.updated_at,
        }
    }
}

/// Query parameters for listing tasks
#[derive(Debug, Deserialize, ToSchema)]
pub struct ListTasksParams {
    pub status: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    20
}

/// Request body for snooze
#[derive(Debug, Deserialize, ToSchema)]
pub struct SnoozeRequest {
    /// Positive shifts the next fire later; negative un-snoozes.
    pub delay_seconds: i64,
}

/// Request body for run_now
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct RunNowRequest {
    /// Per-run parameter overrides merged over the task's params.
    #[schema(value_type = Option<Object>)]
    pub params: Option<Value>,
}

/// Response for run_now
#[derive(Debug, Serialize, ToSchema)]
pub struct RunNowResponse {
    /// Absent when the insert was suppressed by the dedupe key.
    pub work_id: Option<Uuid>,
    pub deduplicated: bool,
}

/// Create task routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/tasks", get(list_tasks).post(create_task))
        .route("/v1/tasks/:task_id", get(get_task).patch(update_task))
        .route("/v1/tasks/:task_id/pause", post(pause_task))
        .route("/v1/tasks/:task_id/resume", post(resume_task))
        .route("/v1/tasks/:task_id/cancel", post(cancel_task))
        .route("/v1/tasks/:task_id/snooze", post(snooze_task))
        .route("/v1/tasks/:task_id/run_now", post(run_now))
        .with_state(state)
}

fn check_length(
    field: &'static str,
    value: &str,
    min: usize,
    max: usize,
) -> Result<(), ValidationError> {
    let len = value.chars().count();
    if len < min || len > max {
        return Err(ValidationError::new(
            field,
            value,
            format!("{}-{} characters", min, max),
        ));
    }
    Ok(())
}

fn parse_schedule(
    kind: &str,
    expr: Option<&str>,
    timezone: Option<&str>,
) -> Result<Schedule, ValidationError> {
    let kind: ScheduleKind = kind
        .parse()
        .map_err(|_| ValidationError::new("schedule_kind", kind, "cron | rrule | once | event"))?;
    let expression = expr.unwrap_or("").to_string();
    if expression.trim().is_empty() {
        let expected = match kind {
            ScheduleKind::Event => "an event topic",
            _ => "a schedule expression",
        };
        return Err(ValidationError::new("schedule_expr", expression, expected));
    }
    Ok(Schedule::new(
        kind,
        expression,
        timezone.unwrap_or("UTC").to_string(),
    ))
}

fn parse_payload(payload: Value) -> Result<TaskPayload, ValidationError> {
    let parsed: TaskPayload = serde_json::from_value(payload.clone()).map_err(|e| {
        ValidationError::new(
            "payload",
            payload.to_string(),
            format!("an object with a pipeline array ({})", e),
        )
    })?;
    parsed.pipeline.validate()?;
    Ok(parsed)
}

fn parse_policy(
    priority: Option<i32>,
    max_retries: Option<i32>,
    backoff_strategy: Option<&str>,
    dedupe_key: Option<String>,
    dedupe_window_seconds: Option<i32>,
    concurrency_key: Option<String>,
) -> Result<TaskPolicy, ValidationError> {
    let max_retries = max_retries.unwrap_or(3);
    if max_retries < 0 {
        return Err(ValidationError::new(
            "max_retries",
            max_retries.to_string(),
            "an integer >= 0",
        ));
    }
    if let Some(window) = dedupe_window_seconds {
        if window < 0 {
            return Err(ValidationError::new(
                "dedupe_window_seconds",
                window.to_string(),
                "an integer >= 0",
            ));
        }
    }
    let backoff_strategy = match backoff_strategy {
        Some(s) => s.parse().map_err(|_| {
            ValidationError::new(
                "backoff_strategy",
                s,
                "exponential_jitter | linear | fixed",
            )
        })?,
        None => Default::default(),
    };

    let policy = TaskPolicy {
        priority: priority.unwrap_or(5),
        max_retries: max_retries as u32,
        backoff_strategy,
        dedupe_key,
        dedupe_window_seconds: dedupe_window_seconds.map(|w| w as u32),
        concurrency_key,
    };
    policy.validate()?;
    Ok(policy)
}

impl CreateTaskRequest {
    /// Validate and build the task. Invalid schedule expressions never
    /// reach the scheduler.
    pub fn into_task(self, created_by: String, now: DateTime<Utc>) -> Result<Task, ValidationError> {
        check_length("title", &self.title, 1, 200)?;
        check_length("description", &self.description, 1, 2000)?;

        let schedule = parse_schedule(
            &self.schedule_kind,
            self.schedule_expr.as_deref(),
            self.timezone.as_deref(),
        )?;
        schedule.validate(now)?;

        let payload = parse_payload(self.payload)?;
        let policy = parse_policy(
            self.priority,
            self.max_retries,
            self.backoff_strategy.as_deref(),
            self.dedupe_key,
            self.dedupe_window_seconds,
            self.concurrency_key,
        )?;

        let catch_up = match self.catch_up.as_deref() {
            Some(s) => s
                .parse::<CatchUpPolicy>()
                .map_err(|_| ValidationError::new("catch_up", s, "all | latest"))?,
            None => CatchUpPolicy::default(),
        };

        Ok(Task {
            id: Uuid::now_v7(),
            title: self.title,
            description: self.description,
            created_by,
            schedule,
            payload,
            policy,
            status: TaskStatus::Active,
            catch_up,
            next_run: None,
            last_enqueued_at: None,
            snoozed_until: None,
            created_at: now,
            updated_at: now,
        })
    }
}

/// POST /v1/tasks - Create a task
#[utoipa::path(
    post,
    path = "/v1/tasks",
    request_body = CreateTaskRequest,
    responses(
        (status = 201, description = "Task created", body = TaskResponse),
        (status = 422, description = "Validation failed"),
        (status = 500, description = "Internal server error")
    ),
    tag = "tasks"
)]
pub async fn create_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<TaskResponse>), ApiError> {
    let task = req.into_task(agent_id(&headers), Utc::now())?;
    state.store.create_task(&task).await?;
    state.metrics.tasks_created.inc();
    tracing::info!(task_id = %task.id, "task created");
    Ok((StatusCode::CREATED, Json(task.into())))
}

/// GET /v1/tasks - List tasks
#[utoipa::path(
    get,
    path = "/v1/tasks",
    params(
        ("status" = Option<String>, Query, description = "Filter by lifecycle status"),
        ("limit" = Option<i64>, Query, description = "Max number of results (default 20)"),
        ("offset" = Option<i64>, Query, description = "Offset for pagination")
    ),
    responses(
        (status = 200, description = "List of tasks", body = ListResponse<TaskResponse>),
        (status = 500, description = "Internal server error")
    ),
    tag = "tasks"
)]
pub async fn list_tasks(
    State(state): State<AppState>,
    Query(params): Query<ListTasksParams>,
) -> Result<Json<ListResponse<TaskResponse>>, ApiError> {
    let status = params
        .status
        .as_deref()
        .map(|s| {
            s.parse::<TaskStatus>().map_err(|_| {
                ValidationError::new("status", s, "active | paused | canceled | completed")
            })
        })
        .transpose()?;

    let tasks = state
        .store
        .list_tasks(TaskFilter {
            status,
            created_by: None,
            limit: params.limit,
            offset: params.offset,
        })
        .await?;

    Ok(Json(
        tasks.into_iter().map(TaskResponse::from).collect::<Vec<_>>().into(),
    ))
}

/// GET /v1/tasks/{task_id}
#[utoipa::path(
    get,
    path = "/v1/tasks/{task_id}",
    params(("task_id" = Uuid, Path, description = "Task ID")),
    responses(
        (status = 200, description = "Task found", body = TaskResponse),
        (status = 404, description = "Task not found")
    ),
    tag = "tasks"
)]
pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<TaskResponse>, ApiError> {
    let task = state
        .store
        .get_task(task_id)
        .await?
        .ok_or(ApiError::NotFound("task"))?;
    Ok(Json(task.into()))
}

/// PATCH /v1/tasks/{task_id} - Update a task definition
#[utoipa::path(
    patch,
    path = "/v1/tasks/{task_id}",
    params(("task_id" = Uuid, Path, description = "Task ID")),
    request_body = UpdateTaskRequest,
    responses(
        (status = 200, description = "Task updated", body = TaskResponse),
        (status = 404, description = "Task not found"),
        (status = 422, description = "Validation failed")
    ),
    tag = "tasks"
)]
pub async fn update_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    Json(req): Json<UpdateTaskRequest>,
) -> Result<Json<TaskResponse>, ApiError> {
    let mut task = state
        .store
        .get_task(task_id)
        .await?
        .ok_or(ApiError::NotFound("task"))?;

    if let Some(title) = req.title {
        check_length("title", &title, 1, 200)?;
        task.title = title;
    }
    if let Some(description) = req.description {
        check_length("description", &description, 1, 2000)?;
        task.description = description;
    }
    if req.schedule_kind.is_some() || req.schedule_expr.is_some() || req.timezone.is_some() {
        let current_kind = task.schedule.kind.to_string();
        let schedule = parse_schedule(
            req.schedule_kind.as_deref().unwrap_or(&current_kind),
            req.schedule_expr
                .as_deref()
                .or(Some(task.schedule.expression.as_str())),
            req.timezone
                .as_deref()
                .or(Some(task.schedule.timezone.as_str())),
        )?;
        schedule.validate(Utc::now())?;
        task.schedule = schedule;
    }
    if let Some(payload) = req.payload {
        task.payload = parse_payload(payload)?;
    }
    if req.priority.is_some()
        || req.max_retries.is_some()
        || req.backoff_strategy.is_some()
        || req.dedupe_key.is_some()
        || req.dedupe_window_seconds.is_some()
        || req.concurrency_key.is_some()
    {
        let current_backoff = task.policy.backoff_strategy.to_string();
        task.policy = parse_policy(
            req.priority.or(Some(task.policy.priority)),
            req.max_retries.or(Some(task.policy.max_retries as i32)),
            req.backoff_strategy.as_deref().or(Some(&current_backoff)),
            req.dedupe_key.or(task.policy.dedupe_key.take()),
            req.dedupe_window_seconds
                .or(task.policy.dedupe_window_seconds.map(|w| w as i32)),
            req.concurrency_key.or(task.policy.concurrency_key.take()),
        )?;
    }
    if let Some(catch_up) = req.catch_up.as_deref() {
        task.catch_up = catch_up
            .parse()
            .map_err(|_| ValidationError::new("catch_up", catch_up, "all | latest"))?;
    }

    if !state.store.update_task(&task).await? {
        return Err(ApiError::NotFound("task"));
    }
    let task = state
        .store
        .get_task(task_id)
        .await?
        .ok_or(ApiError::NotFound("task"))?;
    Ok(Json(task.into()))
}

async fn transition(
    state: &AppState,
    task_id: Uuid,
    from: &[TaskStatus],
    to: TaskStatus,
) -> Result<Task, ApiError> {
    let task = state
        .store
        .get_task(task_id)
        .await?
        .ok_or(ApiError::NotFound("task"))?;

    if !from.contains(&task.status) {
        return Err(ApiError::Conflict(format!(
            "cannot move task from {} to {}",
            task.status, to
        )));
    }
    state.store.set_task_status(task_id, to).await?;
    let task = state
        .store
        .get_task(task_id)
        .await?
        .ok_or(ApiError::NotFound("task"))?;
    Ok(task)
}

/// POST /v1/tasks/{task_id}/pause
#[utoipa::path(
    post,
    path = "/v1/tasks/{task_id}/pause",
    params(("task_id" = Uuid, Path, description = "Task ID")),
    responses(
        (status = 200, description = "Task paused", body = TaskResponse),
        (status = 404, description = "Task not found"),
        (status = 409, description = "Invalid transition")
    ),
    tag = "tasks"
)]
pub async fn pause_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<TaskResponse>, ApiError> {
    let task = transition(&state, task_id, &[TaskStatus::Active], TaskStatus::Paused).await?;
    Ok(Json(task.into()))
}

/// POST /v1/tasks/{task_id}/resume
#[utoipa::path(
    post,
    path = "/v1/tasks/{task_id}/resume",
    params(("task_id" = Uuid, Path, description = "Task ID")),
    responses(
        (status = 200, description = "Task resumed", body = TaskResponse),
        (status = 404, description = "Task not found"),
        (status = 409, description = "Invalid transition")
    ),
    tag = "tasks"
)]
pub async fn resume_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<TaskResponse>, ApiError> {
    let task = transition(&state, task_id, &[TaskStatus::Paused], TaskStatus::Active).await?;
    Ok(Json(task.into()))
}

/// POST /v1/tasks/{task_id}/cancel
#[utoipa::path(
    post,
    path = "/v1/tasks/{task_id}/cancel",
    params(("task_id" = Uuid, Path, description = "Task ID")),
    responses(
        (status = 200, description = "Task canceled", body = TaskResponse),
        (status = 404, description = "Task not found"),
        (status = 409, description = "Invalid transition")
    ),
    tag = "tasks"
)]
pub async fn cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<TaskResponse>, ApiError> {
    let task = transition(
        &state,
        task_id,
        &[TaskStatus::Active, TaskStatus::Paused],
        TaskStatus::Canceled,
    )
    .await?;

    // Unleased occurrences disappear now; anything already leased will be
    // recorded as a skipped run by its worker.
    let dropped = state.store.drop_unleased_work_for_task(task_id).await?;
    if dropped > 0 {
        tracing::info!(%task_id, dropped, "dropped pending occurrences on cancel");
    }
    Ok(Json(task.into()))
}

/// POST /v1/tasks/{task_id}/snooze - Shift the next fire
#[utoipa::path(
    post,
    path = "/v1/tasks/{task_id}/snooze",
    params(("task_id" = Uuid, Path, description = "Task ID")),
    request_body = SnoozeRequest,
    responses(
        (status = 200, description = "Task snoozed", body = TaskResponse),
        (status = 404, description = "Task not found")
    ),
    tag = "tasks"
)]
pub async fn snooze_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    Json(req): Json<SnoozeRequest>,
) -> Result<Json<TaskResponse>, ApiError> {
    let task = state
        .store
        .get_task(task_id)
        .await?
        .ok_or(ApiError::NotFound("task"))?;

    let now = Utc::now();
    let delta = chrono::Duration::seconds(req.delay_seconds);
    let cap = now + max_snooze();

    // The shift accumulates: snooze(d) then snooze(-d) restores the
    // original fire time.
    let base = task.snoozed_until.or(task.next_run).unwrap_or(now);
    let shifted = (base + delta).min(cap);
    let snoozed_until = if shifted <= now { None } else { Some(shifted) };
    state.store.set_task_snooze(task_id, snoozed_until).await?;

    // Already-enqueued occurrences shift too.
    state
        .store
        .shift_unleased_work_for_task(task_id, delta, cap)
        .await?;

    let task = state
        .store
        .get_task(task_id)
        .await?
        .ok_or(ApiError::NotFound("task"))?;
    Ok(Json(task.into()))
}

/// POST /v1/tasks/{task_id}/run_now - Enqueue an immediate occurrence
#[utoipa::path(
    post,
    path = "/v1/tasks/{task_id}/run_now",
    params(("task_id" = Uuid, Path, description = "Task ID")),
    request_body = RunNowRequest,
    responses(
        (status = 202, description = "Occurrence enqueued (or deduplicated)", body = RunNowResponse),
        (status = 404, description = "Task not found"),
        (status = 409, description = "Task is not active")
    ),
    tag = "tasks"
)]
pub async fn run_now(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    Json(req): Json<RunNowRequest>,
) -> Result<(StatusCode, Json<RunNowResponse>), ApiError> {
    let task = state
        .store
        .get_task(task_id)
        .await?
        .ok_or(ApiError::NotFound("task"))?;
    if !task.is_active() {
        return Err(ApiError::Conflict(format!(
            "task is {}, not active",
            task.status
        )));
    }

    let outcome = state
        .queue
        .enqueue_with_params(&task, Utc::now(), 1, req.params)
        .await?;

    let response = match outcome {
        metronome_storage::EnqueueOutcome::Created(id) => RunNowResponse {
            work_id: Some(id),
            deduplicated: false,
        },
        metronome_storage::EnqueueOutcome::Duplicate => RunNowResponse {
            work_id: None,
            deduplicated: true,
        },
    };
    Ok((StatusCode::ACCEPTED, Json(response)))
}

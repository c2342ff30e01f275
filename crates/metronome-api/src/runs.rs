// Run history HTTP routes (read-only: runs are append-only records)

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

use metronome_storage::{Run, RunFilter, WorkStore};

use crate::common::{ApiError, ListResponse};

/// App state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn WorkStore>,
}

/// Public view of a run
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RunResponse {
    pub id: Uuid,
    pub task_id: Uuid,
    pub lease_owner: Option<String>,
    pub attempt: i32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub success: bool,
    pub skipped: bool,
    pub error_kind: Option<String>,
    pub error: Option<String>,
    /// Final pipeline context's `steps` map.
    #[schema(value_type = Option<Object>)]
    pub output: Option<Value>,
}

impl From<Run> for RunResponse {
    fn from(run: Run) -> Self {
        Self {
            id: run.id,
            task_id: run.task_id,
            lease_owner: run.lease_owner,
            attempt: run.attempt,
            started_at: run.started_at,
            finished_at: run.finished_at,
            success: run.success,
            skipped: run.skipped,
            error_kind: run.error_kind,
            error: run.error,
            output: run.output,
        }
    }
}

/// Query parameters for listing runs
#[derive(Debug, Deserialize, ToSchema)]
pub struct ListRunsParams {
    pub task_id: Option<Uuid>,
    pub success: Option<bool>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    20
}

/// Create run routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/runs", get(list_runs))
        .route("/v1/runs/:run_id", get(get_run))
        .route("/v1/tasks/:task_id/runs", get(list_task_runs))
        .with_state(state)
}

/// GET /v1/runs - List runs
#[utoipa::path(
    get,
    path = "/v1/runs",
    params(
        ("task_id" = Option<Uuid>, Query, description = "Filter by task"),
        ("success" = Option<bool>, Query, description = "Filter by outcome"),
        ("limit" = Option<i64>, Query, description = "Max number of results (default 20)"),
        ("offset" = Option<i64>, Query, description = "Offset for pagination")
    ),
    responses(
        (status = 200, description = "List of runs", body = ListResponse<RunResponse>),
        (status = 500, description = "Internal server error")
    ),
    tag = "runs"
)]
pub async fn list_runs(
    State(state): State<AppState>,
    Query(params): Query<ListRunsParams>,
) -> Result<Json<ListResponse<RunResponse>>, ApiError> {
    let runs = state
        .store
        .list_runs(RunFilter {
            task_id: params.task_id,
            success: params.success,
            limit: params.limit,
            offset: params.offset,
        })
        .await?;
    Ok(Json(
        runs.into_iter().map(RunResponse::from).collect::<Vec<_>>().into(),
    ))
}

/// GET /v1/runs/{run_id}
#[utoipa::path(
    get,
    path = "/v1/runs/{run_id}",
    params(("run_id" = Uuid, Path, description = "Run ID")),
    responses(
        (status = 200, description = "Run found", body = RunResponse),
        (status = 404, description = "Run not found")
    ),
    tag = "runs"
)]
pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<RunResponse>, ApiError> {
    let run = state
        .store
        .get_run(run_id)
        .await?
        .ok_or(ApiError::NotFound("run"))?;
    Ok(Json(run.into()))
}

/// GET /v1/tasks/{task_id}/runs - Run history for one task
#[utoipa::path(
    get,
    path = "/v1/tasks/{task_id}/runs",
    params(
        ("task_id" = Uuid, Path, description = "Task ID"),
        ("limit" = Option<i64>, Query, description = "Max number of results (default 20)"),
        ("offset" = Option<i64>, Query, description = "Offset for pagination")
    ),
    responses(
        (status = 200, description = "Run history", body = ListResponse<RunResponse>),
        (status = 500, description = "Internal server error")
    ),
    tag = "runs"
)]
pub async fn list_task_runs(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    Query(params): Query<ListRunsParams>,
) -> Result<Json<ListResponse<RunResponse>>, ApiError> {
    let runs = state
        .store
        .list_runs(RunFilter {
            task_id: Some(task_id),
            success: params.success,
            limit: params.limit,
            offset: params.offset,
        })
        .await?;
    Ok(Json(
        runs.into_iter().map(RunResponse::from).collect::<Vec<_>>().into(),
    ))
}

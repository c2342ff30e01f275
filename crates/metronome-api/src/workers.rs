// Worker heartbeat HTTP routes (operator observability only)

use axum::{extract::State, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

use metronome_storage::WorkStore;

use crate::common::{ApiError, ListResponse};

/// App state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn WorkStore>,
}

/// A worker's last heartbeat
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct WorkerResponse {
    pub worker_id: String,
    pub started_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub inflight: i32,
}

/// Create worker routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/workers", get(list_workers))
        .with_state(state)
}

/// GET /v1/workers - Known workers and their heartbeats
#[utoipa::path(
    get,
    path = "/v1/workers",
    responses(
        (status = 200, description = "Known workers", body = ListResponse<WorkerResponse>),
        (status = 500, description = "Internal server error")
    ),
    tag = "workers"
)]
pub async fn list_workers(
    State(state): State<AppState>,
) -> Result<Json<ListResponse<WorkerResponse>>, ApiError> {
    let heartbeats = state.store.list_worker_heartbeats().await?;
    Ok(Json(
        heartbeats
            .into_iter()
            .map(|hb| WorkerResponse {
                worker_id: hb.worker_id,
                started_at: hb.started_at,
                last_seen: hb.last_seen,
                inflight: hb.inflight,
            })
            .collect::<Vec<_>>()
            .into(),
    ))
}

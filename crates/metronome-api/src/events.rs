// Event publication HTTP route
//
// The facade persists the event; the scheduler's drain loop matches it
// against event-kind tasks. Delivery from real buses is at-least-once, so
// the bus-stable id doubles as the dedupe key.

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

use metronome_core::ValidationError;
use metronome_storage::{NewEvent, WorkStore};

use crate::common::ApiError;

/// App state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn WorkStore>,
}

/// Request to publish an event
#[derive(Debug, Deserialize, ToSchema)]
pub struct PublishEventRequest {
    /// Bus-stable id; generated when absent. Re-publishing the same id is
    /// a no-op.
    pub id: Option<String>,
    pub topic: String,
    #[schema(value_type = Object)]
    pub payload: Option<Value>,
    pub source: Option<String>,
}

/// Response to event publication
#[derive(Debug, Serialize, ToSchema)]
pub struct PublishEventResponse {
    pub id: String,
    /// False when this id was already seen inside the dedupe window.
    pub accepted: bool,
}

/// Create event routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/events", post(publish_event))
        .with_state(state)
}

/// POST /v1/events - Publish an event
#[utoipa::path(
    post,
    path = "/v1/events",
    request_body = PublishEventRequest,
    responses(
        (status = 202, description = "Event accepted (or deduplicated)", body = PublishEventResponse),
        (status = 422, description = "Validation failed")
    ),
    tag = "events"
)]
pub async fn publish_event(
    State(state): State<AppState>,
    Json(req): Json<PublishEventRequest>,
) -> Result<(StatusCode, Json<PublishEventResponse>), ApiError> {
    if req.topic.trim().is_empty() {
        return Err(ValidationError::new("topic", req.topic, "a non-empty topic").into());
    }

    let id = req.id.unwrap_or_else(|| Uuid::now_v7().to_string());
    let accepted = state
        .store
        .publish_event(NewEvent {
            id: id.clone(),
            topic: req.topic,
            payload: req.payload.unwrap_or_else(|| Value::Object(Default::default())),
            source: req.source,
        })
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(PublishEventResponse { id, accepted }),
    ))
}

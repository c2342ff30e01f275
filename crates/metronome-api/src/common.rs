// Common DTOs and error mapping for the public API

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use metronome_core::ValidationError;
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::ToSchema;

/// Response wrapper for list endpoints.
/// All list endpoints return responses wrapped in a `data` field.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ListResponse<T> {
    /// Array of items returned by the list operation.
    pub data: Vec<T>,
}

impl<T> ListResponse<T> {
    pub fn new(data: Vec<T>) -> Self {
        Self { data }
    }
}

impl<T> From<Vec<T>> for ListResponse<T> {
    fn from(data: Vec<T>) -> Self {
        Self { data }
    }
}

/// API error surface. Validation failures carry the
/// `{error, message, details: {field, value, expected}}` shape.
#[derive(Debug)]
pub enum ApiError {
    Validation(ValidationError),
    NotFound(&'static str),
    Conflict(String),
    Internal(String),
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        ApiError::Validation(e)
    }
}

impl From<metronome_storage::StoreError> for ApiError {
    fn from(e: metronome_storage::StoreError) -> Self {
        tracing::error!("store error: {}", e);
        ApiError::Internal(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Validation(e) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({
                    "error": "validation_error",
                    "message": e.to_string(),
                    "details": {
                        "field": e.field,
                        "value": e.value,
                        "expected": e.expected,
                    },
                })),
            )
                .into_response(),
            ApiError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                Json(json!({
                    "error": "not_found",
                    "message": format!("{} not found", what),
                })),
            )
                .into_response(),
            ApiError::Conflict(message) => (
                StatusCode::CONFLICT,
                Json(json!({
                    "error": "conflict",
                    "message": message,
                })),
            )
                .into_response(),
            ApiError::Internal(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": "internal_error",
                    "message": message,
                })),
            )
                .into_response(),
        }
    }
}

/// The opaque principal on writes. Authentication itself is an external
/// collaborator; absent the header, writes are attributed to "anonymous".
pub fn agent_id(headers: &HeaderMap) -> String {
    headers
        .get("x-agent-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_id_falls_back_to_anonymous() {
        let headers = HeaderMap::new();
        assert_eq!(agent_id(&headers), "anonymous");

        let mut headers = HeaderMap::new();
        headers.insert("x-agent-id", "agent-42".parse().unwrap());
        assert_eq!(agent_id(&headers), "agent-42");
    }
}

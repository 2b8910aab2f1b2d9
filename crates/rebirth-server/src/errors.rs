use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use rebirth::engine::types::EngineError;
use rebirth::providers::errors::ProviderError;
use rebirth::storage::StoreError;

/// API error taxonomy. Everything a handler can fail with maps onto one of
/// these kinds; the client sees a status code plus a short human reason and
/// never any partial state.
#[derive(Debug)]
pub enum ApiError {
    Invalid(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    /// The model produced unusable output even after repair.
    ModelOutput(String),
    /// LLM retries exhausted.
    Upstream(String),
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Invalid(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::ModelOutput(_) | ApiError::Upstream(_) | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn message(&self) -> &str {
        match self {
            ApiError::Invalid(m)
            | ApiError::Unauthorized(m)
            | ApiError::Forbidden(m)
            | ApiError::NotFound(m)
            | ApiError::ModelOutput(m)
            | ApiError::Upstream(m)
            | ApiError::Internal(m) => m,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(%status, message = %self.message(), "request failed");
        }
        (status, Json(json!({ "error": self.message() }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(m) => ApiError::NotFound(m),
            // "node does not belong to session" and friends
            StoreError::Invalid(m) => ApiError::NotFound(m),
            // collisions are handled where they happen; one leaking out is a bug
            StoreError::Conflict(m) => ApiError::Internal(m),
            StoreError::Database(e) => ApiError::Internal(e.to_string()),
            StoreError::Serialization(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::InvalidModelOutput(m) => ApiError::ModelOutput(m),
            EngineError::Provider(ProviderError::Unavailable { attempts, last_error }) => {
                ApiError::Upstream(format!("生成服务暂不可用（{attempts}次尝试）：{last_error}"))
            }
            EngineError::Provider(e) => ApiError::Upstream(e.to_string()),
        }
    }
}

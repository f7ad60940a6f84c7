//! Mapping of engine errors onto HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::error;

use crate::error::TaskmillError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

/// Wire shape of every error response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
    pub details: Value,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::BAD_REQUEST,
            body: ErrorBody {
                error: message.into(),
                code: "VALIDATION_ERROR".to_string(),
                details: json!({}),
            },
        }
    }
}

impl From<TaskmillError> for ApiError {
    fn from(err: TaskmillError) -> Self {
        let status = match &err {
            TaskmillError::DuplicateId { .. }
            | TaskmillError::UnknownDependency { .. }
            | TaskmillError::CycleInBatch { .. }
            | TaskmillError::StateConflict { .. } => StatusCode::CONFLICT,
            TaskmillError::NotFound { .. } => StatusCode::NOT_FOUND,
            TaskmillError::Validation(_) => StatusCode::BAD_REQUEST,
            TaskmillError::Store(_) | TaskmillError::Config(_) | TaskmillError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let details = match &err {
            TaskmillError::DuplicateId { ids } => json!({ "ids": ids }),
            TaskmillError::UnknownDependency { missing } => json!({ "missing": missing }),
            TaskmillError::CycleInBatch { ids } => json!({ "ids": ids }),
            TaskmillError::StateConflict { id, status } => json!({ "id": id, "status": status }),
            TaskmillError::NotFound { id } => json!({ "id": id }),
            _ => json!({}),
        };

        if status.is_server_error() {
            error!(error = %err, "request failed");
        }

        ApiError {
            status,
            body: ErrorBody {
                error: err.to_string(),
                code: err.code().to_string(),
                details,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

//! Task submission and read endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::models::{TaskDetail, TaskStatus};
use crate::submit::TaskSpec;
use crate::time::now_ms;
use crate::web::errors::{ApiError, ApiResult};
use crate::web::state::AppState;

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub tasks: Vec<TaskSpec>,
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub created: Vec<String>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct TaskListResponse {
    pub tasks: Vec<TaskDetail>,
    pub total: i64,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    200
}

/// POST /tasks
pub async fn create_task(
    State(state): State<AppState>,
    Json(spec): Json<TaskSpec>,
) -> ApiResult<(StatusCode, Json<TaskDetail>)> {
    let created = state.submit.submit(&spec, now_ms()).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// POST /tasks/batch
pub async fn create_batch(
    State(state): State<AppState>,
    Json(request): Json<BatchRequest>,
) -> ApiResult<(StatusCode, Json<BatchResponse>)> {
    let created = state.submit.submit_batch(&request.tasks, now_ms()).await?;
    let count = created.len();
    Ok((StatusCode::CREATED, Json(BatchResponse { created, count })))
}

/// GET /tasks/{id}
pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TaskDetail>> {
    Ok(Json(state.repo.get_task(&id).await?))
}

/// GET /tasks
pub async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<TaskListResponse>> {
    if !(1..=1000).contains(&query.limit) {
        return Err(ApiError::bad_request("limit must be between 1 and 1000"));
    }
    if query.offset < 0 {
        return Err(ApiError::bad_request("offset must be >= 0"));
    }
    let status = match &query.status {
        Some(raw) => Some(raw.parse::<TaskStatus>().map_err(|e| ApiError::bad_request(e))?),
        None => None,
    };

    let (tasks, total) = state
        .repo
        .list_tasks(status, query.limit, query.offset)
        .await?;

    Ok(Json(TaskListResponse { tasks, total }))
}

//! Task lookup endpoint: the full row projection for observability.

use super::{ApiError, ApiState};

use axum::extract::{Path, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub queue: String,
    pub status: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub async fn get_task(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<TaskResponse>, ApiError> {
    let id = id.trim();
    if id.is_empty() {
        return Err(ApiError::bad_request("missing id"));
    }

    let task = state
        .store
        .get_task(id)
        .await
        .map_err(|error| {
            tracing::error!(%error, "task lookup failed");
            ApiError::internal(format!("db error: {error}"))
        })?
        .ok_or_else(|| ApiError::not_found("not found"))?;

    Ok(Json(TaskResponse {
        id: task.id,
        task_type: task.task_type,
        queue: task.queue,
        status: task.status.as_str().to_string(),
        attempts: task.attempts,
        max_attempts: task.max_attempts,
        last_error: task.last_error,
        result: task.result,
        created_at: task.created_at,
        updated_at: task.updated_at,
    }))
}

//! Enqueue endpoint: validate against the type registry, insert the task
//! row, publish the envelope.
//!
//! The database commit precedes the broker publish. A crash in between
//! leaves a durable `ENQUEUED` row with no message in flight; recovering
//! those is an operational sweep, not this handler's job.

use super::{ApiError, ApiState};
use crate::broker::Envelope;
use crate::metrics::{label_or_unknown, ENQUEUE_LATENCY, ENQUEUE_TOTAL};
use crate::store::NewTask;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use metrics::{counter, histogram};
use rand::rngs::OsRng;
use rand::RngCore as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// End-to-end deadline for the enqueue path.
const ENQUEUE_BUDGET: Duration = Duration::from_secs(2);

const MAX_ATTEMPTS_RANGE: std::ops::RangeInclusive<i32> = 1..=20;

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    #[serde(rename = "type")]
    pub task_type: String,
    /// Optional priority override; empty means the type default.
    #[serde(default)]
    pub queue: String,
    /// Optional cap override; zero means the type default.
    #[serde(default)]
    pub max_attempts: i32,
    #[serde(default)]
    pub idempotency_key: String,
    pub payload: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub id: String,
    pub status: String,
    pub queue: String,
}

pub async fn enqueue(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<EnqueueRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<EnqueueResponse>), ApiError> {
    let Json(request) =
        body.map_err(|rejection| ApiError::bad_request(format!("invalid json: {rejection}")))?;

    let started = Instant::now();
    let outcome = match tokio::time::timeout(ENQUEUE_BUDGET, process(&state, &request)).await {
        Ok(outcome) => outcome,
        Err(_elapsed) => Err(ApiError::unavailable("enqueue deadline exceeded")),
    };

    let status_label = if outcome.is_ok() { "ok" } else { "error" };
    let type_label = label_or_unknown(&request.task_type);
    let queue_label = label_or_unknown(&request.queue);
    counter!(
        ENQUEUE_TOTAL,
        "type" => type_label.clone(),
        "queue" => queue_label.clone(),
        "status" => status_label
    )
    .increment(1);
    histogram!(ENQUEUE_LATENCY, "type" => type_label, "queue" => queue_label)
        .record(started.elapsed().as_secs_f64());

    let response = outcome?;
    Ok((StatusCode::CREATED, Json(response)))
}

async fn process(state: &ApiState, request: &EnqueueRequest) -> Result<EnqueueResponse, ApiError> {
    let task_type = request.task_type.trim();
    if task_type.is_empty() {
        return Err(ApiError::bad_request("type is required"));
    }
    let payload = match &request.payload {
        Some(value) if !value.is_null() => value,
        _ => return Err(ApiError::bad_request("payload is required")),
    };

    let defaults = state.store.type_defaults(task_type).await.map_err(|error| {
        tracing::error!(%error, "type registry lookup failed");
        ApiError::internal(format!("db error: {error}"))
    })?;
    let Some(defaults) = defaults else {
        return Err(ApiError::bad_request(format!("unknown type {task_type:?}")));
    };
    if !defaults.active {
        return Err(ApiError::bad_request(format!(
            "type {task_type:?} is not active"
        )));
    }

    let queue = resolve_queue(
        request.queue.trim(),
        &defaults.default_queue,
        &state.topology.priorities,
    )?;
    let max_attempts = resolve_max_attempts(request.max_attempts, defaults.default_max_attempts)?;

    let id = new_task_id();
    let enqueued = state
        .store
        .upsert_enqueue(&NewTask {
            id: &id,
            task_type,
            queue,
            payload,
            idempotency_key: request.idempotency_key.trim(),
            max_attempts,
        })
        .await
        .map_err(|error| {
            tracing::error!(%error, "task insert failed");
            ApiError::internal(format!("insert error: {error}"))
        })?;

    // Minimal persistent envelope; workers re-read the row by id.
    let envelope = Envelope {
        id: enqueued.id.clone(),
        task_type: task_type.to_string(),
    };
    state
        .publisher
        .publish_task(&state.topology.main_exchange, &enqueued.queue, &envelope)
        .await
        .map_err(|error| {
            tracing::error!(%error, task_id = %enqueued.id, "enqueue publish failed");
            ApiError::unavailable(format!("publish failed: {error}"))
        })?;

    Ok(EnqueueResponse {
        id: enqueued.id,
        status: enqueued.status.as_str().to_string(),
        queue: enqueued.queue,
    })
}

/// Request override if present and allowed, else the type default; anything
/// outside the configured priority set is rejected.
fn resolve_queue<'a>(
    override_queue: &'a str,
    default_queue: &'a str,
    allowed: &[String],
) -> Result<&'a str, ApiError> {
    let queue = if override_queue.is_empty() {
        default_queue
    } else {
        override_queue
    };
    if allowed.iter().any(|name| name == queue) {
        Ok(queue)
    } else {
        Err(ApiError::bad_request(format!(
            "queue {queue:?} not allowed (one of {allowed:?})"
        )))
    }
}

/// Request override if non-zero, else the type default; range-checked.
fn resolve_max_attempts(override_attempts: i32, default_attempts: i32) -> Result<i32, ApiError> {
    let attempts = if override_attempts == 0 {
        default_attempts
    } else {
        override_attempts
    };
    if MAX_ATTEMPTS_RANGE.contains(&attempts) {
        Ok(attempts)
    } else {
        Err(ApiError::bad_request("max_attempts out of range (1..20)"))
    }
}

/// 128 random bits as 32 lower-hex chars. Collisions are negligible and
/// no database round-trip is needed for allocation.
fn new_task_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::{new_task_id, resolve_max_attempts, resolve_queue};
    use axum::http::StatusCode;

    fn allowed() -> Vec<String> {
        vec!["default".to_string(), "high".to_string()]
    }

    #[test]
    fn queue_override_wins_when_allowed() {
        assert_eq!(resolve_queue("high", "default", &allowed()).unwrap(), "high");
    }

    #[test]
    fn empty_override_falls_back_to_the_type_default() {
        assert_eq!(
            resolve_queue("", "default", &allowed()).unwrap(),
            "default"
        );
    }

    #[test]
    fn disallowed_queue_is_rejected_and_lists_the_allowed_set() {
        let error = resolve_queue("urgent", "default", &allowed()).unwrap_err();
        assert_eq!(error.status, StatusCode::BAD_REQUEST);
        assert!(error.message.contains("urgent"));
        assert!(error.message.contains("default"));
        assert!(error.message.contains("high"));
    }

    #[test]
    fn zero_max_attempts_means_the_type_default() {
        assert_eq!(resolve_max_attempts(0, 5).unwrap(), 5);
        assert_eq!(resolve_max_attempts(3, 5).unwrap(), 3);
    }

    #[test]
    fn max_attempts_outside_range_is_rejected() {
        assert!(resolve_max_attempts(21, 5).is_err());
        assert!(resolve_max_attempts(-1, 5).is_err());
        assert!(resolve_max_attempts(0, 0).is_err());
        assert_eq!(resolve_max_attempts(1, 5).unwrap(), 1);
        assert_eq!(resolve_max_attempts(20, 5).unwrap(), 20);
    }

    #[test]
    fn task_ids_are_32_lower_hex_chars() {
        let id = new_task_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(id, new_task_id());
    }
}

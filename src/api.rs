//! HTTP surface: enqueue, task lookup, readiness, and metrics exposition.

pub mod enqueue;
pub mod health;
pub mod tasks;

use crate::broker::topology::Topology;
use crate::broker::Publisher;
use crate::store::TaskStore;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use lapin::Connection;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use std::sync::Arc;

/// Enqueue bodies are capped; payloads are opaque but not unbounded.
const MAX_ENQUEUE_BODY_BYTES: usize = 1 << 20;

/// Shared dependencies for every handler.
pub struct ApiState {
    pub store: TaskStore,
    /// Broker connection; the health probe opens a throwaway channel per
    /// check since a failed passive declaration closes its channel.
    pub broker: Connection,
    pub publisher: Publisher,
    pub topology: Topology,
    pub metrics: PrometheusHandle,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/", get(info))
        .route(
            "/enqueue",
            post(enqueue::enqueue).layer(DefaultBodyLimit::max(MAX_ENQUEUE_BODY_BYTES)),
        )
        .route("/tasks/:id", get(tasks::get_task))
        .route("/healthz", get(health::healthz))
        .route("/metrics", get(metrics_text))
        .with_state(state)
}

async fn info() -> Json<serde_json::Value> {
    Json(json!({"service": "distributed-task-queue"}))
}

async fn metrics_text(State(state): State<Arc<ApiState>>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
        .into_response()
}

/// JSON error body with an HTTP status. Validation failures are the
/// caller's problem and are never logged as server errors.
#[derive(Debug)]
pub struct ApiError {
    pub(crate) status: StatusCode,
    pub(crate) message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({"error": self.message}))).into_response()
    }
}

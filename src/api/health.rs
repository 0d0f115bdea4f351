//! Readiness probe: database ping plus passive topology verification.

use super::ApiState;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const HEALTH_BUDGET: Duration = Duration::from_secs(1);

pub async fn healthz(State(state): State<Arc<ApiState>>) -> (StatusCode, Json<Value>) {
    match tokio::time::timeout(HEALTH_BUDGET, check(&state)).await {
        Ok(Ok(())) => (StatusCode::OK, Json(json!({"status": "ok"}))),
        Ok(Err(degraded)) => (StatusCode::SERVICE_UNAVAILABLE, Json(degraded.body())),
        Err(_elapsed) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "degraded", "timeout": "health budget exceeded"})),
        ),
    }
}

async fn check(state: &ApiState) -> Result<(), Degraded> {
    if let Err(error) = sqlx::query("select 1").execute(state.store.pool()).await {
        return Err(Degraded {
            component: "db",
            diagnostic: format!("down: {error}"),
        });
    }

    // Fresh channel per probe: a failed passive declaration closes the
    // channel it ran on.
    let channel = match state.broker.create_channel().await {
        Ok(channel) => channel,
        Err(error) => {
            return Err(Degraded {
                component: "rmq",
                diagnostic: format!("channel open failed: {error}"),
            })
        }
    };
    if let Err(error) = state.topology.verify(&channel).await {
        return Err(Degraded {
            component: "rmq",
            diagnostic: format!("{error:#}"),
        });
    }

    Ok(())
}

struct Degraded {
    component: &'static str,
    diagnostic: String,
}

impl Degraded {
    fn body(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert("status".into(), Value::String("degraded".into()));
        map.insert(self.component.into(), Value::String(self.diagnostic.clone()));
        Value::Object(map)
    }
}

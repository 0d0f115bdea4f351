//! Handler registry: the process-local dispatch table from task type to
//! executable handler.
//!
//! The registry is populated at startup and never mutated afterwards. A
//! type with no handler is a handler error, not a decode error: the task
//! retries until its attempts run out, so deploying the handler late still
//! drains the backlog.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// A typed unit of work. Receives the task payload verbatim and returns
/// the result document persisted on success.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, payload: &Value) -> anyhow::Result<Value>;
}

/// Dispatch table keyed by task type.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every handler this binary ships.
    pub fn with_builtin_handlers() -> Self {
        let mut registry = Self::new();
        registry.register("email.send.v1", Arc::new(EmailSendStub));
        registry
    }

    pub fn register(&mut self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(task_type.into(), handler);
    }

    /// Run the handler for `task_type`, or fail retryably when none exists.
    pub async fn dispatch(&self, task_type: &str, payload: &Value) -> anyhow::Result<Value> {
        match self.handlers.get(task_type) {
            Some(handler) => handler.handle(payload).await,
            None => Err(anyhow::anyhow!("no handler for type {task_type:?}")),
        }
    }
}

/// Stand-in email handler: pretends to talk to a provider.
pub struct EmailSendStub;

#[async_trait]
impl TaskHandler for EmailSendStub {
    async fn handle(&self, _payload: &Value) -> anyhow::Result<Value> {
        // Simulated provider round-trip.
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(json!({"ok": true, "provider": "stub"}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dispatch_runs_the_registered_handler() {
        let registry = HandlerRegistry::with_builtin_handlers();
        let result = registry
            .dispatch("email.send.v1", &json!({"to": "a@b"}))
            .await
            .unwrap();
        assert_eq!(result["ok"], json!(true));
    }

    #[tokio::test]
    async fn dispatch_fails_for_unregistered_types() {
        let registry = HandlerRegistry::new();
        let error = registry
            .dispatch("nope.v1", &json!({}))
            .await
            .unwrap_err();
        assert!(error.to_string().contains("no handler for type"));
    }
}

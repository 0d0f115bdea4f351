//! Exchange, queue, and routing-key names derived from the configured
//! namespace, plus idempotent declaration against the broker.

use crate::error::Result;

use anyhow::Context as _;
use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, ExchangeKind};

/// Derived broker names for one namespace and priority set.
///
/// Messages flow `main exchange -> {ns}.{p}`; retries flow
/// `default exchange -> {ns}.retry.{p} -(TTL dead-letter)-> main exchange`;
/// terminal failures flow `dlx -> {ns}.dlq`.
#[derive(Debug, Clone)]
pub struct Topology {
    pub namespace: String,
    pub main_exchange: String,
    pub dlx_exchange: String,
    pub dlq_name: String,
    /// Priority names double as routing keys.
    pub priorities: Vec<String>,
}

impl Topology {
    pub fn new(namespace: impl Into<String>, priorities: Vec<String>) -> Self {
        let namespace = namespace.into();
        Self {
            main_exchange: format!("{namespace}.direct"),
            dlx_exchange: format!("{namespace}.dlx"),
            dlq_name: format!("{namespace}.dlq"),
            namespace,
            priorities,
        }
    }

    /// Primary queue for a priority, e.g. `tasks.default`.
    pub fn queue_name(&self, priority: &str) -> String {
        format!("{}.{priority}", self.namespace)
    }

    /// Retry holding queue for a priority, e.g. `tasks.retry.default`.
    pub fn retry_queue_name(&self, priority: &str) -> String {
        format!("{}.retry.{priority}", self.namespace)
    }

    /// Routing key for a task row's queue value. The store keeps the bare
    /// priority, but a namespaced queue name is tolerated too.
    pub fn routing_key_for<'a>(&self, queue: &'a str) -> &'a str {
        queue
            .strip_prefix(&format!("{}.", self.namespace))
            .unwrap_or(queue)
    }

    /// Declare every exchange, queue, and binding. Idempotent: re-running
    /// against a broker that already carries matching declarations succeeds;
    /// a mismatched declaration surfaces the broker's channel error.
    pub async fn declare(&self, channel: &Channel) -> Result<()> {
        let durable = ExchangeDeclareOptions {
            durable: true,
            ..Default::default()
        };
        channel
            .exchange_declare(
                &self.main_exchange,
                ExchangeKind::Direct,
                durable,
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("failed to declare exchange {}", self.main_exchange))?;
        channel
            .exchange_declare(
                &self.dlx_exchange,
                ExchangeKind::Direct,
                durable,
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("failed to declare exchange {}", self.dlx_exchange))?;

        let durable_queue = QueueDeclareOptions {
            durable: true,
            ..Default::default()
        };

        for priority in &self.priorities {
            let queue = self.queue_name(priority);
            channel
                .queue_declare(&queue, durable_queue, FieldTable::default())
                .await
                .with_context(|| format!("failed to declare queue {queue}"))?;
            channel
                .queue_bind(
                    &queue,
                    &self.main_exchange,
                    priority,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .with_context(|| format!("failed to bind queue {queue}"))?;

            // Retry queue: expired messages dead-letter straight back to the
            // main exchange under the priority's routing key.
            let retry_queue = self.retry_queue_name(priority);
            let mut args = FieldTable::default();
            args.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(self.main_exchange.clone().into()),
            );
            args.insert(
                "x-dead-letter-routing-key".into(),
                AMQPValue::LongString(priority.clone().into()),
            );
            channel
                .queue_declare(&retry_queue, durable_queue, args)
                .await
                .with_context(|| format!("failed to declare retry queue {retry_queue}"))?;
        }

        channel
            .queue_declare(&self.dlq_name, durable_queue, FieldTable::default())
            .await
            .with_context(|| format!("failed to declare dead-letter queue {}", self.dlq_name))?;
        for priority in &self.priorities {
            channel
                .queue_bind(
                    &self.dlq_name,
                    &self.dlx_exchange,
                    priority,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .with_context(|| {
                    format!("failed to bind dead-letter queue for priority {priority}")
                })?;
        }

        Ok(())
    }

    /// Passively verify that every topology object exists. Used by the
    /// readiness probe; declares nothing.
    pub async fn verify(&self, channel: &Channel) -> Result<()> {
        let passive_exchange = ExchangeDeclareOptions {
            passive: true,
            ..Default::default()
        };
        channel
            .exchange_declare(
                &self.main_exchange,
                ExchangeKind::Direct,
                passive_exchange,
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("main exchange {} missing", self.main_exchange))?;
        channel
            .exchange_declare(
                &self.dlx_exchange,
                ExchangeKind::Direct,
                passive_exchange,
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("dlx exchange {} missing", self.dlx_exchange))?;

        let passive_queue = QueueDeclareOptions {
            passive: true,
            ..Default::default()
        };
        for priority in &self.priorities {
            let queue = self.queue_name(priority);
            channel
                .queue_declare(&queue, passive_queue, FieldTable::default())
                .await
                .with_context(|| format!("queue {queue} missing"))?;
        }
        channel
            .queue_declare(&self.dlq_name, passive_queue, FieldTable::default())
            .await
            .with_context(|| format!("dlq {} missing", self.dlq_name))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Topology;

    fn topology() -> Topology {
        Topology::new("tasks", vec!["default".into(), "high".into()])
    }

    #[test]
    fn derived_names_follow_the_namespace() {
        let t = topology();
        assert_eq!(t.main_exchange, "tasks.direct");
        assert_eq!(t.dlx_exchange, "tasks.dlx");
        assert_eq!(t.dlq_name, "tasks.dlq");
        assert_eq!(t.queue_name("high"), "tasks.high");
        assert_eq!(t.retry_queue_name("default"), "tasks.retry.default");
    }

    #[test]
    fn routing_key_tolerates_bare_and_namespaced_queue_values() {
        let t = topology();
        assert_eq!(t.routing_key_for("default"), "default");
        assert_eq!(t.routing_key_for("tasks.high"), "high");
        // a foreign prefix is left alone
        assert_eq!(t.routing_key_for("other.high"), "other.high");
    }
}

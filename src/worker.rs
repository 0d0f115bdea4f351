//! Worker loop: consumes the priority queues and drives every delivery
//! through the durable execution protocol.
//!
//! The protocol's contract is write-before-ACK: a positive acknowledgement
//! is only sent after the corresponding database commit. A crash between
//! commit and ACK makes the broker redeliver, and the duplicate is absorbed
//! by the idempotency gate on the next pass.

use crate::backoff::BackoffStrategy;
use crate::broker::topology::Topology;
use crate::broker::{Envelope, Publisher};
use crate::error::Result;
use crate::handler::HandlerRegistry;
use crate::metrics::{WORKER_HANDLE_LATENCY, WORKER_PROCESSED_TOTAL};
use crate::store::{TaskStatus, TaskStore, WorkerTask};

use futures::StreamExt as _;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
};
use lapin::types::FieldTable;
use lapin::{Connection, Consumer};
use metrics::{counter, histogram};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Wall-clock budget for one delivery's transactional scope and handler run.
const MESSAGE_BUDGET: Duration = Duration::from_secs(10);

/// One worker process: a broker connection fanned out into one consumer
/// task per priority queue, all sharing a store, registry, and publisher.
pub struct Worker {
    conn: Connection,
    store: TaskStore,
    registry: HandlerRegistry,
    backoff: BackoffStrategy,
    topology: Topology,
    prefetch: u16,
}

struct WorkerContext {
    store: TaskStore,
    registry: HandlerRegistry,
    backoff: BackoffStrategy,
    topology: Topology,
    publisher: Publisher,
}

impl Worker {
    pub fn new(
        conn: Connection,
        store: TaskStore,
        registry: HandlerRegistry,
        backoff: BackoffStrategy,
        topology: Topology,
        prefetch: u16,
    ) -> Self {
        Self {
            conn,
            store,
            registry,
            backoff,
            topology,
            prefetch,
        }
    }

    /// Consume until the shutdown signal flips, then cancel every consumer
    /// tag, let in-flight deliveries reach their ACK/NACK boundary, and
    /// join the consumer tasks.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let channel = self.conn.create_channel().await?;
        channel
            .basic_qos(self.prefetch, BasicQosOptions::default())
            .await?;

        // Publishes get their own channel; consuming and publishing must not
        // interleave on one.
        let publisher = Publisher::new(self.conn.create_channel().await?);
        let ctx = Arc::new(WorkerContext {
            store: self.store,
            registry: self.registry,
            backoff: self.backoff,
            topology: self.topology,
            publisher,
        });

        tracing::info!(
            prefetch = self.prefetch,
            queues = ?ctx.topology.priorities,
            "worker starting"
        );

        let mut tags = Vec::new();
        let mut handles = Vec::new();
        for priority in ctx.topology.priorities.clone() {
            let queue = ctx.topology.queue_name(&priority);
            let tag = format!(
                "worker-{priority}-{}",
                chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
            );
            let consumer = channel
                .basic_consume(
                    &queue,
                    &tag,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await?;
            tags.push(tag);
            handles.push(tokio::spawn(consume_loop(
                Arc::clone(&ctx),
                priority,
                queue,
                consumer,
                shutdown.clone(),
            )));
        }

        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        tracing::info!("worker shutting down");
        for tag in &tags {
            if let Err(error) = channel.basic_cancel(tag, BasicCancelOptions::default()).await {
                tracing::warn!(%error, tag = %tag, "failed to cancel consumer");
            }
        }
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("worker stopped");
        Ok(())
    }
}

/// Sequentially process deliveries from one priority queue. An in-flight
/// delivery always finishes to ACK/NACK before shutdown is observed.
async fn consume_loop(
    ctx: Arc<WorkerContext>,
    priority: String,
    queue: String,
    mut consumer: Consumer,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let delivery = tokio::select! {
            _ = shutdown.changed() => break,
            next = consumer.next() => match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(error)) => {
                    tracing::error!(%error, queue = %queue, "consumer stream error");
                    break;
                }
                None => break,
            },
        };
        handle_delivery(&ctx, &priority, &queue, delivery).await;
    }
    tracing::debug!(queue = %queue, "consumer drained");
}

/// Drive one delivery through decode, the transactional protocol, and the
/// follow-up publish, ending in exactly one ACK or NACK.
async fn handle_delivery(ctx: &WorkerContext, priority: &str, queue: &str, delivery: Delivery) {
    let envelope: Envelope = match serde_json::from_slice(&delivery.data) {
        Ok(envelope) => envelope,
        Err(error) => {
            // Poison policy: drop instead of redelivering forever.
            tracing::warn!(
                %error,
                queue = %queue,
                body = %String::from_utf8_lossy(&delivery.data),
                "undecodable envelope, dropping"
            );
            counter!(WORKER_PROCESSED_TOTAL, "queue" => priority.to_string(), "outcome" => "poison")
                .increment(1);
            ack(delivery).await;
            return;
        }
    };

    let started = Instant::now();
    let step = tokio::time::timeout(MESSAGE_BUDGET, run_protocol(ctx, &envelope)).await;
    histogram!(WORKER_HANDLE_LATENCY, "queue" => priority.to_string())
        .record(started.elapsed().as_secs_f64());

    let outcome = match step {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(error)) => {
            // Transaction dropped without commit; redelivery re-drives the
            // protocol from the lock.
            tracing::error!(%error, task_id = %envelope.id, "delivery processing failed, requeueing");
            nack_requeue(delivery).await;
            return;
        }
        Err(_elapsed) => {
            tracing::warn!(task_id = %envelope.id, "message budget exceeded, requeueing");
            nack_requeue(delivery).await;
            return;
        }
    };

    match outcome {
        Outcome::Ack { outcome } => {
            counter!(WORKER_PROCESSED_TOTAL, "queue" => priority.to_string(), "outcome" => outcome)
                .increment(1);
            ack(delivery).await;
        }
        Outcome::Retry { task, attempt } => {
            let delay = ctx.backoff.next_delay(attempt.max(1) as u32);
            let routing_key = ctx.topology.routing_key_for(&task.queue);
            let retry_queue = ctx.topology.retry_queue_name(routing_key);
            let envelope = Envelope {
                id: task.id.clone(),
                task_type: task.task_type.clone(),
            };
            match ctx
                .publisher
                .publish_retry(&retry_queue, &envelope, delay)
                .await
            {
                Ok(()) => {
                    tracing::info!(
                        task_id = %task.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        retry_queue = %retry_queue,
                        "task scheduled for retry"
                    );
                    counter!(WORKER_PROCESSED_TOTAL, "queue" => priority.to_string(), "outcome" => "retried")
                        .increment(1);
                    ack(delivery).await;
                }
                Err(error) => {
                    // Row is already ENQUEUED; redelivery re-attempts the
                    // whole claim/handle/publish cycle.
                    tracing::error!(%error, task_id = %task.id, "retry publish failed, requeueing");
                    nack_requeue(delivery).await;
                }
            }
        }
        Outcome::DeadLetter { task } => {
            let routing_key = ctx.topology.routing_key_for(&task.queue);
            let envelope = Envelope {
                id: task.id.clone(),
                task_type: task.task_type.clone(),
            };
            if let Err(error) = ctx
                .publisher
                .publish_dead_letter(&ctx.topology.dlx_exchange, routing_key, &envelope)
                .await
            {
                // The row is already FAILED; the DLQ copy is best-effort.
                tracing::error!(%error, task_id = %task.id, "dead-letter publish failed");
            }
            counter!(WORKER_PROCESSED_TOTAL, "queue" => priority.to_string(), "outcome" => "failed")
                .increment(1);
            ack(delivery).await;
        }
    }
}

/// What the committed transaction decided; the delivery is settled
/// accordingly afterwards.
enum Outcome {
    /// Database state is settled; acknowledge the delivery.
    Ack { outcome: &'static str },
    /// Row committed back to `ENQUEUED`; schedule delayed redelivery.
    Retry { task: WorkerTask, attempt: i32 },
    /// Row committed `FAILED`; route the envelope to the DLX.
    DeadLetter { task: WorkerTask },
}

/// Steps 2-9 of the per-delivery protocol: everything that happens inside
/// the row lock. Every return path has committed; every error path has not.
async fn run_protocol(ctx: &WorkerContext, envelope: &Envelope) -> Result<Outcome> {
    let mut tx = ctx.store.begin().await?;

    let Some(task) = ctx.store.lock_task_for_work(&mut tx, &envelope.id).await? else {
        // Stale message: the row was deleted externally.
        tx.commit().await?;
        tracing::warn!(task_id = %envelope.id, "task row missing, dropping delivery");
        return Ok(Outcome::Ack { outcome: "stale" });
    };

    match decide_gate(task.status, task.attempts, task.max_attempts) {
        Gate::Duplicate => {
            // Already recorded; absorb the duplicate delivery.
            tx.commit().await?;
            return Ok(Outcome::Ack {
                outcome: "duplicate",
            });
        }
        Gate::Exhausted => {
            ctx.store
                .mark_failed(&mut tx, &task.id, "max attempts exceeded")
                .await?;
            tx.commit().await?;
            tracing::warn!(task_id = %task.id, attempts = task.attempts, "attempts exhausted");
            return Ok(Outcome::Ack {
                outcome: "exhausted",
            });
        }
        Gate::Claim => {}
    }

    ctx.store.mark_running(&mut tx, &task.id).await?;
    let attempt = task.attempts + 1;

    match ctx.registry.dispatch(&task.task_type, &task.payload).await {
        Ok(result) => {
            ctx.store.mark_succeeded(&mut tx, &task.id, &result).await?;
            tx.commit().await?;
            tracing::info!(task_id = %task.id, attempt, "task succeeded");
            Ok(Outcome::Ack {
                outcome: "succeeded",
            })
        }
        Err(handler_error) => {
            let message = format!("{handler_error:#}");
            match decide_failure(attempt, task.max_attempts) {
                FailureAction::Retry => {
                    ctx.store.mark_retry(&mut tx, &task.id, &message).await?;
                    tx.commit().await?;
                    Ok(Outcome::Retry { task, attempt })
                }
                FailureAction::Fail => {
                    ctx.store.mark_failed(&mut tx, &task.id, &message).await?;
                    tx.commit().await?;
                    tracing::error!(
                        task_id = %task.id,
                        attempt,
                        error = %message,
                        "task failed terminally"
                    );
                    Ok(Outcome::DeadLetter { task })
                }
            }
        }
    }
}

/// Pre-claim gate over the locked row.
#[derive(Debug, PartialEq, Eq)]
enum Gate {
    /// Terminal success already recorded; duplicate deliveries stop here.
    Duplicate,
    /// No attempts left; finalize as FAILED without claiming.
    Exhausted,
    Claim,
}

fn decide_gate(status: TaskStatus, attempts: i32, max_attempts: i32) -> Gate {
    if status == TaskStatus::Succeeded {
        Gate::Duplicate
    } else if attempts >= max_attempts {
        Gate::Exhausted
    } else {
        Gate::Claim
    }
}

/// Post-handler routing, keyed on the attempt count after the claim.
#[derive(Debug, PartialEq, Eq)]
enum FailureAction {
    Retry,
    Fail,
}

fn decide_failure(attempt_after: i32, max_attempts: i32) -> FailureAction {
    if attempt_after < max_attempts {
        FailureAction::Retry
    } else {
        FailureAction::Fail
    }
}

async fn ack(delivery: Delivery) {
    if let Err(error) = delivery.ack(BasicAckOptions::default()).await {
        tracing::warn!(%error, "failed to ack delivery");
    }
}

async fn nack_requeue(delivery: Delivery) {
    let options = BasicNackOptions {
        requeue: true,
        ..Default::default()
    };
    if let Err(error) = delivery.nack(options).await {
        tracing::warn!(%error, "failed to nack delivery");
    }
}

#[cfg(test)]
mod tests {
    use super::{decide_failure, decide_gate, FailureAction, Gate};
    use crate::store::TaskStatus;

    #[test]
    fn succeeded_rows_absorb_duplicate_deliveries() {
        assert_eq!(
            decide_gate(TaskStatus::Succeeded, 1, 5),
            Gate::Duplicate
        );
        // even a succeeded row at the attempts cap stays a duplicate
        assert_eq!(
            decide_gate(TaskStatus::Succeeded, 5, 5),
            Gate::Duplicate
        );
    }

    #[test]
    fn exhausted_rows_are_finalized_without_a_claim() {
        assert_eq!(decide_gate(TaskStatus::Enqueued, 5, 5), Gate::Exhausted);
        assert_eq!(decide_gate(TaskStatus::Failed, 5, 5), Gate::Exhausted);
    }

    #[test]
    fn rows_with_attempts_left_are_claimed() {
        assert_eq!(decide_gate(TaskStatus::Enqueued, 0, 5), Gate::Claim);
        assert_eq!(decide_gate(TaskStatus::Enqueued, 4, 5), Gate::Claim);
    }

    #[test]
    fn failures_retry_until_the_last_attempt() {
        assert_eq!(decide_failure(1, 3), FailureAction::Retry);
        assert_eq!(decide_failure(2, 3), FailureAction::Retry);
        assert_eq!(decide_failure(3, 3), FailureAction::Fail);
    }

    #[test]
    fn single_attempt_tasks_fail_terminally_on_first_error() {
        assert_eq!(decide_failure(1, 1), FailureAction::Fail);
    }
}

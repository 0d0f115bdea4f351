//! Typed data access for the task table and the task-type registry.
//!
//! The task row is the system's source of truth. Enqueue inserts it, the
//! worker mutates it under a `FOR UPDATE` lock, and nothing here deletes it.

use crate::error::Result;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use std::fmt;
use std::str::FromStr;

/// Task lifecycle states. `Succeeded` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Enqueued,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enqueued => "ENQUEUED",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw {
            "ENQUEUED" => Ok(Self::Enqueued),
            "RUNNING" => Ok(Self::Running),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown task status {other:?}")),
        }
    }
}

/// Registry defaults for a task type.
#[derive(Debug, Clone)]
pub struct TypeDefaults {
    pub active: bool,
    pub default_queue: String,
    pub default_max_attempts: i32,
}

/// Parameters for an enqueue insert.
#[derive(Debug)]
pub struct NewTask<'a> {
    pub id: &'a str,
    pub task_type: &'a str,
    pub queue: &'a str,
    pub payload: &'a Value,
    /// Empty means no idempotency; stored as NULL.
    pub idempotency_key: &'a str,
    pub max_attempts: i32,
}

/// The canonical identity of an enqueued task: on an idempotency-key
/// collision this is the pre-existing row, not the attempted insert.
#[derive(Debug, Clone)]
pub struct EnqueuedTask {
    pub id: String,
    pub status: TaskStatus,
    pub queue: String,
}

/// The fields the worker needs while holding the row lock.
#[derive(Debug, Clone)]
pub struct WorkerTask {
    pub id: String,
    pub task_type: String,
    pub queue: String,
    pub status: TaskStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub payload: Value,
}

/// Read-only projection for the task lookup endpoint.
#[derive(Debug, Clone)]
pub struct TaskRow {
    pub id: String,
    pub task_type: String,
    pub queue: String,
    pub status: TaskStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persistent store for task rows, backed by the Postgres pool.
#[derive(Clone)]
pub struct TaskStore {
    pool: PgPool,
}

impl TaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Open the transactional scope for one delivery.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    /// Registry defaults for a type, or `None` if the type is unknown.
    pub async fn type_defaults(&self, task_type: &str) -> Result<Option<TypeDefaults>> {
        let row = sqlx::query_as::<_, TypeDefaultsRow>(
            "select active, default_queue, default_max_attempts
               from task_type
              where type = $1",
        )
        .bind(task_type)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| TypeDefaults {
            active: r.active,
            default_queue: r.default_queue,
            default_max_attempts: r.default_max_attempts,
        }))
    }

    /// Insert an `ENQUEUED` task, idempotent on `idempotency_key`. A key
    /// collision returns the existing row's identity and only touches
    /// `updated_at`; an empty key is stored as NULL so keyless inserts
    /// never collide with each other.
    pub async fn upsert_enqueue(&self, task: &NewTask<'_>) -> Result<EnqueuedTask> {
        let row = sqlx::query_as::<_, EnqueuedRow>(
            "insert into tasks (id, type, queue, status, payload, idempotency_key, max_attempts)
             values ($1, $2, $3, 'ENQUEUED', $4, nullif($5, ''), $6)
             on conflict (idempotency_key) do update
               set updated_at = now()
             returning id, status, queue",
        )
        .bind(task.id)
        .bind(task.task_type)
        .bind(task.queue)
        .bind(task.payload)
        .bind(task.idempotency_key)
        .bind(task.max_attempts)
        .fetch_one(&self.pool)
        .await?;

        Ok(EnqueuedTask {
            id: row.id,
            status: parse_status(&row.status)?,
            queue: row.queue,
        })
    }

    /// Lock the row for the duration of the caller's transaction.
    /// `None` means the row is gone (stale broker message).
    pub async fn lock_task_for_work(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        id: &str,
    ) -> Result<Option<WorkerTask>> {
        let row = sqlx::query_as::<_, WorkerTaskRow>(
            "select id, type as task_type, queue, status, attempts, max_attempts, payload
               from tasks
              where id = $1
                for update",
        )
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;

        row.map(|r| {
            Ok(WorkerTask {
                id: r.id,
                task_type: r.task_type,
                queue: r.queue,
                status: parse_status(&r.status)?,
                attempts: r.attempts,
                max_attempts: r.max_attempts,
                payload: r.payload,
            })
        })
        .transpose()
    }

    /// Claim the task: `RUNNING`, one more attempt, last error cleared.
    pub async fn mark_running(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        id: &str,
    ) -> Result<()> {
        sqlx::query(
            "update tasks
                set status     = 'RUNNING',
                    attempts   = attempts + 1,
                    last_error = null,
                    updated_at = now()
              where id = $1",
        )
        .bind(id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn mark_succeeded(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        id: &str,
        result: &Value,
    ) -> Result<()> {
        sqlx::query(
            "update tasks
                set status     = 'SUCCEEDED',
                    result     = $2,
                    updated_at = now()
              where id = $1",
        )
        .bind(id)
        .bind(result)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn mark_failed(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        id: &str,
        last_error: &str,
    ) -> Result<()> {
        sqlx::query(
            "update tasks
                set status     = 'FAILED',
                    last_error = $2,
                    updated_at = now()
              where id = $1",
        )
        .bind(id)
        .bind(last_error)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Put the task back in line for another attempt, recording why the
    /// last one failed.
    pub async fn mark_retry(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        id: &str,
        last_error: &str,
    ) -> Result<()> {
        sqlx::query(
            "update tasks
                set status     = 'ENQUEUED',
                    last_error = $2,
                    updated_at = now()
              where id = $1",
        )
        .bind(id)
        .bind(last_error)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Full projection for the read API.
    pub async fn get_task(&self, id: &str) -> Result<Option<TaskRow>> {
        let row = sqlx::query_as::<_, TaskRowRaw>(
            "select id, type as task_type, queue, status, attempts, max_attempts,
                    last_error, result, created_at, updated_at
               from tasks
              where id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            Ok(TaskRow {
                id: r.id,
                task_type: r.task_type,
                queue: r.queue,
                status: parse_status(&r.status)?,
                attempts: r.attempts,
                max_attempts: r.max_attempts,
                last_error: r.last_error,
                result: r.result,
                created_at: r.created_at,
                updated_at: r.updated_at,
            })
        })
        .transpose()
    }
}

fn parse_status(raw: &str) -> Result<TaskStatus> {
    raw.parse::<TaskStatus>()
        .map_err(|e| anyhow::anyhow!("invalid task status in database: {e}").into())
}

#[derive(sqlx::FromRow)]
struct TypeDefaultsRow {
    active: bool,
    default_queue: String,
    default_max_attempts: i32,
}

#[derive(sqlx::FromRow)]
struct EnqueuedRow {
    id: String,
    status: String,
    queue: String,
}

#[derive(sqlx::FromRow)]
struct WorkerTaskRow {
    id: String,
    task_type: String,
    queue: String,
    status: String,
    attempts: i32,
    max_attempts: i32,
    payload: Value,
}

#[derive(sqlx::FromRow)]
struct TaskRowRaw {
    id: String,
    task_type: String,
    queue: String,
    status: String,
    attempts: i32,
    max_attempts: i32,
    last_error: Option<String>,
    result: Option<Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::TaskStatus;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            TaskStatus::Enqueued,
            TaskStatus::Running,
            TaskStatus::Succeeded,
            TaskStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
    }

    #[test]
    fn status_rejects_unknown_values() {
        assert!("enqueued".parse::<TaskStatus>().is_err());
        assert!("DONE".parse::<TaskStatus>().is_err());
    }
}

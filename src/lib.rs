//! Durable, priority-aware distributed task queue over RabbitMQ and
//! Postgres.
//!
//! Clients enqueue typed tasks over HTTP; workers consume priority queues,
//! execute handlers, and persist outcomes with exactly-once state
//! transitions. The task row in Postgres is the source of truth — broker
//! messages are minimal `{id, type}` envelopes, and every acknowledgement
//! is preceded by the database commit it reports.

pub mod api;
pub mod backoff;
pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod store;
pub mod worker;

pub use error::{Error, Result};

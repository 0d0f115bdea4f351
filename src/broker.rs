//! Broker connectivity: connection setup, the wire envelope, and a
//! serialized publisher handle.

pub mod topology;

use crate::error::Result;

use anyhow::Context as _;
use lapin::options::BasicPublishOptions;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;

const CONTENT_TYPE_JSON: &str = "application/json";
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Open a broker connection with the tokio executor wired in.
pub async fn connect(url: &str) -> Result<Connection> {
    let connection = Connection::connect(url, ConnectionProperties::default())
        .await
        .context("failed to connect to broker")?;
    Ok(connection)
}

/// The minimal in-flight message. The task row is the source of truth;
/// workers re-read it under a lock on receipt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: String,
}

/// Publisher over a dedicated channel. AMQP channels are not safe for
/// concurrent publishing, so every publish goes through one mutex.
pub struct Publisher {
    channel: Mutex<Channel>,
}

impl Publisher {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel: Mutex::new(channel),
        }
    }

    /// Publish a fresh task envelope to an exchange, persistent.
    pub async fn publish_task(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<()> {
        let body = serde_json::to_vec(envelope).context("failed to serialize envelope")?;
        let properties = BasicProperties::default()
            .with_content_type(CONTENT_TYPE_JSON.into())
            .with_delivery_mode(DELIVERY_MODE_PERSISTENT);

        let channel = self.channel.lock().await;
        channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await?;
        Ok(())
    }

    /// Publish to a retry queue via the default exchange, with a per-message
    /// TTL so the broker dead-letters it back to the main exchange after
    /// `delay`.
    pub async fn publish_retry(
        &self,
        retry_queue: &str,
        envelope: &Envelope,
        delay: Duration,
    ) -> Result<()> {
        let body = serde_json::to_vec(envelope).context("failed to serialize envelope")?;
        let expiration = delay.as_millis().to_string();
        let properties = BasicProperties::default()
            .with_content_type(CONTENT_TYPE_JSON.into())
            .with_expiration(expiration.into());

        let channel = self.channel.lock().await;
        channel
            .basic_publish(
                "",
                retry_queue,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await?;
        Ok(())
    }

    /// Publish a terminally-failed task's envelope to the dead-letter
    /// exchange for inspection.
    pub async fn publish_dead_letter(
        &self,
        dlx_exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<()> {
        let body = serde_json::to_vec(envelope).context("failed to serialize envelope")?;
        let properties = BasicProperties::default().with_content_type(CONTENT_TYPE_JSON.into());

        let channel = self.channel.lock().await;
        channel
            .basic_publish(
                dlx_exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Envelope;

    #[test]
    fn envelope_wire_shape_is_id_and_type() {
        let envelope = Envelope {
            id: "0123456789abcdef0123456789abcdef".into(),
            task_type: "email.send.v1".into(),
        };
        let json = serde_json::to_string(&envelope).unwrap();
        assert_eq!(
            json,
            r#"{"id":"0123456789abcdef0123456789abcdef","type":"email.send.v1"}"#
        );

        let parsed: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, envelope.id);
        assert_eq!(parsed.task_type, envelope.task_type);
    }

    #[test]
    fn envelope_rejects_non_json_bodies() {
        assert!(serde_json::from_slice::<Envelope>(b"not json at all").is_err());
    }
}

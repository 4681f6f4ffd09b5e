//! Transport-neutral MQTT publish/subscribe interface.

use async_trait::async_trait;
use log::{debug, warn};
use rumqttc::QoS;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Message received from the MQTT broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: String,
}

/// Inbound notification from the MQTT session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MqttEvent {
    Connected,
    Disconnected { reason: String },
    Message(MqttMessage),
}

/// An outbound message produced by the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

impl Publication {
    pub fn new(topic: impl Into<String>, payload: &serde_json::Value, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.to_string(),
            retain,
        }
    }

    /// Parsed JSON payload. Publications are always built from JSON values.
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.payload).unwrap_or(serde_json::Value::Null)
    }
}

/// Failures of the MQTT session.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("MQTT session not connected")]
    NotConnected,

    #[error("timed out waiting for the MQTT session")]
    Timeout,
}

/// Publish/subscribe access to the broker. Safe for concurrent use.
#[async_trait]
pub trait MqttTransport: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    async fn publish(
        &self,
        topic: &str,
        payload: &str,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError>;

    /// Resolve once the session is connected, or fail after `timeout`.
    async fn wait_connected(&self, timeout: Duration) -> Result<(), TransportError>;

    async fn disconnect(&self);
}

/// Publishes [`Publication`]s with the bridge QoS, logging failures.
#[derive(Clone)]
pub struct Publisher {
    transport: Arc<dyn MqttTransport>,
    qos: QoS,
}

impl Publisher {
    pub fn new(transport: Arc<dyn MqttTransport>, qos: QoS) -> Self {
        Self { transport, qos }
    }

    /// Returns `false` if the broker did not take the message.
    pub async fn publish(&self, publication: &Publication) -> bool {
        match self
            .transport
            .publish(
                &publication.topic,
                &publication.payload,
                self.qos,
                publication.retain,
            )
            .await
        {
            Ok(()) => true,
            Err(TransportError::NotConnected) => {
                debug!("[MQTT] Not connected, dropping publish to {}", publication.topic);
                false
            }
            Err(e) => {
                warn!("[MQTT] Failed to publish to {}: {}", publication.topic, e);
                false
            }
        }
    }
}

//! MQTT client wrapper built on rumqttc.

use super::topics::Topics;
use super::transport::{MqttEvent, MqttMessage, MqttTransport, TransportError};
use crate::config::MqttConfig;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// MQTT client owning the rumqttc event loop.
pub struct MqttClient {
    client: AsyncClient,
    event_loop: EventLoop,
    connected: watch::Sender<bool>,
    reconnect_delay: Duration,
}

impl MqttClient {
    /// Create a new MQTT client from configuration.
    ///
    /// A retained last-will marks the coordinator offline if the bridge
    /// disappears without a clean shutdown.
    pub fn new(config: &MqttConfig) -> Self {
        let mut options =
            MqttOptions::new(&config.client_id, &config.broker_host, config.broker_port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }

        let topics = Topics::new(&config.base_topic);
        options.set_last_will(LastWill::new(
            topics.coordinator_status(),
            serde_json::json!({ "status": "offline" }).to_string(),
            config.qos(),
            true,
        ));

        let (client, event_loop) = AsyncClient::new(options, 100);
        let (connected, _) = watch::channel(false);

        Self {
            client,
            event_loop,
            connected,
            reconnect_delay: Duration::from_millis(config.reconnect_delay_ms),
        }
    }

    /// Handle for subscribing and publishing from other tasks.
    pub fn handle(&self) -> MqttHandle {
        MqttHandle {
            client: self.client.clone(),
            connected: self.connected.subscribe(),
        }
    }

    /// Run the MQTT event loop and forward session events to the provided channel.
    ///
    /// rumqttc reconnects on the next poll after an error, so the loop only
    /// reports the transition and waits before polling again.
    pub async fn run(mut self, tx: mpsc::Sender<MqttEvent>, shutdown: CancellationToken) {
        info!("[MQTT] Starting event loop");

        loop {
            let polled = tokio::select! {
                _ = shutdown.cancelled() => break,
                polled = self.event_loop.poll() => polled,
            };

            let event = match polled {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("[MQTT] Connected to broker");
                    self.connected.send_replace(true);
                    Some(MqttEvent::Connected)
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    match String::from_utf8(publish.payload.to_vec()) {
                        Ok(payload) => {
                            debug!("[MQTT] Received on {}: {}", publish.topic, payload);
                            Some(MqttEvent::Message(MqttMessage {
                                topic: publish.topic,
                                payload,
                            }))
                        }
                        Err(e) => {
                            warn!("[MQTT] Invalid UTF-8 in payload on {}: {}", publish.topic, e);
                            None
                        }
                    }
                }
                Ok(_) => None,
                Err(e) => {
                    error!("[MQTT] Connection error: {:?}", e);
                    let was_connected = self.connected.send_replace(false);
                    if was_connected
                        && tx
                            .send(MqttEvent::Disconnected {
                                reason: e.to_string(),
                            })
                            .await
                            .is_err()
                    {
                        break;
                    }
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.reconnect_delay) => {}
                    }
                    None
                }
            };

            if let Some(event) = event
                && tx.send(event).await.is_err()
            {
                error!("[MQTT] Event channel closed");
                break;
            }
        }

        self.connected.send_replace(false);
        info!("[MQTT] Event loop stopped");
    }
}

/// Cloneable publish/subscribe handle backed by the rumqttc client.
#[derive(Clone)]
pub struct MqttHandle {
    client: AsyncClient,
    connected: watch::Receiver<bool>,
}

#[async_trait]
impl MqttTransport for MqttHandle {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        info!("[MQTT] Subscribing to {}", topic);
        self.client.subscribe(topic, QoS::AtLeastOnce).await?;
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: &str,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        if !*self.connected.borrow() {
            return Err(TransportError::NotConnected);
        }
        debug!("[MQTT] Publishing to {}: {}", topic, payload);
        self.client
            .publish(topic, qos, retain, payload.as_bytes().to_vec())
            .await?;
        Ok(())
    }

    async fn wait_connected(&self, timeout: Duration) -> Result<(), TransportError> {
        let mut connected = self.connected.clone();
        match tokio::time::timeout(timeout, connected.wait_for(|c| *c)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(TransportError::NotConnected),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            warn!("[MQTT] Disconnect failed: {}", e);
        }
    }
}

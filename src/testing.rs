//! Shared test fixtures: an in-memory MQTT transport and sample devices.

use crate::config::{Config, RetryPolicy};
use crate::mqtt::{MqttTransport, Publication, TransportError};
use crate::zigbee::clusters::PROFILE_HOME_AUTOMATION;
use crate::zigbee::{DeviceDescriptor, EndpointDescriptor, Ieee};
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::QoS;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub const COORDINATOR: Ieee = Ieee(0x00124b0000000001);

/// MQTT transport that records everything published while "connected".
pub struct RecordingMqtt {
    published: Mutex<Vec<Publication>>,
    subscriptions: Mutex<Vec<String>>,
    connected: watch::Sender<bool>,
}

impl RecordingMqtt {
    pub fn new() -> Arc<Self> {
        let (connected, _) = watch::channel(true);
        Arc::new(Self {
            published: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            connected,
        })
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.send_replace(connected);
    }

    pub fn published(&self) -> Vec<Publication> {
        self.published.lock().clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<Publication> {
        self.published
            .lock()
            .iter()
            .filter(|p| p.topic == topic)
            .cloned()
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().clone()
    }
}

#[async_trait]
impl MqttTransport for RecordingMqtt {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        if !*self.connected.borrow() {
            return Err(TransportError::NotConnected);
        }
        self.subscriptions.lock().push(topic.to_string());
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: &str,
        _qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        if !*self.connected.borrow() {
            return Err(TransportError::NotConnected);
        }
        self.published.lock().push(Publication {
            topic: topic.to_string(),
            payload: payload.to_string(),
            retain,
        });
        Ok(())
    }

    async fn wait_connected(&self, timeout: Duration) -> Result<(), TransportError> {
        let mut connected = self.connected.subscribe();
        match tokio::time::timeout(timeout, connected.wait_for(|c| *c)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(TransportError::NotConnected),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn disconnect(&self) {
        self.connected.send_replace(false);
    }
}

/// Config with short timings suited to tests.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.zigbee.coordinator_ieee = COORDINATOR;
    let bridge = &mut config.bridge;
    bridge.coalesce_window_ms = 1_000;
    bridge.command_timeout_ms = 200;
    bridge.command_retry = RetryPolicy::new(3, 5, 20);
    bridge.reporting_retry = RetryPolicy::new(3, 10, 50);
    bridge.reconnect = RetryPolicy::new(0, 10, 50);
    bridge.startup_attempts = 2;
    bridge.startup_retry_delay_ms = 10;
    bridge.startup_timeout_ms = 500;
    bridge.refresh_interval_secs = 0;
    bridge.shutdown_grace_ms = 200;
    config
}

/// Poll `condition` until it holds, panicking after two seconds.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn device(ieee: Ieee, nwk: u16, model: &str, endpoints: Vec<EndpointDescriptor>) -> DeviceDescriptor {
    DeviceDescriptor {
        ieee,
        nwk,
        manufacturer: Some("Acme".to_string()),
        model: Some(model.to_string()),
        endpoints,
    }
}

fn endpoint(id: u8, device_type: u16, in_clusters: &[u16]) -> EndpointDescriptor {
    EndpointDescriptor {
        id,
        profile_id: PROFILE_HOME_AUTOMATION,
        device_type,
        in_clusters: in_clusters.to_vec(),
        out_clusters: vec![0x0019],
        color_capabilities: None,
    }
}

pub fn smart_plug(ieee: Ieee) -> DeviceDescriptor {
    device(ieee, 0x4a01, "plug", vec![endpoint(1, 0x010A, &[0x0000, 0x0006])])
}

pub fn dimmable_light(ieee: Ieee) -> DeviceDescriptor {
    device(
        ieee,
        0x4a02,
        "dimmer",
        vec![endpoint(1, 0x0101, &[0x0000, 0x0006, 0x0008])],
    )
}

pub fn color_light(ieee: Ieee, color_capabilities: u16) -> DeviceDescriptor {
    let mut ep = endpoint(11, 0x010D, &[0x0000, 0x0006, 0x0008, 0x0300]);
    ep.color_capabilities = Some(color_capabilities);
    device(ieee, 0x4a03, "bulb", vec![ep])
}

pub fn motion_sensor(ieee: Ieee) -> DeviceDescriptor {
    device(ieee, 0x4a04, "motion", vec![endpoint(1, 0x0402, &[0x0000, 0x0500])])
}

pub fn climate_sensor(ieee: Ieee) -> DeviceDescriptor {
    device(
        ieee,
        0x4a05,
        "climate",
        vec![endpoint(1, 0x0302, &[0x0000, 0x0402, 0x0405])],
    )
}

//! MQTT side of the bridge.
//!
//! Provides the transport abstraction consumed by the bridge, a rumqttc-backed
//! client, and the public topic layout.

mod client;
pub mod topics;
mod transport;

pub use client::{MqttClient, MqttHandle};
pub use topics::{Direction, Feature, InboundTopic, TopicAddress, Topics};
pub use transport::{
    MqttEvent, MqttMessage, MqttTransport, Publication, Publisher, TransportError,
};

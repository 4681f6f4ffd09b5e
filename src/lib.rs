//! Zigbee to MQTT bridge library.
//!
//! Exposes the devices of a Zigbee mesh on an MQTT bus: device state is
//! published as JSON under a base topic, and `set` messages become mesh
//! commands.

pub mod bridge;
pub mod config;
pub mod error;
pub mod instance_lock;
pub mod mqtt;
pub mod zigbee;

#[cfg(test)]
mod testing;

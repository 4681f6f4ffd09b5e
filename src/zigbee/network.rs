//! Interface to the mesh network layer.
//!
//! The radio driver and mesh stack live behind [`NetworkLayer`]; the bridge
//! only issues cluster-level reads, writes, commands and reporting
//! configuration, and consumes [`NetworkEvent`](super::NetworkEvent)s from a
//! channel handed over at construction.

use super::clusters::ClusterCommand;
use super::types::{AttributeValue, DeviceDescriptor, Ieee, ReportingContract};
use async_trait::async_trait;
use thiserror::Error;

/// Failures reported by the network layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    /// The device did not answer within the request timeout.
    #[error("request timed out")]
    Timeout,

    /// The frame was sent but never acknowledged.
    #[error("no acknowledgement received")]
    NoAck,

    /// The device is known but cannot be reached (no route, asleep, gone).
    #[error("device unreachable")]
    Unreachable,

    /// The device rejected the request (unsupported attribute or command).
    #[error("unsupported attribute 0x{attribute:04x} on cluster 0x{cluster:04x}")]
    Unsupported { cluster: u16, attribute: u16 },

    /// The device is not in the network layer's database.
    #[error("unknown device {0}")]
    UnknownDevice(Ieee),

    /// The coordinator radio is not connected.
    #[error("network layer disconnected")]
    Disconnected,

    #[error("{0}")]
    Other(String),
}

impl NetworkError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, NetworkError::Timeout | NetworkError::NoAck)
    }
}

/// Cluster-level access to the mesh.
#[async_trait]
pub trait NetworkLayer: Send + Sync {
    /// Open (or reopen) the connection to the coordinator radio.
    async fn connect(&self) -> Result<(), NetworkError>;

    /// Release the coordinator radio.
    async fn disconnect(&self);

    /// IEEE address of the coordinator itself.
    fn coordinator_ieee(&self) -> Ieee;

    /// Devices persisted in the network layer's database.
    async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, NetworkError>;

    async fn read_attribute(
        &self,
        ieee: Ieee,
        endpoint: u8,
        cluster: u16,
        attribute: u16,
    ) -> Result<AttributeValue, NetworkError>;

    async fn write_attribute(
        &self,
        ieee: Ieee,
        endpoint: u8,
        cluster: u16,
        attribute: u16,
        value: AttributeValue,
    ) -> Result<(), NetworkError>;

    async fn issue_command(
        &self,
        ieee: Ieee,
        endpoint: u8,
        command: ClusterCommand,
    ) -> Result<(), NetworkError>;

    /// Install a reporting contract. Re-sending identical parameters must succeed.
    async fn configure_reporting(
        &self,
        ieee: Ieee,
        endpoint: u8,
        cluster: u16,
        attribute: u16,
        contract: ReportingContract,
    ) -> Result<(), NetworkError>;

    /// Open (`permit = true`) or close the pairing window.
    async fn set_permit_join(&self, permit: bool, duration_secs: u16) -> Result<(), NetworkError>;

    /// Ask a device to leave and forget it.
    async fn remove_device(&self, ieee: Ieee) -> Result<(), NetworkError>;
}

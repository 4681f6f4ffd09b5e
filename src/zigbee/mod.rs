//! Zigbee mesh side of the bridge.
//!
//! This module defines the data exchanged with the mesh network layer, the
//! ZCL identifiers the bridge understands, and a simulated coordinator.

pub mod clusters;
mod network;
pub mod simulated;
mod types;

pub use clusters::ClusterCommand;
pub use network::{NetworkError, NetworkLayer};
pub use simulated::SimulatedNetwork;
pub use types::{
    AttributeKey, AttributeValue, DeviceDescriptor, EndpointDescriptor, Ieee, NetworkEvent,
    ParseIeeeError, ReportingContract,
};

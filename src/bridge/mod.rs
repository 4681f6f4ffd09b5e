//! Bridging layer between the Zigbee mesh and MQTT.
//!
//! The [`Bridge`] orchestrator owns the device registry and lifecycle state.
//! Capability resolution, reporting configuration, command execution and
//! event translation each live in their own module and are driven by it.

pub mod capability;
pub mod command;
pub mod event;
mod orchestrator;
pub mod registry;
pub mod reporting;
mod router;
pub mod state;

pub use capability::{Capability, ResolvedCapabilities};
pub use command::{CommandResult, CommandSuccess, CommandTranslator, Control};
pub use event::{DeviceEvent, EventTranslator};
pub use orchestrator::{Bridge, BridgeHandle, parse_permit_join};
pub use registry::{DeviceEntry, Reachability, RegistryView, RegistryWriter};
pub use state::BridgeState;

use crate::zigbee::{Ieee, NetworkError};
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum BridgeError {
    #[error("Invalid payload: {0}")]
    Validation(String),

    #[error("Device not known: {0}")]
    DeviceUnknown(String),

    #[error("Device {ieee} does not support {feature}")]
    CapabilityUnsupported { ieee: Ieee, feature: String },

    #[error("Command to {ieee} timed out after {attempts} attempt(s)")]
    TransportTimeout { ieee: Ieee, attempts: u32 },

    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Reporting configuration incomplete for {ieee}: {missing} attribute(s) missing")]
    ConfigurationPartial { ieee: Ieee, missing: usize },

    #[error("Device {0} is unreachable")]
    DeviceUnreachable(Ieee),

    #[error("Command queue for {ieee} is full ({depth} pending)")]
    CommandQueueFull { ieee: Ieee, depth: usize },

    #[error("Command to {0} was cancelled")]
    Cancelled(Ieee),

    #[error("Startup failed: {0}")]
    StartupFailed(String),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Transport(#[from] crate::mqtt::TransportError),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),
}

impl BridgeError {
    /// Stable identifier used in published error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::Validation(_) => "validation_error",
            BridgeError::DeviceUnknown(_) => "device_unknown",
            BridgeError::CapabilityUnsupported { .. } => "capability_unsupported",
            BridgeError::TransportTimeout { .. } => "transport_timeout",
            BridgeError::TransportUnavailable(_) | BridgeError::Transport(_) => {
                "transport_unavailable"
            }
            BridgeError::ConfigurationPartial { .. } => "configuration_partial",
            BridgeError::DeviceUnreachable(_) => "device_unreachable",
            BridgeError::CommandQueueFull { .. } => "command_queue_full",
            BridgeError::Cancelled(_) => "cancelled",
            BridgeError::StartupFailed(_) => "startup_failed",
            BridgeError::Network(_) => "network_error",
            BridgeError::IoError(_) => "io_error",
            BridgeError::SerdeJsonError(_) => "validation_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_is_stable() {
        let ieee: Ieee = "00:11:22:33:44:55:66:77".parse().unwrap();
        assert_eq!(
            BridgeError::Validation("bad".into()).kind(),
            "validation_error"
        );
        assert_eq!(
            BridgeError::TransportTimeout { ieee, attempts: 3 }.kind(),
            "transport_timeout"
        );
        assert_eq!(
            BridgeError::TransportTimeout { ieee, attempts: 3 }.to_string(),
            "Command to 00:11:22:33:44:55:66:77 timed out after 3 attempt(s)"
        );
    }
}

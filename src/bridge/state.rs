//! Bridge lifecycle states.

use serde::Serialize;
use strum::Display;

/// Lifecycle of the bridge as a whole.
///
/// ```text
/// Starting -> Scanning -> Ready <-> Degraded -> Recovering -> Scanning
///        any state -> ShuttingDown
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BridgeState {
    Starting,
    Scanning,
    Ready,
    Degraded,
    Recovering,
    ShuttingDown,
}

impl BridgeState {
    /// Whether mesh traffic on behalf of MQTT clients is accepted.
    pub fn accepts_commands(self) -> bool {
        matches!(self, BridgeState::Scanning | BridgeState::Ready)
    }

    /// Whether the pairing window may be changed.
    pub fn accepts_permit_join(self) -> bool {
        matches!(self, BridgeState::Scanning | BridgeState::Ready)
    }

    /// `status` value of the coordinator status payload.
    pub fn coordinator_status(self) -> &'static str {
        match self {
            BridgeState::Starting => "starting",
            BridgeState::Scanning => "scanning",
            BridgeState::Ready => "online",
            BridgeState::Degraded => "degraded",
            BridgeState::Recovering => "recovering",
            BridgeState::ShuttingDown => "offline",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_snake_case() {
        assert_eq!(BridgeState::ShuttingDown.to_string(), "shutting_down");
        assert_eq!(BridgeState::Ready.to_string(), "ready");
    }

    #[test]
    fn test_only_live_states_accept_commands() {
        assert!(BridgeState::Ready.accepts_commands());
        assert!(BridgeState::Scanning.accepts_commands());
        assert!(!BridgeState::Degraded.accepts_commands());
        assert!(!BridgeState::Recovering.accepts_commands());
        assert!(!BridgeState::ShuttingDown.accepts_commands());
    }
}

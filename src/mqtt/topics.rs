//! Public MQTT topic layout.
//!
//! All topics hang off a configurable base (default `zigbee`). Per-device
//! feature topics follow `{base}/device/{ieee}/{feature}/{state|set}` and are
//! always derived, never stored.

use crate::zigbee::Ieee;
use std::fmt;
use std::str::FromStr;
use strum::{Display, EnumString};

pub const DEFAULT_BASE_TOPIC: &str = "zigbee";

/// Device feature as it appears in topic paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString)]
pub enum Feature {
    #[strum(to_string = "switch")]
    Switch,
    #[strum(to_string = "light")]
    Light,
    #[strum(to_string = "light/brightness")]
    Brightness,
    #[strum(to_string = "light/color")]
    Color,
    #[strum(to_string = "temperature")]
    Temperature,
    #[strum(to_string = "humidity")]
    Humidity,
    #[strum(to_string = "ias_zone")]
    IasZone,
}

impl Feature {
    /// Features that accept `set` messages.
    pub const CONTROLLABLE: [Feature; 4] = [
        Feature::Switch,
        Feature::Light,
        Feature::Brightness,
        Feature::Color,
    ];

    pub fn is_controllable(self) -> bool {
        Self::CONTROLLABLE.contains(&self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    State,
    Set,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::State => f.write_str("state"),
            Direction::Set => f.write_str("set"),
        }
    }
}

/// `{base}/device/{ieee}/{feature}/{direction}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicAddress<'a> {
    pub base: &'a str,
    pub ieee: Ieee,
    pub feature: Feature,
    pub direction: Direction,
}

impl fmt::Display for TopicAddress<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/device/{}/{}/{}",
            self.base, self.ieee, self.feature, self.direction
        )
    }
}

/// Inbound topic recognised by the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundTopic {
    PermitJoin,
    /// `set` message for a device feature. The address is kept raw so that
    /// malformed addresses can be reported as unknown devices.
    Control { ieee: String, feature: Feature },
    Remove { ieee: String },
}

/// Topic builder and parser for one base topic.
#[derive(Debug, Clone)]
pub struct Topics {
    base: String,
}

impl Topics {
    pub fn new(base: &str) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn address(&self, ieee: Ieee, feature: Feature, direction: Direction) -> String {
        TopicAddress {
            base: &self.base,
            ieee,
            feature,
            direction,
        }
        .to_string()
    }

    pub fn state(&self, ieee: Ieee, feature: Feature) -> String {
        self.address(ieee, feature, Direction::State)
    }

    pub fn permit_join(&self) -> String {
        format!("{}/permit_join", self.base)
    }

    pub fn permit_join_status(&self) -> String {
        format!("{}/permit_join/status", self.base)
    }

    pub fn coordinator_status(&self) -> String {
        format!("{}/coordinator/status", self.base)
    }

    pub fn device_joined(&self) -> String {
        format!("{}/device/joined", self.base)
    }

    pub fn device_left(&self) -> String {
        format!("{}/device/left", self.base)
    }

    pub fn device_status(&self, ieee: Ieee) -> String {
        format!("{}/device/{}/status", self.base, ieee)
    }

    /// Error echo topic; takes the raw address so unparsable ones are echoed too.
    pub fn device_error(&self, ieee: &str) -> String {
        format!("{}/device/{}/error", self.base, ieee)
    }

    /// Topic filters the bridge subscribes to.
    pub fn subscriptions(&self) -> Vec<String> {
        let mut topics = vec![self.permit_join()];
        topics.extend(
            Feature::CONTROLLABLE
                .iter()
                .map(|feature| format!("{}/device/+/{}/set", self.base, feature)),
        );
        topics.push(format!("{}/device/+/remove", self.base));
        topics
    }

    /// Classify an inbound topic. Returns `None` for topics the bridge ignores.
    pub fn parse(&self, topic: &str) -> Option<InboundTopic> {
        let rest = topic.strip_prefix(&self.base)?.strip_prefix('/')?;
        if rest == "permit_join" {
            return Some(InboundTopic::PermitJoin);
        }

        let rest = rest.strip_prefix("device/")?;
        let (ieee, path) = rest.split_once('/')?;
        if ieee.is_empty() {
            return None;
        }
        if path == "remove" {
            return Some(InboundTopic::Remove {
                ieee: ieee.to_string(),
            });
        }

        let feature = Feature::from_str(path.strip_suffix("/set")?).ok()?;
        feature.is_controllable().then(|| InboundTopic::Control {
            ieee: ieee.to_string(),
            feature,
        })
    }
}

impl Default for Topics {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_TOPIC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IEEE: Ieee = Ieee(0x0011_2233_4455_6677);

    #[test]
    fn test_topic_address() {
        let topics = Topics::default();
        assert_eq!(
            topics.state(IEEE, Feature::Switch),
            "zigbee/device/00:11:22:33:44:55:66:77/switch/state"
        );
        assert_eq!(
            topics.address(IEEE, Feature::Brightness, Direction::Set),
            "zigbee/device/00:11:22:33:44:55:66:77/light/brightness/set"
        );
        assert_eq!(
            topics.state(IEEE, Feature::IasZone),
            "zigbee/device/00:11:22:33:44:55:66:77/ias_zone/state"
        );
    }

    #[test]
    fn test_parse_control_topics() {
        let topics = Topics::default();
        assert_eq!(
            topics.parse("zigbee/device/00:11:22:33:44:55:66:77/light/color/set"),
            Some(InboundTopic::Control {
                ieee: "00:11:22:33:44:55:66:77".into(),
                feature: Feature::Color,
            })
        );
        assert_eq!(
            topics.parse("zigbee/device/abc/switch/set"),
            Some(InboundTopic::Control {
                ieee: "abc".into(),
                feature: Feature::Switch,
            })
        );
        assert_eq!(topics.parse("zigbee/permit_join"), Some(InboundTopic::PermitJoin));
        assert_eq!(
            topics.parse("zigbee/device/abc/remove"),
            Some(InboundTopic::Remove { ieee: "abc".into() })
        );
    }

    #[test]
    fn test_parse_ignores_other_topics() {
        let topics = Topics::default();
        assert_eq!(topics.parse("zigbee/device/abc/switch/state"), None);
        assert_eq!(topics.parse("zigbee/device/abc/temperature/set"), None);
        assert_eq!(topics.parse("zigbee/device/abc/dance/set"), None);
        assert_eq!(topics.parse("zigbee/coordinator/status"), None);
        assert_eq!(topics.parse("zigbee2mqtt/device/abc/switch/set"), None);
        assert_eq!(topics.parse("zigbee/device//switch/set"), None);
    }

    #[test]
    fn test_subscriptions_with_custom_base() {
        let topics = Topics::new("home/zb/");
        let subs = topics.subscriptions();
        assert!(subs.contains(&"home/zb/permit_join".to_string()));
        assert!(subs.contains(&"home/zb/device/+/light/brightness/set".to_string()));
        assert!(subs.contains(&"home/zb/device/+/remove".to_string()));
        assert_eq!(subs.len(), 6);
    }
}

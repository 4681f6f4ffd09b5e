//! Data types exchanged with the mesh network layer.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Stable 64-bit IEEE address of a Zigbee device.
///
/// Rendered as colon-separated lowercase hex, e.g. `00:11:22:33:44:55:66:77`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ieee(pub u64);

impl fmt::Display for Ieee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0.to_be_bytes();
        for (i, byte) in bytes.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Error returned when an IEEE address string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid IEEE address: {0}")]
pub struct ParseIeeeError(pub String);

impl FromStr for Ieee {
    type Err = ParseIeeeError;

    /// Accepts `00:11:22:33:44:55:66:77`, `0011223344556677` and `0x0011223344556677`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let hex: String = if trimmed.contains(':') {
            let parts: Vec<&str> = trimmed.split(':').collect();
            if parts.len() != 8 || parts.iter().any(|p| p.len() != 2) {
                return Err(ParseIeeeError(s.to_string()));
            }
            parts.concat()
        } else {
            trimmed
                .strip_prefix("0x")
                .or_else(|| trimmed.strip_prefix("0X"))
                .unwrap_or(trimmed)
                .to_string()
        };

        if hex.len() != 16 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ParseIeeeError(s.to_string()));
        }

        u64::from_str_radix(&hex, 16)
            .map(Ieee)
            .map_err(|_| ParseIeeeError(s.to_string()))
    }
}

impl Serialize for Ieee {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Ieee {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One application endpoint of a device as reported by the network layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub id: u8,
    pub profile_id: u16,
    pub device_type: u16,
    #[serde(default)]
    pub in_clusters: Vec<u16>,
    #[serde(default)]
    pub out_clusters: Vec<u16>,
    /// ColorCapabilities bitmap (Color Control attribute 0x400A) when known.
    #[serde(default)]
    pub color_capabilities: Option<u16>,
}

impl EndpointDescriptor {
    pub fn has_in_cluster(&self, cluster: u16) -> bool {
        self.in_clusters.contains(&cluster)
    }
}

/// Device topology as persisted by the network layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub ieee: Ieee,
    #[serde(default)]
    pub nwk: u16,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub endpoints: Vec<EndpointDescriptor>,
}

/// Attribute value as carried by reports, reads and writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Ieee(Ieee),
    Text(String),
}

impl AttributeValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(b) => Some(*b),
            AttributeValue::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttributeValue::Int(i) => Some(*i),
            AttributeValue::Bool(b) => Some(i64::from(*b)),
            AttributeValue::Float(f) if f.is_finite() => Some(f.round() as i64),
            _ => None,
        }
    }
}

/// Addresses a single attribute on a device endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttributeKey {
    pub endpoint: u8,
    pub cluster: u16,
    pub attribute: u16,
}

impl AttributeKey {
    pub const fn new(endpoint: u8, cluster: u16, attribute: u16) -> Self {
        Self {
            endpoint,
            cluster,
            attribute,
        }
    }
}

/// Attribute-reporting parameters installed on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReportingContract {
    /// Minimum reporting interval in seconds.
    pub min_interval: u16,
    /// Maximum reporting interval in seconds.
    pub max_interval: u16,
    /// Smallest change (in raw attribute units) that triggers a report.
    pub reportable_change: u32,
}

impl ReportingContract {
    pub const fn new(min_interval: u16, max_interval: u16, reportable_change: u32) -> Self {
        Self {
            min_interval,
            max_interval,
            reportable_change,
        }
    }
}

/// Notification emitted by the network layer.
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    /// A device joined (or rejoined) the mesh.
    Joined(DeviceDescriptor),
    /// A device announced that it left the mesh.
    Left { ieee: Ieee },
    /// The network layer considers a device unreachable.
    Unavailable { ieee: Ieee },
    /// A device was removed from the network layer's database.
    Removed { ieee: Ieee },
    /// An attribute report or read response.
    AttributeUpdated {
        ieee: Ieee,
        key: AttributeKey,
        value: AttributeValue,
    },
    /// IAS zone status change notification.
    ZoneAlarm {
        ieee: Ieee,
        endpoint: u8,
        zone_status: u16,
    },
    /// Connection to the coordinator radio was lost.
    ConnectionLost { reason: String },
    /// Connection to the coordinator radio came back on its own.
    ConnectionRestored,
}

impl NetworkEvent {
    /// The device this event refers to, if any.
    pub fn ieee(&self) -> Option<Ieee> {
        match self {
            NetworkEvent::Joined(desc) => Some(desc.ieee),
            NetworkEvent::Left { ieee }
            | NetworkEvent::Unavailable { ieee }
            | NetworkEvent::Removed { ieee }
            | NetworkEvent::AttributeUpdated { ieee, .. }
            | NetworkEvent::ZoneAlarm { ieee, .. } => Some(*ieee),
            NetworkEvent::ConnectionLost { .. } | NetworkEvent::ConnectionRestored => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ieee_display() {
        let ieee = Ieee(0x0011_2233_4455_6677);
        assert_eq!(ieee.to_string(), "00:11:22:33:44:55:66:77");
    }

    #[test]
    fn test_ieee_parse_forms() {
        let expected = Ieee(0xa4c1_3800_1234_abcd);
        assert_eq!("a4:c1:38:00:12:34:ab:cd".parse::<Ieee>().unwrap(), expected);
        assert_eq!("A4:C1:38:00:12:34:AB:CD".parse::<Ieee>().unwrap(), expected);
        assert_eq!("a4c138001234abcd".parse::<Ieee>().unwrap(), expected);
        assert_eq!("0xa4c138001234abcd".parse::<Ieee>().unwrap(), expected);
    }

    #[test]
    fn test_ieee_parse_rejects_garbage() {
        assert!("".parse::<Ieee>().is_err());
        assert!("00:11:22".parse::<Ieee>().is_err());
        assert!("zz:11:22:33:44:55:66:77".parse::<Ieee>().is_err());
        assert!("0011223344556677ff".parse::<Ieee>().is_err());
        assert!("0:11:22:33:44:55:66:777".parse::<Ieee>().is_err());
    }

    #[test]
    fn test_descriptor_from_json() {
        let json = r#"{
            "ieee": "00:11:22:33:44:55:66:77",
            "nwk": 4660,
            "model": "plug",
            "endpoints": [
                {"id": 1, "profile_id": 260, "device_type": 266, "in_clusters": [0, 6]}
            ]
        }"#;
        let desc: DeviceDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(desc.ieee, Ieee(0x0011_2233_4455_6677));
        assert_eq!(desc.manufacturer, None);
        assert!(desc.endpoints[0].has_in_cluster(6));
        assert_eq!(desc.endpoints[0].color_capabilities, None);
    }

    #[test]
    fn test_attribute_value_conversions() {
        assert_eq!(AttributeValue::Int(1).as_bool(), Some(true));
        assert_eq!(AttributeValue::Bool(false).as_i64(), Some(0));
        assert_eq!(AttributeValue::Float(21.6).as_i64(), Some(22));
        assert_eq!(AttributeValue::Text("x".into()).as_bool(), None);
    }
}

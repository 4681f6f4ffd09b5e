//! Mesh events to MQTT publications.
//!
//! Raw attribute values are normalized to public units, routed to the state
//! topic of the feature that owns them and coalesced: an identical value for
//! the same attribute within the coalescing window is published once.

use super::capability::ResolvedCapabilities;
use super::registry::{DeviceEntry, RegistryView};
use crate::error::BridgeError;
use crate::mqtt::{Feature, Publication, Topics};
use crate::zigbee::clusters::{
    self, attribute_name, color_control, ias_zone, level_control, on_off, relative_humidity,
    temperature_measurement,
};
use crate::zigbee::{AttributeKey, AttributeValue, Ieee};
use chrono::Utc;
use log::debug;
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Device-level event handed to the translator by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// A device was admitted; carries the registry entry after admission.
    Joined(DeviceEntry),
    Online { ieee: Ieee },
    Left { ieee: Ieee },
    Unavailable { ieee: Ieee },
    Removed { ieee: Ieee },
    AttributeUpdated {
        ieee: Ieee,
        key: AttributeKey,
        value: AttributeValue,
    },
    ZoneAlarm {
        ieee: Ieee,
        endpoint: u8,
        zone_status: u16,
    },
}

struct LastPublished {
    value: AttributeValue,
    at: Instant,
}

/// Turns device events into publications.
pub struct EventTranslator {
    topics: Topics,
    registry: RegistryView,
    coalesce_window: Duration,
    recent: Mutex<HashMap<(Ieee, AttributeKey), LastPublished>>,
}

impl EventTranslator {
    pub fn new(topics: Topics, registry: RegistryView, coalesce_window: Duration) -> Self {
        Self {
            topics,
            registry,
            coalesce_window,
            recent: Mutex::new(HashMap::new()),
        }
    }

    /// Publication for an event, or `None` when nothing should be published.
    pub fn handle(&self, event: &DeviceEvent) -> Option<Publication> {
        match event {
            DeviceEvent::Joined(entry) => Some(self.joined(entry)),
            DeviceEvent::Online { ieee } => Some(self.status(*ieee, "online", None)),
            DeviceEvent::Left { ieee } => {
                self.forget(*ieee);
                Some(self.status(*ieee, "offline", Some("left")))
            }
            DeviceEvent::Unavailable { ieee } => {
                self.forget(*ieee);
                Some(self.status(*ieee, "offline", Some("unavailable")))
            }
            DeviceEvent::Removed { ieee } => {
                self.forget(*ieee);
                Some(self.status(*ieee, "removed", None))
            }
            DeviceEvent::AttributeUpdated { ieee, key, value } => {
                self.attribute(*ieee, *key, value)
            }
            DeviceEvent::ZoneAlarm {
                ieee,
                endpoint,
                zone_status,
            } => self.attribute(
                *ieee,
                AttributeKey::new(*endpoint, ias_zone::CLUSTER_ID, ias_zone::ATTR_ZONE_STATUS),
                &AttributeValue::Int(i64::from(*zone_status)),
            ),
        }
    }

    /// `{base}/device/left` announcement accompanying a leave.
    pub fn left_announcement(&self, ieee: Ieee) -> Publication {
        Publication::new(
            self.topics.device_left(),
            &json!({
                "event": "device_left",
                "ieee": ieee,
                "timestamp": Utc::now().to_rfc3339(),
            }),
            false,
        )
    }

    /// Error echo for a rejected or failed request.
    pub fn error(&self, ieee: &str, topic: Option<&str>, error: &BridgeError) -> Publication {
        Publication::new(
            self.topics.device_error(ieee),
            &json!({
                "error": error.kind(),
                "message": error.to_string(),
                "topic": topic,
                "timestamp": Utc::now().to_rfc3339(),
            }),
            false,
        )
    }

    fn forget(&self, ieee: Ieee) {
        self.recent.lock().retain(|(device, _), _| *device != ieee);
    }

    fn status(&self, ieee: Ieee, status: &str, reason: Option<&str>) -> Publication {
        let mut payload = json!({
            "ieee": ieee,
            "status": status,
            "timestamp": Utc::now().to_rfc3339(),
        });
        if let Some(reason) = reason {
            payload["reason"] = json!(reason);
        }
        Publication::new(self.topics.device_status(ieee), &payload, true)
    }

    fn joined(&self, entry: &DeviceEntry) -> Publication {
        let descriptor = &entry.descriptor;
        let endpoints: Map<String, Value> = descriptor
            .endpoints
            .iter()
            .map(|ep| {
                (
                    ep.id.to_string(),
                    json!({
                        "profile_id": format!("0x{:04x}", ep.profile_id),
                        "device_type": format!("0x{:04x}", ep.device_type),
                        "in_clusters": ep.in_clusters.iter().map(|c| format!("0x{:04x}", c)).collect::<Vec<_>>(),
                        "out_clusters": ep.out_clusters.iter().map(|c| format!("0x{:04x}", c)).collect::<Vec<_>>(),
                    }),
                )
            })
            .collect();

        Publication::new(
            self.topics.device_joined(),
            &json!({
                "event": "device_joined",
                "ieee": descriptor.ieee,
                "nwk": format!("0x{:04x}", descriptor.nwk),
                "manufacturer": descriptor.manufacturer,
                "model": descriptor.model,
                "capabilities": entry.capabilities.set(),
                "endpoints": endpoints,
                "configuration": entry.configuration,
                "timestamp": Utc::now().to_rfc3339(),
            }),
            true,
        )
    }

    fn attribute(&self, ieee: Ieee, key: AttributeKey, value: &AttributeValue) -> Option<Publication> {
        let Some(capabilities) = self.registry.capabilities(ieee) else {
            debug!("[Event] Ignoring report from unknown device {}", ieee);
            return None;
        };
        let Some((feature, fields)) = normalize(&capabilities, key, value) else {
            debug!(
                "[Event] No public mapping for 0x{:04x}/0x{:04x} on {}",
                key.cluster, key.attribute, ieee
            );
            return None;
        };

        if self.is_duplicate(ieee, key, value) {
            debug!(
                "[Event] Coalesced {} {} on {}",
                feature,
                attribute_name(key.cluster, key.attribute),
                ieee
            );
            return None;
        }

        let mut payload = fields;
        payload.insert("ieee".into(), json!(ieee));
        payload.insert(
            "attribute".into(),
            json!(attribute_name(key.cluster, key.attribute)),
        );
        payload.insert("timestamp".into(), json!(Utc::now().to_rfc3339()));

        Some(Publication::new(
            self.topics.state(ieee, feature),
            &Value::Object(payload),
            true,
        ))
    }

    /// Records the value as published unless it repeats the last one within the window.
    fn is_duplicate(&self, ieee: Ieee, key: AttributeKey, value: &AttributeValue) -> bool {
        let now = Instant::now();
        let mut recent = self.recent.lock();
        if let Some(last) = recent.get(&(ieee, key))
            && last.value == *value
            && now.duration_since(last.at) < self.coalesce_window
        {
            return true;
        }
        recent.insert(
            (ieee, key),
            LastPublished {
                value: value.clone(),
                at: now,
            },
        );
        false
    }
}

/// Map a raw attribute to its feature and public payload fields.
fn normalize(
    capabilities: &ResolvedCapabilities,
    key: AttributeKey,
    value: &AttributeValue,
) -> Option<(Feature, Map<String, Value>)> {
    let mut fields = Map::new();
    let feature = match (key.cluster, key.attribute) {
        (on_off::CLUSTER_ID, on_off::ATTR_ON_OFF) => {
            let on = value.as_bool()?;
            fields.insert("state".into(), json!(if on { "on" } else { "off" }));
            capabilities.on_off_feature()
        }
        (level_control::CLUSTER_ID, level_control::ATTR_CURRENT_LEVEL) => {
            fields.insert("brightness".into(), json!(value.as_i64()?.clamp(0, 255)));
            Feature::Brightness
        }
        (color_control::CLUSTER_ID, color_control::ATTR_CURRENT_HUE) => {
            fields.insert("hue".into(), json!(clusters::hue_from_zcl(value.as_i64()?)));
            Feature::Color
        }
        (color_control::CLUSTER_ID, color_control::ATTR_CURRENT_SATURATION) => {
            fields.insert(
                "saturation".into(),
                json!(clusters::saturation_from_zcl(value.as_i64()?)),
            );
            Feature::Color
        }
        (color_control::CLUSTER_ID, color_control::ATTR_CURRENT_X) => {
            fields.insert("x".into(), json!(clusters::xy_from_zcl(value.as_i64()?)));
            Feature::Color
        }
        (color_control::CLUSTER_ID, color_control::ATTR_CURRENT_Y) => {
            fields.insert("y".into(), json!(clusters::xy_from_zcl(value.as_i64()?)));
            Feature::Color
        }
        (color_control::CLUSTER_ID, color_control::ATTR_COLOR_TEMPERATURE) => {
            let mireds = value.as_i64()?;
            fields.insert("color_temp".into(), json!(mireds));
            fields.insert(
                "color_temp_kelvin".into(),
                json!(clusters::mireds_to_kelvin(mireds)),
            );
            Feature::Color
        }
        (temperature_measurement::CLUSTER_ID, temperature_measurement::ATTR_MEASURED_VALUE) => {
            fields.insert(
                "temperature".into(),
                json!(clusters::centi_to_units(value.as_i64()?)),
            );
            Feature::Temperature
        }
        (relative_humidity::CLUSTER_ID, relative_humidity::ATTR_MEASURED_VALUE) => {
            fields.insert(
                "humidity".into(),
                json!(clusters::centi_to_units(value.as_i64()?)),
            );
            Feature::Humidity
        }
        (ias_zone::CLUSTER_ID, ias_zone::ATTR_ZONE_STATUS) => {
            let status = u16::try_from(value.as_i64()?).ok()?;
            fields.insert("zone_status".into(), json!(status));
            fields.insert("alarm".into(), json!(clusters::zone_in_alarm(status)));
            fields.insert("flags".into(), json!(clusters::zone_status_flags(status)));
            Feature::IasZone
        }
        _ => return None,
    };
    Some((feature, fields))
}

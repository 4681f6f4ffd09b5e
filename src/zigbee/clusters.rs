//! Zigbee Cluster Library identifiers and unit conversions.
//!
//! Only the clusters the bridge understands are listed here. Attribute
//! values travel in ZCL units on the mesh (hue 0..=254, x/y 0..=65535,
//! temperature in centidegrees) and in public units on MQTT.

use serde::{Deserialize, Serialize};

/// Home Automation profile.
pub const PROFILE_HOME_AUTOMATION: u16 = 0x0104;
/// Zigbee Light Link profile.
pub const PROFILE_LIGHT_LINK: u16 = 0xC05E;

pub mod on_off {
    pub const CLUSTER_ID: u16 = 0x0006;
    pub const ATTR_ON_OFF: u16 = 0x0000;
    pub const CMD_OFF: u8 = 0x00;
    pub const CMD_ON: u8 = 0x01;
}

pub mod level_control {
    pub const CLUSTER_ID: u16 = 0x0008;
    pub const ATTR_CURRENT_LEVEL: u16 = 0x0000;
    pub const CMD_MOVE_TO_LEVEL_WITH_ON_OFF: u8 = 0x04;
}

pub mod color_control {
    pub const CLUSTER_ID: u16 = 0x0300;
    pub const ATTR_CURRENT_HUE: u16 = 0x0000;
    pub const ATTR_CURRENT_SATURATION: u16 = 0x0001;
    pub const ATTR_CURRENT_X: u16 = 0x0003;
    pub const ATTR_CURRENT_Y: u16 = 0x0004;
    pub const ATTR_COLOR_TEMPERATURE: u16 = 0x0007;
    pub const ATTR_COLOR_CAPABILITIES: u16 = 0x400A;
    pub const CMD_MOVE_TO_HUE_AND_SATURATION: u8 = 0x06;
    pub const CMD_MOVE_TO_COLOR: u8 = 0x07;

    /// ColorCapabilities bit: hue/saturation supported.
    pub const CAP_HUE_SATURATION: u16 = 1 << 0;
    /// ColorCapabilities bit: CIE xy supported.
    pub const CAP_XY: u16 = 1 << 3;
}

pub mod temperature_measurement {
    pub const CLUSTER_ID: u16 = 0x0402;
    pub const ATTR_MEASURED_VALUE: u16 = 0x0000;
}

pub mod relative_humidity {
    pub const CLUSTER_ID: u16 = 0x0405;
    pub const ATTR_MEASURED_VALUE: u16 = 0x0000;
}

pub mod ias_zone {
    pub const CLUSTER_ID: u16 = 0x0500;
    pub const ATTR_ZONE_STATUS: u16 = 0x0002;
    pub const ATTR_IAS_CIE_ADDRESS: u16 = 0x0010;
}

/// Human readable attribute name used in published payloads.
pub fn attribute_name(cluster: u16, attribute: u16) -> &'static str {
    match (cluster, attribute) {
        (on_off::CLUSTER_ID, on_off::ATTR_ON_OFF) => "on_off",
        (level_control::CLUSTER_ID, level_control::ATTR_CURRENT_LEVEL) => "current_level",
        (color_control::CLUSTER_ID, color_control::ATTR_CURRENT_HUE) => "current_hue",
        (color_control::CLUSTER_ID, color_control::ATTR_CURRENT_SATURATION) => {
            "current_saturation"
        }
        (color_control::CLUSTER_ID, color_control::ATTR_CURRENT_X) => "current_x",
        (color_control::CLUSTER_ID, color_control::ATTR_CURRENT_Y) => "current_y",
        (color_control::CLUSTER_ID, color_control::ATTR_COLOR_TEMPERATURE) => "color_temperature",
        (color_control::CLUSTER_ID, color_control::ATTR_COLOR_CAPABILITIES) => {
            "color_capabilities"
        }
        (temperature_measurement::CLUSTER_ID, temperature_measurement::ATTR_MEASURED_VALUE)
        | (relative_humidity::CLUSTER_ID, relative_humidity::ATTR_MEASURED_VALUE) => {
            "measured_value"
        }
        (ias_zone::CLUSTER_ID, ias_zone::ATTR_ZONE_STATUS) => "zone_status",
        (ias_zone::CLUSTER_ID, ias_zone::ATTR_IAS_CIE_ADDRESS) => "cie_addr",
        _ => "unknown",
    }
}

/// A cluster-specific command sent to a device endpoint, in ZCL units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ClusterCommand {
    On,
    Off,
    MoveToLevelWithOnOff {
        level: u8,
        transition_time: u16,
    },
    MoveToHueAndSaturation {
        hue: u8,
        saturation: u8,
        transition_time: u16,
    },
    MoveToColor {
        x: u16,
        y: u16,
        transition_time: u16,
    },
}

impl ClusterCommand {
    pub fn cluster_id(&self) -> u16 {
        match self {
            ClusterCommand::On | ClusterCommand::Off => on_off::CLUSTER_ID,
            ClusterCommand::MoveToLevelWithOnOff { .. } => level_control::CLUSTER_ID,
            ClusterCommand::MoveToHueAndSaturation { .. } | ClusterCommand::MoveToColor { .. } => {
                color_control::CLUSTER_ID
            }
        }
    }

    pub fn command_id(&self) -> u8 {
        match self {
            ClusterCommand::On => on_off::CMD_ON,
            ClusterCommand::Off => on_off::CMD_OFF,
            ClusterCommand::MoveToLevelWithOnOff { .. } => {
                level_control::CMD_MOVE_TO_LEVEL_WITH_ON_OFF
            }
            ClusterCommand::MoveToHueAndSaturation { .. } => {
                color_control::CMD_MOVE_TO_HUE_AND_SATURATION
            }
            ClusterCommand::MoveToColor { .. } => color_control::CMD_MOVE_TO_COLOR,
        }
    }

    /// ZCL payload bytes (little endian, as sent on the wire).
    pub fn payload(&self) -> Vec<u8> {
        match *self {
            ClusterCommand::On | ClusterCommand::Off => Vec::new(),
            ClusterCommand::MoveToLevelWithOnOff {
                level,
                transition_time,
            } => {
                let mut bytes = vec![level];
                bytes.extend_from_slice(&transition_time.to_le_bytes());
                bytes
            }
            ClusterCommand::MoveToHueAndSaturation {
                hue,
                saturation,
                transition_time,
            } => {
                let mut bytes = vec![hue, saturation];
                bytes.extend_from_slice(&transition_time.to_le_bytes());
                bytes
            }
            ClusterCommand::MoveToColor {
                x,
                y,
                transition_time,
            } => {
                let mut bytes = Vec::with_capacity(6);
                bytes.extend_from_slice(&x.to_le_bytes());
                bytes.extend_from_slice(&y.to_le_bytes());
                bytes.extend_from_slice(&transition_time.to_le_bytes());
                bytes
            }
        }
    }
}

/// Degrees (0..360) to ZCL hue (0..=254).
pub fn hue_to_zcl(degrees: u16) -> u8 {
    ((u32::from(degrees % 360) * 254 + 180) / 360) as u8
}

/// ZCL hue (0..=254) to degrees.
pub fn hue_from_zcl(raw: i64) -> u16 {
    let raw = raw.clamp(0, 254) as u32;
    ((raw * 360 + 127) / 254) as u16 % 360
}

/// Percent (0..=100) to ZCL saturation (0..=254).
pub fn saturation_to_zcl(percent: u8) -> u8 {
    ((u32::from(percent.min(100)) * 254 + 50) / 100) as u8
}

/// ZCL saturation (0..=254) to percent.
pub fn saturation_from_zcl(raw: i64) -> u8 {
    let raw = raw.clamp(0, 254) as u32;
    ((raw * 100 + 127) / 254) as u8
}

/// CIE coordinate (0.0..=1.0) to ZCL (0..=65535). The ZCL caps usable values at 0xFEFF.
pub fn xy_to_zcl(value: f64) -> u16 {
    (value.clamp(0.0, 1.0) * 65535.0).round().min(f64::from(0xFEFF_u16)) as u16
}

/// ZCL xy (0..=65535) to CIE coordinate rounded to four decimals.
pub fn xy_from_zcl(raw: i64) -> f64 {
    let value = raw.clamp(0, 65535) as f64 / 65535.0;
    (value * 10_000.0).round() / 10_000.0
}

/// Color temperature in mireds to kelvin.
pub fn mireds_to_kelvin(mireds: i64) -> Option<u32> {
    if mireds <= 0 {
        return None;
    }
    Some((1_000_000 / mireds) as u32)
}

/// Hundredths (temperature and humidity measured values) to units.
pub fn centi_to_units(raw: i64) -> f64 {
    raw as f64 / 100.0
}

/// IAS zone status bits and their published names.
pub const ZONE_STATUS_FLAGS: [(u16, &str); 8] = [
    (0x0001, "alarm1"),
    (0x0002, "alarm2"),
    (0x0004, "tamper"),
    (0x0008, "battery"),
    (0x0010, "supervision_reports"),
    (0x0020, "restore_reports"),
    (0x0040, "trouble"),
    (0x0080, "ac_mains"),
];

/// Decode the set flags of an IAS zone status bitmap.
pub fn zone_status_flags(status: u16) -> Vec<&'static str> {
    ZONE_STATUS_FLAGS
        .iter()
        .filter(|(bit, _)| status & bit != 0)
        .map(|(_, name)| *name)
        .collect()
}

/// Whether either alarm bit is set.
pub fn zone_in_alarm(status: u16) -> bool {
    status & 0x0003 != 0
}

//! Capability resolution from device topology.
//!
//! [`resolve`] is a pure function of a device's endpoint descriptors. It is
//! re-run on every topology change, so it never fails and always produces the
//! same result for the same input.

use crate::mqtt::Feature;
use crate::zigbee::clusters::{
    PROFILE_HOME_AUTOMATION, PROFILE_LIGHT_LINK, color_control, ias_zone, level_control, on_off,
    relative_humidity, temperature_measurement,
};
use crate::zigbee::{AttributeKey, EndpointDescriptor, ReportingContract};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use strum::{Display, EnumIter};

/// Something a device can do, as exposed on MQTT.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Capability {
    Switch,
    LightOnOff,
    LightDimmable,
    LightColorHs,
    LightColorXy,
    Temperature,
    Humidity,
    Zone,
}

/// Endpoint and cluster to address for a capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterAddress {
    pub endpoint: u8,
    pub cluster: u16,
}

/// An attribute whose reports a capability depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportedAttribute {
    pub cluster: u16,
    pub attribute: u16,
    pub contract: ReportingContract,
}

/// Static description of a capability.
#[derive(Debug)]
pub struct CapabilitySpec {
    pub capability: Capability,
    /// Cluster commands are sent to.
    pub cluster: u16,
    /// Features this capability serves on MQTT.
    pub features: &'static [Feature],
    pub reported: &'static [ReportedAttribute],
}

/// Report on any change, immediately.
const REPORT_IMMEDIATE: ReportingContract = ReportingContract::new(0, 900, 1);
/// Report on any change, at most once per second.
const REPORT_ASAP: ReportingContract = ReportingContract::new(1, 900, 1);
/// 0.5 °C threshold.
const REPORT_TEMPERATURE: ReportingContract = ReportingContract::new(30, 900, 50);
/// 1 % threshold.
const REPORT_HUMIDITY: ReportingContract = ReportingContract::new(30, 900, 100);

const ON_OFF_REPORT: ReportedAttribute = ReportedAttribute {
    cluster: on_off::CLUSTER_ID,
    attribute: on_off::ATTR_ON_OFF,
    contract: REPORT_IMMEDIATE,
};

const fn color_report(attribute: u16) -> ReportedAttribute {
    ReportedAttribute {
        cluster: color_control::CLUSTER_ID,
        attribute,
        contract: REPORT_ASAP,
    }
}

pub const CAPABILITY_TABLE: [CapabilitySpec; 8] = [
    CapabilitySpec {
        capability: Capability::Switch,
        cluster: on_off::CLUSTER_ID,
        features: &[Feature::Switch],
        reported: &[ON_OFF_REPORT],
    },
    CapabilitySpec {
        capability: Capability::LightOnOff,
        cluster: on_off::CLUSTER_ID,
        features: &[Feature::Light],
        reported: &[ON_OFF_REPORT],
    },
    CapabilitySpec {
        capability: Capability::LightDimmable,
        cluster: level_control::CLUSTER_ID,
        features: &[Feature::Light, Feature::Brightness],
        reported: &[
            ON_OFF_REPORT,
            ReportedAttribute {
                cluster: level_control::CLUSTER_ID,
                attribute: level_control::ATTR_CURRENT_LEVEL,
                contract: REPORT_ASAP,
            },
        ],
    },
    CapabilitySpec {
        capability: Capability::LightColorHs,
        cluster: color_control::CLUSTER_ID,
        features: &[Feature::Color],
        reported: &[
            color_report(color_control::ATTR_CURRENT_HUE),
            color_report(color_control::ATTR_CURRENT_SATURATION),
        ],
    },
    CapabilitySpec {
        capability: Capability::LightColorXy,
        cluster: color_control::CLUSTER_ID,
        features: &[Feature::Color],
        reported: &[
            color_report(color_control::ATTR_CURRENT_X),
            color_report(color_control::ATTR_CURRENT_Y),
        ],
    },
    CapabilitySpec {
        capability: Capability::Temperature,
        cluster: temperature_measurement::CLUSTER_ID,
        features: &[Feature::Temperature],
        reported: &[ReportedAttribute {
            cluster: temperature_measurement::CLUSTER_ID,
            attribute: temperature_measurement::ATTR_MEASURED_VALUE,
            contract: REPORT_TEMPERATURE,
        }],
    },
    CapabilitySpec {
        capability: Capability::Humidity,
        cluster: relative_humidity::CLUSTER_ID,
        features: &[Feature::Humidity],
        reported: &[ReportedAttribute {
            cluster: relative_humidity::CLUSTER_ID,
            attribute: relative_humidity::ATTR_MEASURED_VALUE,
            contract: REPORT_HUMIDITY,
        }],
    },
    CapabilitySpec {
        capability: Capability::Zone,
        cluster: ias_zone::CLUSTER_ID,
        features: &[Feature::IasZone],
        reported: &[ReportedAttribute {
            cluster: ias_zone::CLUSTER_ID,
            attribute: ias_zone::ATTR_ZONE_STATUS,
            contract: REPORT_IMMEDIATE,
        }],
    },
];

impl Capability {
    pub fn spec(self) -> &'static CapabilitySpec {
        &CAPABILITY_TABLE[self as usize]
    }
}

/// Clusters the resolver looks at.
const RECOGNIZED_CLUSTERS: [u16; 6] = [
    on_off::CLUSTER_ID,
    level_control::CLUSTER_ID,
    color_control::CLUSTER_ID,
    temperature_measurement::CLUSTER_ID,
    relative_humidity::CLUSTER_ID,
    ias_zone::CLUSTER_ID,
];

/// HA and ZLL device types that are lights rather than switches or outlets.
fn is_light_device_type(profile_id: u16, device_type: u16) -> bool {
    match profile_id {
        PROFILE_HOME_AUTOMATION => {
            matches!(device_type, 0x0100 | 0x0101 | 0x0102 | 0x010C | 0x010D)
        }
        PROFILE_LIGHT_LINK => {
            matches!(device_type, 0x0000 | 0x0100 | 0x0200 | 0x0210 | 0x0220)
        }
        _ => false,
    }
}

/// Capability set of a device together with the addresses to use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedCapabilities {
    capabilities: BTreeMap<Capability, ClusterAddress>,
    /// First endpoint (by id) hosting each recognized cluster.
    cluster_endpoints: BTreeMap<u16, u8>,
}

impl ResolvedCapabilities {
    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.capabilities.contains_key(&capability)
    }

    pub fn address(&self, capability: Capability) -> Option<ClusterAddress> {
        self.capabilities.get(&capability).copied()
    }

    /// Endpoint to use for a recognized cluster.
    pub fn endpoint_for(&self, cluster: u16) -> Option<u8> {
        self.cluster_endpoints.get(&cluster).copied()
    }

    pub fn set(&self) -> BTreeSet<Capability> {
        self.capabilities.keys().copied().collect()
    }

    /// Capabilities of this device that serve a feature.
    pub fn for_feature(&self, feature: Feature) -> Vec<Capability> {
        self.capabilities
            .keys()
            .copied()
            .filter(|c| c.spec().features.contains(&feature))
            .collect()
    }

    pub fn supports_feature(&self, feature: Feature) -> bool {
        !self.for_feature(feature).is_empty()
    }

    /// Feature that carries the On/Off state of this device.
    pub fn on_off_feature(&self) -> Feature {
        if self.contains(Capability::LightOnOff) || self.contains(Capability::LightDimmable) {
            Feature::Light
        } else {
            Feature::Switch
        }
    }

    /// Every attribute report the capability set depends on, one entry per attribute.
    pub fn implied_contracts(&self) -> Vec<(AttributeKey, ReportingContract)> {
        let mut contracts = BTreeMap::new();
        for capability in self.capabilities.keys() {
            for reported in capability.spec().reported {
                if let Some(endpoint) = self.endpoint_for(reported.cluster) {
                    contracts
                        .entry(AttributeKey::new(endpoint, reported.cluster, reported.attribute))
                        .or_insert(reported.contract);
                }
            }
        }
        contracts.into_iter().collect()
    }
}

/// Derive the capability set of a device from its endpoints.
pub fn resolve(endpoints: &[EndpointDescriptor]) -> ResolvedCapabilities {
    let mut sorted: Vec<&EndpointDescriptor> = endpoints.iter().filter(|ep| ep.id != 0).collect();
    sorted.sort_by_key(|ep| ep.id);

    let mut cluster_endpoints: BTreeMap<u16, u8> = BTreeMap::new();
    for ep in &sorted {
        for cluster in RECOGNIZED_CLUSTERS {
            if ep.has_in_cluster(cluster) {
                cluster_endpoints.entry(cluster).or_insert(ep.id);
            }
        }
    }

    let endpoint = |id: u8| sorted.iter().find(|ep| ep.id == id).copied();
    let address = |cluster: u16| {
        cluster_endpoints
            .get(&cluster)
            .map(|&endpoint| ClusterAddress { endpoint, cluster })
    };

    let mut capabilities = BTreeMap::new();

    if let Some(on_off_addr) = address(on_off::CLUSTER_ID) {
        let is_light = endpoint(on_off_addr.endpoint)
            .is_some_and(|ep| is_light_device_type(ep.profile_id, ep.device_type));
        if !is_light {
            capabilities.insert(Capability::Switch, on_off_addr);
        } else if let Some(level_addr) = address(level_control::CLUSTER_ID) {
            capabilities.insert(Capability::LightDimmable, level_addr);
        } else {
            capabilities.insert(Capability::LightOnOff, on_off_addr);
        }
    }

    if let Some(color_addr) = address(color_control::CLUSTER_ID) {
        let bitmap = endpoint(color_addr.endpoint)
            .and_then(|ep| ep.color_capabilities)
            .unwrap_or(color_control::CAP_XY);
        if bitmap & color_control::CAP_HUE_SATURATION != 0 {
            capabilities.insert(Capability::LightColorHs, color_addr);
        }
        if bitmap & color_control::CAP_XY != 0 {
            capabilities.insert(Capability::LightColorXy, color_addr);
        }
    }

    let passive = [
        (temperature_measurement::CLUSTER_ID, Capability::Temperature),
        (relative_humidity::CLUSTER_ID, Capability::Humidity),
        (ias_zone::CLUSTER_ID, Capability::Zone),
    ];
    for (cluster, capability) in passive {
        if let Some(addr) = address(cluster) {
            capabilities.insert(capability, addr);
        }
    }

    ResolvedCapabilities {
        capabilities,
        cluster_endpoints,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    fn endpoint(id: u8, device_type: u16, in_clusters: &[u16]) -> EndpointDescriptor {
        EndpointDescriptor {
            id,
            profile_id: PROFILE_HOME_AUTOMATION,
            device_type,
            in_clusters: in_clusters.to_vec(),
            out_clusters: vec![],
            color_capabilities: None,
        }
    }

    #[test]
    fn test_table_is_indexed_by_capability() {
        for capability in Capability::iter() {
            assert_eq!(capability.spec().capability, capability);
        }
    }

    #[test]
    fn test_smart_plug_is_switch() {
        let resolved = resolve(&[endpoint(1, 0x010A, &[0x0000, 0x0006])]);
        assert_eq!(resolved.set(), BTreeSet::from([Capability::Switch]));
        assert_eq!(
            resolved.address(Capability::Switch),
            Some(ClusterAddress {
                endpoint: 1,
                cluster: 0x0006
            })
        );
        assert_eq!(resolved.on_off_feature(), Feature::Switch);
    }

    #[test]
    fn test_level_control_upgrades_light() {
        let on_off_light = resolve(&[endpoint(1, 0x0100, &[0x0006])]);
        assert_eq!(on_off_light.set(), BTreeSet::from([Capability::LightOnOff]));

        let dimmable = resolve(&[endpoint(1, 0x0101, &[0x0006, 0x0008])]);
        assert_eq!(dimmable.set(), BTreeSet::from([Capability::LightDimmable]));
        assert!(dimmable.supports_feature(Feature::Light));
        assert!(dimmable.supports_feature(Feature::Brightness));
        assert_eq!(dimmable.on_off_feature(), Feature::Light);
    }

    #[test]
    fn test_level_control_does_not_upgrade_switch() {
        let resolved = resolve(&[endpoint(1, 0x0009, &[0x0006, 0x0008])]);
        assert_eq!(resolved.set(), BTreeSet::from([Capability::Switch]));
    }

    #[test]
    fn test_color_capabilities_bitmap() {
        let mut ep = endpoint(11, 0x010D, &[0x0006, 0x0008, 0x0300]);
        ep.color_capabilities = Some(0x0019);
        let resolved = resolve(&[ep.clone()]);
        assert_eq!(
            resolved.set(),
            BTreeSet::from([
                Capability::LightDimmable,
                Capability::LightColorHs,
                Capability::LightColorXy
            ])
        );

        ep.color_capabilities = Some(0x0010);
        let temperature_only = resolve(&[ep.clone()]);
        assert!(!temperature_only.supports_feature(Feature::Color));

        ep.color_capabilities = None;
        let unknown = resolve(&[ep]);
        assert!(unknown.contains(Capability::LightColorXy));
        assert!(!unknown.contains(Capability::LightColorHs));
    }

    #[test]
    fn test_climate_and_zone_sensors() {
        let resolved = resolve(&[
            endpoint(2, 0x0302, &[0x0405]),
            endpoint(1, 0x0302, &[0x0000, 0x0402]),
            endpoint(3, 0x0402, &[0x0500]),
        ]);
        assert_eq!(
            resolved.set(),
            BTreeSet::from([Capability::Temperature, Capability::Humidity, Capability::Zone])
        );
        assert_eq!(resolved.address(Capability::Humidity).unwrap().endpoint, 2);
        assert_eq!(resolved.address(Capability::Zone).unwrap().endpoint, 3);
    }

    #[test]
    fn test_out_clusters_and_zdo_are_ignored() {
        let mut remote = endpoint(1, 0x0820, &[0x0000]);
        remote.out_clusters = vec![0x0006, 0x0008];
        let zdo = endpoint(0, 0x0000, &[0x0006]);
        let resolved = resolve(&[remote, zdo]);
        assert!(resolved.is_empty());
        assert!(resolved.implied_contracts().is_empty());
    }

    #[test]
    fn test_first_endpoint_wins_regardless_of_order() {
        let a = resolve(&[endpoint(2, 0x010A, &[0x0006]), endpoint(1, 0x010A, &[0x0006])]);
        let b = resolve(&[endpoint(1, 0x010A, &[0x0006]), endpoint(2, 0x010A, &[0x0006])]);
        assert_eq!(a, b);
        assert_eq!(a.address(Capability::Switch).unwrap().endpoint, 1);
    }

    #[test]
    fn test_implied_contracts_deduplicated() {
        let mut ep = endpoint(1, 0x010D, &[0x0006, 0x0008, 0x0300]);
        ep.color_capabilities = Some(0x0009);
        let contracts = resolve(&[ep]).implied_contracts();
        let keys: Vec<(u16, u16)> = contracts
            .iter()
            .map(|(k, _)| (k.cluster, k.attribute))
            .collect();
        assert_eq!(
            keys,
            vec![
                (0x0006, 0x0000),
                (0x0008, 0x0000),
                (0x0300, 0x0000),
                (0x0300, 0x0001),
                (0x0300, 0x0003),
                (0x0300, 0x0004),
            ]
        );
        assert_eq!(contracts[0].1, REPORT_IMMEDIATE);
    }

    #[test]
    fn test_temperature_contract_threshold() {
        let contracts = resolve(&[endpoint(1, 0x0302, &[0x0402])]).implied_contracts();
        assert_eq!(contracts.len(), 1);
        assert_eq!(contracts[0].1.reportable_change, 50);
    }
}

//! Device registry.
//!
//! The orchestrator owns the only [`RegistryWriter`]. Everything else holds a
//! [`RegistryView`] and only ever sees cloned snapshots, so readers can never
//! observe a half-applied update.

use super::capability::{ResolvedCapabilities, resolve};
use crate::zigbee::{AttributeKey, AttributeValue, DeviceDescriptor, Ieee};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use strum::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Reachability {
    Online,
    Offline,
}

/// Outcome of reporting configuration for a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConfigurationStatus {
    Pending,
    Complete,
    /// Some contracts are missing. `retrying` ones are still being retried,
    /// `degraded` ones have been given up on.
    Partial {
        retrying: Vec<AttributeKey>,
        degraded: Vec<AttributeKey>,
    },
}

/// Last known value of an attribute.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimestampedValue {
    pub value: AttributeValue,
    pub updated_at: DateTime<Utc>,
}

/// Everything the bridge knows about one device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceEntry {
    pub descriptor: DeviceDescriptor,
    pub capabilities: ResolvedCapabilities,
    pub values: BTreeMap<AttributeKey, TimestampedValue>,
    pub reachability: Reachability,
    pub configuration: ConfigurationStatus,
}

impl DeviceEntry {
    pub fn new(descriptor: DeviceDescriptor) -> Self {
        let capabilities = resolve(&descriptor.endpoints);
        Self {
            descriptor,
            capabilities,
            values: BTreeMap::new(),
            reachability: Reachability::Online,
            configuration: ConfigurationStatus::Pending,
        }
    }

    pub fn ieee(&self) -> Ieee {
        self.descriptor.ieee
    }

    pub fn value(&self, key: &AttributeKey) -> Option<&AttributeValue> {
        self.values.get(key).map(|v| &v.value)
    }
}

/// Result of [`RegistryWriter::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Added,
    CapabilitiesChanged,
    Unchanged,
}

/// Compact per-device line of the coordinator status payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSummary {
    pub ieee: Ieee,
    pub nwk: String,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub reachability: Reachability,
}

type Devices = BTreeMap<Ieee, DeviceEntry>;

/// Exclusive write access to the registry.
pub struct RegistryWriter {
    devices: Arc<RwLock<Devices>>,
}

/// Shared read-only access to the registry.
#[derive(Clone)]
pub struct RegistryView {
    devices: Arc<RwLock<Devices>>,
}

impl RegistryWriter {
    pub fn new() -> Self {
        Self {
            devices: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    pub fn view(&self) -> RegistryView {
        RegistryView {
            devices: Arc::clone(&self.devices),
        }
    }

    /// Insert a device or refresh its topology.
    ///
    /// Known values are kept across rescans and rejoins. Capabilities are
    /// re-resolved from the new descriptor every time.
    pub fn upsert(
        &mut self,
        descriptor: DeviceDescriptor,
        configuration: ConfigurationStatus,
    ) -> UpsertOutcome {
        let mut devices = self.devices.write();
        let mut entry = DeviceEntry::new(descriptor);
        entry.configuration = configuration;

        let outcome = match devices.remove(&entry.ieee()) {
            None => UpsertOutcome::Added,
            Some(previous) => {
                entry.values = previous.values;
                entry.reachability = previous.reachability;
                if previous.capabilities == entry.capabilities {
                    UpsertOutcome::Unchanged
                } else {
                    UpsertOutcome::CapabilitiesChanged
                }
            }
        };
        devices.insert(entry.ieee(), entry);
        outcome
    }

    /// Returns `true` when the reachability actually changed.
    pub fn set_reachability(&mut self, ieee: Ieee, reachability: Reachability) -> bool {
        match self.devices.write().get_mut(&ieee) {
            Some(entry) if entry.reachability != reachability => {
                entry.reachability = reachability;
                true
            }
            _ => false,
        }
    }

    /// Returns `false` for unknown devices.
    pub fn record_value(&mut self, ieee: Ieee, key: AttributeKey, value: AttributeValue) -> bool {
        match self.devices.write().get_mut(&ieee) {
            Some(entry) => {
                entry.values.insert(
                    key,
                    TimestampedValue {
                        value,
                        updated_at: Utc::now(),
                    },
                );
                true
            }
            None => false,
        }
    }

    pub fn set_configuration(&mut self, ieee: Ieee, configuration: ConfigurationStatus) {
        if let Some(entry) = self.devices.write().get_mut(&ieee) {
            entry.configuration = configuration;
        }
    }

    pub fn remove(&mut self, ieee: Ieee) -> Option<DeviceEntry> {
        self.devices.write().remove(&ieee)
    }
}

impl Default for RegistryWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryView {
    pub fn get(&self, ieee: Ieee) -> Option<DeviceEntry> {
        self.devices.read().get(&ieee).cloned()
    }

    pub fn contains(&self, ieee: Ieee) -> bool {
        self.devices.read().contains_key(&ieee)
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    pub fn ieees(&self) -> Vec<Ieee> {
        self.devices.read().keys().copied().collect()
    }

    pub fn capabilities(&self, ieee: Ieee) -> Option<ResolvedCapabilities> {
        self.devices
            .read()
            .get(&ieee)
            .map(|entry| entry.capabilities.clone())
    }

    pub fn summaries(&self) -> Vec<DeviceSummary> {
        self.devices
            .read()
            .values()
            .map(|entry| DeviceSummary {
                ieee: entry.ieee(),
                nwk: format!("0x{:04x}", entry.descriptor.nwk),
                manufacturer: entry.descriptor.manufacturer.clone(),
                model: entry.descriptor.model.clone(),
                reachability: entry.reachability,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::capability::Capability;
    use crate::testing::{dimmable_light, smart_plug};

    const PLUG: Ieee = Ieee(0x00158d0000000001);

    #[test]
    fn test_upsert_outcomes() {
        let mut writer = RegistryWriter::new();
        let view = writer.view();

        assert_eq!(
            writer.upsert(smart_plug(PLUG), ConfigurationStatus::Complete),
            UpsertOutcome::Added
        );
        assert_eq!(
            writer.upsert(smart_plug(PLUG), ConfigurationStatus::Complete),
            UpsertOutcome::Unchanged
        );

        let mut upgraded = dimmable_light(PLUG);
        upgraded.nwk = 0x1234;
        assert_eq!(
            writer.upsert(upgraded, ConfigurationStatus::Complete),
            UpsertOutcome::CapabilitiesChanged
        );
        assert!(
            view.get(PLUG)
                .unwrap()
                .capabilities
                .contains(Capability::LightDimmable)
        );
        assert_eq!(view.len(), 1);
    }

    #[test]
    fn test_values_survive_rescan() {
        let mut writer = RegistryWriter::new();
        let view = writer.view();
        writer.upsert(smart_plug(PLUG), ConfigurationStatus::Pending);

        let key = AttributeKey::new(1, 0x0006, 0x0000);
        assert!(writer.record_value(PLUG, key, AttributeValue::Bool(true)));
        assert!(writer.set_reachability(PLUG, Reachability::Offline));
        assert!(!writer.set_reachability(PLUG, Reachability::Offline));

        writer.upsert(smart_plug(PLUG), ConfigurationStatus::Complete);
        let entry = view.get(PLUG).unwrap();
        assert_eq!(entry.value(&key), Some(&AttributeValue::Bool(true)));
        assert_eq!(entry.reachability, Reachability::Offline);
        assert_eq!(entry.configuration, ConfigurationStatus::Complete);
    }

    #[test]
    fn test_snapshots_are_detached() {
        let mut writer = RegistryWriter::new();
        let view = writer.view();
        writer.upsert(smart_plug(PLUG), ConfigurationStatus::Pending);

        let snapshot = view.get(PLUG).unwrap();
        writer.set_configuration(PLUG, ConfigurationStatus::Complete);
        assert_eq!(snapshot.configuration, ConfigurationStatus::Pending);
        assert_eq!(
            view.get(PLUG).unwrap().configuration,
            ConfigurationStatus::Complete
        );
    }

    #[test]
    fn test_unknown_device_updates_are_ignored() {
        let mut writer = RegistryWriter::new();
        let key = AttributeKey::new(1, 0x0006, 0x0000);
        assert!(!writer.record_value(PLUG, key, AttributeValue::Bool(true)));
        assert!(!writer.set_reachability(PLUG, Reachability::Offline));
        assert!(writer.remove(PLUG).is_none());
        assert!(writer.view().is_empty());
    }

    #[test]
    fn test_summaries_format_nwk() {
        let mut writer = RegistryWriter::new();
        writer.upsert(smart_plug(PLUG), ConfigurationStatus::Pending);
        let summaries = writer.view().summaries();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].nwk, "0x4a01");
        assert_eq!(summaries[0].reachability, Reachability::Online);
    }
}

//! In-process mesh network simulation.
//!
//! Stands in for a coordinator radio during development and in tests. Devices
//! can be seeded from a JSON device database, driven to join/leave/report,
//! and scripted to fail commands or reporting configuration.

use super::clusters::{
    ClusterCommand, color_control, level_control, on_off, relative_humidity,
    temperature_measurement,
};
use super::network::{NetworkError, NetworkLayer};
use super::types::{
    AttributeKey, AttributeValue, DeviceDescriptor, Ieee, NetworkEvent, ReportingContract,
};
use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Capacity of the simulated event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A command attempt seen by the simulated mesh.
#[derive(Debug, Clone, PartialEq)]
pub struct IssuedCommand {
    pub ieee: Ieee,
    pub endpoint: u8,
    pub command: ClusterCommand,
    pub succeeded: bool,
}

/// A reporting configuration request seen by the simulated mesh.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportingRecord {
    pub ieee: Ieee,
    pub key: AttributeKey,
    pub contract: ReportingContract,
    pub succeeded: bool,
}

struct SimDevice {
    descriptor: DeviceDescriptor,
    attributes: HashMap<AttributeKey, AttributeValue>,
    reachable: bool,
}

#[derive(Default)]
struct SimState {
    connected: bool,
    connect_failures: u32,
    latency: Duration,
    devices: BTreeMap<Ieee, SimDevice>,
    command_failures: HashMap<Ieee, VecDeque<NetworkError>>,
    reporting_failures: HashMap<(Ieee, u16, u16), u32>,
    unsupported: HashSet<(Ieee, u16, u16)>,
    contracts: HashMap<(Ieee, AttributeKey), ReportingContract>,
    issued: Vec<IssuedCommand>,
    reporting: Vec<ReportingRecord>,
    writes: Vec<(Ieee, AttributeKey, AttributeValue)>,
    permit_join_calls: Vec<(bool, u16)>,
    in_flight: HashMap<Ieee, usize>,
    max_in_flight: HashMap<Ieee, usize>,
    stalled: HashSet<Ieee>,
    stalled_requests: usize,
}

/// Simulated coordinator implementing [`NetworkLayer`].
pub struct SimulatedNetwork {
    coordinator: Ieee,
    state: Mutex<SimState>,
    events: mpsc::Sender<NetworkEvent>,
}

/// Decrements the in-flight counter even when the command future is dropped.
struct InFlightGuard<'a> {
    network: &'a SimulatedNetwork,
    ieee: Ieee,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.network.state.lock();
        if let Some(count) = state.in_flight.get_mut(&self.ieee) {
            *count = count.saturating_sub(1);
        }
    }
}

impl SimulatedNetwork {
    /// Create an empty simulated network and the receiving end of its event stream.
    pub fn new(coordinator: Ieee) -> (Arc<Self>, mpsc::Receiver<NetworkEvent>) {
        let (events, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let network = Arc::new(Self {
            coordinator,
            state: Mutex::new(SimState::default()),
            events,
        });
        (network, rx)
    }

    /// Create a simulated network seeded with the devices of a JSON device database.
    pub fn from_device_db(
        coordinator: Ieee,
        path: &Path,
    ) -> crate::error::Result<(Arc<Self>, mpsc::Receiver<NetworkEvent>)> {
        let content = std::fs::read_to_string(path)?;
        let devices: Vec<DeviceDescriptor> = serde_json::from_str(&content)?;
        let (network, rx) = Self::new(coordinator);
        info!(
            "[Zigbee] Loaded {} device(s) from {}",
            devices.len(),
            path.display()
        );
        for device in devices {
            network.add_device(device);
        }
        Ok((network, rx))
    }

    fn emit(&self, event: NetworkEvent) {
        if let Err(e) = self.events.try_send(event) {
            warn!("[Zigbee] Dropping simulated event: {}", e);
        }
    }

    /// Persist a device without announcing it.
    pub fn add_device(&self, descriptor: DeviceDescriptor) {
        let ieee = descriptor.ieee;
        self.state.lock().devices.insert(
            ieee,
            SimDevice {
                descriptor,
                attributes: HashMap::new(),
                reachable: true,
            },
        );
    }

    /// Persist a device and announce the join.
    pub fn join(&self, descriptor: DeviceDescriptor) {
        self.add_device(descriptor.clone());
        self.emit(NetworkEvent::Joined(descriptor));
    }

    /// Announce that a device left; it stays in the database but is unreachable.
    pub fn leave(&self, ieee: Ieee) {
        if let Some(device) = self.state.lock().devices.get_mut(&ieee) {
            device.reachable = false;
        }
        self.emit(NetworkEvent::Left { ieee });
    }

    pub fn set_reachable(&self, ieee: Ieee, reachable: bool) {
        if let Some(device) = self.state.lock().devices.get_mut(&ieee) {
            device.reachable = reachable;
        }
    }

    /// Store an attribute value without reporting it.
    pub fn set_attribute(&self, ieee: Ieee, key: AttributeKey, value: AttributeValue) {
        if let Some(device) = self.state.lock().devices.get_mut(&ieee) {
            device.attributes.insert(key, value);
        }
    }

    /// Store an attribute value and emit a report for it.
    pub fn report(&self, ieee: Ieee, key: AttributeKey, value: AttributeValue) {
        self.set_attribute(ieee, key, value.clone());
        self.emit(NetworkEvent::AttributeUpdated { ieee, key, value });
    }

    pub fn zone_alarm(&self, ieee: Ieee, endpoint: u8, zone_status: u16) {
        self.emit(NetworkEvent::ZoneAlarm {
            ieee,
            endpoint,
            zone_status,
        });
    }

    /// Drop the coordinator connection and announce it.
    pub fn drop_connection(&self, reason: &str) {
        self.state.lock().connected = false;
        self.emit(NetworkEvent::ConnectionLost {
            reason: reason.to_string(),
        });
    }

    /// Make the next `count` connect attempts fail.
    pub fn fail_connects(&self, count: u32) {
        self.state.lock().connect_failures = count;
    }

    /// Script failures for the next command attempts to a device.
    pub fn fail_next_commands(&self, ieee: Ieee, errors: impl IntoIterator<Item = NetworkError>) {
        self.state
            .lock()
            .command_failures
            .entry(ieee)
            .or_default()
            .extend(errors);
    }

    /// Make reporting configuration of one attribute time out `count` times.
    pub fn fail_reporting(&self, ieee: Ieee, cluster: u16, attribute: u16, count: u32) {
        self.state
            .lock()
            .reporting_failures
            .insert((ieee, cluster, attribute), count);
    }

    /// Make an attribute permanently unsupported for reporting and reads.
    pub fn mark_unsupported(&self, ieee: Ieee, cluster: u16, attribute: u16) {
        self.state
            .lock()
            .unsupported
            .insert((ieee, cluster, attribute));
    }

    /// Reads, writes and reporting configuration to this device never answer.
    pub fn stall(&self, ieee: Ieee) {
        self.state.lock().stalled.insert(ieee);
    }

    /// Requests swallowed by stalled devices so far.
    pub fn stalled_requests(&self) -> usize {
        self.state.lock().stalled_requests
    }

    /// Delay applied to every command before it completes.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn issued_commands(&self) -> Vec<IssuedCommand> {
        self.state.lock().issued.clone()
    }

    pub fn reporting_records(&self) -> Vec<ReportingRecord> {
        self.state.lock().reporting.clone()
    }

    pub fn installed_contract(&self, ieee: Ieee, key: AttributeKey) -> Option<ReportingContract> {
        self.state.lock().contracts.get(&(ieee, key)).copied()
    }

    pub fn attribute_writes(&self) -> Vec<(Ieee, AttributeKey, AttributeValue)> {
        self.state.lock().writes.clone()
    }

    pub fn permit_join_calls(&self) -> Vec<(bool, u16)> {
        self.state.lock().permit_join_calls.clone()
    }

    /// Highest number of concurrent commands and reporting requests observed for a device.
    pub fn max_in_flight(&self, ieee: Ieee) -> usize {
        self.state
            .lock()
            .max_in_flight
            .get(&ieee)
            .copied()
            .unwrap_or(0)
    }

    pub fn attribute(&self, ieee: Ieee, key: AttributeKey) -> Option<AttributeValue> {
        self.state
            .lock()
            .devices
            .get(&ieee)
            .and_then(|d| d.attributes.get(&key).cloned())
    }

    fn is_stalled(&self, ieee: Ieee) -> bool {
        let mut state = self.state.lock();
        if state.stalled.contains(&ieee) {
            state.stalled_requests += 1;
            true
        } else {
            false
        }
    }

    /// Count a request as in flight until the guard is dropped.
    ///
    /// The guard locks the state on drop, so it must outlive any state guard.
    fn enter(&self, state: &mut SimState, ieee: Ieee) -> InFlightGuard<'_> {
        let count = {
            let count = state.in_flight.entry(ieee).or_insert(0);
            *count += 1;
            *count
        };
        let max = state.max_in_flight.entry(ieee).or_insert(0);
        *max = (*max).max(count);
        InFlightGuard {
            network: self,
            ieee,
        }
    }

    fn check_device(state: &SimState, ieee: Ieee) -> Result<(), NetworkError> {
        if !state.connected {
            return Err(NetworkError::Disconnected);
        }
        match state.devices.get(&ieee) {
            None => Err(NetworkError::UnknownDevice(ieee)),
            Some(device) if !device.reachable => Err(NetworkError::Unreachable),
            Some(_) => Ok(()),
        }
    }

    fn apply_command(device: &mut SimDevice, endpoint: u8, command: ClusterCommand) {
        let on_off_key = AttributeKey::new(endpoint, on_off::CLUSTER_ID, on_off::ATTR_ON_OFF);
        match command {
            ClusterCommand::On => {
                device.attributes.insert(on_off_key, AttributeValue::Bool(true));
            }
            ClusterCommand::Off => {
                device
                    .attributes
                    .insert(on_off_key, AttributeValue::Bool(false));
            }
            ClusterCommand::MoveToLevelWithOnOff { level, .. } => {
                device.attributes.insert(
                    AttributeKey::new(
                        endpoint,
                        level_control::CLUSTER_ID,
                        level_control::ATTR_CURRENT_LEVEL,
                    ),
                    AttributeValue::Int(i64::from(level)),
                );
                device
                    .attributes
                    .insert(on_off_key, AttributeValue::Bool(level > 0));
            }
            ClusterCommand::MoveToHueAndSaturation {
                hue, saturation, ..
            } => {
                let cluster = color_control::CLUSTER_ID;
                device.attributes.insert(
                    AttributeKey::new(endpoint, cluster, color_control::ATTR_CURRENT_HUE),
                    AttributeValue::Int(i64::from(hue)),
                );
                device.attributes.insert(
                    AttributeKey::new(endpoint, cluster, color_control::ATTR_CURRENT_SATURATION),
                    AttributeValue::Int(i64::from(saturation)),
                );
            }
            ClusterCommand::MoveToColor { x, y, .. } => {
                let cluster = color_control::CLUSTER_ID;
                device.attributes.insert(
                    AttributeKey::new(endpoint, cluster, color_control::ATTR_CURRENT_X),
                    AttributeValue::Int(i64::from(x)),
                );
                device.attributes.insert(
                    AttributeKey::new(endpoint, cluster, color_control::ATTR_CURRENT_Y),
                    AttributeValue::Int(i64::from(y)),
                );
            }
        }
    }
}

#[async_trait]
impl NetworkLayer for SimulatedNetwork {
    async fn connect(&self) -> Result<(), NetworkError> {
        let mut state = self.state.lock();
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(NetworkError::Other("coordinator did not respond".into()));
        }
        state.connected = true;
        info!("[Zigbee] Simulated coordinator {} connected", self.coordinator);
        Ok(())
    }

    async fn disconnect(&self) {
        self.state.lock().connected = false;
        info!("[Zigbee] Simulated coordinator disconnected");
    }

    fn coordinator_ieee(&self) -> Ieee {
        self.coordinator
    }

    async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, NetworkError> {
        let state = self.state.lock();
        if !state.connected {
            return Err(NetworkError::Disconnected);
        }
        Ok(state
            .devices
            .values()
            .map(|d| d.descriptor.clone())
            .collect())
    }

    async fn read_attribute(
        &self,
        ieee: Ieee,
        endpoint: u8,
        cluster: u16,
        attribute: u16,
    ) -> Result<AttributeValue, NetworkError> {
        if self.is_stalled(ieee) {
            return std::future::pending().await;
        }
        let state = self.state.lock();
        Self::check_device(&state, ieee)?;
        if state.unsupported.contains(&(ieee, cluster, attribute)) {
            return Err(NetworkError::Unsupported { cluster, attribute });
        }
        state
            .devices
            .get(&ieee)
            .and_then(|d| {
                d.attributes
                    .get(&AttributeKey::new(endpoint, cluster, attribute))
                    .cloned()
            })
            .ok_or(NetworkError::Unsupported { cluster, attribute })
    }

    async fn write_attribute(
        &self,
        ieee: Ieee,
        endpoint: u8,
        cluster: u16,
        attribute: u16,
        value: AttributeValue,
    ) -> Result<(), NetworkError> {
        if self.is_stalled(ieee) {
            return std::future::pending().await;
        }
        let mut state = self.state.lock();
        Self::check_device(&state, ieee)?;
        let key = AttributeKey::new(endpoint, cluster, attribute);
        state.writes.push((ieee, key, value.clone()));
        if let Some(device) = state.devices.get_mut(&ieee) {
            device.attributes.insert(key, value);
        }
        Ok(())
    }

    async fn issue_command(
        &self,
        ieee: Ieee,
        endpoint: u8,
        command: ClusterCommand,
    ) -> Result<(), NetworkError> {
        let (_guard, latency) = {
            let mut state = self.state.lock();
            Self::check_device(&state, ieee)?;
            let latency = state.latency;
            (self.enter(&mut state, ieee), latency)
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        debug!(
            "[Zigbee] {} endpoint {} cluster 0x{:04x} command 0x{:02x} payload {:02x?}",
            ieee,
            endpoint,
            command.cluster_id(),
            command.command_id(),
            command.payload()
        );
        let mut state = self.state.lock();
        let failure = state
            .command_failures
            .get_mut(&ieee)
            .and_then(|queue| queue.pop_front());
        state.issued.push(IssuedCommand {
            ieee,
            endpoint,
            command,
            succeeded: failure.is_none(),
        });
        if let Some(err) = failure {
            debug!("[Zigbee] Simulated failure for {}: {}", ieee, err);
            return Err(err);
        }
        if let Some(device) = state.devices.get_mut(&ieee) {
            Self::apply_command(device, endpoint, command);
        }
        Ok(())
    }

    async fn configure_reporting(
        &self,
        ieee: Ieee,
        endpoint: u8,
        cluster: u16,
        attribute: u16,
        contract: ReportingContract,
    ) -> Result<(), NetworkError> {
        if self.is_stalled(ieee) {
            return std::future::pending().await;
        }
        let _guard = {
            let mut state = self.state.lock();
            Self::check_device(&state, ieee)?;
            self.enter(&mut state, ieee)
        };
        let mut state = self.state.lock();
        let key = AttributeKey::new(endpoint, cluster, attribute);

        let result = if state.unsupported.contains(&(ieee, cluster, attribute)) {
            Err(NetworkError::Unsupported { cluster, attribute })
        } else if let Some(remaining) = state
            .reporting_failures
            .get_mut(&(ieee, cluster, attribute))
            .filter(|remaining| **remaining > 0)
        {
            *remaining -= 1;
            Err(NetworkError::Timeout)
        } else {
            Ok(())
        };

        state.reporting.push(ReportingRecord {
            ieee,
            key,
            contract,
            succeeded: result.is_ok(),
        });
        if result.is_ok() {
            state.contracts.insert((ieee, key), contract);
        }
        result
    }

    async fn set_permit_join(&self, permit: bool, duration_secs: u16) -> Result<(), NetworkError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(NetworkError::Disconnected);
        }
        state.permit_join_calls.push((permit, duration_secs));
        Ok(())
    }

    async fn remove_device(&self, ieee: Ieee) -> Result<(), NetworkError> {
        {
            let mut state = self.state.lock();
            if !state.connected {
                return Err(NetworkError::Disconnected);
            }
            if state.devices.remove(&ieee).is_none() {
                return Err(NetworkError::UnknownDevice(ieee));
            }
        }
        self.emit(NetworkEvent::Removed { ieee });
        Ok(())
    }
}

/// Spawn a task that periodically emits drifting temperature and humidity reports
/// for every simulated sensor.
///
/// # Returns
///
/// A `JoinHandle` that can be used to abort the simulation task.
pub fn run_report_simulation(network: Arc<SimulatedNetwork>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let sensors: Vec<(Ieee, AttributeKey, i64)> = {
                let state = network.state.lock();
                if !state.connected {
                    continue;
                }
                state
                    .devices
                    .values()
                    .flat_map(|device| {
                        device.descriptor.endpoints.iter().filter_map(move |ep| {
                            let (cluster, attribute, base) = if ep
                                .has_in_cluster(temperature_measurement::CLUSTER_ID)
                            {
                                (
                                    temperature_measurement::CLUSTER_ID,
                                    temperature_measurement::ATTR_MEASURED_VALUE,
                                    2150,
                                )
                            } else if ep.has_in_cluster(relative_humidity::CLUSTER_ID) {
                                (
                                    relative_humidity::CLUSTER_ID,
                                    relative_humidity::ATTR_MEASURED_VALUE,
                                    4500,
                                )
                            } else {
                                return None;
                            };
                            Some((
                                device.descriptor.ieee,
                                AttributeKey::new(ep.id, cluster, attribute),
                                base,
                            ))
                        })
                    })
                    .collect()
            };

            for (ieee, key, base) in sensors {
                let drift: i64 = rand::thread_rng().gen_range(-100..=100);
                debug!("[Sim] {} report {:?} = {}", ieee, key, base + drift);
                network.report(ieee, key, AttributeValue::Int(base + drift));
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zigbee::EndpointDescriptor;

    fn plug(ieee: u64) -> DeviceDescriptor {
        DeviceDescriptor {
            ieee: Ieee(ieee),
            nwk: 0x1234,
            manufacturer: Some("Acme".into()),
            model: Some("plug".into()),
            endpoints: vec![EndpointDescriptor {
                id: 1,
                profile_id: 0x0104,
                device_type: 0x010A,
                in_clusters: vec![0x0000, 0x0006],
                out_clusters: vec![],
                color_capabilities: None,
            }],
        }
    }

    #[tokio::test]
    async fn test_commands_require_connection() {
        let (network, _rx) = SimulatedNetwork::new(Ieee(1));
        network.add_device(plug(2));
        assert_eq!(
            network.issue_command(Ieee(2), 1, ClusterCommand::On).await,
            Err(NetworkError::Disconnected)
        );

        network.connect().await.unwrap();
        network
            .issue_command(Ieee(2), 1, ClusterCommand::On)
            .await
            .unwrap();
        let key = AttributeKey::new(1, on_off::CLUSTER_ID, on_off::ATTR_ON_OFF);
        assert_eq!(
            network.attribute(Ieee(2), key),
            Some(AttributeValue::Bool(true))
        );
        assert_eq!(
            network.read_attribute(Ieee(2), 1, 0x0006, 0x0000).await,
            Ok(AttributeValue::Bool(true))
        );
    }

    #[tokio::test]
    async fn test_scripted_failures_are_consumed_in_order() {
        let (network, _rx) = SimulatedNetwork::new(Ieee(1));
        network.add_device(plug(2));
        network.connect().await.unwrap();
        network.fail_next_commands(Ieee(2), [NetworkError::Timeout, NetworkError::NoAck]);

        assert_eq!(
            network.issue_command(Ieee(2), 1, ClusterCommand::Off).await,
            Err(NetworkError::Timeout)
        );
        assert_eq!(
            network.issue_command(Ieee(2), 1, ClusterCommand::Off).await,
            Err(NetworkError::NoAck)
        );
        assert!(
            network
                .issue_command(Ieee(2), 1, ClusterCommand::Off)
                .await
                .is_ok()
        );
        let issued = network.issued_commands();
        assert_eq!(issued.len(), 3);
        assert!(issued[2].succeeded);
    }

    #[tokio::test]
    async fn test_connect_failures_then_success() {
        let (network, _rx) = SimulatedNetwork::new(Ieee(1));
        network.fail_connects(2);
        assert!(network.connect().await.is_err());
        assert!(network.connect().await.is_err());
        assert!(network.connect().await.is_ok());
        assert!(network.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_device_never_answers() {
        let (network, _rx) = SimulatedNetwork::new(Ieee(1));
        network.add_device(plug(2));
        network.connect().await.unwrap();
        network.stall(Ieee(2));

        let read = network.read_attribute(Ieee(2), 1, 0x0006, 0x0000);
        assert!(tokio::time::timeout(Duration::from_secs(30), read).await.is_err());
        assert_eq!(network.stalled_requests(), 1);
        // Commands are unaffected.
        assert!(network.issue_command(Ieee(2), 1, ClusterCommand::On).await.is_ok());
    }

    #[tokio::test]
    async fn test_remove_emits_event() {
        let (network, mut rx) = SimulatedNetwork::new(Ieee(1));
        network.add_device(plug(2));
        network.connect().await.unwrap();
        network.remove_device(Ieee(2)).await.unwrap();
        assert_eq!(rx.recv().await, Some(NetworkEvent::Removed { ieee: Ieee(2) }));
        assert!(network.list_devices().await.unwrap().is_empty());
    }
}

//! Bridge orchestrator.
//!
//! Owns the registry writer and the lifecycle state machine. Network events,
//! requests forwarded by the MQTT router, reporting retry results and refresh
//! reads all funnel into one loop, so registry updates are applied in order
//! and nothing else ever mutates the registry.

use super::command::{CommandResult, CommandSettings, CommandTranslator};
use super::event::{DeviceEvent, EventTranslator};
use super::registry::{DeviceEntry, Reachability, RegistryView, RegistryWriter, UpsertOutcome};
use super::reporting::{ConfigurationReport, ReportingConfigurator, ReportingUpdate};
use super::router::MqttRouter;
use super::state::BridgeState;
use crate::config::{BridgeConfig, Config};
use crate::error::{BridgeError, Result};
use crate::mqtt::{MqttEvent, MqttTransport, Publication, Publisher, Topics};
use crate::zigbee::clusters::{color_control, ias_zone};
use crate::zigbee::{
    AttributeKey, AttributeValue, DeviceDescriptor, Ieee, NetworkError, NetworkEvent, NetworkLayer,
};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use log::{debug, error, info, warn};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const REQUEST_CHANNEL_CAPACITY: usize = 256;
const REPORTING_CHANNEL_CAPACITY: usize = 64;
/// How long a recovery attempt waits for the MQTT session.
const MQTT_RECOVERY_WAIT: Duration = Duration::from_millis(250);
/// Longest pairing window the mesh accepts (255 would mean "forever").
const MAX_PERMIT_JOIN_SECS: u16 = 254;

/// Work forwarded to the orchestrator loop by other tasks.
#[derive(Debug)]
pub(crate) enum BridgeRequest {
    PermitJoin {
        payload: String,
    },
    Remove {
        raw_ieee: String,
    },
    CommandCompleted {
        raw_ieee: String,
        topic: String,
        result: CommandResult,
    },
    Refreshed {
        ieee: Ieee,
        result: CommandResult,
    },
    MqttConnected,
    MqttDisconnected {
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Join,
    Scan,
}

/// A device that went through reporting configuration but is not registered yet.
struct PreparedDevice {
    descriptor: DeviceDescriptor,
    report: ConfigurationReport,
}

/// Which transports are currently believed to be up.
#[derive(Debug, Clone, Copy)]
struct LinkHealth {
    network: bool,
    mqtt: bool,
    /// MQTT subscriptions were lost with the session.
    resubscribe: bool,
}

/// Parse a `permit_join` payload into `(permit, seconds)`.
///
/// Accepts `{"permit_join": bool, "time"?: secs}` or a bare JSON boolean.
pub fn parse_permit_join(payload: &str, default_secs: u16) -> Result<(bool, u16)> {
    let value: Value = serde_json::from_str(payload)
        .map_err(|e| BridgeError::Validation(format!("payload is not JSON: {}", e)))?;
    let (permit, time) = match &value {
        Value::Bool(permit) => (*permit, None),
        Value::Object(map) => {
            let permit = map.get("permit_join").and_then(Value::as_bool).ok_or_else(|| {
                BridgeError::Validation("`permit_join` must be a boolean".into())
            })?;
            let time = match map.get("time") {
                None | Some(Value::Null) => None,
                Some(time) => Some(time.as_u64().ok_or_else(|| {
                    BridgeError::Validation("`time` must be a positive integer".into())
                })?),
            };
            (permit, time)
        }
        _ => {
            return Err(BridgeError::Validation(
                "expected {\"permit_join\": bool}".into(),
            ));
        }
    };

    if !permit {
        return Ok((false, 0));
    }
    let secs = time
        .map(|t| t.clamp(1, u64::from(MAX_PERMIT_JOIN_SECS)) as u16)
        .unwrap_or(default_secs.clamp(1, MAX_PERMIT_JOIN_SECS));
    Ok((true, secs))
}

/// Observe and stop a running [`Bridge`].
#[derive(Clone)]
pub struct BridgeHandle {
    state: watch::Receiver<BridgeState>,
    registry: RegistryView,
    shutdown: CancellationToken,
}

impl BridgeHandle {
    pub fn state(&self) -> BridgeState {
        *self.state.borrow()
    }

    /// Wait until the bridge reaches `target`. Returns `false` if the bridge is gone.
    pub async fn wait_for(&self, target: BridgeState) -> bool {
        let mut state = self.state.clone();
        state.wait_for(|s| *s == target).await.is_ok()
    }

    pub fn registry(&self) -> &RegistryView {
        &self.registry
    }

    /// Request a graceful shutdown.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// The Zigbee⇄MQTT bridge.
pub struct Bridge {
    settings: BridgeConfig,
    topics: Topics,
    network: Arc<dyn NetworkLayer>,
    network_events: mpsc::Receiver<NetworkEvent>,
    mqtt: Arc<dyn MqttTransport>,
    mqtt_events: Option<mpsc::Receiver<MqttEvent>>,
    publisher: Publisher,
    registry: RegistryWriter,
    commands: Arc<CommandTranslator>,
    events: Arc<EventTranslator>,
    reporting: ReportingConfigurator,
    state: watch::Sender<BridgeState>,
    requests_tx: mpsc::Sender<BridgeRequest>,
    requests: mpsc::Receiver<BridgeRequest>,
    reporting_tx: mpsc::Sender<ReportingUpdate>,
    reporting_updates: mpsc::Receiver<ReportingUpdate>,
    shutdown: CancellationToken,
    /// Cancels background reporting retries per device.
    device_tokens: HashMap<Ieee, CancellationToken>,
    link: LinkHealth,
    reconnect_attempt: u32,
    next_reconnect: Option<Instant>,
    permit_join_until: Option<(Instant, DateTime<Utc>)>,
}

impl Bridge {
    pub fn new(
        config: &Config,
        network: Arc<dyn NetworkLayer>,
        network_events: mpsc::Receiver<NetworkEvent>,
        mqtt: Arc<dyn MqttTransport>,
        mqtt_events: mpsc::Receiver<MqttEvent>,
    ) -> Self {
        let settings = config.bridge.clone();
        let topics = Topics::new(&config.mqtt.base_topic);
        let registry = RegistryWriter::new();
        let (state, state_rx) = watch::channel(BridgeState::Starting);

        let commands = Arc::new(CommandTranslator::new(
            registry.view(),
            Arc::clone(&network),
            CommandSettings {
                timeout: settings.command_timeout(),
                retry: settings.command_retry,
                queue_depth: settings.command_queue_depth,
            },
            state_rx,
        ));
        let events = Arc::new(EventTranslator::new(
            topics.clone(),
            registry.view(),
            settings.coalesce_window(),
        ));
        let reporting = ReportingConfigurator::new(
            Arc::clone(&network),
            Arc::clone(&commands),
            settings.reporting_retry,
            settings.command_timeout(),
        );
        let (requests_tx, requests) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let (reporting_tx, reporting_updates) = mpsc::channel(REPORTING_CHANNEL_CAPACITY);

        Self {
            publisher: Publisher::new(Arc::clone(&mqtt), config.mqtt.qos()),
            settings,
            topics,
            network,
            network_events,
            mqtt,
            mqtt_events: Some(mqtt_events),
            registry,
            commands,
            events,
            reporting,
            state,
            requests_tx,
            requests,
            reporting_tx,
            reporting_updates,
            shutdown: CancellationToken::new(),
            device_tokens: HashMap::new(),
            link: LinkHealth {
                network: false,
                mqtt: false,
                resubscribe: false,
            },
            reconnect_attempt: 0,
            next_reconnect: None,
            permit_join_until: None,
        }
    }

    pub fn handle(&self) -> BridgeHandle {
        BridgeHandle {
            state: self.state.subscribe(),
            registry: self.registry.view(),
            shutdown: self.shutdown.clone(),
        }
    }

    fn current_state(&self) -> BridgeState {
        *self.state.borrow()
    }

    fn set_state(&self, next: BridgeState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!("[Bridge] {} -> {}", previous, next);
        }
    }

    /// Run the bridge until shutdown is requested.
    ///
    /// Only a failure to bring up the transports at startup is returned as an
    /// error; everything after that is handled and published.
    pub async fn run(mut self) -> Result<()> {
        info!("[Bridge] Starting");
        if let Err(e) = self.start().await {
            error!("[Bridge] {}", e);
            self.set_state(BridgeState::ShuttingDown);
            self.network.disconnect().await;
            return Err(e);
        }

        self.subscribe().await;
        self.spawn_router();

        match self.scan().await {
            Ok(()) => self.enter_ready().await,
            Err(_) if self.shutdown.is_cancelled() => {}
            Err(e) => {
                self.link.network = false;
                self.degrade(&format!("initial scan failed: {}", e)).await;
            }
        }

        let mut refresh = self.settings.refresh_interval().map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });

        loop {
            let reconnect_at = self.next_reconnect;
            let permit_join_expiry = self.permit_join_until.map(|(at, _)| at);

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                event = self.network_events.recv() => match event {
                    Some(event) => self.handle_network_event(event).await,
                    None => {
                        error!("[Bridge] Network event stream closed");
                        break;
                    }
                },
                Some(request) = self.requests.recv() => self.handle_request(request).await,
                Some(update) = self.reporting_updates.recv() => self.apply_reporting_update(update),
                _ = sleep_until_some(reconnect_at) => self.try_recover().await,
                _ = sleep_until_some(permit_join_expiry) => self.permit_join_expired().await,
                _ = next_tick(&mut refresh) => self.refresh(),
            }
        }

        self.shutdown_sequence().await;
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        let attempts = self.settings.startup_attempts.max(1);
        let timeout = self.settings.startup_timeout();

        for attempt in 1..=attempts {
            let network = Arc::clone(&self.network);
            let mqtt = Arc::clone(&self.mqtt);
            let connect = async {
                tokio::try_join!(
                    async { network.connect().await.map_err(BridgeError::from) },
                    async { mqtt.wait_connected(timeout).await.map_err(BridgeError::from) },
                )
            };

            let outcome = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return Err(BridgeError::StartupFailed("shutdown requested".into()));
                }
                outcome = tokio::time::timeout(timeout, connect) => outcome,
            };

            match outcome {
                Ok(Ok(_)) => {
                    info!(
                        "[Bridge] Coordinator {} and MQTT connected",
                        self.network.coordinator_ieee()
                    );
                    self.link.network = true;
                    self.link.mqtt = true;
                    return Ok(());
                }
                Ok(Err(e)) => warn!(
                    "[Bridge] Startup attempt {}/{} failed: {}",
                    attempt, attempts, e
                ),
                Err(_) => warn!(
                    "[Bridge] Startup attempt {}/{} timed out after {:?}",
                    attempt, attempts, timeout
                ),
            }

            // Leave no half-open connection behind between attempts.
            self.network.disconnect().await;

            if attempt < attempts {
                tokio::select! {
                    _ = self.shutdown.cancelled() => {
                        return Err(BridgeError::StartupFailed("shutdown requested".into()));
                    }
                    _ = tokio::time::sleep(self.settings.startup_retry_delay()) => {}
                }
            }
        }

        Err(BridgeError::StartupFailed(format!(
            "could not connect after {} attempt(s)",
            attempts
        )))
    }

    async fn subscribe(&mut self) {
        let mut ok = true;
        for topic in self.topics.subscriptions() {
            if let Err(e) = self.mqtt.subscribe(&topic).await {
                warn!("[Bridge] Failed to subscribe to {}: {}", topic, e);
                ok = false;
            }
        }
        self.link.resubscribe = !ok;
    }

    fn spawn_router(&mut self) {
        let Some(inbound) = self.mqtt_events.take() else {
            return;
        };
        let router = MqttRouter::new(
            self.topics.clone(),
            Arc::clone(&self.commands),
            Arc::clone(&self.events),
            self.publisher.clone(),
            self.requests_tx.clone(),
        );
        tokio::spawn(router.run(inbound, self.shutdown.child_token()));
    }

    async fn publish(&self, publication: Publication) {
        self.publisher.publish(&publication).await;
    }

    async fn publish_event(&self, event: DeviceEvent) {
        if let Some(publication) = self.events.handle(&event) {
            self.publish(publication).await;
        }
    }

    fn coordinator_status(&self, detail: Option<&str>) -> Publication {
        let state = self.current_state();
        let devices = self.registry.view().summaries();
        Publication::new(
            self.topics.coordinator_status(),
            &json!({
                "status": state.coordinator_status(),
                "state": state,
                "detail": detail,
                "coordinator": self.network.coordinator_ieee(),
                "device_count": devices.len(),
                "devices": devices,
                "permit_join": self.permit_join_until.is_some(),
                "timestamp": Utc::now().to_rfc3339(),
            }),
            true,
        )
    }

    async fn publish_coordinator_status(&self, detail: Option<&str>) {
        self.publish(self.coordinator_status(detail)).await;
    }

    // ----- Scanning and admission -----

    /// Admit every device the network layer knows. Returns an error when
    /// shutdown is requested before the scan completes.
    async fn scan(&mut self) -> Result<()> {
        self.set_state(BridgeState::Scanning);
        let listing = tokio::time::timeout(
            self.settings.startup_timeout(),
            self.network.list_devices(),
        );
        let devices = unless_cancelled(&self.shutdown, listing)
            .await
            .ok_or_else(shutdown_requested)?
            .unwrap_or(Err(NetworkError::Timeout))?;

        info!("[Bridge] Scanning {} known device(s)", devices.len());
        let preparing = join_all(
            devices
                .into_iter()
                .map(|d| self.prepare(d, Admission::Scan)),
        );
        let prepared = unless_cancelled(&self.shutdown, preparing)
            .await
            .ok_or_else(shutdown_requested)?;
        for device in prepared {
            self.register(device, Admission::Scan).await;
        }
        Ok(())
    }

    async fn enter_ready(&mut self) {
        self.set_state(BridgeState::Ready);
        self.reconnect_attempt = 0;
        self.next_reconnect = None;
        let detail = format!("{} device(s)", self.registry.view().len());
        self.publish_coordinator_status(Some(&detail)).await;
    }

    /// Fill in ColorCapabilities where the descriptor does not carry it.
    ///
    /// Rescans reuse the bitmap already known for the device. Otherwise the
    /// attribute is read, falling back to the known bitmap if the read fails.
    async fn enrich_color_capabilities(&self, descriptor: &mut DeviceDescriptor, admission: Admission) {
        let ieee = descriptor.ieee;
        let previous = self.registry.view().get(ieee);
        for endpoint in descriptor.endpoints.iter_mut().filter(|ep| {
            ep.id != 0
                && ep.has_in_cluster(color_control::CLUSTER_ID)
                && ep.color_capabilities.is_none()
        }) {
            let known = previous
                .as_ref()
                .and_then(|entry| known_color_capabilities(entry, endpoint.id));
            if admission == Admission::Scan && known.is_some() {
                endpoint.color_capabilities = known;
                continue;
            }
            endpoint.color_capabilities = self.read_color_capabilities(ieee, endpoint.id).await.or(known);
        }
    }

    async fn read_color_capabilities(&self, ieee: Ieee, endpoint: u8) -> Option<u16> {
        let read = self.network.read_attribute(
            ieee,
            endpoint,
            color_control::CLUSTER_ID,
            color_control::ATTR_COLOR_CAPABILITIES,
        );
        match tokio::time::timeout(self.settings.command_timeout(), read).await {
            Ok(Ok(value)) => value.as_i64().and_then(|v| u16::try_from(v).ok()),
            Ok(Err(e)) => {
                debug!(
                    "[Bridge] ColorCapabilities unavailable on {} endpoint {}: {}",
                    ieee, endpoint, e
                );
                None
            }
            Err(_) => {
                debug!(
                    "[Bridge] ColorCapabilities read timed out on {} endpoint {}",
                    ieee, endpoint
                );
                None
            }
        }
    }

    async fn prepare(&self, mut descriptor: DeviceDescriptor, admission: Admission) -> PreparedDevice {
        self.enrich_color_capabilities(&mut descriptor, admission).await;
        let capabilities = super::capability::resolve(&descriptor.endpoints);
        let steps = self.reporting.plan(&capabilities);
        let report = self.reporting.configure(descriptor.ieee, &steps).await;
        PreparedDevice { descriptor, report }
    }

    /// Register a configured device and announce it when it is new or changed.
    async fn register(&mut self, device: PreparedDevice, admission: Admission) {
        let PreparedDevice { descriptor, report } = device;
        let ieee = descriptor.ieee;
        let retrying = !report.retryable.is_empty() && self.settings.reporting_retry.allows(1);
        let outcome = self.registry.upsert(descriptor, report.status(retrying));

        if !report.is_complete() {
            warn!(
                "[Bridge] {}",
                BridgeError::ConfigurationPartial {
                    ieee,
                    missing: report.missing(),
                }
            );
        }

        if let Some(token) = self.device_tokens.remove(&ieee) {
            token.cancel();
        }
        if retrying {
            let token = self.shutdown.child_token();
            self.reporting
                .spawn_retries(ieee, report, token.clone(), self.reporting_tx.clone());
            self.device_tokens.insert(ieee, token);
        }

        let announce = admission == Admission::Join || outcome != UpsertOutcome::Unchanged;
        if announce && let Some(entry) = self.registry.view().get(ieee) {
            info!(
                "[Bridge] Device {} registered with {:?}",
                ieee,
                entry.capabilities.set()
            );
            self.publish_event(DeviceEvent::Joined(entry)).await;
        }
        if admission == Admission::Join {
            self.registry.set_reachability(ieee, Reachability::Online);
            self.publish_event(DeviceEvent::Online { ieee }).await;
        }
    }

    fn apply_reporting_update(&mut self, update: ReportingUpdate) {
        if !self.registry.view().contains(update.ieee) {
            return;
        }
        debug!(
            "[Bridge] Reporting status of {}: {:?}",
            update.ieee, update.status
        );
        self.registry.set_configuration(update.ieee, update.status);
    }

    // ----- Network events -----

    async fn handle_network_event(&mut self, event: NetworkEvent) {
        match event {
            NetworkEvent::Joined(descriptor) => {
                info!("[Bridge] Device {} joined", descriptor.ieee);
                let preparing = self.prepare(descriptor, Admission::Join);
                let prepared = unless_cancelled(&self.shutdown, preparing).await;
                if let Some(prepared) = prepared {
                    self.register(prepared, Admission::Join).await;
                }
            }
            NetworkEvent::Left { ieee } => {
                if !self.registry.view().contains(ieee) {
                    debug!("[Bridge] Unknown device {} left", ieee);
                    return;
                }
                info!("[Bridge] Device {} left", ieee);
                self.registry.set_reachability(ieee, Reachability::Offline);
                self.publish_event(DeviceEvent::Left { ieee }).await;
                self.publish(self.events.left_announcement(ieee)).await;
            }
            NetworkEvent::Unavailable { ieee } => {
                if self.registry.set_reachability(ieee, Reachability::Offline) {
                    warn!("[Bridge] Device {} unavailable", ieee);
                    self.publish_event(DeviceEvent::Unavailable { ieee }).await;
                }
            }
            NetworkEvent::Removed { ieee } => self.forget(ieee).await,
            NetworkEvent::AttributeUpdated { ieee, key, value } => {
                self.apply_value(ieee, key, value).await;
            }
            NetworkEvent::ZoneAlarm {
                ieee,
                endpoint,
                zone_status,
            } => {
                let key =
                    AttributeKey::new(endpoint, ias_zone::CLUSTER_ID, ias_zone::ATTR_ZONE_STATUS);
                let value = AttributeValue::Int(i64::from(zone_status));
                if self.record(ieee, key, value).await {
                    info!("[Bridge] Zone alarm from {}: {:#06x}", ieee, zone_status);
                    self.publish_event(DeviceEvent::ZoneAlarm {
                        ieee,
                        endpoint,
                        zone_status,
                    })
                    .await;
                }
            }
            NetworkEvent::ConnectionLost { reason } => {
                self.link.network = false;
                self.degrade(&format!("network: {}", reason)).await;
            }
            NetworkEvent::ConnectionRestored => {
                info!("[Bridge] Network connection restored");
                self.link.network = true;
                if matches!(
                    self.current_state(),
                    BridgeState::Degraded | BridgeState::Recovering
                ) {
                    self.try_recover().await;
                }
            }
        }
    }

    /// Record a value and mark the device online. Returns `false` for unknown devices.
    async fn record(&mut self, ieee: Ieee, key: AttributeKey, value: AttributeValue) -> bool {
        if !self.registry.record_value(ieee, key, value) {
            debug!("[Bridge] Ignoring value from unknown device {}", ieee);
            return false;
        }
        if self.registry.set_reachability(ieee, Reachability::Online) {
            self.publish_event(DeviceEvent::Online { ieee }).await;
        }
        true
    }

    async fn apply_value(&mut self, ieee: Ieee, key: AttributeKey, value: AttributeValue) {
        if self.record(ieee, key, value.clone()).await {
            self.publish_event(DeviceEvent::AttributeUpdated { ieee, key, value })
                .await;
        }
    }

    async fn forget(&mut self, ieee: Ieee) {
        self.commands.cancel_device(ieee);
        if let Some(token) = self.device_tokens.remove(&ieee) {
            token.cancel();
        }
        if self.registry.remove(ieee).is_some() {
            info!("[Bridge] Device {} removed", ieee);
            self.publish_event(DeviceEvent::Removed { ieee }).await;
        }
    }

    // ----- Requests from other tasks -----

    async fn handle_request(&mut self, request: BridgeRequest) {
        match request {
            BridgeRequest::PermitJoin { payload } => self.permit_join(&payload).await,
            BridgeRequest::Remove { raw_ieee } => self.remove(&raw_ieee).await,
            BridgeRequest::CommandCompleted {
                raw_ieee,
                topic,
                result,
            } => match result {
                Ok(success) => {
                    for (key, value) in success.values {
                        self.apply_value(success.ieee, key, value).await;
                    }
                }
                Err(e) => {
                    warn!("[Bridge] Command on {} failed: {}", topic, e);
                    self.publish(self.events.error(&raw_ieee, Some(&topic), &e))
                        .await;
                }
            },
            BridgeRequest::Refreshed { ieee, result } => match result {
                Ok(success) => {
                    for (key, value) in success.values {
                        self.apply_value(ieee, key, value).await;
                    }
                }
                Err(e) => debug!("[Bridge] Refresh of {} failed: {}", ieee, e),
            },
            BridgeRequest::MqttConnected => {
                if self.link.mqtt {
                    return;
                }
                info!("[Bridge] MQTT session re-established");
                self.link.mqtt = true;
                if matches!(
                    self.current_state(),
                    BridgeState::Degraded | BridgeState::Recovering
                ) {
                    self.try_recover().await;
                }
            }
            BridgeRequest::MqttDisconnected { reason } => {
                self.link.mqtt = false;
                self.link.resubscribe = true;
                self.degrade(&format!("mqtt: {}", reason)).await;
            }
        }
    }

    async fn remove(&mut self, raw_ieee: &str) {
        let topic = format!("{}/device/{}/remove", self.topics.base(), raw_ieee);
        let ieee = match raw_ieee.parse::<Ieee>() {
            Ok(ieee) if self.registry.view().contains(ieee) => ieee,
            _ => {
                let e = BridgeError::DeviceUnknown(raw_ieee.to_string());
                self.publish(self.events.error(raw_ieee, Some(&topic), &e))
                    .await;
                return;
            }
        };

        let state = self.current_state();
        if !state.accepts_commands() {
            let e = BridgeError::TransportUnavailable(format!("bridge is {}", state));
            self.publish(self.events.error(raw_ieee, Some(&topic), &e))
                .await;
            return;
        }

        info!("[Bridge] Removing device {}", ieee);
        let removal = tokio::time::timeout(
            self.settings.command_timeout(),
            self.network.remove_device(ieee),
        )
        .await
        .unwrap_or(Err(NetworkError::Timeout));

        match removal {
            Ok(()) | Err(NetworkError::UnknownDevice(_)) => self.forget(ieee).await,
            Err(e) => {
                warn!("[Bridge] Removing {} failed: {}", ieee, e);
                self.publish(self.events.error(raw_ieee, Some(&topic), &BridgeError::from(e)))
                    .await;
            }
        }
    }

    // ----- Pairing window -----

    fn permit_join_status(
        &self,
        status: &str,
        permit: bool,
        secs: u16,
        expires_at: Option<DateTime<Utc>>,
        reason: Option<String>,
    ) -> Publication {
        Publication::new(
            self.topics.permit_join_status(),
            &json!({
                "status": status,
                "permit_join": permit,
                "time": secs,
                "expires_at": expires_at.map(|t| t.to_rfc3339()),
                "reason": reason,
                "timestamp": Utc::now().to_rfc3339(),
            }),
            true,
        )
    }

    async fn permit_join(&mut self, payload: &str) {
        let (permit, secs) = match parse_permit_join(payload, self.settings.permit_join_secs) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("[Bridge] Rejected permit_join payload: {}", e);
                self.publish(self.permit_join_status("rejected", false, 0, None, Some(e.to_string())))
                    .await;
                return;
            }
        };

        let state = self.current_state();
        if !state.accepts_permit_join() {
            warn!("[Bridge] permit_join rejected while {}", state);
            self.publish(self.permit_join_status(
                "rejected",
                permit,
                secs,
                None,
                Some(format!("bridge is {}", state)),
            ))
            .await;
            return;
        }

        let policy = self.settings.command_retry;
        let mut attempt = 0;
        let outcome = loop {
            attempt += 1;
            let result = tokio::time::timeout(
                self.settings.command_timeout(),
                self.network.set_permit_join(permit, secs),
            )
            .await
            .unwrap_or(Err(NetworkError::Timeout));

            match result {
                Err(e) if e.is_transient() && policy.allows(attempt) => {
                    debug!("[Bridge] permit_join attempt {} failed: {}", attempt, e);
                    tokio::time::sleep(policy.delay(attempt)).await;
                }
                other => break other,
            }
        };

        match outcome {
            Ok(()) if permit => {
                let expires_at = Utc::now() + chrono::Duration::seconds(i64::from(secs));
                info!("[Bridge] Pairing window open for {}s", secs);
                self.permit_join_until = Some((
                    Instant::now() + Duration::from_secs(u64::from(secs)),
                    expires_at,
                ));
                self.publish(self.permit_join_status("enabled", true, secs, Some(expires_at), None))
                    .await;
            }
            Ok(()) => {
                info!("[Bridge] Pairing window closed");
                self.permit_join_until = None;
                self.publish(self.permit_join_status("disabled", false, 0, None, None))
                    .await;
            }
            Err(e) => {
                error!("[Bridge] permit_join failed: {}", e);
                self.publish(self.permit_join_status(
                    "failed",
                    permit,
                    secs,
                    None,
                    Some(e.to_string()),
                ))
                .await;
            }
        }
    }

    async fn permit_join_expired(&mut self) {
        self.permit_join_until = None;
        info!("[Bridge] Pairing window expired");
        self.publish(self.permit_join_status(
            "disabled",
            false,
            0,
            None,
            Some("expired".into()),
        ))
        .await;
    }

    // ----- Refresh -----

    /// Queue reads of every reported attribute of online devices.
    fn refresh(&self) {
        if self.current_state() != BridgeState::Ready {
            return;
        }
        let view = self.registry.view();
        for ieee in view.ieees() {
            let Some(entry) = view.get(ieee) else {
                continue;
            };
            if entry.reachability == Reachability::Offline {
                continue;
            }

            let mut reads: BTreeMap<(u8, u16), Vec<u16>> = BTreeMap::new();
            for (key, _) in entry.capabilities.implied_contracts() {
                reads
                    .entry((key.endpoint, key.cluster))
                    .or_default()
                    .push(key.attribute);
            }

            for ((endpoint, cluster), attributes) in reads {
                match self.commands.read(ieee, endpoint, cluster, attributes) {
                    Ok(rx) => self.forward_refresh(ieee, rx),
                    Err(e) => debug!("[Bridge] Skipping refresh of {}: {}", ieee, e),
                }
            }
        }
    }

    fn forward_refresh(&self, ieee: Ieee, rx: oneshot::Receiver<CommandResult>) {
        let requests = self.requests_tx.clone();
        tokio::spawn(async move {
            let result = rx.await.unwrap_or_else(|_| {
                Err(BridgeError::TransportUnavailable("command worker stopped".into()))
            });
            let _ = requests.send(BridgeRequest::Refreshed { ieee, result }).await;
        });
    }

    // ----- Degradation and recovery -----

    async fn degrade(&mut self, reason: &str) {
        match self.current_state() {
            BridgeState::Degraded | BridgeState::Recovering => {
                debug!("[Bridge] Already degraded, also: {}", reason);
                return;
            }
            BridgeState::ShuttingDown => return,
            _ => {}
        }
        warn!("[Bridge] Degraded: {}", reason);
        self.set_state(BridgeState::Degraded);
        self.publish_coordinator_status(Some(reason)).await;

        self.reconnect_attempt = 0;
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        let policy = self.settings.reconnect;
        if !policy.allows(self.reconnect_attempt) {
            error!(
                "[Bridge] Giving up reconnecting after {} attempt(s)",
                self.reconnect_attempt
            );
            self.set_state(BridgeState::Degraded);
            self.next_reconnect = None;
            return;
        }
        self.reconnect_attempt += 1;
        let delay = policy.jittered_delay(self.reconnect_attempt);
        debug!(
            "[Bridge] Reconnect attempt {} in {:?}",
            self.reconnect_attempt, delay
        );
        self.set_state(BridgeState::Recovering);
        self.next_reconnect = Some(Instant::now() + delay);
    }

    async fn try_recover(&mut self) {
        self.next_reconnect = None;
        self.set_state(BridgeState::Recovering);

        if !self.link.network {
            let connect =
                tokio::time::timeout(self.settings.command_timeout(), self.network.connect());
            let Some(connected) = unless_cancelled(&self.shutdown, connect).await else {
                return;
            };
            match connected {
                Ok(Ok(())) => {
                    info!("[Bridge] Network layer reconnected");
                    self.link.network = true;
                }
                Ok(Err(e)) => warn!("[Bridge] Network reconnect failed: {}", e),
                Err(_) => warn!("[Bridge] Network reconnect timed out"),
            }
        }
        if !self.link.mqtt && self.mqtt.wait_connected(MQTT_RECOVERY_WAIT).await.is_ok() {
            self.link.mqtt = true;
        }

        if !(self.link.network && self.link.mqtt) {
            self.schedule_reconnect();
            return;
        }

        if self.link.resubscribe {
            self.subscribe().await;
        }
        match self.scan().await {
            Ok(()) => {
                info!("[Bridge] Recovered");
                self.enter_ready().await;
            }
            Err(_) if self.shutdown.is_cancelled() => {}
            Err(e) => {
                warn!("[Bridge] Rescan failed: {}", e);
                if matches!(e, BridgeError::Network(NetworkError::Disconnected)) {
                    self.link.network = false;
                }
                self.schedule_reconnect();
            }
        }
    }

    // ----- Shutdown -----

    async fn shutdown_sequence(&mut self) {
        info!("[Bridge] Shutting down");
        self.set_state(BridgeState::ShuttingDown);
        self.next_reconnect = None;

        self.commands.shutdown(self.settings.shutdown_grace()).await;
        for (_, token) in self.device_tokens.drain() {
            token.cancel();
        }

        self.publish_coordinator_status(Some("shutdown")).await;
        self.network.disconnect().await;
        self.mqtt.disconnect().await;
        info!("[Bridge] Stopped");
    }
}

/// Last ColorCapabilities bitmap seen for an endpoint of a registered device.
fn known_color_capabilities(entry: &DeviceEntry, endpoint: u8) -> Option<u16> {
    entry
        .descriptor
        .endpoints
        .iter()
        .find(|ep| ep.id == endpoint)
        .and_then(|ep| ep.color_capabilities)
        .or_else(|| {
            let key = AttributeKey::new(
                endpoint,
                color_control::CLUSTER_ID,
                color_control::ATTR_COLOR_CAPABILITIES,
            );
            entry
                .value(&key)
                .and_then(AttributeValue::as_i64)
                .and_then(|v| u16::try_from(v).ok())
        })
}

/// Drive `work` to completion unless `shutdown` fires first.
async fn unless_cancelled<F: Future>(shutdown: &CancellationToken, work: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => None,
        output = work => Some(output),
    }
}

fn shutdown_requested() -> BridgeError {
    BridgeError::TransportUnavailable("shutdown requested".into())
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

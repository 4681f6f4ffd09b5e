//! MQTT `set` payloads to mesh commands.
//!
//! Submission validates the payload against the device's capabilities and
//! enqueues the resulting command on the device's worker. Each device has
//! exactly one worker task draining a bounded queue, so at most one command
//! per device is on the mesh at any time while different devices proceed in
//! parallel. Retries, timeouts and cancellation happen inside the worker.

use super::capability::{Capability, ResolvedCapabilities};
use super::registry::RegistryView;
use super::reporting::{self, ConfigurationStep};
use super::state::BridgeState;
use crate::config::RetryPolicy;
use crate::error::{BridgeError, Result};
use crate::mqtt::Feature;
use crate::zigbee::clusters::{self, color_control, level_control, on_off};
use crate::zigbee::{AttributeKey, AttributeValue, ClusterCommand, Ieee, NetworkError, NetworkLayer};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Validated control request in public units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Control {
    OnOff(bool),
    Brightness(u8),
    HueSaturation { hue: u16, saturation: u8 },
    Xy { x: f64, y: f64 },
}

/// Work item executed on a device worker.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshRequest {
    Command(ClusterCommand),
    /// Read attributes of one cluster, skipping ones the device rejects.
    Read { cluster: u16, attributes: Vec<u16> },
    /// One reporting configuration step. Attempted once; the reporting
    /// schedule decides when to try again.
    Configure(ConfigurationStep),
}

impl MeshRequest {
    fn is_retried(&self) -> bool {
        !matches!(self, MeshRequest::Configure(_))
    }
}

/// Successful completion of a [`MeshRequest`].
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSuccess {
    pub ieee: Ieee,
    pub attempts: u32,
    /// Attribute values known to hold after the request.
    pub values: Vec<(AttributeKey, AttributeValue)>,
}

pub type CommandResult = Result<CommandSuccess>;

/// A request waiting on, or running in, a device worker.
pub struct PendingCommand {
    pub ieee: Ieee,
    pub endpoint: u8,
    pub request: MeshRequest,
    /// Values to report on success. Commands carry their expected state here.
    pub expected: Vec<(AttributeKey, AttributeValue)>,
    pub attempts: u32,
    pub enqueued_at: Instant,
    responder: oneshot::Sender<CommandResult>,
}

/// Timing and queueing limits for commands.
#[derive(Debug, Clone, Copy)]
pub struct CommandSettings {
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub queue_depth: usize,
}

fn object(payload: &str) -> Result<serde_json::Map<String, Value>> {
    match serde_json::from_str::<Value>(payload) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(BridgeError::Validation("payload must be a JSON object".into())),
        Err(e) => Err(BridgeError::Validation(format!("payload is not JSON: {}", e))),
    }
}

fn integer(map: &serde_json::Map<String, Value>, field: &str) -> Result<Option<i64>> {
    match map.get(field) {
        None => Ok(None),
        Some(value) => value
            .as_i64()
            .map(Some)
            .ok_or_else(|| BridgeError::Validation(format!("`{}` must be an integer", field))),
    }
}

fn number(map: &serde_json::Map<String, Value>, field: &str) -> Result<Option<f64>> {
    match map.get(field) {
        None => Ok(None),
        Some(value) => value
            .as_f64()
            .map(Some)
            .ok_or_else(|| BridgeError::Validation(format!("`{}` must be a number", field))),
    }
}

/// Parse and normalize a `set` payload for a feature.
///
/// Out-of-range values are clamped (hue wraps modulo 360); malformed
/// payloads are rejected.
pub fn parse_control(feature: Feature, payload: &str) -> Result<Control> {
    let map = object(payload)?;
    match feature {
        Feature::Switch | Feature::Light => {
            let state = map
                .get("state")
                .and_then(Value::as_str)
                .ok_or_else(|| BridgeError::Validation("`state` must be \"on\" or \"off\"".into()))?;
            match state.to_ascii_lowercase().as_str() {
                "on" => Ok(Control::OnOff(true)),
                "off" => Ok(Control::OnOff(false)),
                other => Err(BridgeError::Validation(format!(
                    "`state` must be \"on\" or \"off\", got {:?}",
                    other
                ))),
            }
        }
        Feature::Brightness => {
            let brightness = integer(&map, "brightness")?
                .ok_or_else(|| BridgeError::Validation("missing `brightness`".into()))?;
            Ok(Control::Brightness(brightness.clamp(0, 255) as u8))
        }
        Feature::Color => {
            if let (Some(x), Some(y)) = (number(&map, "x")?, number(&map, "y")?) {
                if !x.is_finite() || !y.is_finite() {
                    return Err(BridgeError::Validation("`x` and `y` must be finite".into()));
                }
                return Ok(Control::Xy {
                    x: x.clamp(0.0, 1.0),
                    y: y.clamp(0.0, 1.0),
                });
            }
            match (integer(&map, "hue")?, integer(&map, "saturation")?) {
                (Some(hue), Some(saturation)) => Ok(Control::HueSaturation {
                    hue: hue.rem_euclid(360) as u16,
                    saturation: saturation.clamp(0, 100) as u8,
                }),
                _ => Err(BridgeError::Validation(
                    "expected {\"hue\",\"saturation\"} or {\"x\",\"y\"}".into(),
                )),
            }
        }
        other => Err(BridgeError::Validation(format!("{} is read-only", other))),
    }
}

/// A command ready to enqueue, with the state it should produce.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedCommand {
    pub endpoint: u8,
    pub command: ClusterCommand,
    pub expected: Vec<(AttributeKey, AttributeValue)>,
}

/// Map a validated control onto the device's capabilities.
pub fn plan_command(
    ieee: Ieee,
    feature: Feature,
    control: Control,
    capabilities: &ResolvedCapabilities,
) -> Result<PlannedCommand> {
    let unsupported = |what: &str| BridgeError::CapabilityUnsupported {
        ieee,
        feature: what.to_string(),
    };
    let endpoint_of = |cluster: u16, what: &str| {
        capabilities
            .endpoint_for(cluster)
            .ok_or_else(|| unsupported(what))
    };

    match control {
        Control::OnOff(on) => {
            if !capabilities.supports_feature(feature) {
                return Err(unsupported(&feature.to_string()));
            }
            let endpoint = endpoint_of(on_off::CLUSTER_ID, "switch")?;
            Ok(PlannedCommand {
                endpoint,
                command: if on {
                    ClusterCommand::On
                } else {
                    ClusterCommand::Off
                },
                expected: vec![(
                    AttributeKey::new(endpoint, on_off::CLUSTER_ID, on_off::ATTR_ON_OFF),
                    AttributeValue::Bool(on),
                )],
            })
        }
        Control::Brightness(level) => {
            let address = capabilities
                .address(Capability::LightDimmable)
                .ok_or_else(|| unsupported(&Feature::Brightness.to_string()))?;
            let mut expected = vec![(
                AttributeKey::new(
                    address.endpoint,
                    level_control::CLUSTER_ID,
                    level_control::ATTR_CURRENT_LEVEL,
                ),
                AttributeValue::Int(i64::from(level)),
            )];
            if let Some(endpoint) = capabilities.endpoint_for(on_off::CLUSTER_ID) {
                expected.push((
                    AttributeKey::new(endpoint, on_off::CLUSTER_ID, on_off::ATTR_ON_OFF),
                    AttributeValue::Bool(level > 0),
                ));
            }
            Ok(PlannedCommand {
                endpoint: address.endpoint,
                command: ClusterCommand::MoveToLevelWithOnOff {
                    level,
                    transition_time: 0,
                },
                expected,
            })
        }
        Control::HueSaturation { hue, saturation } => {
            let address = capabilities
                .address(Capability::LightColorHs)
                .ok_or_else(|| unsupported("light/color (hue/saturation)"))?;
            let hue = clusters::hue_to_zcl(hue);
            let saturation = clusters::saturation_to_zcl(saturation);
            let key = |attribute| AttributeKey::new(address.endpoint, color_control::CLUSTER_ID, attribute);
            Ok(PlannedCommand {
                endpoint: address.endpoint,
                command: ClusterCommand::MoveToHueAndSaturation {
                    hue,
                    saturation,
                    transition_time: 0,
                },
                expected: vec![
                    (key(color_control::ATTR_CURRENT_HUE), AttributeValue::Int(i64::from(hue))),
                    (
                        key(color_control::ATTR_CURRENT_SATURATION),
                        AttributeValue::Int(i64::from(saturation)),
                    ),
                ],
            })
        }
        Control::Xy { x, y } => {
            let address = capabilities
                .address(Capability::LightColorXy)
                .ok_or_else(|| unsupported("light/color (xy)"))?;
            let x = clusters::xy_to_zcl(x);
            let y = clusters::xy_to_zcl(y);
            let key = |attribute| AttributeKey::new(address.endpoint, color_control::CLUSTER_ID, attribute);
            Ok(PlannedCommand {
                endpoint: address.endpoint,
                command: ClusterCommand::MoveToColor {
                    x,
                    y,
                    transition_time: 0,
                },
                expected: vec![
                    (key(color_control::ATTR_CURRENT_X), AttributeValue::Int(i64::from(x))),
                    (key(color_control::ATTR_CURRENT_Y), AttributeValue::Int(i64::from(y))),
                ],
            })
        }
    }
}

/// State shared by the translator and its workers.
struct WorkerContext {
    network: Arc<dyn NetworkLayer>,
    settings: CommandSettings,
    state: watch::Receiver<BridgeState>,
}

struct DeviceWorker {
    queue: mpsc::Sender<PendingCommand>,
    cancel: CancellationToken,
}

/// Validates `set` requests and runs them on per-device workers.
pub struct CommandTranslator {
    registry: RegistryView,
    context: Arc<WorkerContext>,
    workers: Mutex<HashMap<Ieee, DeviceWorker>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    accepting: AtomicBool,
}

impl CommandTranslator {
    pub fn new(
        registry: RegistryView,
        network: Arc<dyn NetworkLayer>,
        settings: CommandSettings,
        state: watch::Receiver<BridgeState>,
    ) -> Self {
        Self {
            registry,
            context: Arc::new(WorkerContext {
                network,
                settings,
                state,
            }),
            workers: Mutex::new(HashMap::new()),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            accepting: AtomicBool::new(true),
        }
    }

    /// Validate a `set` request and enqueue it.
    ///
    /// Validation failures return immediately and never reach the mesh. On
    /// success the returned receiver resolves once the device acknowledged
    /// the command or the worker gave up on it.
    pub fn submit(
        &self,
        raw_ieee: &str,
        feature: Feature,
        payload: &str,
    ) -> Result<oneshot::Receiver<CommandResult>> {
        let ieee: Ieee = raw_ieee
            .parse()
            .map_err(|_| BridgeError::DeviceUnknown(raw_ieee.to_string()))?;
        let capabilities = self
            .registry
            .capabilities(ieee)
            .ok_or_else(|| BridgeError::DeviceUnknown(raw_ieee.to_string()))?;
        if !capabilities.supports_feature(feature) {
            return Err(BridgeError::CapabilityUnsupported {
                ieee,
                feature: feature.to_string(),
            });
        }

        let control = parse_control(feature, payload)?;
        let planned = plan_command(ieee, feature, control, &capabilities)?;
        self.ensure_available()?;

        debug!(
            "[Command] {} {} -> {:?} on endpoint {}",
            ieee, feature, planned.command, planned.endpoint
        );
        self.enqueue(
            ieee,
            planned.endpoint,
            MeshRequest::Command(planned.command),
            planned.expected,
        )
    }

    /// Queue an attribute read on the device worker, behind any pending commands.
    pub fn read(
        &self,
        ieee: Ieee,
        endpoint: u8,
        cluster: u16,
        attributes: Vec<u16>,
    ) -> Result<oneshot::Receiver<CommandResult>> {
        self.ensure_available()?;
        self.enqueue(
            ieee,
            endpoint,
            MeshRequest::Read {
                cluster,
                attributes,
            },
            Vec::new(),
        )
    }

    /// Queue a reporting configuration step on the device worker.
    pub fn configure(
        &self,
        ieee: Ieee,
        step: ConfigurationStep,
    ) -> Result<oneshot::Receiver<CommandResult>> {
        self.ensure_available()?;
        self.enqueue(ieee, step.key().endpoint, MeshRequest::Configure(step), Vec::new())
    }

    fn ensure_available(&self) -> Result<()> {
        let state = *self.context.state.borrow();
        if !self.accepting.load(Ordering::Acquire) || !state.accepts_commands() {
            return Err(BridgeError::TransportUnavailable(format!(
                "bridge is {}",
                state
            )));
        }
        Ok(())
    }

    fn enqueue(
        &self,
        ieee: Ieee,
        endpoint: u8,
        request: MeshRequest,
        expected: Vec<(AttributeKey, AttributeValue)>,
    ) -> Result<oneshot::Receiver<CommandResult>> {
        let (responder, receiver) = oneshot::channel();
        let pending = PendingCommand {
            ieee,
            endpoint,
            request,
            expected,
            attempts: 0,
            enqueued_at: Instant::now(),
            responder,
        };

        let mut workers = self.workers.lock();
        let depth = self.context.settings.queue_depth;
        let worker = workers
            .entry(ieee)
            .or_insert_with(|| self.spawn_worker(ieee));

        match worker.queue.try_send(pending) {
            Ok(()) => Ok(receiver),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("[Command] Queue for {} is full", ieee);
                Err(BridgeError::CommandQueueFull { ieee, depth })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                workers.remove(&ieee);
                Err(BridgeError::Cancelled(ieee))
            }
        }
    }

    fn spawn_worker(&self, ieee: Ieee) -> DeviceWorker {
        let (queue, rx) = mpsc::channel(self.context.settings.queue_depth.max(1));
        let cancel = self.shutdown.child_token();
        self.tracker.spawn(run_worker(
            Arc::clone(&self.context),
            ieee,
            rx,
            cancel.clone(),
        ));
        debug!("[Command] Started worker for {}", ieee);
        DeviceWorker { queue, cancel }
    }

    /// Abort everything queued or in flight for a device.
    pub fn cancel_device(&self, ieee: Ieee) {
        if let Some(worker) = self.workers.lock().remove(&ieee) {
            info!("[Command] Cancelling pending commands for {}", ieee);
            worker.cancel.cancel();
        }
    }

    /// Stop accepting commands and let workers drain.
    ///
    /// Requests still running after `grace` are cancelled.
    pub async fn shutdown(&self, grace: Duration) {
        self.accepting.store(false, Ordering::Release);
        self.workers.lock().clear();
        self.tracker.close();

        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!("[Command] Grace period elapsed, cancelling in-flight commands");
            self.shutdown.cancel();
            self.tracker.wait().await;
        }
        info!("[Command] All device workers stopped");
    }
}

async fn run_worker(
    context: Arc<WorkerContext>,
    ieee: Ieee,
    mut queue: mpsc::Receiver<PendingCommand>,
    cancel: CancellationToken,
) {
    while let Some(mut pending) = queue.recv().await {
        let result = if cancel.is_cancelled() {
            Err(BridgeError::Cancelled(ieee))
        } else {
            context.execute(&mut pending, &cancel).await
        };
        match &result {
            Ok(_) => debug!(
                "[Command] {} completed in {:?}",
                ieee,
                pending.enqueued_at.elapsed()
            ),
            Err(e) => debug!(
                "[Command] {} failed after {} attempt(s): {}",
                ieee, pending.attempts, e
            ),
        }
        let _ = pending.responder.send(result);
    }
    debug!("[Command] Worker for {} stopped", ieee);
}

impl WorkerContext {
    async fn execute(&self, pending: &mut PendingCommand, cancel: &CancellationToken) -> CommandResult {
        let ieee = pending.ieee;
        let policy = self.settings.retry;

        loop {
            let state = *self.state.borrow();
            if !state.accepts_commands() {
                return Err(BridgeError::TransportUnavailable(format!("bridge is {}", state)));
            }

            pending.attempts += 1;
            let deadline = Instant::now() + self.settings.timeout;
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BridgeError::Cancelled(ieee)),
                outcome = tokio::time::timeout_at(deadline, self.perform(pending)) => outcome,
            };

            let error = match outcome {
                Ok(Ok(values)) => {
                    let mut values = values;
                    values.extend(pending.expected.iter().cloned());
                    return Ok(CommandSuccess {
                        ieee,
                        attempts: pending.attempts,
                        values,
                    });
                }
                Ok(Err(NetworkError::Unreachable)) => return Err(BridgeError::DeviceUnreachable(ieee)),
                Ok(Err(NetworkError::Disconnected)) => {
                    return Err(BridgeError::TransportUnavailable(
                        NetworkError::Disconnected.to_string(),
                    ));
                }
                Ok(Err(e)) if !e.is_transient() => return Err(e.into()),
                Ok(Err(e)) => e,
                Err(_) => NetworkError::Timeout,
            };

            if !pending.request.is_retried() {
                return Err(error.into());
            }

            if !policy.allows(pending.attempts) {
                warn!(
                    "[Command] {} gave up after {} attempt(s): {}",
                    ieee, pending.attempts, error
                );
                return Err(BridgeError::TransportTimeout {
                    ieee,
                    attempts: pending.attempts,
                });
            }

            let backoff = policy.delay(pending.attempts);
            debug!(
                "[Command] Attempt {} to {} failed ({}), retrying in {:?}",
                pending.attempts, ieee, error, backoff
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BridgeError::Cancelled(ieee)),
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    async fn perform(
        &self,
        pending: &PendingCommand,
    ) -> std::result::Result<Vec<(AttributeKey, AttributeValue)>, NetworkError> {
        match &pending.request {
            MeshRequest::Command(command) => {
                self.network
                    .issue_command(pending.ieee, pending.endpoint, *command)
                    .await?;
                Ok(Vec::new())
            }
            MeshRequest::Read {
                cluster,
                attributes,
            } => {
                let mut values = Vec::with_capacity(attributes.len());
                for &attribute in attributes {
                    match self
                        .network
                        .read_attribute(pending.ieee, pending.endpoint, *cluster, attribute)
                        .await
                    {
                        Ok(value) => values.push((
                            AttributeKey::new(pending.endpoint, *cluster, attribute),
                            value,
                        )),
                        Err(NetworkError::Unsupported { .. }) => {}
                        Err(e) => return Err(e),
                    }
                }
                Ok(values)
            }
            MeshRequest::Configure(step) => {
                reporting::send_step(self.network.as_ref(), pending.ieee, step).await?;
                Ok(Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::capability::resolve;
    use crate::bridge::registry::{ConfigurationStatus, RegistryWriter};
    use crate::testing::{COORDINATOR, color_light, dimmable_light, smart_plug};
    use crate::zigbee::SimulatedNetwork;

    const PLUG: Ieee = Ieee(0x00158d0000000001);
    const LIGHT: Ieee = Ieee(0x00158d0000000002);
    const XY_LIGHT: Ieee = Ieee(0x00158d0000000005);

    struct Fixture {
        network: Arc<SimulatedNetwork>,
        translator: CommandTranslator,
        state: watch::Sender<BridgeState>,
        _writer: RegistryWriter,
    }

    async fn fixture(settings: CommandSettings) -> Fixture {
        let (network, _rx) = SimulatedNetwork::new(COORDINATOR);
        network.connect().await.unwrap();
        let mut writer = RegistryWriter::new();
        for descriptor in [smart_plug(PLUG), color_light(LIGHT, 0x0019), color_light(XY_LIGHT, 0x0008)] {
            network.add_device(descriptor.clone());
            writer.upsert(descriptor, ConfigurationStatus::Complete);
        }
        let (state, state_rx) = watch::channel(BridgeState::Ready);
        let translator = CommandTranslator::new(writer.view(), network.clone(), settings, state_rx);
        Fixture {
            network,
            translator,
            state,
            _writer: writer,
        }
    }

    fn fast_settings() -> CommandSettings {
        CommandSettings {
            timeout: Duration::from_millis(200),
            retry: RetryPolicy::new(3, 5, 20),
            queue_depth: 16,
        }
    }

    const PLUG_ON_OFF: AttributeKey = AttributeKey::new(1, 0x0006, 0x0000);

    #[test]
    fn test_state_is_case_insensitive() {
        assert_eq!(
            parse_control(Feature::Switch, r#"{"state":"ON"}"#).unwrap(),
            Control::OnOff(true)
        );
        assert_eq!(
            parse_control(Feature::Light, r#"{"state":"Off"}"#).unwrap(),
            Control::OnOff(false)
        );
    }

    #[test]
    fn test_invalid_state_is_rejected() {
        for payload in [r#"{"state":"maybe"}"#, r#"{"state":1}"#, r#"{}"#, "on", "[1]"] {
            let err = parse_control(Feature::Switch, payload).unwrap_err();
            assert_eq!(err.kind(), "validation_error", "payload {}", payload);
        }
    }

    #[test]
    fn test_brightness_is_clamped() {
        assert_eq!(
            parse_control(Feature::Brightness, r#"{"brightness":300}"#).unwrap(),
            Control::Brightness(255)
        );
        assert_eq!(
            parse_control(Feature::Brightness, r#"{"brightness":-5}"#).unwrap(),
            Control::Brightness(0)
        );
        assert!(parse_control(Feature::Brightness, r#"{"brightness":"high"}"#).is_err());
    }

    #[test]
    fn test_hue_wraps_and_saturation_clamps() {
        assert_eq!(
            parse_control(Feature::Color, r#"{"hue":400,"saturation":150}"#).unwrap(),
            Control::HueSaturation {
                hue: 40,
                saturation: 100
            }
        );
        assert_eq!(
            parse_control(Feature::Color, r#"{"hue":-30,"saturation":50}"#).unwrap(),
            Control::HueSaturation {
                hue: 330,
                saturation: 50
            }
        );
    }

    #[test]
    fn test_xy_is_clamped_and_preferred() {
        assert_eq!(
            parse_control(Feature::Color, r#"{"x":1.5,"y":-0.2,"hue":10,"saturation":10}"#).unwrap(),
            Control::Xy { x: 1.0, y: 0.0 }
        );
        assert!(parse_control(Feature::Color, r#"{"hue":10}"#).is_err());
    }

    #[test]
    fn test_read_only_features_reject_set() {
        assert!(parse_control(Feature::Temperature, r#"{"temperature":20}"#).is_err());
    }

    #[test]
    fn test_hs_payload_on_xy_only_light_is_unsupported() {
        let capabilities = resolve(&color_light(XY_LIGHT, 0x0008).endpoints);
        let err = plan_command(
            XY_LIGHT,
            Feature::Color,
            Control::HueSaturation {
                hue: 40,
                saturation: 50,
            },
            &capabilities,
        )
        .unwrap_err();
        assert_eq!(err.kind(), "capability_unsupported");
    }

    #[test]
    fn test_brightness_expects_on_state() {
        let capabilities = resolve(&dimmable_light(LIGHT).endpoints);
        let planned = plan_command(LIGHT, Feature::Brightness, Control::Brightness(0), &capabilities)
            .unwrap();
        assert_eq!(
            planned.command,
            ClusterCommand::MoveToLevelWithOnOff {
                level: 0,
                transition_time: 0
            }
        );
        assert!(planned.expected.contains(&(
            AttributeKey::new(1, 0x0006, 0x0000),
            AttributeValue::Bool(false)
        )));
    }

    #[tokio::test]
    async fn test_submit_issues_exactly_one_command() {
        let f = fixture(fast_settings()).await;
        let rx = f.translator.submit(&PLUG.to_string(), Feature::Switch, r#"{"state":"on"}"#).unwrap();
        let success = rx.await.unwrap().unwrap();

        assert_eq!(success.attempts, 1);
        assert_eq!(success.values, vec![(PLUG_ON_OFF, AttributeValue::Bool(true))]);
        let issued = f.network.issued_commands();
        assert_eq!(issued.len(), 1);
        assert_eq!(issued[0].command, ClusterCommand::On);
        assert_eq!(issued[0].endpoint, 1);
    }

    #[tokio::test]
    async fn test_validation_failures_generate_no_traffic() {
        let f = fixture(fast_settings()).await;
        let plug = PLUG.to_string();
        let xy_light = XY_LIGHT.to_string();
        let cases = [
            ("not-an-address", Feature::Switch, r#"{"state":"on"}"#, "device_unknown"),
            ("00:00:00:00:00:00:be:ef", Feature::Switch, r#"{"state":"on"}"#, "device_unknown"),
            (plug.as_str(), Feature::Brightness, r#"{"brightness":10}"#, "capability_unsupported"),
            (plug.as_str(), Feature::Switch, r#"{"state":"dim"}"#, "validation_error"),
            (xy_light.as_str(), Feature::Color, r#"{"hue":1,"saturation":1}"#, "capability_unsupported"),
        ];
        for (ieee, feature, payload, kind) in cases {
            let err = f.translator.submit(ieee, feature, payload).unwrap_err();
            assert_eq!(err.kind(), kind, "{} {} {}", ieee, feature, payload);
        }
        assert!(f.network.issued_commands().is_empty());
    }

    #[tokio::test]
    async fn test_hue_400_is_sent_as_40_degrees() {
        let f = fixture(fast_settings()).await;
        let rx = f
            .translator
            .submit(&LIGHT.to_string(), Feature::Color, r#"{"hue":400,"saturation":100}"#)
            .unwrap();
        rx.await.unwrap().unwrap();
        assert_eq!(
            f.network.issued_commands()[0].command,
            ClusterCommand::MoveToHueAndSaturation {
                hue: clusters::hue_to_zcl(40),
                saturation: 254,
                transition_time: 0
            }
        );
    }

    #[tokio::test]
    async fn test_one_command_in_flight_per_device() {
        let f = fixture(fast_settings()).await;
        f.network.set_latency(Duration::from_millis(20));

        let mut receivers = Vec::new();
        for i in 0..5 {
            let payload = if i % 2 == 0 { r#"{"state":"on"}"# } else { r#"{"state":"off"}"# };
            receivers.push(f.translator.submit(&PLUG.to_string(), Feature::Switch, payload).unwrap());
            receivers.push(
                f.translator
                    .submit(&LIGHT.to_string(), Feature::Light, payload)
                    .unwrap(),
            );
        }
        for rx in receivers {
            rx.await.unwrap().unwrap();
        }

        assert_eq!(f.network.max_in_flight(PLUG), 1);
        assert_eq!(f.network.max_in_flight(LIGHT), 1);
        assert_eq!(f.network.issued_commands().len(), 10);
        assert_eq!(
            f.network.attribute(PLUG, PLUG_ON_OFF),
            Some(AttributeValue::Bool(true))
        );
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let f = fixture(fast_settings()).await;
        f.network
            .fail_next_commands(PLUG, [NetworkError::NoAck, NetworkError::Timeout]);
        let rx = f.translator.submit(&PLUG.to_string(), Feature::Switch, r#"{"state":"off"}"#).unwrap();
        let success = rx.await.unwrap().unwrap();
        assert_eq!(success.attempts, 3);
        assert_eq!(f.network.issued_commands().len(), 3);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_frees_the_device() {
        let f = fixture(fast_settings()).await;
        f.network.fail_next_commands(PLUG, vec![NetworkError::NoAck; 3]);

        let rx = f.translator.submit(&PLUG.to_string(), Feature::Switch, r#"{"state":"on"}"#).unwrap();
        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::TransportTimeout { attempts: 3, .. }));

        let rx = f.translator.submit(&PLUG.to_string(), Feature::Switch, r#"{"state":"on"}"#).unwrap();
        assert_eq!(rx.await.unwrap().unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn test_unreachable_device_fails_without_retry() {
        let f = fixture(fast_settings()).await;
        f.network.set_reachable(PLUG, false);
        let rx = f.translator.submit(&PLUG.to_string(), Feature::Switch, r#"{"state":"on"}"#).unwrap();
        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), "device_unreachable");
    }

    #[tokio::test]
    async fn test_command_timeout_counts_as_attempt() {
        let f = fixture(CommandSettings {
            timeout: Duration::from_millis(10),
            retry: RetryPolicy::new(2, 1, 1),
            queue_depth: 4,
        })
        .await;
        f.network.set_latency(Duration::from_millis(200));
        let rx = f.translator.submit(&PLUG.to_string(), Feature::Switch, r#"{"state":"on"}"#).unwrap();
        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::TransportTimeout { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn test_full_queue_rejects_new_commands() {
        let f = fixture(CommandSettings {
            timeout: Duration::from_secs(5),
            retry: RetryPolicy::new(1, 1, 1),
            queue_depth: 2,
        })
        .await;
        f.network.set_latency(Duration::from_millis(100));

        let mut accepted = Vec::new();
        let mut rejected = 0;
        for _ in 0..6 {
            match f.translator.submit(&PLUG.to_string(), Feature::Switch, r#"{"state":"on"}"#) {
                Ok(rx) => accepted.push(rx),
                Err(BridgeError::CommandQueueFull { depth, .. }) => {
                    assert_eq!(depth, 2);
                    rejected += 1;
                }
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert!(rejected > 0);
        for rx in accepted {
            rx.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_degraded_bridge_fails_fast() {
        let f = fixture(fast_settings()).await;
        f.state.send_replace(BridgeState::Degraded);
        let err = f
            .translator
            .submit(&PLUG.to_string(), Feature::Switch, r#"{"state":"on"}"#)
            .unwrap_err();
        assert_eq!(err.kind(), "transport_unavailable");
        assert!(f.network.issued_commands().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_device_aborts_retries() {
        let f = fixture(CommandSettings {
            timeout: Duration::from_millis(200),
            retry: RetryPolicy::new(5, 10_000, 10_000),
            queue_depth: 4,
        })
        .await;
        f.network.fail_next_commands(PLUG, [NetworkError::NoAck]);
        let rx = f.translator.submit(&PLUG.to_string(), Feature::Switch, r#"{"state":"on"}"#).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        f.translator.cancel_device(PLUG);
        let err = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, BridgeError::Cancelled(ieee) if ieee == PLUG));

        // A fresh worker serves later commands.
        let rx = f.translator.submit(&PLUG.to_string(), Feature::Switch, r#"{"state":"on"}"#).unwrap();
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_drains_then_rejects() {
        let f = fixture(fast_settings()).await;
        f.network.set_latency(Duration::from_millis(30));
        let rx = f.translator.submit(&PLUG.to_string(), Feature::Switch, r#"{"state":"on"}"#).unwrap();

        f.translator.shutdown(Duration::from_secs(1)).await;
        assert!(rx.await.unwrap().is_ok());
        let err = f
            .translator
            .submit(&PLUG.to_string(), Feature::Switch, r#"{"state":"off"}"#)
            .unwrap_err();
        assert_eq!(err.kind(), "transport_unavailable");
    }

    #[tokio::test]
    async fn test_shutdown_cancels_after_grace() {
        let f = fixture(CommandSettings {
            timeout: Duration::from_millis(100),
            retry: RetryPolicy::new(10, 10_000, 10_000),
            queue_depth: 4,
        })
        .await;
        f.network.fail_next_commands(PLUG, [NetworkError::NoAck]);
        let rx = f.translator.submit(&PLUG.to_string(), Feature::Switch, r#"{"state":"on"}"#).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(2), f.translator.shutdown(Duration::from_millis(50)))
            .await
            .unwrap();
        assert_eq!(rx.await.unwrap().unwrap_err().kind(), "cancelled");
    }

    #[tokio::test]
    async fn test_read_skips_unsupported_attributes() {
        let f = fixture(fast_settings()).await;
        f.network.report(PLUG, PLUG_ON_OFF, AttributeValue::Bool(true));
        let rx = f
            .translator
            .read(PLUG, 1, 0x0006, vec![0x0000, 0x4003])
            .unwrap();
        let success = rx.await.unwrap().unwrap();
        assert_eq!(success.values, vec![(PLUG_ON_OFF, AttributeValue::Bool(true))]);
    }
}

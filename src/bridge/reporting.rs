//! Attribute-reporting configuration.
//!
//! Every capability implies a set of reporting contracts. A device is
//! configured once inline when it is admitted; contracts that fail with a
//! retryable error are retried in the background on the reporting backoff
//! schedule until they succeed or the attempt ceiling is reached. Retries
//! run on the device's command worker, so they never overlap a command.

use super::capability::{Capability, ResolvedCapabilities};
use super::command::CommandTranslator;
use super::registry::ConfigurationStatus;
use crate::config::RetryPolicy;
use crate::error::BridgeError;
use crate::zigbee::clusters::ias_zone;
use crate::zigbee::{AttributeKey, AttributeValue, Ieee, NetworkError, NetworkLayer, ReportingContract};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// One configuration request sent to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigurationStep {
    Report {
        key: AttributeKey,
        contract: ReportingContract,
    },
    /// Write the coordinator address into IAS_CIE_Address so the zone
    /// sends its notifications to us.
    EnrollCie { endpoint: u8 },
}

impl ConfigurationStep {
    pub fn key(&self) -> AttributeKey {
        match self {
            ConfigurationStep::Report { key, .. } => *key,
            ConfigurationStep::EnrollCie { endpoint } => {
                AttributeKey::new(*endpoint, ias_zone::CLUSTER_ID, ias_zone::ATTR_IAS_CIE_ADDRESS)
            }
        }
    }
}

/// Result of one configuration pass over a device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigurationReport {
    pub configured: Vec<AttributeKey>,
    /// Steps that failed with an error worth retrying.
    pub retryable: Vec<ConfigurationStep>,
    /// Steps the device rejected outright.
    pub rejected: Vec<AttributeKey>,
}

impl ConfigurationReport {
    fn record(&mut self, ieee: Ieee, step: &ConfigurationStep, result: Result<(), NetworkError>) {
        match result {
            Ok(()) => self.configured.push(step.key()),
            Err(NetworkError::Unsupported { cluster, attribute }) => {
                warn!(
                    "[Reporting] {} rejected reporting on 0x{:04x}/0x{:04x}",
                    ieee, cluster, attribute
                );
                self.rejected.push(step.key());
            }
            Err(e) => {
                debug!("[Reporting] {} step {:?} failed: {}", ieee, step, e);
                self.retryable.push(*step);
            }
        }
    }

    fn log_outcome(&self, ieee: Ieee, steps: usize) {
        if self.is_complete() {
            info!(
                "[Reporting] Configured {} contract(s) on {}",
                self.configured.len(),
                ieee
            );
        } else {
            warn!(
                "[Reporting] {} of {} step(s) failed on {}",
                self.missing(),
                steps,
                ieee
            );
        }
    }

    pub fn is_complete(&self) -> bool {
        self.retryable.is_empty() && self.rejected.is_empty()
    }

    pub fn missing(&self) -> usize {
        self.retryable.len() + self.rejected.len()
    }

    /// Registry status after this pass, given whether retries will follow.
    pub fn status(&self, retrying: bool) -> ConfigurationStatus {
        if self.is_complete() {
            return ConfigurationStatus::Complete;
        }
        let pending: Vec<AttributeKey> = self.retryable.iter().map(ConfigurationStep::key).collect();
        let (retrying, mut degraded) = if retrying {
            (pending, Vec::new())
        } else {
            (Vec::new(), pending)
        };
        degraded.extend(self.rejected.iter().copied());
        ConfigurationStatus::Partial { retrying, degraded }
    }
}

/// Progress of a background retry, sent back to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportingUpdate {
    pub ieee: Ieee,
    pub status: ConfigurationStatus,
}

/// Send one step to a device, without timeout.
pub(crate) async fn send_step(
    network: &dyn NetworkLayer,
    ieee: Ieee,
    step: &ConfigurationStep,
) -> Result<(), NetworkError> {
    match *step {
        ConfigurationStep::Report { key, contract } => {
            network
                .configure_reporting(ieee, key.endpoint, key.cluster, key.attribute, contract)
                .await
        }
        ConfigurationStep::EnrollCie { endpoint } => {
            network
                .write_attribute(
                    ieee,
                    endpoint,
                    ias_zone::CLUSTER_ID,
                    ias_zone::ATTR_IAS_CIE_ADDRESS,
                    AttributeValue::Ieee(network.coordinator_ieee()),
                )
                .await
        }
    }
}

/// Installs reporting contracts on devices.
#[derive(Clone)]
pub struct ReportingConfigurator {
    network: Arc<dyn NetworkLayer>,
    commands: Arc<CommandTranslator>,
    policy: RetryPolicy,
    request_timeout: Duration,
}

impl ReportingConfigurator {
    pub fn new(
        network: Arc<dyn NetworkLayer>,
        commands: Arc<CommandTranslator>,
        policy: RetryPolicy,
        request_timeout: Duration,
    ) -> Self {
        Self {
            network,
            commands,
            policy,
            request_timeout,
        }
    }

    /// Steps implied by a capability set.
    pub fn plan(&self, capabilities: &ResolvedCapabilities) -> Vec<ConfigurationStep> {
        let mut steps: Vec<ConfigurationStep> = capabilities
            .implied_contracts()
            .into_iter()
            .map(|(key, contract)| ConfigurationStep::Report { key, contract })
            .collect();
        if let Some(address) = capabilities.address(Capability::Zone) {
            steps.push(ConfigurationStep::EnrollCie {
                endpoint: address.endpoint,
            });
        }
        steps
    }

    /// Run every step once.
    ///
    /// Contracts are idempotent on the device side, so configuring an
    /// already configured device only re-sends identical parameters.
    pub async fn configure(&self, ieee: Ieee, steps: &[ConfigurationStep]) -> ConfigurationReport {
        let mut report = ConfigurationReport::default();
        for step in steps {
            let request = send_step(self.network.as_ref(), ieee, step);
            let result = tokio::time::timeout(self.request_timeout, request)
                .await
                .unwrap_or(Err(NetworkError::Timeout));
            report.record(ieee, step, result);
        }
        report.log_outcome(ieee, steps.len());
        report
    }

    /// Run every step once on the device's command worker, behind anything
    /// already queued for the device.
    async fn configure_queued(&self, ieee: Ieee, steps: &[ConfigurationStep]) -> ConfigurationReport {
        let mut report = ConfigurationReport::default();
        for step in steps {
            let completion = match self.commands.configure(ieee, *step) {
                Ok(rx) => rx
                    .await
                    .unwrap_or_else(|_| Err(BridgeError::Cancelled(ieee))),
                Err(e) => Err(e),
            };
            let result = match completion {
                Ok(_) => Ok(()),
                Err(BridgeError::Network(e)) => Err(e),
                Err(e) => Err(NetworkError::Other(e.to_string())),
            };
            report.record(ieee, step, result);
        }
        report.log_outcome(ieee, steps.len());
        report
    }

    /// Retry failed steps in the background.
    ///
    /// Each pass sends a [`ReportingUpdate`]. The task stops when everything
    /// is configured, when the attempt ceiling is reached, or when `cancel`
    /// fires (device removed, bridge shutting down).
    pub fn spawn_retries(
        &self,
        ieee: Ieee,
        initial: ConfigurationReport,
        cancel: CancellationToken,
        updates: mpsc::Sender<ReportingUpdate>,
    ) -> JoinHandle<()> {
        let configurator = self.clone();
        tokio::spawn(async move {
            let mut rejected = initial.rejected;
            let mut pending = initial.retryable;
            // The inline pass was attempt 1.
            let mut attempt = 1;

            while !pending.is_empty() {
                if !configurator.policy.allows(attempt) {
                    warn!(
                        "[Reporting] Giving up on {} step(s) for {} after {} attempt(s)",
                        pending.len(),
                        ieee,
                        attempt
                    );
                    break;
                }
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("[Reporting] Retries for {} cancelled", ieee);
                        return;
                    }
                    _ = tokio::time::sleep(configurator.policy.delay(attempt)) => {}
                }
                attempt += 1;

                let report = configurator.configure_queued(ieee, &pending).await;
                rejected.extend(report.rejected);
                pending = report.retryable;

                let still_retrying = !pending.is_empty() && configurator.policy.allows(attempt);
                let status = ConfigurationReport {
                    configured: Vec::new(),
                    retryable: pending.clone(),
                    rejected: rejected.clone(),
                }
                .status(still_retrying);

                if cancel.is_cancelled() {
                    return;
                }
                if updates.send(ReportingUpdate { ieee, status }).await.is_err() {
                    return;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::capability::resolve;
    use crate::bridge::command::CommandSettings;
    use crate::bridge::registry::{RegistryView, RegistryWriter};
    use crate::bridge::state::BridgeState;
    use crate::mqtt::Feature;
    use crate::testing::{COORDINATOR, color_light, motion_sensor, smart_plug};
    use crate::zigbee::SimulatedNetwork;
    use tokio::sync::watch;

    const PLUG: Ieee = Ieee(0x00158d0000000001);
    const LIGHT: Ieee = Ieee(0x00158d0000000002);
    const MOTION: Ieee = Ieee(0x00158d0000000003);

    fn translator(network: &Arc<SimulatedNetwork>, registry: RegistryView) -> Arc<CommandTranslator> {
        let (_state, state_rx) = watch::channel(BridgeState::Ready);
        Arc::new(CommandTranslator::new(
            registry,
            network.clone(),
            CommandSettings {
                timeout: Duration::from_millis(200),
                retry: RetryPolicy::new(3, 5, 20),
                queue_depth: 16,
            },
            state_rx,
        ))
    }

    fn configurator_with(network: Arc<SimulatedNetwork>, policy: RetryPolicy) -> ReportingConfigurator {
        let commands = translator(&network, RegistryWriter::new().view());
        ReportingConfigurator::new(network, commands, policy, Duration::from_millis(200))
    }

    fn configurator(network: Arc<SimulatedNetwork>) -> ReportingConfigurator {
        configurator_with(network, RetryPolicy::new(3, 10, 20))
    }

    async fn connected_network() -> Arc<SimulatedNetwork> {
        let (network, _rx) = SimulatedNetwork::new(COORDINATOR);
        network.connect().await.unwrap();
        network
    }

    #[tokio::test]
    async fn test_configure_installs_every_contract() {
        let network = connected_network().await;
        let descriptor = color_light(LIGHT, 0x0019);
        network.add_device(descriptor.clone());
        let configurator = configurator(network.clone());

        let capabilities = resolve(&descriptor.endpoints);
        let steps = configurator.plan(&capabilities);
        let report = configurator.configure(LIGHT, &steps).await;

        assert!(report.is_complete());
        assert_eq!(report.configured.len(), 6);
        assert_eq!(report.status(false), ConfigurationStatus::Complete);
        assert_eq!(
            network.installed_contract(LIGHT, AttributeKey::new(11, 0x0008, 0x0000)),
            Some(ReportingContract::new(1, 900, 1))
        );
    }

    #[tokio::test]
    async fn test_reconfigure_is_idempotent() {
        let network = connected_network().await;
        let descriptor = smart_plug(PLUG);
        network.add_device(descriptor.clone());
        let configurator = configurator(network.clone());
        let steps = configurator.plan(&resolve(&descriptor.endpoints));

        let first = configurator.configure(PLUG, &steps).await;
        let second = configurator.configure(PLUG, &steps).await;

        assert_eq!(first, second);
        let records = network.reporting_records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].contract, records[1].contract);
        assert_eq!(records[0].key, records[1].key);
    }

    #[tokio::test]
    async fn test_zone_enrollment_writes_coordinator_address() {
        let network = connected_network().await;
        let descriptor = motion_sensor(MOTION);
        network.add_device(descriptor.clone());
        let configurator = configurator(network.clone());

        let steps = configurator.plan(&resolve(&descriptor.endpoints));
        assert!(steps.contains(&ConfigurationStep::EnrollCie { endpoint: 1 }));

        let report = configurator.configure(MOTION, &steps).await;
        assert!(report.is_complete());
        assert_eq!(
            network.attribute_writes(),
            vec![(
                MOTION,
                AttributeKey::new(1, ias_zone::CLUSTER_ID, ias_zone::ATTR_IAS_CIE_ADDRESS),
                AttributeValue::Ieee(COORDINATOR)
            )]
        );
    }

    #[tokio::test]
    async fn test_rejected_contract_is_degraded_without_retry() {
        let network = connected_network().await;
        let descriptor = smart_plug(PLUG);
        network.add_device(descriptor.clone());
        network.mark_unsupported(PLUG, 0x0006, 0x0000);
        let configurator = configurator(network.clone());

        let steps = configurator.plan(&resolve(&descriptor.endpoints));
        let report = configurator.configure(PLUG, &steps).await;

        assert!(report.retryable.is_empty());
        assert_eq!(
            report.status(true),
            ConfigurationStatus::Partial {
                retrying: vec![],
                degraded: vec![AttributeKey::new(1, 0x0006, 0x0000)],
            }
        );
    }

    #[tokio::test]
    async fn test_background_retry_completes_configuration() {
        let network = connected_network().await;
        let descriptor = smart_plug(PLUG);
        network.add_device(descriptor.clone());
        network.fail_reporting(PLUG, 0x0006, 0x0000, 2);
        let configurator = configurator(network.clone());

        let steps = configurator.plan(&resolve(&descriptor.endpoints));
        let report = configurator.configure(PLUG, &steps).await;
        assert_eq!(report.retryable.len(), 1);

        let (tx, mut rx) = mpsc::channel(8);
        let handle = configurator.spawn_retries(PLUG, report, CancellationToken::new(), tx);

        let first = rx.recv().await.unwrap();
        assert!(matches!(first.status, ConfigurationStatus::Partial { .. }));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.status, ConfigurationStatus::Complete);
        handle.await.unwrap();

        assert!(
            network
                .installed_contract(PLUG, AttributeKey::new(1, 0x0006, 0x0000))
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_background_retry_gives_up_at_ceiling() {
        let network = connected_network().await;
        let descriptor = smart_plug(PLUG);
        network.add_device(descriptor.clone());
        network.fail_reporting(PLUG, 0x0006, 0x0000, 100);
        let configurator = configurator(network.clone());

        let steps = configurator.plan(&resolve(&descriptor.endpoints));
        let report = configurator.configure(PLUG, &steps).await;
        let (tx, mut rx) = mpsc::channel(8);
        configurator
            .spawn_retries(PLUG, report, CancellationToken::new(), tx)
            .await
            .unwrap();

        let mut last = None;
        while let Ok(update) = rx.try_recv() {
            last = Some(update);
        }
        assert_eq!(
            last.unwrap().status,
            ConfigurationStatus::Partial {
                retrying: vec![],
                degraded: vec![AttributeKey::new(1, 0x0006, 0x0000)],
            }
        );
        // One inline attempt plus two retries.
        assert_eq!(network.reporting_records().len(), 3);
    }

    #[tokio::test]
    async fn test_background_retry_stops_on_cancel() {
        let network = connected_network().await;
        let descriptor = smart_plug(PLUG);
        network.add_device(descriptor.clone());
        network.fail_reporting(PLUG, 0x0006, 0x0000, 100);
        let configurator = configurator_with(network.clone(), RetryPolicy::new(0, 60_000, 60_000));

        let steps = configurator.plan(&resolve(&descriptor.endpoints));
        let report = configurator.configure(PLUG, &steps).await;
        let cancel = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(8);
        let handle = configurator.spawn_retries(PLUG, report, cancel.clone(), tx);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(network.reporting_records().len(), 1);
    }

    #[tokio::test]
    async fn test_background_retry_waits_behind_device_commands() {
        let network = connected_network().await;
        let descriptor = smart_plug(PLUG);
        network.add_device(descriptor.clone());
        network.fail_reporting(PLUG, 0x0006, 0x0000, 1);
        let mut writer = RegistryWriter::new();
        writer.upsert(descriptor.clone(), ConfigurationStatus::Pending);
        let commands = translator(&network, writer.view());
        let configurator = ReportingConfigurator::new(
            network.clone(),
            commands.clone(),
            RetryPolicy::new(3, 10, 20),
            Duration::from_millis(200),
        );

        let steps = configurator.plan(&resolve(&descriptor.endpoints));
        let report = configurator.configure(PLUG, &steps).await;
        assert_eq!(report.retryable.len(), 1);

        // The command is still on the mesh when the retry comes due.
        network.set_latency(Duration::from_millis(100));
        let command = commands
            .submit(&PLUG.to_string(), Feature::Switch, r#"{"state": "on"}"#)
            .unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let handle = configurator.spawn_retries(PLUG, report, CancellationToken::new(), tx);

        assert!(command.await.unwrap().is_ok());
        assert_eq!(rx.recv().await.unwrap().status, ConfigurationStatus::Complete);
        handle.await.unwrap();
        assert_eq!(network.max_in_flight(PLUG), 1);
        assert_eq!(network.reporting_records().len(), 2);
    }
}

use clap::Parser;
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use zigbee_mqtt_bridge::bridge::Bridge;
use zigbee_mqtt_bridge::config::{Config, load_dotenv};
use zigbee_mqtt_bridge::instance_lock::InstanceLock;
use zigbee_mqtt_bridge::mqtt::{MqttClient, MqttTransport};
use zigbee_mqtt_bridge::zigbee::{NetworkLayer, SimulatedNetwork, simulated::run_report_simulation};

/// Bridge the devices of a Zigbee mesh onto an MQTT bus.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// MQTT broker host
    #[arg(long, env = "MQTT_BROKER_HOST")]
    broker_host: Option<String>,

    /// MQTT broker port
    #[arg(long, env = "MQTT_BROKER_PORT")]
    broker_port: Option<u16>,

    /// Root of every bridge topic
    #[arg(long, env = "MQTT_BASE_TOPIC")]
    base_topic: Option<String>,

    /// Serial device of the coordinator radio
    #[arg(long, env = "ZIGBEE_DEVICE_PATH")]
    device_path: Option<String>,

    /// JSON device database for the simulated mesh
    #[arg(long, env = "ZIGBEE_DEVICE_DB")]
    device_db: Option<PathBuf>,

    /// Emit simulated sensor reports at this period (seconds, 0 disables)
    #[arg(long, default_value_t = 60)]
    simulate_reports_secs: u64,
}

impl Args {
    fn apply(self, config: &mut Config) {
        if let Some(host) = self.broker_host {
            config.mqtt.broker_host = host;
        }
        if let Some(port) = self.broker_port {
            config.mqtt.broker_port = port;
        }
        if let Some(base) = self.base_topic {
            config.mqtt.base_topic = base;
        }
        if let Some(path) = self.device_path {
            config.zigbee.device_path = path;
        }
        if let Some(db) = self.device_db {
            config.zigbee.device_db = Some(db.display().to_string());
        }
    }
}

fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

fn main() -> ExitCode {
    // .env is applied before the runtime spawns any threads and before clap reads the environment
    load_dotenv();
    init_logger();

    let args = Args::parse();
    let report_period = Duration::from_secs(args.simulate_reports_secs);
    let mut config = Config::from_env();
    args.apply(&mut config);

    match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime.block_on(run(config, report_period)),
        Err(e) => {
            error!("Failed to start the async runtime: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config, report_period: Duration) -> ExitCode {
    info!("Starting Zigbee MQTT bridge");
    info!(
        "  Broker: {}:{}",
        config.mqtt.broker_host, config.mqtt.broker_port
    );
    info!("  Base topic: {}", config.mqtt.base_topic);
    info!("  Coordinator: {}", config.zigbee.device_path);

    let _lock = match InstanceLock::acquire(&config.zigbee.device_path) {
        Ok(lock) => lock,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let coordinator = config.zigbee.coordinator_ieee;
    let (network, network_events) = match &config.zigbee.device_db {
        Some(path) => match SimulatedNetwork::from_device_db(coordinator, Path::new(path)) {
            Ok(network) => network,
            Err(e) => {
                error!("Failed to load device database {}: {}", path, e);
                return ExitCode::FAILURE;
            }
        },
        None => {
            warn!("No device database configured, starting with an empty mesh");
            SimulatedNetwork::new(coordinator)
        }
    };
    let simulation = (!report_period.is_zero())
        .then(|| run_report_simulation(Arc::clone(&network), report_period));

    let shutdown = CancellationToken::new();
    let mqtt_client = MqttClient::new(&config.mqtt);
    let mqtt: Arc<dyn MqttTransport> = Arc::new(mqtt_client.handle());
    let (mqtt_tx, mqtt_events) = mpsc::channel(100);
    let mqtt_task = tokio::spawn(mqtt_client.run(mqtt_tx, shutdown.clone()));

    let network: Arc<dyn NetworkLayer> = network;
    let bridge = Bridge::new(&config, network, network_events, mqtt, mqtt_events);
    let handle = bridge.handle();
    let mut bridge_task = tokio::spawn(bridge.run());

    let result = tokio::select! {
        result = &mut bridge_task => result,
        signal = signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("Received shutdown signal"),
                Err(e) => error!("Failed to listen for shutdown signal: {}", e),
            }
            handle.shutdown();
            bridge_task.await
        }
    };

    if let Some(simulation) = simulation {
        simulation.abort();
    }
    shutdown.cancel();
    let _ = mqtt_task.await;

    match result {
        Ok(Ok(())) => {
            info!("Zigbee MQTT bridge stopped");
            ExitCode::SUCCESS
        }
        Ok(Err(e)) => {
            error!("Bridge failed: {}", e);
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("Bridge task panicked: {}", e);
            ExitCode::FAILURE
        }
    }
}

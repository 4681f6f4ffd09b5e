//! Watch a running bridge from the broker side.
//!
//! Usage:
//!   cargo run --bin bridge-probe -- --permit-join 60
//!
//! Subscribes to everything under the base topic and prints the traffic.
//! Optionally opens the pairing window first.

use clap::Parser;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use zigbee_mqtt_bridge::config::{Config, load_dotenv};
use zigbee_mqtt_bridge::mqtt::{MqttClient, MqttEvent, MqttTransport, Topics};

#[derive(Debug, Parser)]
#[command(about = "Print the MQTT traffic of a Zigbee MQTT bridge")]
struct Args {
    #[arg(long, env = "MQTT_BROKER_HOST")]
    broker_host: Option<String>,

    #[arg(long, env = "MQTT_BROKER_PORT")]
    broker_port: Option<u16>,

    #[arg(long, env = "MQTT_BASE_TOPIC")]
    base_topic: Option<String>,

    /// Open the pairing window for this many seconds before listening
    #[arg(long)]
    permit_join: Option<u16>,
}

fn main() {
    load_dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = Config::from_env();
    if let Some(host) = args.broker_host {
        config.mqtt.broker_host = host;
    }
    if let Some(port) = args.broker_port {
        config.mqtt.broker_port = port;
    }
    if let Some(base) = args.base_topic {
        config.mqtt.base_topic = base;
    }
    config.mqtt.client_id = format!("{}-probe", config.mqtt.client_id);

    match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime.block_on(probe(config, args.permit_join)),
        Err(e) => eprintln!("Failed to start the async runtime: {}", e),
    }
}

async fn probe(config: Config, permit_join: Option<u16>) {
    info!(
        "Connecting to MQTT broker at {}:{}",
        config.mqtt.broker_host, config.mqtt.broker_port
    );

    let topics = Topics::new(&config.mqtt.base_topic);
    let client = MqttClient::new(&config.mqtt);
    let mqtt: Arc<dyn MqttTransport> = Arc::new(client.handle());
    let shutdown = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(100);
    let event_loop = tokio::spawn(client.run(tx, shutdown.clone()));

    if let Err(e) = mqtt.wait_connected(Duration::from_secs(10)).await {
        warn!("Broker not reachable: {}", e);
        shutdown.cancel();
        let _ = event_loop.await;
        return;
    }

    let filter = format!("{}/#", topics.base());
    if let Err(e) = mqtt.subscribe(&filter).await {
        warn!("Failed to subscribe to {}: {}", filter, e);
    }

    if let Some(secs) = permit_join {
        let payload = serde_json::json!({ "permit_join": true, "time": secs }).to_string();
        info!("Opening pairing window for {}s", secs);
        if let Err(e) = mqtt
            .publish(&topics.permit_join(), &payload, config.mqtt.qos(), false)
            .await
        {
            warn!("Failed to request permit_join: {}", e);
        }
    }

    info!("Listening on {}... Press Ctrl+C to exit.", filter);
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(MqttEvent::Message(message)) => {
                    println!("{} {}", message.topic, message.payload);
                }
                Some(MqttEvent::Connected) => info!("Connected"),
                Some(MqttEvent::Disconnected { reason }) => warn!("Disconnected: {}", reason),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    mqtt.disconnect().await;
    shutdown.cancel();
    let _ = event_loop.await;
}

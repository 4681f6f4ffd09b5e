use crate::mqtt::topics::DEFAULT_BASE_TOPIC;
use crate::zigbee::Ieee;
use rand::Rng;
use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Load environment variables from .env file with robust parsing.
/// Handles values with spaces without requiring quotes.
pub fn load_dotenv() {
    let env_path = Path::new(".env");
    if !env_path.exists() {
        return;
    }

    let content = match fs::read_to_string(env_path) {
        Ok(c) => c,
        Err(_) => return,
    };

    for line in content.lines() {
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(eq_pos) = line.find('=') {
            let key = line[..eq_pos].trim();
            let mut value = line[eq_pos + 1..].trim();

            if (value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\''))
            {
                value = &value[1..value.len() - 1];
            }

            // Env vars already set take precedence
            if std::env::var(key).is_err() {
                // SAFETY: called from main before the async runtime starts any threads
                unsafe { std::env::set_var(key, value) };
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub zigbee: ZigbeeConfig,
    pub bridge: BridgeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Root of every topic the bridge publishes or subscribes to.
    pub base_topic: String,
    /// QoS level (0, 1 or 2) for bridge publishes.
    pub qos_level: u8,
    pub keep_alive_secs: u64,
    pub reconnect_delay_ms: u64,
}

impl MqttConfig {
    pub fn qos(&self) -> QoS {
        match self.qos_level {
            0 => QoS::AtMostOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::AtLeastOnce,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZigbeeConfig {
    /// Serial device of the coordinator radio.
    pub device_path: String,
    /// JSON device database used by the simulated network layer.
    pub device_db: Option<String>,
    pub coordinator_ieee: Ieee,
}

/// Exponential backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one. 0 means unlimited.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, initial_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms,
            max_backoff_ms,
        }
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_attempts == 0 || attempts < self.max_attempts
    }

    /// Delay before the attempt following attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let backoff = self
            .initial_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_ms);
        Duration::from_millis(backoff)
    }

    /// [`delay`](Self::delay) plus up to 10% random jitter.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.delay(attempt);
        let spread = base.as_millis() as u64 / 10;
        if spread == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }
}

/// Tuning of the bridging layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Identical attribute values within this window are published once.
    pub coalesce_window_ms: u64,
    /// Time to wait for a mesh command acknowledgement.
    pub command_timeout_ms: u64,
    pub command_retry: RetryPolicy,
    /// Commands queued per device before new ones are rejected.
    pub command_queue_depth: usize,
    pub reporting_retry: RetryPolicy,
    pub reconnect: RetryPolicy,
    pub startup_attempts: u32,
    pub startup_retry_delay_ms: u64,
    pub startup_timeout_ms: u64,
    /// Pairing window opened by `permit_join` when no time is given.
    pub permit_join_secs: u16,
    /// Period of attribute refresh reads. 0 disables refresh.
    pub refresh_interval_secs: u64,
    /// How long shutdown waits for in-flight commands.
    pub shutdown_grace_ms: u64,
}

impl BridgeConfig {
    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_window_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn startup_retry_delay(&self) -> Duration {
        Duration::from_millis(self.startup_retry_delay_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        (self.refresh_interval_secs > 0).then(|| Duration::from_secs(self.refresh_interval_secs))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            coalesce_window_ms: 2_000,
            command_timeout_ms: 15_000,
            command_retry: RetryPolicy::new(3, 500, 8_000),
            command_queue_depth: 16,
            reporting_retry: RetryPolicy::new(5, 5_000, 300_000),
            reconnect: RetryPolicy::new(0, 1_000, 60_000),
            startup_attempts: 3,
            startup_retry_delay_ms: 2_000,
            startup_timeout_ms: 60_000,
            permit_join_secs: 120,
            refresh_interval_secs: 300,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mqtt: MqttConfig {
                broker_host: "localhost".to_string(),
                broker_port: 1883,
                client_id: "zigbee-mqtt-bridge".to_string(),
                username: None,
                password: None,
                base_topic: DEFAULT_BASE_TOPIC.to_string(),
                qos_level: 1,
                keep_alive_secs: 30,
                reconnect_delay_ms: 5_000,
            },
            zigbee: ZigbeeConfig {
                device_path: "/dev/ttyACM0".to_string(),
                device_db: None,
                coordinator_ieee: Ieee(0x0012_4b00_0000_0001),
            },
            bridge: BridgeConfig::default(),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // MQTT configuration
        if let Ok(host) = std::env::var("MQTT_BROKER_HOST") {
            config.mqtt.broker_host = host;
        }
        if let Some(port) = env_parse("MQTT_BROKER_PORT") {
            config.mqtt.broker_port = port;
        }
        if let Ok(client_id) = std::env::var("MQTT_CLIENT_ID") {
            config.mqtt.client_id = client_id;
        }
        if let Ok(username) = std::env::var("MQTT_USERNAME") {
            config.mqtt.username = Some(username);
        }
        if let Ok(password) = std::env::var("MQTT_PASSWORD") {
            config.mqtt.password = Some(password);
        }
        if let Ok(base) = std::env::var("MQTT_BASE_TOPIC") {
            config.mqtt.base_topic = base;
        }
        if let Some(qos) = env_parse("MQTT_QOS") {
            config.mqtt.qos_level = qos;
        }

        // Zigbee configuration
        if let Ok(path) = std::env::var("ZIGBEE_DEVICE_PATH") {
            config.zigbee.device_path = path;
        }
        if let Ok(db) = std::env::var("ZIGBEE_DEVICE_DB") {
            config.zigbee.device_db = Some(db);
        }
        if let Some(ieee) = env_parse("ZIGBEE_COORDINATOR_IEEE") {
            config.zigbee.coordinator_ieee = ieee;
        }

        // Bridge tuning
        let bridge = &mut config.bridge;
        if let Some(ms) = env_parse("BRIDGE_COALESCE_WINDOW_MS") {
            bridge.coalesce_window_ms = ms;
        }
        if let Some(ms) = env_parse("BRIDGE_COMMAND_TIMEOUT_MS") {
            bridge.command_timeout_ms = ms;
        }
        if let Some(attempts) = env_parse("BRIDGE_COMMAND_MAX_ATTEMPTS") {
            bridge.command_retry.max_attempts = attempts;
        }
        if let Some(depth) = env_parse("BRIDGE_COMMAND_QUEUE_DEPTH") {
            bridge.command_queue_depth = depth;
        }
        if let Some(attempts) = env_parse("BRIDGE_REPORTING_MAX_ATTEMPTS") {
            bridge.reporting_retry.max_attempts = attempts;
        }
        if let Some(secs) = env_parse("BRIDGE_PERMIT_JOIN_SECS") {
            bridge.permit_join_secs = secs;
        }
        if let Some(secs) = env_parse("BRIDGE_REFRESH_INTERVAL_SECS") {
            bridge.refresh_interval_secs = secs;
        }
        if let Some(ms) = env_parse("BRIDGE_SHUTDOWN_GRACE_MS") {
            bridge.shutdown_grace_ms = ms;
        }

        config
    }
}

use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer};
use tracing::warn;

fn default_scan_interval() -> u64 {
    20
}

fn default_mqtt_server() -> String {
    "127.0.0.1".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "lghvac2mqtt".to_string()
}

fn default_base_topic() -> String {
    "lgaircon".to_string()
}

/// Service configuration, loaded from a JSON options file (the add-on
/// convention) with environment overrides applied on top.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub lg_server_ip: String,
    pub lg_server_port: u16,
    /// Unit id (hex string) to room name.
    #[serde(default, deserialize_with = "rooms_table")]
    pub rooms: HashMap<String, String>,
    /// Seconds between status polls of each unit.
    #[serde(default = "default_scan_interval")]
    pub scan_interval: u64,
    /// Offset added to every reported room temperature.
    #[serde(default)]
    pub temperature_adjust: f64,
    /// Sweep the whole 0x00-0x0f id range at startup.
    #[serde(default)]
    pub full_scan_on_boot: bool,
    #[serde(default)]
    pub mqtt: MqttConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_server")]
    pub server: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_base_topic")]
    pub base_topic: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        MqttConfig {
            server: default_mqtt_server(),
            port: default_mqtt_port(),
            client_id: default_client_id(),
            username: None,
            password: None,
            base_topic: default_base_topic(),
        }
    }
}

/// The add-on UI emits rooms as a list of `{id, name}` entries; hand
/// written files usually use a plain map. Accept both.
#[derive(Deserialize)]
#[serde(untagged)]
enum RoomsField {
    Table(HashMap<String, String>),
    List(Vec<RoomEntry>),
}

#[derive(Deserialize)]
struct RoomEntry {
    id: String,
    name: String,
}

fn rooms_table<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match RoomsField::deserialize(deserializer)? {
        RoomsField::Table(table) => table,
        RoomsField::List(entries) => entries
            .into_iter()
            .map(|entry| (entry.id, entry.name))
            .collect(),
    })
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config: Config = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = env::var("LGAIRCON_SERVER_IP") {
            self.lg_server_ip = value;
        }
        if let Ok(value) = env::var("LGAIRCON_SERVER_PORT") {
            match value.parse() {
                Ok(port) => self.lg_server_port = port,
                Err(_) => warn!("ignoring unparseable LGAIRCON_SERVER_PORT {:?}", value),
            }
        }
        if let Ok(value) = env::var("MQTT_SERVER_IP") {
            self.mqtt.server = value;
        }
        if let Ok(value) = env::var("MQTT_SERVER_PORT") {
            match value.parse() {
                Ok(port) => self.mqtt.port = port,
                Err(_) => warn!("ignoring unparseable MQTT_SERVER_PORT {:?}", value),
            }
        }
        if let Ok(value) = env::var("TEMPERATURE_ADJUST") {
            match value.parse() {
                Ok(offset) => self.temperature_adjust = offset,
                Err(_) => warn!("ignoring unparseable TEMPERATURE_ADJUST {:?}", value),
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.lg_server_ip.is_empty() {
            bail!("lg_server_ip must not be empty");
        }
        if self.rooms.is_empty() {
            bail!("at least one room must be configured");
        }
        Ok(())
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval)
    }
}

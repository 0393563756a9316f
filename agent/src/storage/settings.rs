//! Settings file management

use std::path::PathBuf;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize};

use crate::logs::LogLevel;
use crate::version::VersionOrdering;

/// Agent settings, provisioned once per device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Write rolling log files here in addition to stdout
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Network configuration
    #[serde(default)]
    pub network: NetworkSettings,

    /// MQTT broker configuration
    #[serde(default)]
    pub mqtt_broker: MqttBrokerSettings,

    /// HTTP base URL for `version.json` and `firmware/{ref}`
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Version of the running firmware
    #[serde(default = "default_current_version")]
    pub current_version: String,

    /// Development mode skips update checks
    #[serde(default)]
    pub is_dev: bool,

    /// Deployment environment tag published for observability
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Re-check for updates on this cadence; startup only when absent
    #[serde(default)]
    pub update_check_interval_secs: Option<u64>,

    /// Ordering used to decide whether an advertised version is newer
    #[serde(default)]
    pub version_ordering: VersionOrdering,

    /// Update slot configuration
    #[serde(default)]
    pub slot: SlotSettings,

    /// HTTP connect timeout in seconds
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,

    /// Abandon a firmware transfer idle for this many seconds
    #[serde(default = "default_transfer_stall")]
    pub transfer_stall_secs: u64,
}

fn default_api_url() -> String {
    "http://localhost:3003".to_string()
}

fn default_current_version() -> String {
    env!("FIRMWARE_VERSION").to_string()
}

fn default_environment() -> String {
    "prod".to_string()
}

fn default_http_timeout() -> u64 {
    30
}

fn default_transfer_stall() -> u64 {
    60
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_dir: None,
            network: NetworkSettings::default(),
            mqtt_broker: MqttBrokerSettings::default(),
            api_url: default_api_url(),
            current_version: default_current_version(),
            is_dev: false,
            environment: default_environment(),
            update_check_interval_secs: None,
            version_ordering: VersionOrdering::default(),
            slot: SlotSettings::default(),
            http_timeout_secs: default_http_timeout(),
            transfer_stall_secs: default_transfer_stall(),
        }
    }
}

/// Network settings
#[derive(Debug, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// Network name
    #[serde(default)]
    pub ssid: String,

    /// Network password; never written back out
    #[serde(
        default = "empty_secret",
        deserialize_with = "deserialize_secret",
        skip_serializing
    )]
    pub password: SecretString,

    /// Restrict bring-up to this interface
    #[serde(default)]
    pub interface: Option<String>,

    /// Seconds between connection attempts
    #[serde(default = "default_network_retry")]
    pub connect_retry_secs: u64,
}

fn empty_secret() -> SecretString {
    SecretString::new("".into())
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(SecretString::new(raw.into_boxed_str()))
}

fn default_network_retry() -> u64 {
    1
}

impl Clone for NetworkSettings {
    fn clone(&self) -> Self {
        Self {
            ssid: self.ssid.clone(),
            password: SecretString::new(self.password.expose_secret().into()),
            interface: self.interface.clone(),
            connect_retry_secs: self.connect_retry_secs,
        }
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            ssid: String::new(),
            password: empty_secret(),
            interface: None,
            connect_retry_secs: default_network_retry(),
        }
    }
}

/// MQTT broker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttBrokerSettings {
    /// Broker host
    #[serde(default = "default_mqtt_host")]
    pub host: String,

    /// Broker port
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// Use TLS
    #[serde(default)]
    pub tls: bool,

    /// Optional path to a PEM-encoded CA certificate for broker TLS verification.
    /// When absent, the system certificate store is used.
    #[serde(default)]
    pub ca_cert_path: Option<String>,

    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// Prefix prepended to the device identity to form the client id
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,

    /// Seconds between connection attempts
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
}

fn default_mqtt_host() -> String {
    "".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_keep_alive() -> u64 {
    30
}

fn default_client_id_prefix() -> String {
    "fwagent-".to_string()
}

fn default_reconnect_delay() -> u64 {
    5
}

impl Default for MqttBrokerSettings {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            tls: false,
            ca_cert_path: None,
            keep_alive_secs: default_keep_alive(),
            client_id_prefix: default_client_id_prefix(),
            reconnect_delay_secs: default_reconnect_delay(),
        }
    }
}

/// Update slot settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlotSettings {
    /// Directory holding the staged and committed image
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Largest image the slot accepts, in bytes
    #[serde(default)]
    pub capacity_bytes: Option<u64>,

    /// Command run before the agent exits to boot a committed image
    #[serde(default)]
    pub restart_command: Option<Vec<String>>,
}

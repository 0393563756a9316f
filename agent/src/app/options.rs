//! Application configuration options

use std::path::PathBuf;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::firmware::installer;
use crate::mqtt::client::MqttAddress;
use crate::network::link::NetworkCredentials;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::update::checker;
use crate::utils::RetryPolicy;

/// Immutable agent configuration, built once at startup
#[derive(Debug)]
pub struct AgentOptions {
    /// Network credentials and bring-up retry policy
    pub network: NetworkOptions,

    /// Control-plane options
    pub control_plane: ControlPlaneOptions,

    /// Update checker options
    pub checker: checker::Options,

    /// Installer options
    pub installer: installer::Options,

    /// Deployment environment tag
    pub environment: String,

    /// Development mode skips update checks
    pub is_dev: bool,

    /// Re-check for updates on this cadence; startup only when `None`
    pub update_check_interval: Option<Duration>,
}

/// Network bring-up options
#[derive(Debug)]
pub struct NetworkOptions {
    pub credentials: NetworkCredentials,
    pub interface: Option<String>,
    pub retry: RetryPolicy,
}

/// Control-plane options
#[derive(Debug, Clone)]
pub struct ControlPlaneOptions {
    /// MQTT broker address
    pub broker_address: MqttAddress,

    /// Keep-alive interval
    pub keep_alive: Duration,

    /// Prefix of the client identifier
    pub client_id_prefix: String,

    /// Reconnect policy
    pub reconnect: RetryPolicy,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl AgentOptions {
    /// Build options from the settings file
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            network: NetworkOptions {
                credentials: NetworkCredentials {
                    ssid: settings.network.ssid.clone(),
                    password: SecretString::new(
                        settings.network.password.expose_secret().into(),
                    ),
                },
                interface: settings.network.interface.clone(),
                retry: RetryPolicy::unbounded(Duration::from_secs(
                    settings.network.connect_retry_secs,
                )),
            },
            control_plane: ControlPlaneOptions {
                broker_address: MqttAddress {
                    host: settings.mqtt_broker.host.clone(),
                    port: settings.mqtt_broker.port,
                    use_tls: settings.mqtt_broker.tls,
                    ca_cert_path: settings.mqtt_broker.ca_cert_path.clone(),
                },
                keep_alive: Duration::from_secs(settings.mqtt_broker.keep_alive_secs),
                client_id_prefix: settings.mqtt_broker.client_id_prefix.clone(),
                reconnect: RetryPolicy::unbounded(Duration::from_secs(
                    settings.mqtt_broker.reconnect_delay_secs,
                )),
            },
            checker: checker::Options {
                api_url: settings.api_url.clone(),
                current_version: settings.current_version.clone(),
                ordering: settings.version_ordering,
            },
            installer: installer::Options {
                stall_timeout: Duration::from_secs(settings.transfer_stall_secs),
            },
            environment: settings.environment.clone(),
            is_dev: settings.is_dev,
            update_check_interval: settings
                .update_check_interval_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
        }
    }

    /// Whether update checks run at all
    pub fn checks_enabled(&self) -> bool {
        !self.is_dev
    }
}

/// Update slot directory: configured, or the storage layout default
pub fn slot_dir(settings: &Settings, layout: &StorageLayout) -> PathBuf {
    settings
        .slot
        .dir
        .clone()
        .unwrap_or_else(|| layout.slot_dir().path().to_path_buf())
}

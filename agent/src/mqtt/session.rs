//! Control-plane session: connect with identity, announce presence,
//! subscribe, and turn inbound messages into commands

use tracing::{debug, info, warn};

use crate::errors::AgentError;
use crate::identity::DeviceIdentity;
use crate::mqtt::client::{ControlPlane, MqttMessage, Will};
use crate::mqtt::topics::{Topics, STATUS_OFFLINE, STATUS_ONLINE};

/// Control-plane link state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Effect requested by an inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ignore,
    /// Install the firmware at this reference without a version check
    InstallFromUrl(String),
}

/// Retained values published on every successful connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub version: String,
    pub environment: String,
}

/// Decide what an inbound message asks for. Pure; performs no I/O.
///
/// Any non-empty UTF-8 payload on the firmware update topic is taken as an
/// install command. There is no origin or signature check.
pub fn decide(topics: &Topics, topic: &str, payload: &[u8]) -> Command {
    if !topics.is_firmware_update(topic) {
        return Command::Ignore;
    }

    match std::str::from_utf8(payload) {
        Ok(url) if !url.trim().is_empty() => Command::InstallFromUrl(url.trim().to_string()),
        Ok(_) => {
            warn!("Ignoring empty firmware update payload on {}", topic);
            Command::Ignore
        }
        Err(e) => {
            warn!("Ignoring non UTF-8 firmware update payload on {}: {}", topic, e);
            Command::Ignore
        }
    }
}

/// Owns the publish/subscribe connection lifecycle for one device
pub struct ControlPlaneSession {
    transport: Box<dyn ControlPlane>,
    topics: Topics,
    client_id: String,
    announcement: Announcement,
    state: SessionState,
}

impl ControlPlaneSession {
    pub fn new(
        transport: Box<dyn ControlPlane>,
        identity: &DeviceIdentity,
        client_id_prefix: &str,
        announcement: Announcement,
    ) -> Self {
        Self {
            transport,
            topics: Topics::new(identity),
            client_id: identity.client_id(client_id_prefix),
            announcement,
            state: SessionState::Disconnected,
        }
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Connected according to both the session and the transport. A
    /// transport-level drop moves the session back to `Disconnected`.
    pub fn is_connected(&mut self) -> bool {
        if self.state == SessionState::Connected && !self.transport.is_connected() {
            self.state = SessionState::Disconnected;
        }
        self.state == SessionState::Connected
    }

    /// Connect, then announce status, version and environment (all
    /// retained) strictly before subscribing to the command topics.
    pub async fn connect(&mut self) -> Result<(), AgentError> {
        self.state = SessionState::Connecting;

        let will = Will {
            topic: self.topics.status(),
            payload: STATUS_OFFLINE.as_bytes().to_vec(),
            retain: true,
        };

        if let Err(e) = self.transport.connect(&self.client_id, &will).await {
            self.state = SessionState::Disconnected;
            return Err(e);
        }
        self.state = SessionState::Connected;

        if let Err(e) = self.announce().await {
            self.state = SessionState::Disconnected;
            return Err(e);
        }

        info!("Control-plane session established as {}", self.client_id);
        Ok(())
    }

    async fn announce(&mut self) -> Result<(), AgentError> {
        let status = self.topics.status();
        let version = self.topics.version();
        let environment = self.topics.environment();
        let version_payload = self.announcement.version.clone();
        let environment_payload = self.announcement.environment.clone();

        self.publish(&status, STATUS_ONLINE.as_bytes(), true).await?;
        self.publish(&version, version_payload.as_bytes(), true).await?;
        self.publish(&environment, environment_payload.as_bytes(), true)
            .await?;

        let firmware_update = self.topics.firmware_update();
        let device = self.topics.device().to_string();
        self.subscribe(&firmware_update).await?;
        self.subscribe(&device).await?;
        Ok(())
    }

    /// Publish; only valid while `Connected`
    pub async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        retain: bool,
    ) -> Result<(), AgentError> {
        if self.state != SessionState::Connected {
            return Err(AgentError::NotConnected);
        }
        self.transport.publish(topic, payload, retain).await
    }

    /// Subscribe; only valid while `Connected`
    pub async fn subscribe(&mut self, topic: &str) -> Result<(), AgentError> {
        if self.state != SessionState::Connected {
            return Err(AgentError::NotConnected);
        }
        self.transport.subscribe(topic).await
    }

    /// Decide what an inbound message asks for
    pub fn dispatch(&self, topic: &str, payload: &[u8]) -> Command {
        decide(&self.topics, topic, payload)
    }

    /// Service one iteration of inbound delivery and keep-alive. An I/O
    /// failure moves the session to `Disconnected` and is returned.
    pub async fn run_once(&mut self) -> Result<Command, AgentError> {
        if self.state != SessionState::Connected {
            return Err(AgentError::NotConnected);
        }

        match self.transport.poll().await {
            Ok(Some(MqttMessage { topic, payload })) => {
                info!(
                    "Message received [{}]: {}",
                    topic,
                    String::from_utf8_lossy(&payload)
                );
                Ok(self.dispatch(&topic, &payload))
            }
            Ok(None) => Ok(Command::Ignore),
            Err(e) => {
                self.state = SessionState::Disconnected;
                Err(e)
            }
        }
    }

    /// Mark the device offline and close the session cleanly. A clean
    /// disconnect suppresses the last will, so `offline` is published first.
    pub async fn shutdown(&mut self) {
        if self.is_connected() {
            let status = self.topics.status();
            if let Err(e) = self.publish(&status, STATUS_OFFLINE.as_bytes(), true).await {
                warn!("Failed to publish offline status: {}", e);
            }
        }
        if let Err(e) = self.transport.disconnect().await {
            debug!("Disconnect failed: {}", e);
        }
        self.state = SessionState::Disconnected;
    }
}

//! MQTT topic definitions

use crate::identity::DeviceIdentity;

/// Topic namespace for one device, rooted at `devices/{id}`
#[derive(Debug, Clone)]
pub struct Topics {
    root: String,
}

impl Topics {
    pub fn new(device: &DeviceIdentity) -> Self {
        Self {
            root: format!("devices/{}", device),
        }
    }

    /// Device root topic, subscribed for generic device messages
    pub fn device(&self) -> &str {
        &self.root
    }

    /// Presence topic (`online` / `offline`), also the last-will topic
    pub fn status(&self) -> String {
        format!("{}/status", self.root)
    }

    /// Running firmware version topic
    pub fn version(&self) -> String {
        format!("{}/version", self.root)
    }

    /// Deployment environment tag topic
    pub fn environment(&self) -> String {
        format!("{}/environment", self.root)
    }

    /// Firmware update command topic; payload is a firmware URL
    pub fn firmware_update(&self) -> String {
        format!("{}/firmware/update", self.root)
    }

    /// Check if topic is this device's firmware update topic
    pub fn is_firmware_update(&self, topic: &str) -> bool {
        topic
            .strip_prefix(self.root.as_str())
            .is_some_and(|rest| rest == "/firmware/update")
    }
}

/// Presence payloads
pub const STATUS_ONLINE: &str = "online";
pub const STATUS_OFFLINE: &str = "offline";

//! Device identity

use std::fmt;

/// Stable per-device identifier derived from the network interface's
/// hardware address. Namespaces every control-plane topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    /// Derive the identity from a MAC address, formatted `AA:BB:CC:DD:EE:FF`
    pub fn from_mac(mac: [u8; 6]) -> Self {
        let id = mac
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":");
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Client identifier presented to the broker
    pub fn client_id(&self, prefix: &str) -> String {
        format!("{}{}", prefix, self.0)
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceIdentity {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

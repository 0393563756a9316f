//! Network bring-up

use std::fmt;
use std::net::IpAddr;

use async_trait::async_trait;
use secrecy::SecretString;
use sysinfo::{NetworkData, Networks};
use tracing::{debug, info};

use crate::errors::AgentError;

/// Credentials for joining the network
pub struct NetworkCredentials {
    pub ssid: String,
    pub password: SecretString,
}

impl fmt::Debug for NetworkCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkCredentials")
            .field("ssid", &self.ssid)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Network bring-up capability
#[async_trait]
pub trait NetworkLink: Send + Sync {
    /// Join the network and return the acquired address. Callers retry.
    async fn connect(&self, credentials: &NetworkCredentials) -> Result<IpAddr, AgentError>;

    /// Hardware address of the link; the stable source of the device identity
    fn hardware_address(&self) -> Result<[u8; 6], AgentError>;
}

/// Host network managed by the operating system. "Connecting" waits for an
/// interface with a hardware address and a routable IP address.
#[derive(Debug, Clone, Default)]
pub struct HostNetwork {
    /// Restrict to this interface (e.g. `wlan0`); any interface otherwise
    interface: Option<String>,
}

impl HostNetwork {
    pub fn new(interface: Option<String>) -> Self {
        Self { interface }
    }

    fn usable_address(data: &NetworkData) -> Option<IpAddr> {
        if data.mac_address().is_unspecified() {
            return None;
        }
        let mut addrs: Vec<IpAddr> = data
            .ip_networks()
            .iter()
            .map(|net| net.addr)
            .filter(|addr| !addr.is_loopback() && !addr.is_unspecified())
            .collect();
        // Prefer IPv4
        addrs.sort_by_key(|addr| addr.is_ipv6());
        addrs.into_iter().next()
    }

    /// First matching interface that is up, with its address
    fn find_link(&self) -> Option<(String, [u8; 6], IpAddr)> {
        let networks = Networks::new_with_refreshed_list();
        let mut links: Vec<(String, [u8; 6], IpAddr)> = networks
            .list()
            .iter()
            .filter(|(name, _)| self.interface.as_ref().is_none_or(|want| want == *name))
            .filter_map(|(name, data)| {
                Self::usable_address(data).map(|ip| (name.clone(), data.mac_address().0, ip))
            })
            .collect();
        links.sort_by(|a, b| a.0.cmp(&b.0));
        links.into_iter().next()
    }
}

#[async_trait]
impl NetworkLink for HostNetwork {
    async fn connect(&self, credentials: &NetworkCredentials) -> Result<IpAddr, AgentError> {
        debug!("Waiting for network (ssid {:?})", credentials.ssid);
        match self.find_link() {
            Some((name, _, ip)) => {
                info!("Network connected on {}, IP address: {}", name, ip);
                Ok(ip)
            }
            None => Err(AgentError::NetworkUnavailable(match &self.interface {
                Some(name) => format!("interface {} has no address", name),
                None => "no interface with an address".to_string(),
            })),
        }
    }

    fn hardware_address(&self) -> Result<[u8; 6], AgentError> {
        self.find_link()
            .map(|(_, mac, _)| mac)
            .ok_or_else(|| AgentError::NetworkUnavailable("no hardware address".to_string()))
    }
}

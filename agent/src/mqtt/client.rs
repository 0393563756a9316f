//! MQTT client implementation

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS};
use tracing::{debug, info, warn};

use crate::errors::AgentError;

/// MQTT broker address
#[derive(Debug, Clone)]
pub struct MqttAddress {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    /// Optional path to a PEM-encoded CA certificate for broker verification.
    /// When `None` and `use_tls` is `true`, the system certificate store is used.
    pub ca_cert_path: Option<String>,
}

impl Default for MqttAddress {
    fn default() -> Self {
        Self {
            host: "".to_string(),
            port: 1883,
            use_tls: false,
            ca_cert_path: None,
        }
    }
}

/// Message the broker publishes on the client's behalf after an unclean drop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

/// Inbound MQTT message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Publish/subscribe capability used by the control-plane session
#[async_trait]
pub trait ControlPlane: Send {
    /// Open a session with `client_id`, registering `will`
    async fn connect(&mut self, client_id: &str, will: &Will) -> Result<(), AgentError>;

    async fn publish(&mut self, topic: &str, payload: &[u8], retain: bool)
        -> Result<(), AgentError>;

    async fn subscribe(&mut self, topic: &str) -> Result<(), AgentError>;

    fn is_connected(&self) -> bool;

    /// Service one iteration of the connection; yields an inbound message
    /// when one arrived
    async fn poll(&mut self) -> Result<Option<MqttMessage>, AgentError>;

    /// Close the session cleanly
    async fn disconnect(&mut self) -> Result<(), AgentError>;
}

struct Connection {
    client: AsyncClient,
    eventloop: EventLoop,
    connected: bool,
}

/// MQTT client wrapper over rumqttc
pub struct MqttClient {
    address: MqttAddress,
    keep_alive: Duration,
    connect_timeout: Duration,
    conn: Option<Connection>,
}

impl MqttClient {
    /// Create a new, disconnected MQTT client
    pub fn new(address: MqttAddress, keep_alive: Duration) -> Result<Self, AgentError> {
        if address.host.is_empty() {
            return Err(AgentError::ConfigError("MQTT host is not configured".to_string()));
        }

        Ok(Self {
            address,
            keep_alive,
            connect_timeout: Duration::from_secs(10),
            conn: None,
        })
    }

    fn options(&self, client_id: &str, will: &Will) -> Result<MqttOptions, AgentError> {
        let mut options = MqttOptions::new(client_id, &self.address.host, self.address.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);
        options.set_last_will(LastWill::new(
            &will.topic,
            will.payload.clone(),
            QoS::AtMostOnce,
            will.retain,
        ));

        if self.address.use_tls {
            use rumqttc::{TlsConfiguration, Transport};
            use rustls::ClientConfig;
            use std::sync::Arc;

            let mut root_cert_store = rustls::RootCertStore::empty();

            if let Some(ref ca_path) = self.address.ca_cert_path {
                let ca_pem = std::fs::read(ca_path).map_err(|e| {
                    AgentError::ConfigError(format!("Failed to read CA cert {ca_path}: {e}"))
                })?;
                let mut cursor = std::io::Cursor::new(ca_pem);
                for cert in rustls_pemfile::certs(&mut cursor).flatten() {
                    let _ = root_cert_store.add(cert);
                }
            } else {
                for cert in rustls_native_certs::load_native_certs().unwrap_or_default() {
                    let _ = root_cert_store.add(cert);
                }
            }

            let client_config = ClientConfig::builder()
                .with_root_certificates(root_cert_store)
                .with_no_client_auth();

            options.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(
                Arc::new(client_config),
            )));
        }

        Ok(options)
    }

    fn connection(&mut self) -> Result<&mut Connection, AgentError> {
        match self.conn.as_mut() {
            Some(conn) if conn.connected => Ok(conn),
            _ => Err(AgentError::NotConnected),
        }
    }
}

async fn await_connack(eventloop: &mut EventLoop) -> Result<(), AgentError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                debug!("ConnAck received: {:?}", ack.code);
                return Ok(());
            }
            Ok(_) => continue,
            Err(e) => return Err(AgentError::ControlPlane(e.to_string())),
        }
    }
}

#[async_trait]
impl ControlPlane for MqttClient {
    async fn connect(&mut self, client_id: &str, will: &Will) -> Result<(), AgentError> {
        // Drop any stale session before dialing again
        self.conn = None;

        let options = self.options(client_id, will)?;
        let (client, mut eventloop) = AsyncClient::new(options, 16);

        tokio::time::timeout(self.connect_timeout, await_connack(&mut eventloop))
            .await
            .map_err(|_| {
                AgentError::ControlPlane(format!(
                    "connect timed out after {:?}",
                    self.connect_timeout
                ))
            })??;

        info!(
            "MQTT connected to {}:{} as {}",
            self.address.host, self.address.port, client_id
        );
        self.conn = Some(Connection {
            client,
            eventloop,
            connected: true,
        });
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        retain: bool,
    ) -> Result<(), AgentError> {
        let conn = self.connection()?;
        conn.client
            .publish(topic, QoS::AtMostOnce, retain, payload.to_vec())
            .await
            .map_err(|e| AgentError::ControlPlane(e.to_string()))?;
        debug!("Published to: {}", topic);
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), AgentError> {
        let conn = self.connection()?;
        conn.client
            .subscribe(topic, QoS::AtMostOnce)
            .await
            .map_err(|e| AgentError::ControlPlane(e.to_string()))?;
        info!("Subscribed to: {}", topic);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.conn.as_ref().is_some_and(|conn| conn.connected)
    }

    async fn poll(&mut self) -> Result<Option<MqttMessage>, AgentError> {
        let conn = self.connection()?;
        match conn.eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!("Received message on topic: {}", publish.topic);
                Ok(Some(MqttMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                }))
            }
            Ok(Event::Incoming(Packet::SubAck(_))) => {
                debug!("Subscription acknowledged");
                Ok(None)
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                conn.connected = false;
                warn!("Broker closed the MQTT session");
                Err(AgentError::ControlPlane("broker disconnected".to_string()))
            }
            Ok(_) => Ok(None),
            Err(e) => {
                conn.connected = false;
                warn!("MQTT poll error: {}", e);
                Err(AgentError::ControlPlane(e.to_string()))
            }
        }
    }

    async fn disconnect(&mut self) -> Result<(), AgentError> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };

        conn.client
            .disconnect()
            .await
            .map_err(|e| AgentError::ControlPlane(e.to_string()))?;

        // Drive the event loop until the queued requests and DISCONNECT are flushed
        let flush = async {
            loop {
                match conn.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
        };
        if tokio::time::timeout(Duration::from_secs(2), flush).await.is_err() {
            warn!("Timed out flushing MQTT disconnect");
        }

        info!("MQTT disconnected");
        Ok(())
    }
}

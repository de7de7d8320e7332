//! Gemeinsame Konfigurationsstrukturen für Controller in Server- und Client-Rolle.

use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::ServiceId;

/// Standard-Lesetimeout, nach dem ein Keep-Alive gesendet wird.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);
/// Obergrenze für die Nutzlast eines einzelnen Pakets.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Rolle eines Controllers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Server,
    Client,
}

impl Role {
    pub fn flipped(self) -> Self {
        match self {
            Role::Server => Role::Client,
            Role::Client => Role::Server,
        }
    }
}

/// Unterstützte Transport-Implementierungen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Loopback,
}

/// Beschreibt einen einzelnen Transport (`protocol`, `host`, `port`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransportDescriptor {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
}

impl TransportDescriptor {
    pub fn new(protocol: Protocol, host: impl Into<String>, port: u16) -> Self {
        Self {
            protocol,
            host: host.into(),
            port,
        }
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::new(Protocol::Tcp, host, port)
    }

    pub fn loopback(host: impl Into<String>, port: u16) -> Self {
        Self::new(Protocol::Loopback, host, port)
    }

    /// `"host:port"`, Schlüssel für Loopback-Netze und Log-Ausgaben.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Parst den Host als IP-Adresse. Hostnamen werden erst beim Verbinden aufgelöst.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigurationError> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|_| ConfigurationError::InvalidHost(self.host.clone()))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Verhalten einer Client-Verbindung nach einem Verbindungsabbruch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ReconnectPolicy {
    /// Der Transport bleibt untätig, bis `restart` aufgerufen wird.
    #[default]
    Manual,
    /// Der Transport versucht es nach einer festen Pause erneut.
    Retry { delay_ms: u64 },
}

impl ReconnectPolicy {
    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            ReconnectPolicy::Manual => None,
            ReconnectPolicy::Retry { delay_ms } => Some(Duration::from_millis(*delay_ms)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("configuration lists no transports")]
    NoTransports,
    #[error("configuration lists no services")]
    NoServices,
    #[error("service {0} is listed more than once")]
    DuplicateService(ServiceId),
    #[error("transport endpoint {0} is listed more than once")]
    DuplicateTransport(String),
    #[error("client role requires a transport index")]
    MissingClientTransport,
    #[error("client transport index {index} is out of range ({len} transports)")]
    ClientTransportOutOfRange { index: usize, len: usize },
    #[error("transport {index} has an empty host")]
    EmptyHost { index: usize },
    #[error("host {0} is not an ip address")]
    InvalidHost(String),
    #[error("read timeout must be greater than zero")]
    ZeroReadTimeout,
    #[error("service {0} is not registered")]
    UnknownService(ServiceId),
    #[error("transport {index} could not be created: {reason}")]
    TransportSetup { index: usize, reason: String },
}

fn default_read_timeout_ms() -> u64 {
    DEFAULT_READ_TIMEOUT.as_millis() as u64
}

fn default_max_packet_size() -> usize {
    DEFAULT_MAX_PACKET_SIZE
}

/// Vollständige Controller-Konfiguration.
///
/// Nach `apply_config` unveränderlich; der Controller hält sie hinter einem `Arc`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub role: Role,
    pub transports: Vec<TransportDescriptor>,
    pub services: Vec<ServiceId>,
    /// Index in `transports`, nur für die Client-Rolle.
    #[serde(default)]
    pub client_transport: Option<usize>,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
}

impl Config {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            transports: Vec::new(),
            services: Vec::new(),
            client_transport: None,
            read_timeout_ms: default_read_timeout_ms(),
            reconnect: ReconnectPolicy::Manual,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    pub fn server() -> Self {
        Self::new(Role::Server)
    }

    /// Client-Konfiguration; wählt standardmäßig den ersten Transport.
    pub fn client() -> Self {
        Self {
            client_transport: Some(0),
            ..Self::new(Role::Client)
        }
    }

    /// Fügt einen Transport hinzu. Doppelte Endpunkte werden abgelehnt.
    pub fn add_transport(
        &mut self,
        descriptor: TransportDescriptor,
    ) -> Result<&mut Self, ConfigurationError> {
        if self.transports.iter().any(|t| t == &descriptor) {
            return Err(ConfigurationError::DuplicateTransport(descriptor.endpoint()));
        }
        self.transports.push(descriptor);
        Ok(self)
    }

    /// Fügt einen Dienst hinzu. Doppelte IDs werden abgelehnt.
    pub fn add_service(&mut self, id: impl Into<ServiceId>) -> Result<&mut Self, ConfigurationError> {
        let id = id.into();
        if self.services.contains(&id) {
            return Err(ConfigurationError::DuplicateService(id));
        }
        self.services.push(id);
        Ok(self)
    }

    pub fn with_transport(mut self, descriptor: TransportDescriptor) -> Self {
        self.transports.push(descriptor);
        self
    }

    pub fn with_service(mut self, id: impl Into<ServiceId>) -> Self {
        self.services.push(id.into());
        self
    }

    pub fn with_client_transport(mut self, index: usize) -> Self {
        self.client_transport = Some(index);
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Der Transport, mit dem sich ein Client verbindet.
    pub fn selected_transport(&self) -> Option<&TransportDescriptor> {
        match self.role {
            Role::Server => None,
            Role::Client => self.client_transport.and_then(|i| self.transports.get(i)),
        }
    }

    /// Prüft die Konfiguration ohne Seiteneffekte.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.transports.is_empty() {
            return Err(ConfigurationError::NoTransports);
        }
        if self.services.is_empty() {
            return Err(ConfigurationError::NoServices);
        }
        for (i, id) in self.services.iter().enumerate() {
            if self.services[..i].contains(id) {
                return Err(ConfigurationError::DuplicateService(*id));
            }
        }
        for (i, transport) in self.transports.iter().enumerate() {
            if transport.host.trim().is_empty() {
                return Err(ConfigurationError::EmptyHost { index: i });
            }
            if self.transports[..i].contains(transport) {
                return Err(ConfigurationError::DuplicateTransport(transport.endpoint()));
            }
        }
        if self.read_timeout_ms == 0 {
            return Err(ConfigurationError::ZeroReadTimeout);
        }
        if self.role == Role::Client {
            let index = self
                .client_transport
                .ok_or(ConfigurationError::MissingClientTransport)?;
            if index >= self.transports.len() {
                return Err(ConfigurationError::ClientTransportOutOfRange {
                    index,
                    len: self.transports.len(),
                });
            }
        }
        Ok(())
    }

    /// Spiegelt die Konfiguration auf die Gegenseite.
    ///
    /// Aus einer Server-Konfiguration wird ein Client, der die gleichen Dienste
    /// unter `host` erreicht; aus einem Client ein Server, der auf `host` lauscht.
    pub fn mirror(&self, host: impl Into<String>) -> Config {
        let host = host.into();
        let role = self.role.flipped();
        let transports = self
            .transports
            .iter()
            .map(|t| TransportDescriptor::new(t.protocol, host.clone(), t.port))
            .collect();
        Config {
            role,
            transports,
            services: self.services.clone(),
            client_transport: match role {
                Role::Client => Some(0),
                Role::Server => None,
            },
            read_timeout_ms: self.read_timeout_ms,
            reconnect: self.reconnect,
            max_packet_size: self.max_packet_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_config() -> Config {
        Config::server()
            .with_transport(TransportDescriptor::tcp("0.0.0.0", 4000))
            .with_transport(TransportDescriptor::tcp("0.0.0.0", 4001))
            .with_service(1)
            .with_service(2)
    }

    #[test]
    fn valid_server_config_passes() {
        assert_eq!(server_config().validate(), Ok(()));
    }

    #[test]
    fn empty_lists_are_rejected() {
        assert_eq!(
            Config::server().with_service(1).validate(),
            Err(ConfigurationError::NoTransports)
        );
        assert_eq!(
            Config::server()
                .with_transport(TransportDescriptor::tcp("127.0.0.1", 1))
                .validate(),
            Err(ConfigurationError::NoServices)
        );
    }

    #[test]
    fn duplicate_service_is_rejected() {
        let config = server_config().with_service(1);
        assert_eq!(
            config.validate(),
            Err(ConfigurationError::DuplicateService(ServiceId::new(1)))
        );
    }

    #[test]
    fn client_index_must_be_in_range() {
        let config = Config::client()
            .with_transport(TransportDescriptor::tcp("127.0.0.1", 4000))
            .with_service(1)
            .with_client_transport(3);
        assert_eq!(
            config.validate(),
            Err(ConfigurationError::ClientTransportOutOfRange { index: 3, len: 1 })
        );

        let mut missing = config.clone();
        missing.client_transport = None;
        assert_eq!(
            missing.validate(),
            Err(ConfigurationError::MissingClientTransport)
        );
    }

    #[test]
    fn validation_is_repeatable() {
        let config = server_config().with_service(2);
        let first = config.validate();
        let second = config.validate();
        assert_eq!(first, second);
        assert!(first.is_err());
    }

    #[test]
    fn add_helpers_reject_duplicates() {
        let mut config = Config::server();
        config.add_service(7u32).unwrap();
        assert!(config.add_service(7u32).is_err());
        config
            .add_transport(TransportDescriptor::loopback("hub", 1))
            .unwrap();
        assert_eq!(
            config
                .add_transport(TransportDescriptor::loopback("hub", 1))
                .unwrap_err(),
            ConfigurationError::DuplicateTransport("hub:1".into())
        );
    }

    #[test]
    fn mirror_turns_server_into_client() {
        let client = server_config().mirror("192.168.1.20");
        assert_eq!(client.role, Role::Client);
        assert_eq!(client.client_transport, Some(0));
        assert_eq!(client.services, vec![ServiceId::new(1), ServiceId::new(2)]);
        assert_eq!(
            client.selected_transport(),
            Some(&TransportDescriptor::tcp("192.168.1.20", 4000))
        );
        assert_eq!(client.validate(), Ok(()));
    }

    #[test]
    fn socket_addr_requires_ip_literal() {
        let descriptor = TransportDescriptor::tcp("127.0.0.1", 8080);
        assert_eq!(
            descriptor.socket_addr().unwrap(),
            "127.0.0.1:8080".parse().unwrap()
        );
        assert!(TransportDescriptor::tcp("localhost", 1).socket_addr().is_err());
    }

    #[test]
    fn serde_fills_defaults() {
        let json = r#"{
            "role": "client",
            "transports": [{ "protocol": "tcp", "host": "10.0.0.1", "port": 9000 }],
            "services": [3, 4],
            "client_transport": 0
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.read_timeout(), DEFAULT_READ_TIMEOUT);
        assert_eq!(config.reconnect, ReconnectPolicy::Manual);
        assert_eq!(config.max_packet_size, DEFAULT_MAX_PACKET_SIZE);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn retry_policy_parses_from_tagged_form() {
        let policy: ReconnectPolicy =
            serde_json::from_str(r#"{ "mode": "retry", "delay_ms": 250 }"#).unwrap();
        assert_eq!(policy.retry_delay(), Some(Duration::from_millis(250)));
    }
}

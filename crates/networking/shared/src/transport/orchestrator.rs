//! Transport orchestrator for creating network transports.
//!
//! Provides a unified [`TransportFactory`] that instantiates the right transport
//! type (TCP, loopback) for each configured descriptor.

use tracing::debug;

use crate::config::{Protocol, TransportDescriptor};
use crate::events::TransportError;

use super::loopback::{LoopbackConnection, LoopbackListener, LoopbackNetwork};
use super::tcp::{TcpConnection, TcpListenerTransport};
use super::{EventSink, Transport, TransportFactory, TransportOptions, TransportResult};

/// Error types for transport orchestration.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Transport not available: {0}")]
    Unavailable(&'static str),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<OrchestratorError> for TransportError {
    fn from(err: OrchestratorError) -> Self {
        TransportError::InvalidConfig(err.to_string())
    }
}

/// Transport orchestrator - factory for creating transport instances.
///
/// Loopback descriptors need an attached [`LoopbackNetwork`]; every
/// orchestrator sharing a network can reach the listeners bound in it.
#[derive(Debug, Clone, Default)]
pub struct TransportOrchestrator {
    loopback: Option<LoopbackNetwork>,
}

impl TransportOrchestrator {
    /// Orchestrator for TCP only.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_loopback(network: LoopbackNetwork) -> Self {
        Self {
            loopback: Some(network),
        }
    }

    pub fn loopback_network(&self) -> Option<&LoopbackNetwork> {
        self.loopback.as_ref()
    }

    fn network(&self) -> Result<LoopbackNetwork, OrchestratorError> {
        self.loopback
            .clone()
            .ok_or(OrchestratorError::Unavailable("loopback transport requires a LoopbackNetwork"))
    }

    fn check(descriptor: &TransportDescriptor) -> Result<(), OrchestratorError> {
        if descriptor.host.is_empty() {
            return Err(OrchestratorError::InvalidConfig(format!(
                "empty host for port {}",
                descriptor.port
            )));
        }
        Ok(())
    }
}

impl TransportFactory for TransportOrchestrator {
    fn listener(
        &self,
        descriptor: &TransportDescriptor,
        options: &TransportOptions,
        sink: EventSink,
    ) -> TransportResult<Box<dyn Transport>> {
        Self::check(descriptor)?;
        debug!(
            target: "net::transport::orchestrator",
            "creating {:?} listener {} for {}",
            descriptor.protocol,
            descriptor.endpoint(),
            sink.source()
        );
        let transport: Box<dyn Transport> = match descriptor.protocol {
            Protocol::Tcp => Box::new(TcpListenerTransport::new(descriptor, options.clone(), sink)),
            Protocol::Loopback => Box::new(
                LoopbackListener::new(self.network()?, descriptor.endpoint(), sink)
                    .with_max_packet_size(options.max_packet_size),
            ),
        };
        Ok(transport)
    }

    fn connector(
        &self,
        descriptor: &TransportDescriptor,
        options: &TransportOptions,
        sink: EventSink,
    ) -> TransportResult<Box<dyn Transport>> {
        Self::check(descriptor)?;
        debug!(
            target: "net::transport::orchestrator",
            "creating {:?} connector to {} for {}",
            descriptor.protocol,
            descriptor.endpoint(),
            sink.source()
        );
        let transport: Box<dyn Transport> = match descriptor.protocol {
            Protocol::Tcp => Box::new(TcpConnection::connector(descriptor, options.clone(), sink)),
            Protocol::Loopback => Box::new(
                LoopbackConnection::connector(self.network()?, descriptor.endpoint(), sink)
                    .with_max_packet_size(options.max_packet_size),
            ),
        };
        Ok(transport)
    }
}

//! Events and errors reported by transports.

use bytes::Bytes;
use thiserror::Error;

use crate::ids::{PacketId, ServiceId, TransportId};
use crate::transport::codec::CodecError;
use crate::transport::Transport;

/// Why a transport lost (or never established) its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// Binding or connecting failed.
    InitError,
    NetError,
    /// Keep-alive went unanswered.
    Timeout,
    OtherSide,
    /// Malformed frame or acknowledgement out of order.
    PacketError,
    /// Local deactivation.
    Request,
    /// Local restart tore the session down.
    Restart,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not ready: {0}")]
    NotReady(&'static str),
    #[error("transport is not connected")]
    NotConnected,
    #[error("transport is already active")]
    AlreadyActive,
    #[error("operation not supported by {0}")]
    Unsupported(&'static str),
    #[error("invalid transport configuration: {0}")]
    InvalidConfig(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("{0}")]
    Other(String),
}

/// Everything a transport reports back to its owner.
///
/// Events of one transport are delivered in emission order; `Terminated` is
/// always the last event a transport emits.
#[derive(Debug)]
pub enum TransportEvent {
    /// A listener is accepting connections on `endpoint`.
    Activated { endpoint: String },
    /// A listener accepted a connection. The child stays inert until activated.
    Spawned {
        child: TransportId,
        transport: Box<dyn Transport>,
    },
    Connected { endpoint: String },
    Disconnected { reason: DisconnectReason },
    DataReceived { service: ServiceId, payload: Bytes },
    SendComplete { packet: PacketId },
    DeliveryConfirmed { packet: PacketId },
    Terminated,
}

impl TransportEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            TransportEvent::Activated { .. } => "activated",
            TransportEvent::Spawned { .. } => "spawned",
            TransportEvent::Connected { .. } => "connected",
            TransportEvent::Disconnected { .. } => "disconnected",
            TransportEvent::DataReceived { .. } => "data_received",
            TransportEvent::SendComplete { .. } => "send_complete",
            TransportEvent::DeliveryConfirmed { .. } => "delivery_confirmed",
            TransportEvent::Terminated => "terminated",
        }
    }
}

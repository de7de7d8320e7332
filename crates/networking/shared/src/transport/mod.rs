//! Transport layer: the [`Transport`] trait, the event sink transports report
//! through, and the concrete TCP and loopback implementations.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc::{self, UnboundedReceiver};

use crate::config::{Config, ReconnectPolicy, DEFAULT_MAX_PACKET_SIZE, DEFAULT_READ_TIMEOUT};
use crate::config::TransportDescriptor;
use crate::events::{TransportError, TransportEvent};
use crate::ids::{IdGenerator, PacketId, ServiceId, TransportId};

pub mod codec;
pub mod loopback;
pub mod orchestrator;
pub mod tcp;

pub use codec::{CodecError, Packet, PacketCodec};
pub use loopback::{LoopbackConnection, LoopbackError, LoopbackListener, LoopbackNetwork};
pub use orchestrator::{OrchestratorError, TransportOrchestrator};
pub use tcp::{TcpConnection, TcpListenerTransport};

pub type TransportResult<T> = Result<T, TransportError>;

/// A listener or a single connection.
///
/// All methods return immediately; progress is reported through the
/// [`EventSink`] the transport was created with.
pub trait Transport: Send + fmt::Debug {
    fn activate(&mut self) -> TransportResult<()>;

    /// Stops the transport. `Terminated` follows, even if it was never activated.
    fn deactivate(&mut self);

    /// Re-arms the transport without changing its configuration.
    fn restart(&mut self);

    fn send(&mut self, service: ServiceId, payload: Bytes) -> TransportResult<PacketId>;
}

pub type EventForwarder = dyn Fn(TransportId, TransportEvent) -> bool + Send + Sync;

/// Where a transport posts its events, tagged with its own id.
#[derive(Clone)]
pub struct EventSink {
    source: TransportId,
    ids: IdGenerator,
    forward: Arc<EventForwarder>,
}

impl EventSink {
    pub fn new(source: TransportId, ids: IdGenerator, forward: Arc<EventForwarder>) -> Self {
        Self {
            source,
            ids,
            forward,
        }
    }

    /// Sink that forwards into an unbounded channel. Handy for hosts and tests
    /// that drive transports without a controller.
    pub fn unbounded(ids: IdGenerator) -> (Self, UnboundedReceiver<(TransportId, TransportEvent)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let source = TransportId::new(ids.next());
        let forward: Arc<EventForwarder> = Arc::new(move |source, event| tx.send((source, event)).is_ok());
        (Self::new(source, ids, forward), rx)
    }

    pub fn source(&self) -> TransportId {
        self.source
    }

    /// Returns `false` once the receiving side is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        (self.forward)(self.source, event)
    }

    /// Sink for a spawned child, with a fresh id from the shared generator.
    pub fn child(&self) -> EventSink {
        EventSink {
            source: TransportId::new(self.ids.next()),
            ids: self.ids.clone(),
            forward: Arc::clone(&self.forward),
        }
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

/// Per-config tuning shared by all transports of a controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    pub read_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub max_packet_size: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
            reconnect: ReconnectPolicy::Manual,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

impl From<&Config> for TransportOptions {
    fn from(config: &Config) -> Self {
        Self {
            read_timeout: config.read_timeout(),
            reconnect: config.reconnect,
            max_packet_size: config.max_packet_size,
        }
    }
}

/// Builds transports for configured descriptors.
pub trait TransportFactory: Send + Sync {
    fn listener(
        &self,
        descriptor: &TransportDescriptor,
        options: &TransportOptions,
        sink: EventSink,
    ) -> TransportResult<Box<dyn Transport>>;

    fn connector(
        &self,
        descriptor: &TransportDescriptor,
        options: &TransportOptions,
        sink: EventSink,
    ) -> TransportResult<Box<dyn Transport>>;
}

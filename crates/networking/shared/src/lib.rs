/// Controller configuration shared by server & client
pub mod config;
/// Transport level events and errors
pub mod events;
/// Strongly typed identifiers
pub mod ids;
/// Transport trait, event sink and the TCP / loopback implementations
pub mod transport;

pub use config::{
    Config, ConfigurationError, Protocol, ReconnectPolicy, Role, TransportDescriptor,
    DEFAULT_MAX_PACKET_SIZE, DEFAULT_READ_TIMEOUT,
};
pub use events::{DisconnectReason, TransportError, TransportEvent};
pub use ids::{IdGenerator, PacketId, ServiceId, TrackId, TransportId};
pub use transport::{
    EventForwarder, EventSink, Transport, TransportFactory, TransportOptions, TransportResult,
};

pub mod prelude {
    pub use crate::config::{Config, Protocol, ReconnectPolicy, Role, TransportDescriptor};
    pub use crate::events::{DisconnectReason, TransportEvent};
    pub use crate::ids::{PacketId, ServiceId, TransportId};
    pub use crate::transport::{
        loopback::LoopbackNetwork, orchestrator::TransportOrchestrator, EventSink, Transport,
        TransportFactory,
    };
}

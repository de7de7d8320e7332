/// Channels and the per-controller service table
pub mod channel;
/// Connections and their send bookkeeping
pub mod connection;
/// The controller and its handle
pub mod controller;
/// Controller errors and contract violations
pub mod error;
/// Listeners and the connections they spawn
pub mod listener;
/// Process-wide registry of running controllers
pub mod manager;
/// Service registrar and the closure-backed registry
pub mod registrar;
/// The service handler trait
pub mod service;

pub use channel::{Channel, ChannelKey, ServiceEntry};
pub use connection::{Connection, ConnectionState, ConnectionStats, Owner};
pub use controller::{
    Command, Controller, ControllerHandle, ControllerMessage, ControllerOptions, ControllerState,
    StopHandler,
};
pub use error::{ControllerError, ControllerResult, LifecycleViolation, ProtocolError};
pub use listener::{Listener, ListenerState};
pub use manager::NetCore;
pub use registrar::{RegistryError, ServiceRegistrar, ServiceRegistry};
pub use service::{ChannelContext, ChannelInfo, CloseReason, Service};

pub use network_shared as shared;

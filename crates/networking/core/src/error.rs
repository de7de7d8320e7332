use network_shared::{ConfigurationError, ServiceId, TrackId, TransportError};
use thiserror::Error;
use tracing::error;

use crate::channel::ChannelKey;
use crate::registrar::RegistryError;

/// Misuse of the controller's lifecycle contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LifecycleViolation {
    #[error("stop requested more than once")]
    DoubleStop,
    #[error("start requested before a configuration was applied")]
    StartBeforeConfig,
    #[error("start requested more than once")]
    AlreadyStarted,
    #[error("a configuration was already applied")]
    AlreadyConfigured,
    #[error("restart requested while stopping")]
    RestartWhileStopping,
    #[error("restart requested while not running")]
    NotRunning,
    #[error("channel {0} opened twice")]
    DoubleOpen(ChannelKey),
    #[error("channel {0} closed twice")]
    DoubleClose(ChannelKey),
    #[error("service {0} created while still referenced")]
    CreateWhileReferenced(ServiceId),
}

/// Traffic from the remote side that could not be routed. The connection
/// stays open; the error is logged and kept on the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("{len} bytes for unknown service {service}")]
    UnknownService { service: ServiceId, len: usize },
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("lifecycle violation: {0}")]
    Lifecycle(#[from] LifecycleViolation),
    #[error("channel {0} is not open")]
    NotOpen(ChannelKey),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("unknown controller {0}")]
    UnknownController(TrackId),
    #[error("controller is gone")]
    Closed,
}

pub type ControllerResult<T> = Result<T, ControllerError>;

/// Reports a contract violation: panics when `strict`, otherwise logs it and
/// hands back the error for the caller.
pub(crate) fn violation(violation: LifecycleViolation, strict: bool) -> ControllerError {
    if strict {
        panic!("lifecycle violation: {violation}");
    }
    error!(target: "net::controller", "lifecycle violation rejected: {violation}");
    ControllerError::Lifecycle(violation)
}

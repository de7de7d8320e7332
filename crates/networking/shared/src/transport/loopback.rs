//! Loopback transport for in-process connections.
//!
//! Listener and connector halves meet in a [`LoopbackNetwork`] keyed by
//! `"host:port"` without touching the network stack. This is primarily used
//! for single-process setups and for tests that need real transport semantics.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::config::DEFAULT_MAX_PACKET_SIZE;
use crate::events::{DisconnectReason, TransportError, TransportEvent};
use crate::ids::{PacketId, ServiceId, TransportId};

use super::codec::CodecError;
use super::{EventSink, Transport, TransportResult};

/// Error type for loopback transport operations.
#[derive(Debug, thiserror::Error)]
pub enum LoopbackError {
    #[error("loopback address {0} already in use")]
    AddressInUse(String),
    #[error("no loopback listener at {0}")]
    NoListener(String),
    #[error("loopback transport not connected")]
    NotConnected,
    #[error("loopback transport already active")]
    AlreadyActive,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl From<LoopbackError> for TransportError {
    fn from(err: LoopbackError) -> Self {
        match err {
            LoopbackError::NotConnected => TransportError::NotConnected,
            LoopbackError::AlreadyActive => TransportError::AlreadyActive,
            LoopbackError::Codec(err) => TransportError::Codec(err),
            other => TransportError::Other(other.to_string()),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct Bound {
    sink: EventSink,
    max_packet_size: usize,
}

/// In-memory "network" that loopback listeners bind to.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    listeners: Arc<Mutex<HashMap<String, Bound>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_bound(&self, endpoint: &str) -> bool {
        lock(&self.listeners).contains_key(endpoint)
    }

    fn bind(
        &self,
        endpoint: &str,
        sink: &EventSink,
        max_packet_size: usize,
    ) -> Result<(), LoopbackError> {
        let mut listeners = lock(&self.listeners);
        if listeners.contains_key(endpoint) {
            return Err(LoopbackError::AddressInUse(endpoint.to_string()));
        }
        listeners.insert(
            endpoint.to_string(),
            Bound {
                sink: sink.clone(),
                max_packet_size,
            },
        );
        Ok(())
    }

    fn unbind(&self, endpoint: &str, source: TransportId) {
        let mut listeners = lock(&self.listeners);
        if listeners.get(endpoint).is_some_and(|b| b.sink.source() == source) {
            listeners.remove(endpoint);
        }
    }

    /// Links `client` to the listener at `endpoint`. The server half is
    /// announced to the listener with `Spawned`.
    fn connect(
        &self,
        endpoint: &str,
        client: &EventSink,
        max_packet_size: usize,
    ) -> Result<Arc<Link>, LoopbackError> {
        let listeners = lock(&self.listeners);
        let Bound {
            sink: listener,
            max_packet_size: server_max,
        } = listeners
            .get(endpoint)
            .ok_or_else(|| LoopbackError::NoListener(endpoint.to_string()))?;

        let child = listener.child();
        let link = Arc::new(Link::new(
            Half::new(client.clone(), endpoint.to_string(), max_packet_size),
            Half::new(
                child.clone(),
                format!("loopback-peer:{}", client.source().get()),
                *server_max,
            ),
        ));
        debug!(
            target: "net::transport::loopback",
            "{} linked to {endpoint} as {}",
            client.source(),
            child.source()
        );

        let server_half =
            LoopbackConnection::accepted(Arc::clone(&link), child.clone(), *server_max);
        listener.emit(TransportEvent::Spawned {
            child: child.source(),
            transport: Box::new(server_half),
        });
        Ok(link)
    }
}

impl fmt::Debug for LoopbackNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackNetwork")
            .field("listeners", &lock(&self.listeners).len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Server,
}

#[derive(Debug)]
struct Queued {
    service: ServiceId,
    payload: Bytes,
    packet: PacketId,
}

#[derive(Debug)]
struct Half {
    sink: EventSink,
    /// What this half reports as the remote endpoint.
    peer_endpoint: String,
    /// Largest payload this half may send.
    max_packet_size: usize,
    active: bool,
    next_packet: u32,
    inbox: VecDeque<Queued>,
}

impl Half {
    fn new(sink: EventSink, peer_endpoint: String, max_packet_size: usize) -> Self {
        Self {
            sink,
            peer_endpoint,
            max_packet_size,
            active: false,
            next_packet: 1,
            inbox: VecDeque::new(),
        }
    }
}

#[derive(Debug)]
struct LinkState {
    client: Half,
    server: Half,
    severed: bool,
}

impl LinkState {
    fn split(&mut self, side: Side) -> (&mut Half, &mut Half) {
        match side {
            Side::Client => (&mut self.client, &mut self.server),
            Side::Server => (&mut self.server, &mut self.client),
        }
    }
}

/// Shared state of one linked client/server pair.
#[derive(Debug)]
struct Link {
    state: Mutex<LinkState>,
}

impl Link {
    fn new(client: Half, server: Half) -> Self {
        Self {
            state: Mutex::new(LinkState {
                client,
                server,
                severed: false,
            }),
        }
    }

    fn activate(&self, side: Side) -> Result<(), LoopbackError> {
        let mut state = lock(&self.state);
        let severed = state.severed;
        let (own, peer) = state.split(side);
        if own.active {
            return Err(LoopbackError::AlreadyActive);
        }
        if severed {
            own.sink.emit(TransportEvent::Disconnected {
                reason: DisconnectReason::OtherSide,
            });
            return Ok(());
        }

        own.active = true;
        own.sink.emit(TransportEvent::Connected {
            endpoint: own.peer_endpoint.clone(),
        });
        while let Some(queued) = own.inbox.pop_front() {
            own.sink.emit(TransportEvent::DataReceived {
                service: queued.service,
                payload: queued.payload,
            });
            peer.sink.emit(TransportEvent::DeliveryConfirmed {
                packet: queued.packet,
            });
        }
        Ok(())
    }

    fn send(&self, side: Side, service: ServiceId, payload: Bytes) -> Result<PacketId, LoopbackError> {
        let mut state = lock(&self.state);
        if state.severed {
            return Err(LoopbackError::NotConnected);
        }
        let (own, peer) = state.split(side);
        if !own.active {
            return Err(LoopbackError::NotConnected);
        }
        if payload.len() > own.max_packet_size {
            return Err(CodecError::TooLarge {
                len: payload.len(),
                max: own.max_packet_size,
            }
            .into());
        }

        let packet = PacketId::new(own.next_packet);
        own.next_packet = own.next_packet.wrapping_add(1);
        trace!(
            target: "net::transport::loopback",
            "{} sends {packet} on {service} ({} bytes)",
            own.sink.source(),
            payload.len()
        );

        if peer.active {
            peer.sink.emit(TransportEvent::DataReceived { service, payload });
            own.sink.emit(TransportEvent::SendComplete { packet });
            own.sink.emit(TransportEvent::DeliveryConfirmed { packet });
        } else {
            peer.inbox.push_back(Queued {
                service,
                payload,
                packet,
            });
            own.sink.emit(TransportEvent::SendComplete { packet });
        }
        Ok(packet)
    }

    /// Cuts the link. `side` sees `reason`, an active peer sees `OtherSide`.
    fn sever(&self, side: Side, reason: DisconnectReason) {
        let mut state = lock(&self.state);
        if state.severed {
            return;
        }
        state.severed = true;
        let (own, peer) = state.split(side);
        if own.active {
            own.active = false;
            own.sink.emit(TransportEvent::Disconnected { reason });
        }
        if peer.active {
            peer.active = false;
            peer.sink.emit(TransportEvent::Disconnected {
                reason: DisconnectReason::OtherSide,
            });
        }
        own.inbox.clear();
        peer.inbox.clear();
    }
}

/// Listener half, bound to an endpoint of a [`LoopbackNetwork`].
#[derive(Debug)]
pub struct LoopbackListener {
    network: LoopbackNetwork,
    endpoint: String,
    sink: EventSink,
    max_packet_size: usize,
    bound: bool,
    deactivated: bool,
}

impl LoopbackListener {
    pub fn new(network: LoopbackNetwork, endpoint: impl Into<String>, sink: EventSink) -> Self {
        Self {
            network,
            endpoint: endpoint.into(),
            sink,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            bound: false,
            deactivated: false,
        }
    }

    /// Limits the payload size of every connection this listener accepts.
    pub fn with_max_packet_size(mut self, max_packet_size: usize) -> Self {
        self.max_packet_size = max_packet_size;
        self
    }
}

impl Transport for LoopbackListener {
    fn activate(&mut self) -> TransportResult<()> {
        if self.deactivated {
            return Err(TransportError::NotReady("loopback listener was deactivated"));
        }
        if self.bound {
            return Err(LoopbackError::AlreadyActive.into());
        }
        self.network.bind(&self.endpoint, &self.sink, self.max_packet_size)?;
        self.bound = true;
        debug!(target: "net::transport::loopback", "listening on {}", self.endpoint);
        self.sink.emit(TransportEvent::Activated {
            endpoint: self.endpoint.clone(),
        });
        Ok(())
    }

    fn deactivate(&mut self) {
        if self.deactivated {
            return;
        }
        self.deactivated = true;
        if self.bound {
            self.network.unbind(&self.endpoint, self.sink.source());
            self.bound = false;
        }
        self.sink.emit(TransportEvent::Terminated);
    }

    fn restart(&mut self) {
        if self.deactivated || !self.bound {
            return;
        }
        self.network.unbind(&self.endpoint, self.sink.source());
        if let Err(err) = self.network.bind(&self.endpoint, &self.sink, self.max_packet_size) {
            warn!(target: "net::transport::loopback", "rebind of {} failed: {err}", self.endpoint);
            self.bound = false;
            self.sink.emit(TransportEvent::Disconnected {
                reason: DisconnectReason::InitError,
            });
        }
    }

    fn send(&mut self, _service: ServiceId, _payload: Bytes) -> TransportResult<PacketId> {
        Err(TransportError::Unsupported("loopback listener"))
    }
}

#[derive(Debug)]
enum Origin {
    Connector {
        network: LoopbackNetwork,
        endpoint: String,
    },
    Accepted,
}

/// One end of a loopback link: either the connector a client created or the
/// child a listener spawned.
#[derive(Debug)]
pub struct LoopbackConnection {
    origin: Origin,
    side: Side,
    sink: EventSink,
    max_packet_size: usize,
    link: Option<Arc<Link>>,
    started: bool,
    deactivated: bool,
}

impl LoopbackConnection {
    pub fn connector(network: LoopbackNetwork, endpoint: impl Into<String>, sink: EventSink) -> Self {
        Self {
            origin: Origin::Connector {
                network,
                endpoint: endpoint.into(),
            },
            side: Side::Client,
            sink,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            link: None,
            started: false,
            deactivated: false,
        }
    }

    fn accepted(link: Arc<Link>, sink: EventSink, max_packet_size: usize) -> Self {
        Self {
            origin: Origin::Accepted,
            side: Side::Server,
            sink,
            max_packet_size,
            link: Some(link),
            started: false,
            deactivated: false,
        }
    }

    pub fn with_max_packet_size(mut self, max_packet_size: usize) -> Self {
        self.max_packet_size = max_packet_size;
        self
    }

    fn establish(&mut self) -> TransportResult<()> {
        match &self.origin {
            Origin::Connector { network, endpoint } => {
                match network.connect(endpoint, &self.sink, self.max_packet_size) {
                    Ok(link) => {
                        link.activate(self.side)?;
                        self.link = Some(link);
                    }
                    Err(err) => {
                        warn!(target: "net::transport::loopback", "{}: {err}", self.sink.source());
                        self.sink.emit(TransportEvent::Disconnected {
                            reason: DisconnectReason::InitError,
                        });
                    }
                }
            }
            Origin::Accepted => {
                if let Some(link) = &self.link {
                    link.activate(self.side)?;
                }
            }
        }
        Ok(())
    }
}

impl Transport for LoopbackConnection {
    fn activate(&mut self) -> TransportResult<()> {
        if self.deactivated {
            return Err(TransportError::NotReady("loopback connection was deactivated"));
        }
        if self.started {
            return Err(LoopbackError::AlreadyActive.into());
        }
        self.started = true;
        self.establish()
    }

    fn deactivate(&mut self) {
        if self.deactivated {
            return;
        }
        self.deactivated = true;
        if let Some(link) = self.link.take() {
            link.sever(self.side, DisconnectReason::Request);
        }
        self.sink.emit(TransportEvent::Terminated);
    }

    fn restart(&mut self) {
        if self.deactivated || !self.started {
            return;
        }
        if let Some(link) = &self.link {
            link.sever(self.side, DisconnectReason::Restart);
        }
        if matches!(self.origin, Origin::Connector { .. }) {
            self.link = None;
            if let Err(err) = self.establish() {
                warn!(target: "net::transport::loopback", "reconnect failed: {err}");
            }
        }
    }

    fn send(&mut self, service: ServiceId, payload: Bytes) -> TransportResult<PacketId> {
        let link = self.link.as_ref().ok_or(LoopbackError::NotConnected)?;
        Ok(link.send(self.side, service, payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::IdGenerator;

    #[test]
    fn second_bind_is_rejected() {
        let network = LoopbackNetwork::new();
        let (sink, _rx) = EventSink::unbounded(IdGenerator::default());
        let mut first = LoopbackListener::new(network.clone(), "hub:1", sink.child());
        let mut second = LoopbackListener::new(network.clone(), "hub:1", sink.child());

        first.activate().unwrap();
        assert!(second.activate().is_err());
        assert!(network.is_bound("hub:1"));

        first.deactivate();
        assert!(!network.is_bound("hub:1"));
        second.activate().unwrap();
    }

    #[test]
    fn connect_without_listener_reports_init_error() {
        let network = LoopbackNetwork::new();
        let (sink, mut rx) = EventSink::unbounded(IdGenerator::default());
        let mut client = LoopbackConnection::connector(network, "nowhere:9", sink);

        client.activate().unwrap();
        let (_, event) = rx.try_recv().unwrap();
        assert!(matches!(
            event,
            TransportEvent::Disconnected {
                reason: DisconnectReason::InitError
            }
        ));
        assert!(client.send(ServiceId::new(1), Bytes::new()).is_err());
    }

    #[test]
    fn deactivate_before_activate_still_terminates() {
        let (sink, mut rx) = EventSink::unbounded(IdGenerator::default());
        let mut client = LoopbackConnection::connector(LoopbackNetwork::new(), "hub:2", sink);
        client.deactivate();
        client.deactivate();
        assert!(matches!(rx.try_recv().unwrap().1, TransportEvent::Terminated));
        assert!(rx.try_recv().is_err());
    }
}

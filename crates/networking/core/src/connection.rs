//! One connected endpoint and the channels multiplexed over it.

use std::collections::HashMap;

use bytes::Bytes;
use network_shared::{
    PacketId, ServiceId, Transport, TransportError, TransportEvent, TransportId, TransportResult,
};
use tracing::{debug, error, info, trace, warn};

use crate::channel::{close_channel, open_channel, Channel, ChannelKey, Scope};
use crate::error::{ControllerError, ControllerResult, ProtocolError};
use crate::service::{ChannelContext, CloseReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Created,
    Activating,
    Open,
    Draining,
    Terminated,
}

/// Who reclaims a connection once it terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Listener(TransportId),
    Controller,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Payloads dropped because no channel exists for their service id.
    pub protocol_errors: u64,
}

/// Sending half of a connection: the transport plus the sends it still has to
/// confirm.
#[derive(Debug)]
pub(crate) struct Outbox {
    transport: Box<dyn Transport>,
    sent: HashMap<PacketId, (ServiceId, Bytes)>,
    delivering: HashMap<PacketId, ServiceId>,
    stats: ConnectionStats,
}

impl Outbox {
    pub(crate) fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            sent: HashMap::new(),
            delivering: HashMap::new(),
            stats: ConnectionStats::default(),
        }
    }

    pub(crate) fn send(&mut self, service: ServiceId, payload: Bytes) -> ControllerResult<PacketId> {
        let len = payload.len() as u64;
        let packet = self.transport.send(service, payload.clone())?;
        trace!(target: "net::channel", "queued {packet} on {service} ({len} bytes)");
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += len;
        self.sent.insert(packet, (service, payload));
        Ok(packet)
    }

    fn complete(&mut self, packet: PacketId) -> Option<(ServiceId, Bytes)> {
        let (service, payload) = self.sent.remove(&packet)?;
        self.delivering.insert(packet, service);
        Some((service, payload))
    }

    fn confirm(&mut self, packet: PacketId) -> Option<ServiceId> {
        self.delivering
            .remove(&packet)
            .or_else(|| self.sent.remove(&packet).map(|(service, _)| service))
    }

    fn forget(&mut self) {
        self.sent.clear();
        self.delivering.clear();
    }
}

/// Whether a connection is still alive after handling an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
    Continue,
    Terminated,
}

/// One endpoint: owns its transport and one channel per configured service id.
#[derive(Debug)]
pub struct Connection {
    id: TransportId,
    owner: Owner,
    state: ConnectionState,
    channels: Vec<Channel>,
    outbox: Outbox,
    remote: Option<String>,
    last_protocol_error: Option<ProtocolError>,
    deactivation_requested: bool,
}

impl Connection {
    pub(crate) fn new(
        id: TransportId,
        owner: Owner,
        transport: Box<dyn Transport>,
        services: &[ServiceId],
    ) -> Self {
        Self {
            id,
            owner,
            state: ConnectionState::Created,
            channels: services
                .iter()
                .map(|&service| Channel::new(ChannelKey::new(id, service)))
                .collect(),
            outbox: Outbox::new(transport),
            remote: None,
            last_protocol_error: None,
            deactivation_requested: false,
        }
    }

    pub fn id(&self) -> TransportId {
        self.id
    }

    pub fn owner(&self) -> Owner {
        self.owner
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn remote(&self) -> Option<&str> {
        self.remote.as_deref()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.outbox.stats
    }

    /// Most recent unroutable payload; `stats().protocol_errors` counts them all.
    pub fn last_protocol_error(&self) -> Option<ProtocolError> {
        self.last_protocol_error
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn channel(&self, service: ServiceId) -> Option<&Channel> {
        self.channels.iter().find(|c| c.key().service == service)
    }

    pub fn open_channels(&self) -> usize {
        self.channels.iter().filter(|c| c.is_open()).count()
    }

    pub fn is_terminated(&self) -> bool {
        self.state == ConnectionState::Terminated
    }

    pub(crate) fn activate(&mut self) -> TransportResult<()> {
        if self.state != ConnectionState::Created {
            return Err(TransportError::AlreadyActive);
        }
        self.state = ConnectionState::Activating;
        self.outbox.transport.activate()
    }

    /// Marks a connection whose activation failed as terminated. Nothing was
    /// opened on it, so there is nothing to close.
    pub(crate) fn fail(&mut self) {
        self.state = ConnectionState::Terminated;
        self.deactivation_requested = true;
    }

    /// Asks the transport to shut down. `Terminated` arrives later as an event.
    pub(crate) fn deactivate(&mut self) {
        if self.deactivation_requested || self.state == ConnectionState::Terminated {
            return;
        }
        self.deactivation_requested = true;
        self.state = ConnectionState::Draining;
        debug!(target: "net::controller", "deactivating {}", self.id);
        self.outbox.transport.deactivate();
    }

    pub(crate) fn restart(&mut self) {
        if matches!(
            self.state,
            ConnectionState::Activating | ConnectionState::Open
        ) {
            debug!(target: "net::controller", "restarting {}", self.id);
            self.outbox.transport.restart();
        }
    }

    pub(crate) fn send(&mut self, service: ServiceId, payload: Bytes) -> ControllerResult<PacketId> {
        let key = ChannelKey::new(self.id, service);
        if self.state != ConnectionState::Open {
            return Err(ControllerError::NotOpen(key));
        }
        if !self.channel(service).is_some_and(Channel::is_open) {
            return Err(ControllerError::NotOpen(key));
        }
        self.outbox.send(service, payload)
    }

    pub(crate) fn on_event(&mut self, event: TransportEvent, scope: &mut Scope<'_>) -> Progress {
        if self.state == ConnectionState::Terminated {
            trace!(target: "net::controller", "{}: ignoring {} after termination", self.id, event.kind());
            return Progress::Continue;
        }

        match event {
            TransportEvent::Connected { endpoint } | TransportEvent::Activated { endpoint } => {
                self.on_connected(endpoint, scope)
            }
            TransportEvent::Disconnected { reason } => {
                info!(target: "net::controller", "{} disconnected: {reason:?}", self.id);
                let close = if scope.stopping {
                    CloseReason::Shutdown
                } else {
                    CloseReason::Disconnected(reason)
                };
                self.close_all(scope, close);
                self.outbox.forget();
                self.remote = None;
                match self.owner {
                    // A spawned connection cannot come back; let it terminate.
                    Owner::Listener(_) => self.deactivate(),
                    Owner::Controller if !self.deactivation_requested => {
                        self.state = ConnectionState::Activating;
                    }
                    Owner::Controller => {}
                }
            }
            TransportEvent::DataReceived { service, payload } => self.deliver(service, payload, scope),
            TransportEvent::SendComplete { packet } => {
                if let Some((service, payload)) = self.outbox.complete(packet) {
                    if let Some(channel) = self.open_channel_for(service) {
                        if let Some(handler) = scope.services.handler_mut(service) {
                            handler.on_packet_sent(&channel.info, packet, payload);
                        }
                    }
                }
            }
            TransportEvent::DeliveryConfirmed { packet } => {
                if let Some(service) = self.outbox.confirm(packet) {
                    if let Some(channel) = self.open_channel_for(service) {
                        if let Some(handler) = scope.services.handler_mut(service) {
                            handler.on_packet_delivered(&channel.info, packet);
                        }
                    }
                } else {
                    trace!(target: "net::controller", "{}: confirmation for unknown {packet}", self.id);
                }
            }
            TransportEvent::Spawned { child, .. } => {
                warn!(target: "net::controller", "{}: connection cannot spawn {child}", self.id);
            }
            TransportEvent::Terminated => {
                let reason = if scope.stopping {
                    CloseReason::Shutdown
                } else {
                    CloseReason::Terminated
                };
                self.close_all(scope, reason);
                self.outbox.forget();
                self.state = ConnectionState::Terminated;
                info!(target: "net::controller", "{} terminated", self.id);
                return Progress::Terminated;
            }
        }
        Progress::Continue
    }

    fn on_connected(&mut self, endpoint: String, scope: &mut Scope<'_>) {
        match self.state {
            ConnectionState::Created | ConnectionState::Activating => {
                info!(target: "net::controller", "{} connected to {endpoint}", self.id);
                self.state = ConnectionState::Open;
                self.remote = Some(endpoint);
                self.open_all(scope);
            }
            ConnectionState::Open => {
                warn!(target: "net::controller", "{}: duplicate connect from {endpoint}", self.id);
            }
            ConnectionState::Draining | ConnectionState::Terminated => {
                debug!(target: "net::controller", "{}: connect while draining ignored", self.id);
            }
        }
    }

    /// Opens one channel per configured service id, in configuration order.
    fn open_all(&mut self, scope: &mut Scope<'_>) {
        for channel in &mut self.channels {
            channel.info.remote = self.remote.clone();
            if let Err(err) = open_channel(scope, channel, &mut self.outbox) {
                error!(target: "net::channel", "opening {} failed: {err}", channel.key());
            }
        }
    }

    fn close_all(&mut self, scope: &mut Scope<'_>, reason: CloseReason) {
        for channel in self.channels.iter_mut().filter(|c| c.is_open()) {
            if let Err(err) = close_channel(scope, channel, reason) {
                error!(target: "net::channel", "closing {} failed: {err}", channel.key());
            }
        }
    }

    fn open_channel_for(&self, service: ServiceId) -> Option<&Channel> {
        self.channels
            .iter()
            .find(|c| c.key().service == service && c.is_open())
    }

    fn deliver(&mut self, service: ServiceId, payload: Bytes, scope: &mut Scope<'_>) {
        if self.state != ConnectionState::Open {
            debug!(target: "net::channel", "{}: dropping data while {:?}", self.id, self.state);
            return;
        }
        let Some(channel) = self
            .channels
            .iter()
            .find(|c| c.key().service == service && c.is_open())
        else {
            let err = ProtocolError::UnknownService {
                service,
                len: payload.len(),
            };
            self.outbox.stats.protocol_errors += 1;
            self.last_protocol_error = Some(err);
            warn!(target: "net::channel", "{}: dropped: {err}", self.id);
            return;
        };
        self.outbox.stats.packets_received += 1;
        self.outbox.stats.bytes_received += payload.len() as u64;
        trace!(target: "net::channel", "{} received {} bytes", channel.key(), payload.len());
        if let Some(handler) = scope.services.handler_mut(service) {
            handler.on_packet_received(&mut ChannelContext::new(&channel.info, &mut self.outbox), payload);
        }
    }
}

use std::collections::HashMap;

use network_shared::{
    ServiceId, Transport, TransportDescriptor, TransportEvent, TransportId, TransportResult,
};
use tracing::{debug, info, warn};

use crate::channel::Scope;
use crate::connection::{Connection, Owner, Progress};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Created,
    Activating,
    Listening,
    Draining,
    Terminated,
}

/// A listening transport and the connections it spawned.
///
/// A listener only counts as terminated once its own transport reported
/// `Terminated` and every spawned connection has been reclaimed.
#[derive(Debug)]
pub struct Listener {
    id: TransportId,
    descriptor: TransportDescriptor,
    transport: Box<dyn Transport>,
    state: ListenerState,
    children: HashMap<TransportId, Connection>,
    transport_terminated: bool,
    deactivation_requested: bool,
    accepted: u64,
}

impl Listener {
    pub(crate) fn new(
        id: TransportId,
        descriptor: TransportDescriptor,
        transport: Box<dyn Transport>,
    ) -> Self {
        Self {
            id,
            descriptor,
            transport,
            state: ListenerState::Created,
            children: HashMap::new(),
            transport_terminated: false,
            deactivation_requested: false,
            accepted: 0,
        }
    }

    pub fn id(&self) -> TransportId {
        self.id
    }

    pub fn descriptor(&self) -> &TransportDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> ListenerState {
        self.state
    }

    pub fn live_connections(&self) -> usize {
        self.children.len()
    }

    /// Connections accepted over the listener's lifetime.
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    pub fn connection(&self, id: TransportId) -> Option<&Connection> {
        self.children.get(&id)
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.children.values()
    }

    pub fn is_terminated(&self) -> bool {
        self.state == ListenerState::Terminated
    }

    pub(crate) fn has_child(&self, id: TransportId) -> bool {
        self.children.contains_key(&id)
    }

    pub(crate) fn child_mut(&mut self, id: TransportId) -> Option<&mut Connection> {
        self.children.get_mut(&id)
    }

    pub(crate) fn activate(&mut self) -> TransportResult<()> {
        self.state = ListenerState::Activating;
        self.transport.activate()
    }

    /// Activation failed; the transport will never report. Returns `true` if
    /// the listener is now terminated.
    pub(crate) fn fail(&mut self) -> bool {
        self.transport_terminated = true;
        self.try_finish()
    }

    /// Stops accepting and force-terminates every live child.
    pub(crate) fn deactivate(&mut self) {
        if self.deactivation_requested || self.is_terminated() {
            return;
        }
        self.deactivation_requested = true;
        self.state = ListenerState::Draining;
        info!(
            target: "net::controller",
            "deactivating listener {} with {} live connections",
            self.descriptor.endpoint(),
            self.children.len()
        );
        self.transport.deactivate();
        for child in self.children.values_mut() {
            child.deactivate();
        }
    }

    pub(crate) fn restart(&mut self) {
        if self.deactivation_requested || self.is_terminated() {
            return;
        }
        debug!(target: "net::controller", "restarting listener {}", self.descriptor.endpoint());
        self.transport.restart();
        for child in self.children.values_mut() {
            child.restart();
        }
    }

    /// Handles an event of the listening transport itself. Returns `true` when
    /// the listener has just terminated.
    pub(crate) fn on_event(&mut self, event: TransportEvent, scope: &mut Scope<'_>) -> bool {
        match event {
            TransportEvent::Activated { endpoint } => {
                if matches!(self.state, ListenerState::Created | ListenerState::Activating) {
                    self.state = ListenerState::Listening;
                }
                info!(target: "net::controller", "listener {} accepting on {endpoint}", self.id);
            }
            TransportEvent::Spawned { child, transport } => {
                self.adopt(child, transport, scope.services.ids());
            }
            TransportEvent::Disconnected { reason } => {
                warn!(
                    target: "net::controller",
                    "listener {} reported {reason:?}",
                    self.descriptor.endpoint()
                );
            }
            TransportEvent::Terminated => {
                self.transport_terminated = true;
                debug!(target: "net::controller", "listener transport {} terminated", self.id);
                return self.try_finish();
            }
            other => {
                warn!(target: "net::controller", "listener {}: unexpected {}", self.id, other.kind());
            }
        }
        false
    }

    /// Routes an event to a spawned connection and reclaims its slot once it
    /// terminates. Returns `true` when the listener has just terminated.
    pub(crate) fn on_child_event(
        &mut self,
        child: TransportId,
        event: TransportEvent,
        scope: &mut Scope<'_>,
    ) -> bool {
        let Some(connection) = self.children.get_mut(&child) else {
            return false;
        };
        if connection.on_event(event, scope) == Progress::Terminated {
            self.children.remove(&child);
            debug!(
                target: "net::controller",
                "reclaimed {child}, {} live on {}",
                self.children.len(),
                self.descriptor.endpoint()
            );
            return self.try_finish();
        }
        false
    }

    fn adopt(&mut self, child: TransportId, transport: Box<dyn Transport>, services: &[ServiceId]) {
        let mut connection = Connection::new(child, Owner::Listener(self.id), transport, services);
        self.accepted += 1;
        if self.deactivation_requested {
            debug!(target: "net::controller", "{child} spawned while draining, deactivating");
            connection.deactivate();
        } else if let Err(err) = connection.activate() {
            warn!(target: "net::controller", "activating {child} failed: {err}");
            connection.deactivate();
        }
        self.children.insert(child, connection);
    }

    fn try_finish(&mut self) -> bool {
        if self.transport_terminated && self.children.is_empty() && !self.is_terminated() {
            self.state = ListenerState::Terminated;
            info!(target: "net::controller", "listener {} terminated", self.descriptor.endpoint());
            return true;
        }
        false
    }
}

//! Channel bookkeeping: which service handlers exist and how many channels
//! reference each of them.
//!
//! [`open_channel`] and [`close_channel`] are the only places where handlers
//! are created or destroyed. Both run on the controller's execution context.

use std::collections::HashMap;
use std::fmt;

use network_shared::{ServiceId, TransportId};
use tracing::debug;

use crate::connection::Outbox;
use crate::error::{violation, ControllerResult, LifecycleViolation};
use crate::registrar::{RegistryError, ServiceRegistrar};
use crate::service::{ChannelContext, ChannelInfo, CloseReason, Service};

/// Identifies a channel: one service id on one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub connection: TransportId,
    pub service: ServiceId,
}

impl ChannelKey {
    pub fn new(connection: TransportId, service: ServiceId) -> Self {
        Self {
            connection,
            service,
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.connection, self.service)
    }
}

/// A (connection, service id) pair. Lives as long as its connection and is
/// attached to the service handler while open.
#[derive(Debug)]
pub struct Channel {
    pub(crate) info: ChannelInfo,
    attached: bool,
}

impl Channel {
    pub(crate) fn new(key: ChannelKey) -> Self {
        Self {
            info: ChannelInfo { key, remote: None },
            attached: false,
        }
    }

    pub fn key(&self) -> ChannelKey {
        self.info.key
    }

    pub fn info(&self) -> &ChannelInfo {
        &self.info
    }

    pub fn is_open(&self) -> bool {
        self.attached
    }
}

/// Per-controller record of one configured service id.
pub struct ServiceEntry {
    id: ServiceId,
    handler: Option<Box<dyn Service>>,
    ref_count: usize,
}

impl ServiceEntry {
    pub fn id(&self) -> ServiceId {
        self.id
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    pub fn is_instantiated(&self) -> bool {
        self.handler.is_some()
    }
}

impl fmt::Debug for ServiceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceEntry")
            .field("id", &self.id)
            .field("instantiated", &self.handler.is_some())
            .field("ref_count", &self.ref_count)
            .finish()
    }
}

/// Service entries in configuration order.
#[derive(Debug, Default)]
pub(crate) struct ServiceTable {
    order: Vec<ServiceId>,
    entries: HashMap<ServiceId, ServiceEntry>,
}

impl ServiceTable {
    pub(crate) fn new(ids: &[ServiceId]) -> Self {
        let entries = ids
            .iter()
            .map(|&id| {
                (
                    id,
                    ServiceEntry {
                        id,
                        handler: None,
                        ref_count: 0,
                    },
                )
            })
            .collect();
        Self {
            order: ids.to_vec(),
            entries,
        }
    }

    pub(crate) fn ids(&self) -> &[ServiceId] {
        &self.order
    }

    pub(crate) fn entry(&self, id: ServiceId) -> Option<&ServiceEntry> {
        self.entries.get(&id)
    }

    /// Entries that still hold a reference.
    pub(crate) fn live_entries(&self) -> usize {
        self.entries.values().filter(|e| e.ref_count > 0).count()
    }

    pub(crate) fn handler_mut(&mut self, id: ServiceId) -> Option<&mut Box<dyn Service>> {
        self.entries.get_mut(&id).and_then(|e| e.handler.as_mut())
    }

    fn acquire(
        &mut self,
        id: ServiceId,
        registrar: &dyn ServiceRegistrar,
        strict: bool,
    ) -> ControllerResult<&mut Box<dyn Service>> {
        let entry = self.entries.get_mut(&id).ok_or(RegistryError::Unknown(id))?;
        if entry.ref_count == 0 {
            if entry.handler.is_some() {
                return Err(violation(LifecycleViolation::CreateWhileReferenced(id), strict));
            }
            entry.handler = Some(registrar.create(id)?);
            debug!(target: "net::channel", "created handler for {id}");
        }
        let Some(handler) = entry.handler.as_mut() else {
            return Err(violation(LifecycleViolation::CreateWhileReferenced(id), strict));
        };
        entry.ref_count += 1;
        Ok(handler)
    }

    fn release(
        &mut self,
        key: ChannelKey,
        registrar: &dyn ServiceRegistrar,
        strict: bool,
    ) -> ControllerResult<()> {
        let id = key.service;
        let entry = self.entries.get_mut(&id).ok_or(RegistryError::Unknown(id))?;
        if entry.ref_count == 0 {
            return Err(violation(LifecycleViolation::DoubleClose(key), strict));
        }
        entry.ref_count -= 1;
        if entry.ref_count == 0 {
            if let Some(handler) = entry.handler.take() {
                registrar.destroy(id, handler);
                debug!(target: "net::channel", "destroyed handler for {id}");
            }
        }
        Ok(())
    }

    /// Destroys every remaining handler. Returns how many were still referenced.
    pub(crate) fn release_all(&mut self, registrar: &dyn ServiceRegistrar) -> usize {
        let mut referenced = 0;
        for id in &self.order {
            if let Some(entry) = self.entries.get_mut(id) {
                if entry.ref_count > 0 {
                    referenced += 1;
                    entry.ref_count = 0;
                }
                if let Some(handler) = entry.handler.take() {
                    registrar.destroy(*id, handler);
                }
            }
        }
        referenced
    }
}

/// What channel operations need from the controller.
pub(crate) struct Scope<'a> {
    pub services: &'a mut ServiceTable,
    pub registrar: &'a dyn ServiceRegistrar,
    pub strict: bool,
    /// Set while the controller is stopping; closes report `Shutdown`.
    pub stopping: bool,
}

/// Attaches `channel` to its service handler, creating the handler if this is
/// the first reference, and runs `on_channel_open`.
pub(crate) fn open_channel(
    scope: &mut Scope<'_>,
    channel: &mut Channel,
    outbox: &mut Outbox,
) -> ControllerResult<()> {
    let key = channel.key();
    if channel.attached {
        return Err(violation(LifecycleViolation::DoubleOpen(key), scope.strict));
    }
    let handler = scope
        .services
        .acquire(key.service, scope.registrar, scope.strict)?;
    channel.attached = true;
    debug!(target: "net::channel", "opened {key}");
    handler.on_channel_open(&mut ChannelContext::new(&channel.info, outbox));
    Ok(())
}

/// Runs `on_channel_closed`, detaches `channel` and destroys the handler once
/// no channel references it any more.
pub(crate) fn close_channel(
    scope: &mut Scope<'_>,
    channel: &mut Channel,
    reason: CloseReason,
) -> ControllerResult<()> {
    let key = channel.key();
    if !channel.attached {
        return Err(violation(LifecycleViolation::DoubleClose(key), scope.strict));
    }
    channel.attached = false;
    if let Some(handler) = scope.services.handler_mut(key.service) {
        handler.on_channel_closed(&channel.info, reason);
    }
    scope.services.release(key, scope.registrar, scope.strict)?;
    debug!(target: "net::channel", "closed {key}: {reason:?}");
    Ok(())
}

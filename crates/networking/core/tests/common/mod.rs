//! Test doubles shared by the controller integration tests.
//!
//! `MockFactory` hands out `MockTransport`s that never emit anything on their
//! own; tests play the transport side by emitting through the recorded sinks
//! and then draining the controller with `dispatch_pending`.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use network_core::{
    ChannelContext, ChannelInfo, ChannelKey, CloseReason, ControllerOptions, RegistryError,
    Service, ServiceRegistrar,
};
use network_shared::{
    EventSink, PacketId, ServiceId, Transport, TransportDescriptor, TransportError,
    TransportEvent, TransportFactory, TransportId, TransportOptions, TransportResult,
};

pub fn lenient() -> ControllerOptions {
    ControllerOptions::lenient()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap()
}

/// What the controller did to one transport.
#[derive(Debug, Default)]
pub struct Tally {
    pub activations: AtomicUsize,
    pub deactivations: AtomicUsize,
    pub restarts: AtomicUsize,
    pub fail_activate: AtomicBool,
    pub sent: Mutex<Vec<(ServiceId, Bytes)>>,
}

impl Tally {
    pub fn activations(&self) -> usize {
        self.activations.load(Ordering::SeqCst)
    }

    pub fn deactivations(&self) -> usize {
        self.deactivations.load(Ordering::SeqCst)
    }

    pub fn restarts(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<(ServiceId, Bytes)> {
        lock(&self.sent).clone()
    }
}

#[derive(Debug)]
pub struct MockTransport {
    tally: Arc<Tally>,
    next_packet: u32,
}

impl MockTransport {
    pub fn new(tally: Arc<Tally>) -> Self {
        Self {
            tally,
            next_packet: 1,
        }
    }
}

impl Transport for MockTransport {
    fn activate(&mut self) -> TransportResult<()> {
        self.tally.activations.fetch_add(1, Ordering::SeqCst);
        if self.tally.fail_activate.load(Ordering::SeqCst) {
            return Err(TransportError::Other("activation refused".into()));
        }
        Ok(())
    }

    fn deactivate(&mut self) {
        self.tally.deactivations.fetch_add(1, Ordering::SeqCst);
    }

    fn restart(&mut self) {
        self.tally.restarts.fetch_add(1, Ordering::SeqCst);
    }

    fn send(&mut self, service: ServiceId, payload: Bytes) -> TransportResult<PacketId> {
        lock(&self.tally.sent).push((service, payload));
        let packet = PacketId::new(self.next_packet);
        self.next_packet += 1;
        Ok(packet)
    }
}

/// The test's end of one mock transport.
#[derive(Debug, Clone)]
pub struct MockEndpoint {
    pub sink: EventSink,
    pub tally: Arc<Tally>,
}

impl MockEndpoint {
    pub fn id(&self) -> TransportId {
        self.sink.source()
    }

    pub fn emit(&self, event: TransportEvent) {
        assert!(self.sink.emit(event), "controller queue is gone");
    }

    pub fn activated(&self) {
        self.emit(TransportEvent::Activated {
            endpoint: format!("mock:{}", self.id().get()),
        });
    }

    pub fn connected(&self) {
        self.emit(TransportEvent::Connected {
            endpoint: format!("peer-of:{}", self.id().get()),
        });
    }

    pub fn terminated(&self) {
        self.emit(TransportEvent::Terminated);
    }

    pub fn data(&self, service: u32, payload: &'static [u8]) {
        self.emit(TransportEvent::DataReceived {
            service: ServiceId::new(service),
            payload: Bytes::from_static(payload),
        });
    }

    /// Announces an accepted connection on this listener.
    pub fn spawn_child(&self) -> MockEndpoint {
        let sink = self.sink.child();
        let tally = Arc::new(Tally::default());
        self.emit(TransportEvent::Spawned {
            child: sink.source(),
            transport: Box::new(MockTransport::new(Arc::clone(&tally))),
        });
        MockEndpoint { sink, tally }
    }
}

#[derive(Debug, Default)]
pub struct MockFactory {
    endpoints: Mutex<Vec<MockEndpoint>>,
    descriptors: Mutex<Vec<TransportDescriptor>>,
    /// Fails the n-th creation (0-based) with an invalid config error.
    fail_at: Mutex<Option<usize>>,
    created: AtomicUsize,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_at(index: usize) -> Arc<Self> {
        let factory = Self::default();
        *lock(&factory.fail_at) = Some(index);
        Arc::new(factory)
    }

    pub fn endpoints(&self) -> Vec<MockEndpoint> {
        lock(&self.endpoints).clone()
    }

    pub fn endpoint(&self, index: usize) -> MockEndpoint {
        lock(&self.endpoints)[index].clone()
    }

    pub fn descriptors(&self) -> Vec<TransportDescriptor> {
        lock(&self.descriptors).clone()
    }

    fn build(&self, descriptor: &TransportDescriptor, sink: EventSink) -> TransportResult<Box<dyn Transport>> {
        let attempt = self.created.fetch_add(1, Ordering::SeqCst);
        if *lock(&self.fail_at) == Some(attempt) {
            return Err(TransportError::InvalidConfig(format!(
                "mock refuses {}",
                descriptor.endpoint()
            )));
        }
        let tally = Arc::new(Tally::default());
        lock(&self.descriptors).push(descriptor.clone());
        lock(&self.endpoints).push(MockEndpoint {
            sink,
            tally: Arc::clone(&tally),
        });
        Ok(Box::new(MockTransport::new(tally)))
    }
}

impl TransportFactory for MockFactory {
    fn listener(
        &self,
        descriptor: &TransportDescriptor,
        _options: &TransportOptions,
        sink: EventSink,
    ) -> TransportResult<Box<dyn Transport>> {
        self.build(descriptor, sink)
    }

    fn connector(
        &self,
        descriptor: &TransportDescriptor,
        _options: &TransportOptions,
        sink: EventSink,
    ) -> TransportResult<Box<dyn Transport>> {
        self.build(descriptor, sink)
    }
}

/// Everything the recording services saw, in order.
#[derive(Debug, Default)]
pub struct ServiceLog {
    pub opened: Vec<ChannelKey>,
    pub closed: Vec<(ChannelKey, CloseReason)>,
    pub received: Vec<(ChannelKey, Bytes)>,
    pub sent: Vec<(ChannelKey, PacketId)>,
    pub delivered: Vec<(ChannelKey, PacketId)>,
}

pub struct RecordingService {
    log: Arc<Mutex<ServiceLog>>,
    echo: bool,
}

impl Service for RecordingService {
    fn on_channel_open(&mut self, channel: &mut ChannelContext<'_>) {
        lock(&self.log).opened.push(channel.key());
    }

    fn on_channel_closed(&mut self, channel: &ChannelInfo, reason: CloseReason) {
        lock(&self.log).closed.push((channel.key, reason));
    }

    fn on_packet_received(&mut self, channel: &mut ChannelContext<'_>, payload: Bytes) {
        lock(&self.log).received.push((channel.key(), payload.clone()));
        if self.echo {
            channel.send(payload).unwrap();
        }
    }

    fn on_packet_sent(&mut self, channel: &ChannelInfo, packet: PacketId, _payload: Bytes) {
        lock(&self.log).sent.push((channel.key, packet));
    }

    fn on_packet_delivered(&mut self, channel: &ChannelInfo, packet: PacketId) {
        lock(&self.log).delivered.push((channel.key, packet));
    }
}

/// Registrar that counts creations and destructions per service id.
#[derive(Debug, Default)]
pub struct CountingRegistrar {
    registered: Vec<ServiceId>,
    created: Mutex<HashMap<ServiceId, usize>>,
    destroyed: Mutex<HashMap<ServiceId, usize>>,
    pub log: Arc<Mutex<ServiceLog>>,
    echo: bool,
}

impl CountingRegistrar {
    pub fn new(ids: &[u32]) -> Arc<Self> {
        Arc::new(Self::with_ids(ids))
    }

    pub fn echoing(ids: &[u32]) -> Arc<Self> {
        Arc::new(Self {
            echo: true,
            ..Self::with_ids(ids)
        })
    }

    fn with_ids(ids: &[u32]) -> Self {
        Self {
            registered: ids.iter().copied().map(ServiceId::new).collect(),
            ..Self::default()
        }
    }

    pub fn created(&self, id: u32) -> usize {
        lock(&self.created).get(&ServiceId::new(id)).copied().unwrap_or(0)
    }

    pub fn destroyed(&self, id: u32) -> usize {
        lock(&self.destroyed).get(&ServiceId::new(id)).copied().unwrap_or(0)
    }

    pub fn total_created(&self) -> usize {
        lock(&self.created).values().sum()
    }

    pub fn total_destroyed(&self) -> usize {
        lock(&self.destroyed).values().sum()
    }

    pub fn log(&self) -> MutexGuard<'_, ServiceLog> {
        lock(&self.log)
    }
}

impl ServiceRegistrar for CountingRegistrar {
    fn is_registered(&self, id: ServiceId) -> bool {
        self.registered.contains(&id)
    }

    fn create(&self, id: ServiceId) -> Result<Box<dyn Service>, RegistryError> {
        if !self.is_registered(id) {
            return Err(RegistryError::Unknown(id));
        }
        *lock(&self.created).entry(id).or_default() += 1;
        Ok(Box::new(RecordingService {
            log: Arc::clone(&self.log),
            echo: self.echo,
        }))
    }

    fn destroy(&self, id: ServiceId, _service: Box<dyn Service>) {
        *lock(&self.destroyed).entry(id).or_default() += 1;
    }
}

pub fn key(connection: TransportId, service: u32) -> ChannelKey {
    ChannelKey::new(connection, ServiceId::new(service))
}

//! The controller: owns the transports of one configuration, routes their
//! events to connections and channels, and coordinates shutdown.
//!
//! All state lives on a single execution context. Transports and
//! [`ControllerHandle`]s post [`ControllerMessage`]s into one unbounded queue;
//! the controller consumes it either from [`Controller::run`] or, for hosts
//! that poll, from [`Controller::dispatch_pending`].

use std::fmt;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use bytes::Bytes;
use network_shared::{
    Config, ConfigurationError, EventForwarder, EventSink, IdGenerator, PacketId, Role, ServiceId,
    TransportError, TransportEvent, TransportFactory, TransportId, TransportOptions,
};
use tokio::sync::{
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    oneshot,
};
use tracing::{debug, error, info, trace};

use crate::channel::{ChannelKey, Scope, ServiceEntry, ServiceTable};
use crate::connection::{Connection, Owner, Progress};
use crate::error::{violation, ControllerError, ControllerResult, LifecycleViolation};
use crate::listener::Listener;
use crate::registrar::ServiceRegistrar;

pub type StopHandler = Box<dyn FnOnce() + Send + 'static>;

type SendReply = oneshot::Sender<ControllerResult<PacketId>>;

/// Requests posted to the controller's execution context.
pub enum Command {
    Start,
    Stop(StopHandler),
    Restart,
    Send {
        channel: ChannelKey,
        payload: Bytes,
        reply: Option<SendReply>,
    },
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Start => f.write_str("Start"),
            Command::Stop(_) => f.write_str("Stop"),
            Command::Restart => f.write_str("Restart"),
            Command::Send { channel, payload, .. } => f
                .debug_struct("Send")
                .field("channel", channel)
                .field("len", &payload.len())
                .finish(),
        }
    }
}

#[derive(Debug)]
pub enum ControllerMessage {
    Command(Command),
    Transport {
        source: TransportId,
        event: TransportEvent,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// No configuration applied yet.
    Idle,
    Configured,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerOptions {
    /// Panic on lifecycle violations instead of rejecting them.
    pub strict_contracts: bool,
}

impl ControllerOptions {
    pub fn strict() -> Self {
        Self {
            strict_contracts: true,
        }
    }

    pub fn lenient() -> Self {
        Self {
            strict_contracts: false,
        }
    }
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            strict_contracts: cfg!(debug_assertions),
        }
    }
}

#[derive(Debug)]
enum Topology {
    Unconfigured,
    Server(Vec<Listener>),
    Client(Connection),
    Released,
}

pub struct Controller {
    registrar: Arc<dyn ServiceRegistrar>,
    factory: Arc<dyn TransportFactory>,
    options: ControllerOptions,
    config: Option<Arc<Config>>,
    state: ControllerState,
    topology: Topology,
    services: ServiceTable,
    running_objects: usize,
    stop_handler: Option<StopHandler>,
    ids: IdGenerator,
    forward: Arc<EventForwarder>,
    tx: UnboundedSender<ControllerMessage>,
    rx: UnboundedReceiver<ControllerMessage>,
    stop_requested: Arc<AtomicBool>,
}

impl Controller {
    pub fn new(registrar: Arc<dyn ServiceRegistrar>, factory: Arc<dyn TransportFactory>) -> Self {
        Self::with_options(registrar, factory, ControllerOptions::default())
    }

    pub fn with_options(
        registrar: Arc<dyn ServiceRegistrar>,
        factory: Arc<dyn TransportFactory>,
        options: ControllerOptions,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let events = tx.clone();
        let forward: Arc<EventForwarder> = Arc::new(move |source, event| {
            events
                .send(ControllerMessage::Transport { source, event })
                .is_ok()
        });
        Self {
            registrar,
            factory,
            options,
            config: None,
            state: ControllerState::Idle,
            topology: Topology::Unconfigured,
            services: ServiceTable::default(),
            running_objects: 0,
            stop_handler: None,
            ids: IdGenerator::default(),
            forward,
            tx,
            rx,
            stop_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle {
            tx: self.tx.clone(),
            stop_requested: Arc::clone(&self.stop_requested),
            strict: self.options.strict_contracts,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn options(&self) -> &ControllerOptions {
        &self.options
    }

    pub fn config(&self) -> Option<&Arc<Config>> {
        self.config.as_ref()
    }

    pub fn role(&self) -> Option<Role> {
        self.config.as_ref().map(|c| c.role)
    }

    /// Top-level transports (listeners, or the client connection) that have
    /// not terminated yet.
    pub fn running_objects(&self) -> usize {
        self.running_objects
    }

    pub fn listeners(&self) -> &[Listener] {
        match &self.topology {
            Topology::Server(listeners) => listeners,
            _ => &[],
        }
    }

    pub fn client_connection(&self) -> Option<&Connection> {
        match &self.topology {
            Topology::Client(connection) => Some(connection),
            _ => None,
        }
    }

    pub fn connection(&self, id: TransportId) -> Option<&Connection> {
        match &self.topology {
            Topology::Server(listeners) => listeners.iter().find_map(|l| l.connection(id)),
            Topology::Client(connection) if connection.id() == id => Some(connection),
            _ => None,
        }
    }

    /// Connections not yet terminated and reclaimed.
    pub fn live_connections(&self) -> usize {
        match &self.topology {
            Topology::Server(listeners) => listeners.iter().map(Listener::live_connections).sum(),
            Topology::Client(connection) if !connection.is_terminated() => 1,
            _ => 0,
        }
    }

    pub fn live_listeners(&self) -> usize {
        self.listeners().iter().filter(|l| !l.is_terminated()).count()
    }

    pub fn service_entry(&self, id: ServiceId) -> Option<&ServiceEntry> {
        self.services.entry(id)
    }

    /// Service entries whose ref count is above zero.
    pub fn live_service_entries(&self) -> usize {
        self.services.live_entries()
    }

    fn sink(&self) -> EventSink {
        EventSink::new(
            TransportId::new(self.ids.next()),
            self.ids.clone(),
            Arc::clone(&self.forward),
        )
    }

    /// Validates `config` and builds its transports. Nothing changes on failure.
    pub fn apply_config(&mut self, config: Config) -> ControllerResult<()> {
        if self.state != ControllerState::Idle {
            return Err(violation(
                LifecycleViolation::AlreadyConfigured,
                self.options.strict_contracts,
            ));
        }
        config.validate()?;
        if let Some(id) = config
            .services
            .iter()
            .copied()
            .find(|id| !self.registrar.is_registered(*id))
        {
            return Err(ConfigurationError::UnknownService(id).into());
        }

        let options = TransportOptions::from(&config);
        let setup_failed = |index: usize, err: TransportError| {
            ControllerError::from(ConfigurationError::TransportSetup {
                index,
                reason: err.to_string(),
            })
        };

        let topology = match config.role {
            Role::Server => {
                let mut listeners = Vec::with_capacity(config.transports.len());
                for (index, descriptor) in config.transports.iter().enumerate() {
                    let sink = self.sink();
                    let id = sink.source();
                    let transport = self
                        .factory
                        .listener(descriptor, &options, sink)
                        .map_err(|err| setup_failed(index, err))?;
                    listeners.push(Listener::new(id, descriptor.clone(), transport));
                }
                Topology::Server(listeners)
            }
            Role::Client => {
                let (index, descriptor) = config
                    .client_transport
                    .and_then(|i| config.transports.get(i).map(|d| (i, d)))
                    .ok_or(ConfigurationError::MissingClientTransport)?;
                let sink = self.sink();
                let id = sink.source();
                let transport = self
                    .factory
                    .connector(descriptor, &options, sink)
                    .map_err(|err| setup_failed(index, err))?;
                Topology::Client(Connection::new(
                    id,
                    Owner::Controller,
                    transport,
                    &config.services,
                ))
            }
        };

        info!(
            target: "net::controller",
            "configured as {:?} with {} transports and {} services",
            config.role,
            config.transports.len(),
            config.services.len()
        );
        self.services = ServiceTable::new(&config.services);
        self.topology = topology;
        self.config = Some(Arc::new(config));
        self.state = ControllerState::Configured;
        Ok(())
    }

    /// Activates every transport of the applied configuration.
    pub fn start(&mut self) -> ControllerResult<()> {
        match self.state {
            ControllerState::Configured => {}
            ControllerState::Idle => {
                return Err(violation(
                    LifecycleViolation::StartBeforeConfig,
                    self.options.strict_contracts,
                ))
            }
            _ => {
                return Err(violation(
                    LifecycleViolation::AlreadyStarted,
                    self.options.strict_contracts,
                ))
            }
        }

        self.state = ControllerState::Running;
        let mut failed = 0;
        match &mut self.topology {
            Topology::Server(listeners) => {
                self.running_objects = listeners.len();
                for listener in listeners.iter_mut() {
                    if let Err(err) = listener.activate() {
                        error!(
                            target: "net::controller",
                            "listener {} failed to activate: {err}",
                            listener.descriptor().endpoint()
                        );
                        if listener.fail() {
                            failed += 1;
                        }
                    }
                }
            }
            Topology::Client(connection) => {
                self.running_objects = 1;
                if let Err(err) = connection.activate() {
                    error!(target: "net::controller", "connection failed to activate: {err}");
                    connection.fail();
                    failed += 1;
                }
            }
            Topology::Unconfigured | Topology::Released => {}
        }
        self.running_objects -= failed;
        info!(
            target: "net::controller",
            "started with {} running objects",
            self.running_objects
        );
        Ok(())
    }

    /// Deactivates everything; `handler` runs exactly once after the last
    /// top-level transport terminated.
    pub fn stop<F>(&mut self, handler: F) -> ControllerResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.stop_boxed(Box::new(handler))
    }

    fn stop_boxed(&mut self, handler: StopHandler) -> ControllerResult<()> {
        let running = match self.state {
            ControllerState::Stopping | ControllerState::Stopped => {
                return Err(violation(
                    LifecycleViolation::DoubleStop,
                    self.options.strict_contracts,
                ));
            }
            ControllerState::Idle | ControllerState::Configured => {
                info!(target: "net::controller", "stop before start");
                false
            }
            ControllerState::Running => {
                info!(
                    target: "net::controller",
                    "stopping, waiting for {} running objects",
                    self.running_objects
                );
                true
            }
        };

        self.stop_requested.store(true, Ordering::SeqCst);
        self.state = ControllerState::Stopping;
        self.stop_handler = Some(handler);
        // Transports that were never activated are simply dropped on release.
        if running {
            match &mut self.topology {
                Topology::Server(listeners) => listeners.iter_mut().for_each(Listener::deactivate),
                Topology::Client(connection) => connection.deactivate(),
                Topology::Unconfigured | Topology::Released => {}
            }
        }
        self.finish_if_drained();
        Ok(())
    }

    /// Re-arms every transport without touching configuration or counters.
    pub fn restart(&mut self) -> ControllerResult<()> {
        match self.state {
            ControllerState::Running => {}
            ControllerState::Stopping => {
                return Err(violation(
                    LifecycleViolation::RestartWhileStopping,
                    self.options.strict_contracts,
                ))
            }
            _ => {
                return Err(violation(
                    LifecycleViolation::NotRunning,
                    self.options.strict_contracts,
                ))
            }
        }
        info!(target: "net::controller", "restarting transports");
        match &mut self.topology {
            Topology::Server(listeners) => listeners.iter_mut().for_each(Listener::restart),
            Topology::Client(connection) => connection.restart(),
            Topology::Unconfigured | Topology::Released => {}
        }
        Ok(())
    }

    /// Sends `payload` on an open channel.
    pub fn send(&mut self, channel: ChannelKey, payload: Bytes) -> ControllerResult<PacketId> {
        let connection = match &mut self.topology {
            Topology::Server(listeners) => listeners
                .iter_mut()
                .find_map(|l| l.child_mut(channel.connection)),
            Topology::Client(connection) if connection.id() == channel.connection => Some(connection),
            _ => None,
        };
        connection
            .ok_or(ControllerError::NotOpen(channel))?
            .send(channel.service, payload)
    }

    pub fn dispatch(&mut self, message: ControllerMessage) {
        match message {
            ControllerMessage::Command(command) => self.on_command(command),
            ControllerMessage::Transport { source, event } => self.on_transport_event(source, event),
        }
    }

    /// Handles every queued message, including those posted while handling.
    /// Returns how many were handled.
    pub fn dispatch_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(message) = self.rx.try_recv() {
            self.dispatch(message);
            handled += 1;
        }
        handled
    }

    /// Consumes the queue until the controller has stopped.
    pub async fn run(mut self) {
        debug!(target: "net::controller", "run loop started");
        while self.state != ControllerState::Stopped {
            let Some(message) = self.rx.recv().await else {
                break;
            };
            self.dispatch(message);
        }
        debug!(target: "net::controller", "run loop finished");
    }

    fn on_command(&mut self, command: Command) {
        trace!(target: "net::controller", "command {command:?}");
        let result = match command {
            Command::Start => self.start(),
            Command::Stop(handler) => self.stop_boxed(handler),
            Command::Restart => self.restart(),
            Command::Send {
                channel,
                payload,
                reply,
            } => {
                let result = self.send(channel, payload);
                match reply {
                    Some(reply) => {
                        let _ = reply.send(result);
                        Ok(())
                    }
                    None => result.map(|_| ()),
                }
            }
        };
        if let Err(err) = result {
            debug!(target: "net::controller", "command rejected: {err}");
        }
    }

    fn on_transport_event(&mut self, source: TransportId, event: TransportEvent) {
        trace!(target: "net::controller", "{source}: {}", event.kind());
        let mut scope = Scope {
            services: &mut self.services,
            registrar: self.registrar.as_ref(),
            strict: self.options.strict_contracts,
            stopping: self.state == ControllerState::Stopping,
        };

        let terminated = match &mut self.topology {
            Topology::Server(listeners) => route_to_listener(listeners, source, event, &mut scope),
            Topology::Client(connection) if connection.id() == source => {
                connection.on_event(event, &mut scope) == Progress::Terminated
            }
            _ => {
                debug!(target: "net::controller", "dropping {} from unknown {source}", event.kind());
                false
            }
        };

        if terminated {
            self.running_objects = self.running_objects.saturating_sub(1);
            info!(
                target: "net::controller",
                "top-level transport terminated, {} still running",
                self.running_objects
            );
            self.finish_if_drained();
        }
    }

    fn finish_if_drained(&mut self) {
        if self.state != ControllerState::Stopping || self.running_objects > 0 {
            return;
        }
        self.state = ControllerState::Stopped;
        self.topology = Topology::Released;
        let referenced = self.services.release_all(self.registrar.as_ref());
        if referenced > 0 {
            error!(
                target: "net::controller",
                "{referenced} service handlers were still referenced at shutdown"
            );
        }
        info!(target: "net::controller", "stopped");
        if let Some(handler) = self.stop_handler.take() {
            handler();
        }
    }
}

fn route_to_listener(
    listeners: &mut [Listener],
    source: TransportId,
    event: TransportEvent,
    scope: &mut Scope<'_>,
) -> bool {
    if let Some(listener) = listeners.iter_mut().find(|l| l.id() == source) {
        return listener.on_event(event, scope);
    }
    if let Some(listener) = listeners.iter_mut().find(|l| l.has_child(source)) {
        return listener.on_child_event(source, event, scope);
    }
    debug!(target: "net::controller", "dropping {} from unknown {source}", event.kind());
    false
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("state", &self.state)
            .field("role", &self.role())
            .field("running_objects", &self.running_objects)
            .field("topology", &self.topology)
            .finish_non_exhaustive()
    }
}

/// Cloneable handle that posts requests to a controller's execution context.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    tx: UnboundedSender<ControllerMessage>,
    stop_requested: Arc<AtomicBool>,
    strict: bool,
}

impl ControllerHandle {
    fn post(&self, command: Command) -> ControllerResult<()> {
        self.tx
            .send(ControllerMessage::Command(command))
            .map_err(|_| ControllerError::Closed)
    }

    pub fn start(&self) -> ControllerResult<()> {
        self.post(Command::Start)
    }

    /// Requests a stop. A second request is rejected here, before it reaches
    /// the controller.
    pub fn stop<F>(&self, handler: F) -> ControllerResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self
            .stop_requested
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(violation(LifecycleViolation::DoubleStop, self.strict));
        }
        self.post(Command::Stop(Box::new(handler)))
    }

    /// Requests a stop and waits until the stop handler ran.
    pub async fn stop_and_wait(&self) -> ControllerResult<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.stop(move || {
            let _ = done_tx.send(());
        })?;
        done_rx.await.map_err(|_| ControllerError::Closed)
    }

    pub fn restart(&self) -> ControllerResult<()> {
        if self.stop_requested.load(Ordering::SeqCst) {
            return Err(violation(LifecycleViolation::RestartWhileStopping, self.strict));
        }
        self.post(Command::Restart)
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Sends without waiting for the packet id.
    pub fn post_send(&self, channel: ChannelKey, payload: impl Into<Bytes>) -> ControllerResult<()> {
        self.post(Command::Send {
            channel,
            payload: payload.into(),
            reply: None,
        })
    }

    pub async fn send(&self, channel: ChannelKey, payload: impl Into<Bytes>) -> ControllerResult<PacketId> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.post(Command::Send {
            channel,
            payload: payload.into(),
            reply: Some(reply_tx),
        })?;
        reply_rx.await.map_err(|_| ControllerError::Closed)?
    }
}

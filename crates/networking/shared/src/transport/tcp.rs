//! TCP transport built on tokio.
//!
//! [`TcpListenerTransport`] accepts connections and announces every accepted
//! stream as a [`TcpConnection`] child. [`TcpConnection`] runs one session task
//! that frames packets with [`PacketCodec`], acknowledges inbound data, checks
//! that acknowledgements come back in send order and keeps idle sessions alive
//! with ping/pong.

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    runtime::Handle,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
    time::{sleep, Instant},
};
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};

use crate::config::TransportDescriptor;
use crate::events::{DisconnectReason, TransportError, TransportEvent};
use crate::ids::{PacketId, ServiceId};

use super::codec::{CodecError, Packet, PacketCodec};
use super::{EventSink, Transport, TransportOptions, TransportResult};

const LISTENER_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug)]
enum Command {
    Send {
        service: ServiceId,
        packet: PacketId,
        payload: Bytes,
    },
    Restart,
    Shutdown,
}

fn runtime() -> TransportResult<Handle> {
    Handle::try_current().map_err(|_| TransportError::NotReady("no tokio runtime"))
}

/// Accepting side of the TCP transport.
#[derive(Debug)]
pub struct TcpListenerTransport {
    host: String,
    port: u16,
    options: TransportOptions,
    sink: EventSink,
    commands: Option<UnboundedSender<Command>>,
    task: Option<JoinHandle<()>>,
    deactivated: bool,
}

impl TcpListenerTransport {
    pub fn new(descriptor: &TransportDescriptor, options: TransportOptions, sink: EventSink) -> Self {
        Self {
            host: descriptor.host.clone(),
            port: descriptor.port,
            options,
            sink,
            commands: None,
            task: None,
            deactivated: false,
        }
    }
}

impl Transport for TcpListenerTransport {
    fn activate(&mut self) -> TransportResult<()> {
        if self.deactivated {
            return Err(TransportError::NotReady("tcp listener was deactivated"));
        }
        if self.commands.is_some() {
            return Err(TransportError::AlreadyActive);
        }
        let handle = runtime()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.task = Some(handle.spawn(listen(
            self.host.clone(),
            self.port,
            self.options.clone(),
            self.sink.clone(),
            rx,
        )));
        self.commands = Some(tx);
        Ok(())
    }

    fn deactivate(&mut self) {
        if self.deactivated {
            return;
        }
        self.deactivated = true;
        match &self.commands {
            Some(tx) => {
                if tx.send(Command::Shutdown).is_err() {
                    self.sink.emit(TransportEvent::Terminated);
                }
            }
            None => {
                self.sink.emit(TransportEvent::Terminated);
            }
        }
    }

    fn restart(&mut self) {
        if let Some(tx) = &self.commands {
            let _ = tx.send(Command::Restart);
        }
    }

    fn send(&mut self, _service: ServiceId, _payload: Bytes) -> TransportResult<PacketId> {
        Err(TransportError::Unsupported("tcp listener"))
    }
}

async fn listen(
    host: String,
    port: u16,
    options: TransportOptions,
    sink: EventSink,
    mut commands: UnboundedReceiver<Command>,
) {
    'bind: loop {
        let listener = match TcpListener::bind((host.as_str(), port)).await {
            Ok(listener) => listener,
            Err(err) => {
                warn!(target: "net::transport::tcp", "bind {host}:{port} failed: {err}");
                sink.emit(TransportEvent::Disconnected {
                    reason: DisconnectReason::InitError,
                });
                match wait(&mut commands, Some(LISTENER_RETRY_DELAY)).await {
                    Wake::Shutdown => break 'bind,
                    Wake::Restart | Wake::Elapsed => continue 'bind,
                }
            }
        };

        let endpoint = listener
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| format!("{host}:{port}"));
        info!(target: "net::transport::tcp", "listening on {endpoint}");
        sink.emit(TransportEvent::Activated { endpoint });

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(err) = stream.set_nodelay(true) {
                            debug!(target: "net::transport::tcp", "set_nodelay for {peer} failed: {err}");
                        }
                        let child = sink.child();
                        debug!(target: "net::transport::tcp", "accepted {peer} as {}", child.source());
                        let connection = TcpConnection::accepted(stream, peer, options.clone(), child.clone());
                        sink.emit(TransportEvent::Spawned {
                            child: child.source(),
                            transport: Box::new(connection),
                        });
                    }
                    Err(err) => {
                        warn!(target: "net::transport::tcp", "accept on {host}:{port} failed: {err}");
                    }
                },
                command = commands.recv() => match command {
                    Some(Command::Restart) => {
                        info!(target: "net::transport::tcp", "rebinding {host}:{port}");
                        continue 'bind;
                    }
                    Some(Command::Send { .. }) => {}
                    Some(Command::Shutdown) | None => break 'bind,
                },
            }
        }
    }

    debug!(target: "net::transport::tcp", "listener {host}:{port} terminated");
    sink.emit(TransportEvent::Terminated);
}

#[derive(Debug)]
enum Origin {
    Outbound { host: String, port: u16 },
    Accepted { peer: SocketAddr, stream: Option<TcpStream> },
}

/// One TCP session, either dialled out or adopted from a listener.
#[derive(Debug)]
pub struct TcpConnection {
    origin: Option<Origin>,
    options: TransportOptions,
    sink: EventSink,
    commands: Option<UnboundedSender<Command>>,
    connected: Arc<AtomicBool>,
    next_packet: u32,
    task: Option<JoinHandle<()>>,
    deactivated: bool,
}

impl TcpConnection {
    pub fn connector(descriptor: &TransportDescriptor, options: TransportOptions, sink: EventSink) -> Self {
        Self::with_origin(
            Origin::Outbound {
                host: descriptor.host.clone(),
                port: descriptor.port,
            },
            options,
            sink,
        )
    }

    fn accepted(stream: TcpStream, peer: SocketAddr, options: TransportOptions, sink: EventSink) -> Self {
        Self::with_origin(
            Origin::Accepted {
                peer,
                stream: Some(stream),
            },
            options,
            sink,
        )
    }

    fn with_origin(origin: Origin, options: TransportOptions, sink: EventSink) -> Self {
        Self {
            origin: Some(origin),
            options,
            sink,
            commands: None,
            connected: Arc::new(AtomicBool::new(false)),
            next_packet: 1,
            task: None,
            deactivated: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

impl Transport for TcpConnection {
    fn activate(&mut self) -> TransportResult<()> {
        if self.deactivated {
            return Err(TransportError::NotReady("tcp connection was deactivated"));
        }
        let handle = runtime()?;
        let origin = self.origin.take().ok_or(TransportError::AlreadyActive)?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.task = Some(handle.spawn(run_connection(
            origin,
            self.options.clone(),
            self.sink.clone(),
            Arc::clone(&self.connected),
            rx,
        )));
        self.commands = Some(tx);
        Ok(())
    }

    fn deactivate(&mut self) {
        if self.deactivated {
            return;
        }
        self.deactivated = true;
        let delivered = self
            .commands
            .as_ref()
            .is_some_and(|tx| tx.send(Command::Shutdown).is_ok());
        if !delivered {
            // Never activated: dropping the origin closes an adopted stream.
            self.origin = None;
            self.sink.emit(TransportEvent::Terminated);
        }
    }

    fn restart(&mut self) {
        if let Some(tx) = &self.commands {
            let _ = tx.send(Command::Restart);
        }
    }

    fn send(&mut self, service: ServiceId, payload: Bytes) -> TransportResult<PacketId> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        // Oversized frames never reach the session task.
        if payload.len() > self.options.max_packet_size {
            return Err(CodecError::TooLarge {
                len: payload.len(),
                max: self.options.max_packet_size,
            }
            .into());
        }
        let tx = self.commands.as_ref().ok_or(TransportError::NotConnected)?;
        let packet = PacketId::new(self.next_packet);
        self.next_packet = self.next_packet.wrapping_add(1);
        tx.send(Command::Send {
            service,
            packet,
            payload,
        })
        .map_err(|_| TransportError::NotConnected)?;
        Ok(packet)
    }
}

enum Wake {
    Elapsed,
    Restart,
    Shutdown,
}

/// Waits for a control command, or for `delay` if given. Sends are dropped.
async fn wait(commands: &mut UnboundedReceiver<Command>, delay: Option<Duration>) -> Wake {
    let timer = async {
        match delay {
            Some(delay) => sleep(delay).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(timer);
    loop {
        tokio::select! {
            _ = &mut timer => return Wake::Elapsed,
            command = commands.recv() => match command {
                Some(Command::Restart) => return Wake::Restart,
                Some(Command::Shutdown) | None => return Wake::Shutdown,
                Some(Command::Send { packet, .. }) => {
                    trace!(target: "net::transport::tcp", "dropping {packet}: not connected");
                }
            },
        }
    }
}

enum SessionEnd {
    Lost,
    Restart,
    Shutdown,
}

async fn run_connection(
    mut origin: Origin,
    options: TransportOptions,
    sink: EventSink,
    connected: Arc<AtomicBool>,
    mut commands: UnboundedReceiver<Command>,
) {
    'session: loop {
        let stream = match &mut origin {
            Origin::Accepted { stream, peer } => match stream.take() {
                Some(stream) => stream,
                None => {
                    // An accepted session cannot be re-established.
                    trace!(target: "net::transport::tcp", "session with {peer} is gone");
                    match wait(&mut commands, None).await {
                        Wake::Shutdown => break,
                        Wake::Restart | Wake::Elapsed => continue,
                    }
                }
            },
            Origin::Outbound { host, port } => {
                let dial = TcpStream::connect((host.as_str(), *port));
                tokio::pin!(dial);
                let attempt = loop {
                    tokio::select! {
                        result = &mut dial => break Some(result),
                        command = commands.recv() => match command {
                            Some(Command::Restart) => break None,
                            Some(Command::Shutdown) | None => break 'session,
                            Some(Command::Send { packet, .. }) => {
                                trace!(target: "net::transport::tcp", "dropping {packet}: still connecting");
                            }
                        },
                    }
                };
                match attempt {
                    Some(Ok(stream)) => {
                        if let Err(err) = stream.set_nodelay(true) {
                            debug!(target: "net::transport::tcp", "set_nodelay failed: {err}");
                        }
                        stream
                    }
                    Some(Err(err)) => {
                        warn!(target: "net::transport::tcp", "connect to {host}:{port} failed: {err}");
                        sink.emit(TransportEvent::Disconnected {
                            reason: DisconnectReason::InitError,
                        });
                        match wait(&mut commands, options.reconnect.retry_delay()).await {
                            Wake::Shutdown => break,
                            Wake::Restart | Wake::Elapsed => continue,
                        }
                    }
                    // Restart while connecting: dial again.
                    None => continue,
                }
            }
        };

        let endpoint = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        info!(target: "net::transport::tcp", "{} connected to {endpoint}", sink.source());
        connected.store(true, Ordering::Release);
        sink.emit(TransportEvent::Connected {
            endpoint: endpoint.clone(),
        });

        let (reason, end) = run_session(stream, &options, &sink, &mut commands).await;
        connected.store(false, Ordering::Release);
        info!(target: "net::transport::tcp", "{} disconnected from {endpoint}: {reason:?}", sink.source());
        sink.emit(TransportEvent::Disconnected { reason });

        match end {
            SessionEnd::Shutdown => break,
            SessionEnd::Restart => continue,
            SessionEnd::Lost => {
                if matches!(origin, Origin::Outbound { .. }) {
                    match wait(&mut commands, options.reconnect.retry_delay()).await {
                        Wake::Shutdown => break,
                        Wake::Restart | Wake::Elapsed => continue,
                    }
                }
            }
        }
    }

    sink.emit(TransportEvent::Terminated);
}

async fn run_session(
    stream: TcpStream,
    options: &TransportOptions,
    sink: &EventSink,
    commands: &mut UnboundedReceiver<Command>,
) -> (DisconnectReason, SessionEnd) {
    let mut framed = Framed::new(stream, PacketCodec::new(options.max_packet_size));
    let mut awaiting_ack: VecDeque<PacketId> = VecDeque::new();
    let mut ping_sent = false;
    let idle = sleep(options.read_timeout);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            inbound = framed.next() => {
                let packet = match inbound {
                    Some(Ok(packet)) => packet,
                    Some(Err(CodecError::Io(err))) => {
                        warn!(target: "net::transport::tcp", "read failed: {err}");
                        return (DisconnectReason::NetError, SessionEnd::Lost);
                    }
                    Some(Err(err)) => {
                        warn!(target: "net::transport::tcp", "malformed packet: {err}");
                        return (DisconnectReason::PacketError, SessionEnd::Lost);
                    }
                    None => return (DisconnectReason::OtherSide, SessionEnd::Lost),
                };
                idle.as_mut().reset(Instant::now() + options.read_timeout);
                ping_sent = false;

                match packet {
                    Packet::Data { service, packet, payload } => {
                        trace!(target: "net::transport::tcp", "received {packet} on {service}");
                        if framed.send(Packet::Ack { service, packet }).await.is_err() {
                            return (DisconnectReason::NetError, SessionEnd::Lost);
                        }
                        sink.emit(TransportEvent::DataReceived { service, payload });
                    }
                    Packet::Ack { packet, .. } => match awaiting_ack.pop_front() {
                        Some(expected) if expected == packet => {
                            sink.emit(TransportEvent::DeliveryConfirmed { packet });
                        }
                        expected => {
                            warn!(target: "net::transport::tcp", "ack for {packet} out of order, expected {expected:?}");
                            return (DisconnectReason::PacketError, SessionEnd::Lost);
                        }
                    },
                    Packet::Ping => {
                        if framed.send(Packet::Pong).await.is_err() {
                            return (DisconnectReason::NetError, SessionEnd::Lost);
                        }
                    }
                    Packet::Pong => {}
                }
            }
            command = commands.recv() => match command {
                Some(Command::Send { service, packet, payload }) => {
                    if let Err(err) = framed.send(Packet::Data { service, packet, payload }).await {
                        warn!(target: "net::transport::tcp", "write failed: {err}");
                        return (DisconnectReason::NetError, SessionEnd::Lost);
                    }
                    awaiting_ack.push_back(packet);
                    sink.emit(TransportEvent::SendComplete { packet });
                }
                Some(Command::Restart) => return (DisconnectReason::Restart, SessionEnd::Restart),
                Some(Command::Shutdown) | None => return (DisconnectReason::Request, SessionEnd::Shutdown),
            },
            _ = &mut idle => {
                if ping_sent {
                    return (DisconnectReason::Timeout, SessionEnd::Lost);
                }
                ping_sent = true;
                if framed.send(Packet::Ping).await.is_err() {
                    return (DisconnectReason::NetError, SessionEnd::Lost);
                }
                idle.as_mut().reset(Instant::now() + options.read_timeout);
            }
        }
    }
}

//! Integration test for the loopback transport.
//!
//! Verifies that a listener and a connector linked through one
//! `LoopbackNetwork` report the full event sequence with zero network I/O.

use bytes::Bytes;
use network_shared::transport::{
    CodecError, LoopbackConnection, LoopbackListener, LoopbackNetwork,
};
use network_shared::{
    DisconnectReason, EventSink, IdGenerator, ServiceId, Transport, TransportError,
    TransportEvent, TransportId,
};
use test_log::test;
use tokio::sync::mpsc::UnboundedReceiver;

type Events = UnboundedReceiver<(TransportId, TransportEvent)>;

fn drain(rx: &mut Events) -> Vec<(TransportId, TransportEvent)> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

struct Setup {
    network: LoopbackNetwork,
    listener: LoopbackListener,
    server_rx: Events,
    client: LoopbackConnection,
    client_rx: Events,
}

fn listening(endpoint: &str) -> Setup {
    let network = LoopbackNetwork::new();
    let (server_sink, mut server_rx) = EventSink::unbounded(IdGenerator::new(1));
    let (client_sink, client_rx) = EventSink::unbounded(IdGenerator::new(100));

    let mut listener = LoopbackListener::new(network.clone(), endpoint, server_sink);
    listener.activate().unwrap();
    assert!(matches!(
        drain(&mut server_rx).as_slice(),
        [(_, TransportEvent::Activated { endpoint: e })] if e == endpoint
    ));

    let client = LoopbackConnection::connector(network.clone(), endpoint, client_sink);
    Setup {
        network,
        listener,
        server_rx,
        client,
        client_rx,
    }
}

fn take_spawned(rx: &mut Events) -> (TransportId, Box<dyn Transport>) {
    let mut events = drain(rx);
    assert_eq!(events.len(), 1, "expected exactly one spawn: {events:?}");
    match events.pop() {
        Some((_, TransportEvent::Spawned { child, transport })) => (child, transport),
        other => panic!("expected spawn, got {other:?}"),
    }
}

#[test]
fn client_and_server_exchange_data_in_process() {
    let mut s = listening("local:7777");

    s.client.activate().unwrap();
    assert!(matches!(
        drain(&mut s.client_rx).as_slice(),
        [(_, TransportEvent::Connected { endpoint })] if endpoint == "local:7777"
    ));
    let (child_id, mut child) = take_spawned(&mut s.server_rx);

    // The server half is still inert: data is queued.
    let early = s
        .client
        .send(ServiceId::new(3), Bytes::from_static(b"early"))
        .unwrap();
    assert!(matches!(
        drain(&mut s.client_rx).as_slice(),
        [(_, TransportEvent::SendComplete { packet })] if *packet == early
    ));

    child.activate().unwrap();
    match drain(&mut s.server_rx).as_slice() {
        [(a, TransportEvent::Connected { .. }), (b, TransportEvent::DataReceived { service, payload })] =>
        {
            assert_eq!(*a, child_id);
            assert_eq!(*b, child_id);
            assert_eq!(*service, ServiceId::new(3));
            assert_eq!(payload.as_ref(), b"early");
        }
        other => panic!("unexpected server events: {other:?}"),
    }
    assert!(matches!(
        drain(&mut s.client_rx).as_slice(),
        [(_, TransportEvent::DeliveryConfirmed { packet })] if *packet == early
    ));

    let reply = child
        .send(ServiceId::new(3), Bytes::from_static(b"reply"))
        .unwrap();
    assert!(matches!(
        drain(&mut s.client_rx).as_slice(),
        [(_, TransportEvent::DataReceived { payload, .. })] if payload.as_ref() == b"reply"
    ));
    assert!(matches!(
        drain(&mut s.server_rx).as_slice(),
        [
            (_, TransportEvent::SendComplete { packet: sent }),
            (_, TransportEvent::DeliveryConfirmed { packet: confirmed }),
        ] if *sent == reply && *confirmed == reply
    ));
}

#[test]
fn deactivating_one_side_disconnects_the_other() {
    let mut s = listening("local:1");
    s.client.activate().unwrap();
    let (_, mut child) = take_spawned(&mut s.server_rx);
    child.activate().unwrap();
    drain(&mut s.client_rx);
    drain(&mut s.server_rx);

    s.client.deactivate();
    assert!(matches!(
        drain(&mut s.client_rx).as_slice(),
        [
            (_, TransportEvent::Disconnected { reason: DisconnectReason::Request }),
            (_, TransportEvent::Terminated),
        ]
    ));
    assert!(matches!(
        drain(&mut s.server_rx).as_slice(),
        [(_, TransportEvent::Disconnected { reason: DisconnectReason::OtherSide })]
    ));
    assert!(child.send(ServiceId::new(1), Bytes::new()).is_err());

    child.deactivate();
    assert!(matches!(
        drain(&mut s.server_rx).as_slice(),
        [(_, TransportEvent::Terminated)]
    ));
}

#[test]
fn restart_reconnects_the_client() {
    let mut s = listening("local:2");
    s.client.activate().unwrap();
    let (first_id, mut first) = take_spawned(&mut s.server_rx);
    first.activate().unwrap();
    drain(&mut s.client_rx);
    drain(&mut s.server_rx);

    s.client.restart();
    assert!(matches!(
        drain(&mut s.client_rx).as_slice(),
        [
            (_, TransportEvent::Disconnected { reason: DisconnectReason::Restart }),
            (_, TransportEvent::Connected { .. }),
        ]
    ));
    match drain(&mut s.server_rx).as_slice() {
        [
            (old, TransportEvent::Disconnected { reason: DisconnectReason::OtherSide }),
            (_, TransportEvent::Spawned { child, .. }),
        ] => {
            assert_eq!(*old, first_id);
            assert_ne!(*child, first_id);
        }
        other => panic!("unexpected server events: {other:?}"),
    }
}

#[test]
fn closed_listener_refuses_new_connections() {
    let mut s = listening("local:3");
    s.listener.deactivate();
    assert!(matches!(
        drain(&mut s.server_rx).as_slice(),
        [(_, TransportEvent::Terminated)]
    ));
    assert!(!s.network.is_bound("local:3"));

    s.client.activate().unwrap();
    assert!(matches!(
        drain(&mut s.client_rx).as_slice(),
        [(_, TransportEvent::Disconnected { reason: DisconnectReason::InitError })]
    ));
}

#[test]
fn oversized_send_is_refused_without_cutting_the_link() {
    let network = LoopbackNetwork::new();
    let (server_sink, mut server_rx) = EventSink::unbounded(IdGenerator::new(1));
    let (client_sink, mut client_rx) = EventSink::unbounded(IdGenerator::new(100));
    let mut listener =
        LoopbackListener::new(network.clone(), "local:4", server_sink).with_max_packet_size(4);
    listener.activate().unwrap();
    drain(&mut server_rx);

    let mut client =
        LoopbackConnection::connector(network, "local:4", client_sink).with_max_packet_size(4);
    client.activate().unwrap();
    let (_, mut child) = take_spawned(&mut server_rx);
    child.activate().unwrap();
    drain(&mut client_rx);
    drain(&mut server_rx);

    assert!(matches!(
        client.send(ServiceId::new(1), Bytes::from_static(b"too large")),
        Err(TransportError::Codec(CodecError::TooLarge { len: 9, max: 4 }))
    ));
    assert!(matches!(
        child.send(ServiceId::new(1), Bytes::from_static(b"also too large")),
        Err(TransportError::Codec(CodecError::TooLarge { max: 4, .. }))
    ));
    assert!(drain(&mut client_rx).is_empty());
    assert!(drain(&mut server_rx).is_empty());

    client.send(ServiceId::new(1), Bytes::from_static(b"ok")).unwrap();
    assert!(matches!(
        drain(&mut server_rx).as_slice(),
        [(_, TransportEvent::DataReceived { payload, .. })] if payload.as_ref() == b"ok"
    ));
}

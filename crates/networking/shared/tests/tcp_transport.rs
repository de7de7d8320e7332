//! TCP transport against real sockets on 127.0.0.1.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use network_shared::transport::{
    CodecError, Packet, PacketCodec, TcpConnection, TcpListenerTransport, TransportOptions,
};
use network_shared::{
    DisconnectReason, EventSink, IdGenerator, PacketId, ServiceId, Transport, TransportDescriptor,
    TransportError, TransportEvent, TransportId,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::codec::Framed;

type Events = UnboundedReceiver<(TransportId, TransportEvent)>;

async fn next(rx: &mut Events) -> Result<TransportEvent> {
    let (_, event) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await?
        .ok_or_else(|| anyhow!("event channel closed"))?;
    Ok(event)
}

fn options(read_timeout: Duration) -> TransportOptions {
    TransportOptions {
        read_timeout,
        ..TransportOptions::default()
    }
}

async fn listening(opts: &TransportOptions) -> Result<(TcpListenerTransport, Events, SocketAddr)> {
    let (sink, mut rx) = EventSink::unbounded(IdGenerator::new(1));
    let mut listener =
        TcpListenerTransport::new(&TransportDescriptor::tcp("127.0.0.1", 0), opts.clone(), sink);
    listener.activate()?;
    let addr = match next(&mut rx).await? {
        TransportEvent::Activated { endpoint } => endpoint.parse()?,
        other => bail!("expected activation, got {other:?}"),
    };
    Ok((listener, rx, addr))
}

fn connector(addr: SocketAddr, opts: &TransportOptions) -> (TcpConnection, Events) {
    let (sink, rx) = EventSink::unbounded(IdGenerator::new(100));
    let descriptor = TransportDescriptor::tcp("127.0.0.1", addr.port());
    (TcpConnection::connector(&descriptor, opts.clone(), sink), rx)
}

#[tokio::test]
async fn data_is_delivered_and_confirmed() -> Result<()> {
    let opts = TransportOptions::default();
    let (mut listener, mut server_rx, addr) = listening(&opts).await?;
    let (mut client, mut client_rx) = connector(addr, &opts);
    client.activate()?;

    let mut child = match next(&mut server_rx).await? {
        TransportEvent::Spawned { transport, .. } => transport,
        other => bail!("expected spawn, got {other:?}"),
    };
    child.activate()?;
    assert!(matches!(next(&mut client_rx).await?, TransportEvent::Connected { .. }));
    assert!(matches!(next(&mut server_rx).await?, TransportEvent::Connected { .. }));

    let packet = client.send(ServiceId::new(9), Bytes::from_static(b"hello"))?;
    assert!(matches!(
        next(&mut client_rx).await?,
        TransportEvent::SendComplete { packet: p } if p == packet
    ));
    match next(&mut server_rx).await? {
        TransportEvent::DataReceived { service, payload } => {
            assert_eq!(service, ServiceId::new(9));
            assert_eq!(payload.as_ref(), b"hello");
        }
        other => bail!("expected data, got {other:?}"),
    }
    assert!(matches!(
        next(&mut client_rx).await?,
        TransportEvent::DeliveryConfirmed { packet: p } if p == packet
    ));

    client.deactivate();
    assert!(matches!(
        next(&mut client_rx).await?,
        TransportEvent::Disconnected { reason: DisconnectReason::Request }
    ));
    assert!(matches!(next(&mut client_rx).await?, TransportEvent::Terminated));
    assert!(matches!(
        next(&mut server_rx).await?,
        TransportEvent::Disconnected { reason: DisconnectReason::OtherSide }
    ));

    child.deactivate();
    assert!(matches!(next(&mut server_rx).await?, TransportEvent::Terminated));
    listener.deactivate();
    assert!(matches!(next(&mut server_rx).await?, TransportEvent::Terminated));
    Ok(())
}

#[tokio::test]
async fn silent_peer_times_out() -> Result<()> {
    let raw = TcpListener::bind("127.0.0.1:0").await?;
    let addr = raw.local_addr()?;
    let (mut client, mut client_rx) = connector(addr, &options(Duration::from_millis(50)));
    client.activate()?;
    let (_socket, _) = raw.accept().await?;

    assert!(matches!(next(&mut client_rx).await?, TransportEvent::Connected { .. }));
    assert!(matches!(
        next(&mut client_rx).await?,
        TransportEvent::Disconnected { reason: DisconnectReason::Timeout }
    ));

    client.deactivate();
    assert!(matches!(next(&mut client_rx).await?, TransportEvent::Terminated));
    Ok(())
}

#[tokio::test]
async fn out_of_order_ack_is_a_packet_error() -> Result<()> {
    let raw = TcpListener::bind("127.0.0.1:0").await?;
    let addr = raw.local_addr()?;
    let (mut client, mut client_rx) = connector(addr, &TransportOptions::default());
    client.activate()?;
    let (socket, _) = raw.accept().await?;
    let mut peer = Framed::new(socket, PacketCodec::default());

    assert!(matches!(next(&mut client_rx).await?, TransportEvent::Connected { .. }));
    let packet = client.send(ServiceId::new(1), Bytes::from_static(b"x"))?;
    assert!(matches!(next(&mut client_rx).await?, TransportEvent::SendComplete { .. }));

    match peer.next().await.transpose()? {
        Some(Packet::Data { packet: p, .. }) => assert_eq!(p, packet),
        other => bail!("expected data frame, got {other:?}"),
    }
    peer.send(Packet::Ack {
        service: ServiceId::new(1),
        packet: PacketId::new(packet.get() + 10),
    })
    .await?;

    assert!(matches!(
        next(&mut client_rx).await?,
        TransportEvent::Disconnected { reason: DisconnectReason::PacketError }
    ));
    client.deactivate();
    assert!(matches!(next(&mut client_rx).await?, TransportEvent::Terminated));
    Ok(())
}

#[tokio::test]
async fn keep_alive_holds_an_idle_session() -> Result<()> {
    let opts = options(Duration::from_millis(100));
    let (_listener, mut server_rx, addr) = listening(&opts).await?;
    let (mut client, mut client_rx) = connector(addr, &opts);
    client.activate()?;
    let mut child = match next(&mut server_rx).await? {
        TransportEvent::Spawned { transport, .. } => transport,
        other => bail!("expected spawn, got {other:?}"),
    };
    child.activate()?;
    assert!(matches!(next(&mut client_rx).await?, TransportEvent::Connected { .. }));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(client_rx.try_recv().is_err(), "idle session must stay connected");
    assert!(client.is_connected());
    Ok(())
}

#[tokio::test]
async fn oversized_send_is_refused_and_the_session_survives() -> Result<()> {
    let opts = TransportOptions {
        max_packet_size: 4,
        ..TransportOptions::default()
    };
    let (_listener, mut server_rx, addr) = listening(&opts).await?;
    let (mut client, mut client_rx) = connector(addr, &opts);
    client.activate()?;
    let mut child = match next(&mut server_rx).await? {
        TransportEvent::Spawned { transport, .. } => transport,
        other => bail!("expected spawn, got {other:?}"),
    };
    child.activate()?;
    assert!(matches!(next(&mut client_rx).await?, TransportEvent::Connected { .. }));
    assert!(matches!(next(&mut server_rx).await?, TransportEvent::Connected { .. }));

    assert!(matches!(
        client.send(ServiceId::new(9), Bytes::from_static(b"too large payload")),
        Err(TransportError::Codec(CodecError::TooLarge { len: 17, max: 4 }))
    ));

    let packet = client.send(ServiceId::new(9), Bytes::from_static(b"ok"))?;
    assert!(matches!(
        next(&mut client_rx).await?,
        TransportEvent::SendComplete { packet: p } if p == packet
    ));
    match next(&mut server_rx).await? {
        TransportEvent::DataReceived { payload, .. } => assert_eq!(payload.as_ref(), b"ok"),
        other => bail!("expected data, got {other:?}"),
    }
    assert!(client.is_connected());
    Ok(())
}

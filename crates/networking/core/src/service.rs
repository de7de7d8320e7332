//! The service side of a channel: the handler trait and what a handler gets to
//! see while one of its callbacks runs.

use bytes::Bytes;
use network_shared::{DisconnectReason, PacketId, ServiceId, TransportId};

use crate::channel::ChannelKey;
use crate::connection::Outbox;
use crate::error::ControllerResult;

/// Why a channel was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The transport lost its connection.
    Disconnected(DisconnectReason),
    /// The transport terminated without a stop request.
    Terminated,
    /// The controller is stopping.
    Shutdown,
}

/// Identity of a channel as seen by its handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub key: ChannelKey,
    pub remote: Option<String>,
}

impl ChannelInfo {
    pub fn connection(&self) -> TransportId {
        self.key.connection
    }

    pub fn service(&self) -> ServiceId {
        self.key.service
    }
}

/// Borrowed view of an open channel, valid for the duration of one callback.
pub struct ChannelContext<'a> {
    info: &'a ChannelInfo,
    outbox: &'a mut Outbox,
}

impl<'a> ChannelContext<'a> {
    pub(crate) fn new(info: &'a ChannelInfo, outbox: &'a mut Outbox) -> Self {
        Self { info, outbox }
    }

    pub fn info(&self) -> &ChannelInfo {
        self.info
    }

    pub fn key(&self) -> ChannelKey {
        self.info.key
    }

    pub fn remote(&self) -> Option<&str> {
        self.info.remote.as_deref()
    }

    /// Sends `payload` on this channel's service id. The returned id shows up
    /// again in `on_packet_delivered`.
    pub fn send(&mut self, payload: impl Into<Bytes>) -> ControllerResult<PacketId> {
        self.outbox.send(self.info.key.service, payload.into())
    }
}

/// Handler bound to one service id.
///
/// A handler instance is shared by every channel of its service id across all
/// connections of a controller. It is created when the first channel opens and
/// destroyed after the last one closes.
pub trait Service: Send {
    fn on_channel_open(&mut self, channel: &mut ChannelContext<'_>);

    fn on_channel_closed(&mut self, channel: &ChannelInfo, reason: CloseReason);

    fn on_packet_received(&mut self, channel: &mut ChannelContext<'_>, payload: Bytes);

    /// The transport wrote `payload` to the wire.
    fn on_packet_sent(&mut self, _channel: &ChannelInfo, _packet: PacketId, _payload: Bytes) {}

    /// The peer confirmed `packet`.
    fn on_packet_delivered(&mut self, _channel: &ChannelInfo, _packet: PacketId) {}
}

//! Packet framing for the TCP transport.
//!
//! Layout of every frame (all integers big-endian):
//! - 1 byte: kind (data, ack, ping, pong)
//! - 4 bytes: service id
//! - 4 bytes: packet id
//! - 4 bytes: payload length
//! - N bytes: payload (data frames only)

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::DEFAULT_MAX_PACKET_SIZE;
use crate::ids::{PacketId, ServiceId};

pub const HEADER_LEN: usize = 13;

const KIND_DATA: u8 = 1;
const KIND_ACK: u8 = 2;
const KIND_PING: u8 = 3;
const KIND_PONG: u8 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Data {
        service: ServiceId,
        packet: PacketId,
        payload: Bytes,
    },
    /// Confirms a data packet; acks travel in the order data was received.
    Ack { service: ServiceId, packet: PacketId },
    Ping,
    Pong,
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown packet kind {0}")]
    UnknownKind(u8),
    #[error("payload of {len} bytes exceeds max_packet_size {max}")]
    TooLarge { len: usize, max: usize },
    #[error("{kind} packet must not carry a payload ({len} bytes)")]
    UnexpectedPayload { kind: &'static str, len: usize },
}

#[derive(Debug, Clone)]
pub struct PacketCodec {
    max_packet_size: usize,
}

impl PacketCodec {
    pub fn new(max_packet_size: usize) -> Self {
        Self { max_packet_size }
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PACKET_SIZE)
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, CodecError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = &src[..HEADER_LEN];
        let kind = header.get_u8();
        let service = ServiceId::new(header.get_u32());
        let packet = PacketId::new(header.get_u32());
        let len = header.get_u32() as usize;

        if !matches!(kind, KIND_DATA | KIND_ACK | KIND_PING | KIND_PONG) {
            return Err(CodecError::UnknownKind(kind));
        }
        if len > self.max_packet_size {
            return Err(CodecError::TooLarge {
                len,
                max: self.max_packet_size,
            });
        }
        if kind != KIND_DATA && len != 0 {
            return Err(CodecError::UnexpectedPayload {
                kind: kind_name(kind),
                len,
            });
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();

        Ok(Some(match kind {
            KIND_DATA => Packet::Data {
                service,
                packet,
                payload,
            },
            KIND_ACK => Packet::Ack { service, packet },
            KIND_PING => Packet::Ping,
            _ => Packet::Pong,
        }))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), CodecError> {
        let (kind, service, packet, payload) = match item {
            Packet::Data {
                service,
                packet,
                payload,
            } => (KIND_DATA, service.get(), packet.get(), payload),
            Packet::Ack { service, packet } => (KIND_ACK, service.get(), packet.get(), Bytes::new()),
            Packet::Ping => (KIND_PING, 0, 0, Bytes::new()),
            Packet::Pong => (KIND_PONG, 0, 0, Bytes::new()),
        };

        if payload.len() > self.max_packet_size {
            return Err(CodecError::TooLarge {
                len: payload.len(),
                max: self.max_packet_size,
            });
        }

        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u8(kind);
        dst.put_u32(service);
        dst.put_u32(packet);
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}

fn kind_name(kind: u8) -> &'static str {
    match kind {
        KIND_DATA => "data",
        KIND_ACK => "ack",
        KIND_PING => "ping",
        KIND_PONG => "pong",
        _ => "unknown",
    }
}

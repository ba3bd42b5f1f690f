//! MQTT 3.1.1 wire codec
//!
//! Fixed-header framing plus the eleven control packets this client speaks:
//! CONNECT, CONNACK, PUBLISH, PUBACK, SUBSCRIBE, SUBACK, UNSUBSCRIBE,
//! UNSUBACK, PINGREQ, PINGRESP, DISCONNECT. Both directions are implemented
//! so the test harness can act as a broker over the same codec.
//!
//! Decoding is incremental: `Packet::decode` consumes at most one complete
//! frame from the buffer and returns `None` when more bytes are needed.

use crate::config::{Credentials, Will};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol name and revision for MQTT 3.1.1.
const PROTOCOL_NAME: &str = "MQTT";
const PROTOCOL_LEVEL: u8 = 4;

/// Remaining-length encoding uses at most 4 varint bytes.
const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Delivery guarantee requested for a publish or subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QoS {
    /// Fire and forget.
    AtMostOnce = 0,
    /// Acknowledged delivery, duplicates possible.
    AtLeastOnce = 1,
    /// Assured single delivery (decoded but not offered by this client).
    ExactlyOnce = 2,
}

impl QoS {
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }
}

/// CONNACK return codes per MQTT 3.1.1 table 3.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReturnCode {
    Accepted,
    UnacceptableProtocol,
    IdentifierRejected,
    ServerUnavailable,
    BadCredentials,
    NotAuthorized,
}

impl ConnectReturnCode {
    pub const fn from_u8(code: u8) -> Option<Self> {
        match code {
            0 => Some(ConnectReturnCode::Accepted),
            1 => Some(ConnectReturnCode::UnacceptableProtocol),
            2 => Some(ConnectReturnCode::IdentifierRejected),
            3 => Some(ConnectReturnCode::ServerUnavailable),
            4 => Some(ConnectReturnCode::BadCredentials),
            5 => Some(ConnectReturnCode::NotAuthorized),
            _ => None,
        }
    }

    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Errors raised while encoding or decoding frames.
///
/// Any of these observed on a live session is fatal to that session: the
/// supervisor tears the connection down and reconnects.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed remaining-length encoding")]
    MalformedLength,
    #[error("packet of {size} bytes exceeds the {limit} byte limit")]
    PacketTooLarge { size: usize, limit: usize },
    #[error("unknown packet type nibble: 0x{0:x}")]
    UnknownPacketType(u8),
    #[error("invalid fixed-header flags 0x{flags:x} for {packet}")]
    InvalidFlags { packet: &'static str, flags: u8 },
    #[error("truncated packet body")]
    Truncated,
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
    #[error("packet identifier must be non-zero")]
    ZeroPacketId,
    #[error("invalid QoS value: {0}")]
    InvalidQos(u8),
    #[error("unsupported protocol name or revision in CONNECT")]
    UnsupportedProtocol,
    #[error("invalid CONNECT flags")]
    InvalidConnectFlags,
    #[error("empty topic")]
    EmptyTopic,
    #[error("unknown CONNACK return code: {0}")]
    UnknownReturnCode(u8),
    #[error("unexpected {0} packet for this session direction")]
    UnexpectedPacket(&'static str),
}

/// Client request to open a session.
#[derive(Debug, Clone, PartialEq)]
pub struct Connect {
    pub client_id: String,
    pub clean_session: bool,
    pub keepalive_secs: u16,
    pub will: Option<Will>,
    pub credentials: Option<Credentials>,
}

/// Broker response to CONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub return_code: ConnectReturnCode,
}

/// Application message, either direction.
#[derive(Debug, Clone, PartialEq)]
pub struct Publish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    /// Present iff `qos` is above `AtMostOnce`.
    pub packet_id: Option<u16>,
    pub dup: bool,
    pub retain: bool,
}

/// Client subscription request. MQTT allows several filters per packet;
/// this client sends one at a time but decodes the general form.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub filters: Vec<(String, QoS)>,
}

/// Broker acknowledgement of a SUBSCRIBE. A return code of 0x80 marks a
/// rejected filter.
#[derive(Debug, Clone, PartialEq)]
pub struct SubAck {
    pub packet_id: u16,
    pub return_codes: Vec<u8>,
}

impl SubAck {
    pub const FAILURE: u8 = 0x80;

    pub fn any_rejected(&self) -> Option<u8> {
        self.return_codes.iter().copied().find(|&c| c >= Self::FAILURE)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub filters: Vec<String>,
}

/// One MQTT control packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck { packet_id: u16 },
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck { packet_id: u16 },
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    /// Wire name, used in logs and protocol errors.
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::ConnAck(_) => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::PubAck { .. } => "PUBACK",
            Packet::Subscribe(_) => "SUBSCRIBE",
            Packet::SubAck(_) => "SUBACK",
            Packet::Unsubscribe(_) => "UNSUBSCRIBE",
            Packet::UnsubAck { .. } => "UNSUBACK",
            Packet::PingReq => "PINGREQ",
            Packet::PingResp => "PINGRESP",
            Packet::Disconnect => "DISCONNECT",
        }
    }

    /// Append one complete frame to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        let mut body = BytesMut::new();
        let header = match self {
            Packet::Connect(c) => {
                encode_connect(c, &mut body)?;
                0x10
            }
            Packet::ConnAck(a) => {
                body.put_u8(u8::from(a.session_present));
                body.put_u8(a.return_code.as_u8());
                0x20
            }
            Packet::Publish(p) => {
                encode_publish(p, &mut body)?;
                let mut flags = (p.qos as u8) << 1;
                if p.dup {
                    flags |= 0x08;
                }
                if p.retain {
                    flags |= 0x01;
                }
                0x30 | flags
            }
            Packet::PubAck { packet_id } => {
                put_packet_id(*packet_id, &mut body)?;
                0x40
            }
            Packet::Subscribe(s) => {
                put_packet_id(s.packet_id, &mut body)?;
                for (filter, qos) in &s.filters {
                    write_string(filter, &mut body)?;
                    body.put_u8(*qos as u8);
                }
                // bit 1 of the fixed header is mandatory for SUBSCRIBE
                0x82
            }
            Packet::SubAck(a) => {
                put_packet_id(a.packet_id, &mut body)?;
                body.put_slice(&a.return_codes);
                0x90
            }
            Packet::Unsubscribe(u) => {
                put_packet_id(u.packet_id, &mut body)?;
                for filter in &u.filters {
                    write_string(filter, &mut body)?;
                }
                0xa2
            }
            Packet::UnsubAck { packet_id } => {
                put_packet_id(*packet_id, &mut body)?;
                0xb0
            }
            Packet::PingReq => 0xc0,
            Packet::PingResp => 0xd0,
            Packet::Disconnect => 0xe0,
        };

        buf.put_u8(header);
        write_remaining_length(body.len(), buf)?;
        buf.extend_from_slice(&body);
        Ok(())
    }

    /// Consume at most one complete frame from `buf`.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a full frame;
    /// the caller should read more bytes and try again. Frames larger than
    /// `max_packet_size` are rejected before their body is buffered up.
    pub fn decode(
        buf: &mut BytesMut,
        max_packet_size: usize,
    ) -> Result<Option<Packet>, ProtocolError> {
        let Some((remaining, header_len)) = peek_remaining_length(buf)? else {
            return Ok(None);
        };

        let frame_len = header_len + remaining;
        if frame_len > max_packet_size {
            return Err(ProtocolError::PacketTooLarge {
                size: frame_len,
                limit: max_packet_size,
            });
        }
        if buf.len() < frame_len {
            return Ok(None);
        }

        let header = buf[0];
        let mut frame = buf.split_to(frame_len).freeze();
        frame.advance(header_len);

        let packet = match header >> 4 {
            1 => {
                expect_flags(header, 0x00, "CONNECT")?;
                Packet::Connect(decode_connect(&mut frame)?)
            }
            2 => {
                expect_flags(header, 0x00, "CONNACK")?;
                Packet::ConnAck(decode_connack(&mut frame)?)
            }
            3 => Packet::Publish(decode_publish(header, &mut frame)?),
            4 => {
                expect_flags(header, 0x00, "PUBACK")?;
                Packet::PubAck {
                    packet_id: read_packet_id(&mut frame)?,
                }
            }
            8 => {
                expect_flags(header, 0x02, "SUBSCRIBE")?;
                Packet::Subscribe(decode_subscribe(&mut frame)?)
            }
            9 => {
                expect_flags(header, 0x00, "SUBACK")?;
                Packet::SubAck(decode_suback(&mut frame)?)
            }
            10 => {
                expect_flags(header, 0x02, "UNSUBSCRIBE")?;
                Packet::Unsubscribe(decode_unsubscribe(&mut frame)?)
            }
            11 => {
                expect_flags(header, 0x00, "UNSUBACK")?;
                Packet::UnsubAck {
                    packet_id: read_packet_id(&mut frame)?,
                }
            }
            12 => {
                expect_flags(header, 0x00, "PINGREQ")?;
                Packet::PingReq
            }
            13 => {
                expect_flags(header, 0x00, "PINGRESP")?;
                Packet::PingResp
            }
            14 => {
                expect_flags(header, 0x00, "DISCONNECT")?;
                Packet::Disconnect
            }
            // PUBREC/PUBREL/PUBCOMP only exist for QoS 2 exchanges, which
            // this client never initiates.
            5 | 6 | 7 => return Err(ProtocolError::UnexpectedPacket("QoS 2 flow")),
            other => return Err(ProtocolError::UnknownPacketType(other)),
        };

        Ok(Some(packet))
    }
}

fn expect_flags(header: u8, expected: u8, packet: &'static str) -> Result<(), ProtocolError> {
    let flags = header & 0x0f;
    if flags != expected {
        return Err(ProtocolError::InvalidFlags { packet, flags });
    }
    Ok(())
}

/// Parse the remaining-length varint without consuming the buffer.
///
/// Returns `(remaining_length, total_header_bytes)` or `None` when the
/// header is not fully buffered yet.
fn peek_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>, ProtocolError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let mut value = 0usize;
    let mut shift = 0u32;
    for (i, &byte) in buf[1..].iter().enumerate() {
        if i >= 4 {
            return Err(ProtocolError::MalformedLength);
        }
        value |= ((byte & 0x7f) as usize) << shift;
        if value > MAX_REMAINING_LENGTH {
            return Err(ProtocolError::MalformedLength);
        }
        if byte & 0x80 == 0 {
            return Ok(Some((value, 2 + i)));
        }
        shift += 7;
    }
    Ok(None)
}

fn write_remaining_length(mut len: usize, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    if len > MAX_REMAINING_LENGTH {
        return Err(ProtocolError::MalformedLength);
    }
    loop {
        let mut byte = (len & 0x7f) as u8;
        len >>= 7;
        if len > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if len == 0 {
            return Ok(());
        }
    }
}

fn write_string(s: &str, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    if s.len() > u16::MAX as usize {
        return Err(ProtocolError::MalformedLength);
    }
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn read_string(frame: &mut Bytes) -> Result<String, ProtocolError> {
    if frame.len() < 2 {
        return Err(ProtocolError::Truncated);
    }
    let len = frame.get_u16() as usize;
    if frame.len() < len {
        return Err(ProtocolError::Truncated);
    }
    let raw = frame.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
}

fn put_packet_id(packet_id: u16, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    if packet_id == 0 {
        return Err(ProtocolError::ZeroPacketId);
    }
    buf.put_u16(packet_id);
    Ok(())
}

fn read_packet_id(frame: &mut Bytes) -> Result<u16, ProtocolError> {
    if frame.len() < 2 {
        return Err(ProtocolError::Truncated);
    }
    let packet_id = frame.get_u16();
    if packet_id == 0 {
        return Err(ProtocolError::ZeroPacketId);
    }
    Ok(packet_id)
}

fn encode_connect(c: &Connect, body: &mut BytesMut) -> Result<(), ProtocolError> {
    write_string(PROTOCOL_NAME, body)?;
    body.put_u8(PROTOCOL_LEVEL);

    let mut flags = 0u8;
    if c.clean_session {
        flags |= 0x02;
    }
    if let Some(will) = &c.will {
        flags |= 0x04;
        flags |= (will.qos as u8) << 3;
        if will.retain {
            flags |= 0x20;
        }
    }
    if let Some(creds) = &c.credentials {
        flags |= 0x80;
        if creds.password.is_some() {
            flags |= 0x40;
        }
    }
    body.put_u8(flags);
    body.put_u16(c.keepalive_secs);

    write_string(&c.client_id, body)?;
    if let Some(will) = &c.will {
        write_string(&will.topic, body)?;
        if will.payload.len() > u16::MAX as usize {
            return Err(ProtocolError::MalformedLength);
        }
        body.put_u16(will.payload.len() as u16);
        body.put_slice(&will.payload);
    }
    if let Some(creds) = &c.credentials {
        write_string(&creds.username, body)?;
        if let Some(password) = &creds.password {
            write_string(password, body)?;
        }
    }
    Ok(())
}

fn decode_connect(frame: &mut Bytes) -> Result<Connect, ProtocolError> {
    let name = read_string(frame)?;
    if frame.is_empty() {
        return Err(ProtocolError::Truncated);
    }
    let level = frame.get_u8();
    if name != PROTOCOL_NAME || level != PROTOCOL_LEVEL {
        return Err(ProtocolError::UnsupportedProtocol);
    }

    if frame.len() < 3 {
        return Err(ProtocolError::Truncated);
    }
    let flags = frame.get_u8();
    if flags & 0x01 != 0 {
        return Err(ProtocolError::InvalidConnectFlags);
    }
    let will_flag = flags & 0x04 != 0;
    if !will_flag && flags & 0x38 != 0 {
        return Err(ProtocolError::InvalidConnectFlags);
    }
    let keepalive_secs = frame.get_u16();
    let client_id = read_string(frame)?;

    let will = if will_flag {
        let qos = QoS::from_u8((flags >> 3) & 0x03)
            .ok_or(ProtocolError::InvalidQos((flags >> 3) & 0x03))?;
        let topic = read_string(frame)?;
        if frame.len() < 2 {
            return Err(ProtocolError::Truncated);
        }
        let len = frame.get_u16() as usize;
        if frame.len() < len {
            return Err(ProtocolError::Truncated);
        }
        let payload = frame.split_to(len);
        Some(Will {
            topic,
            payload,
            qos,
            retain: flags & 0x20 != 0,
        })
    } else {
        None
    };

    let credentials = if flags & 0x80 != 0 {
        let username = read_string(frame)?;
        let password = if flags & 0x40 != 0 {
            Some(read_string(frame)?)
        } else {
            None
        };
        Some(Credentials { username, password })
    } else if flags & 0x40 != 0 {
        // password without username is invalid
        return Err(ProtocolError::InvalidConnectFlags);
    } else {
        None
    };

    Ok(Connect {
        client_id,
        clean_session: flags & 0x02 != 0,
        keepalive_secs,
        will,
        credentials,
    })
}

fn decode_connack(frame: &mut Bytes) -> Result<ConnAck, ProtocolError> {
    if frame.len() < 2 {
        return Err(ProtocolError::Truncated);
    }
    let session_present = frame.get_u8() & 0x01 != 0;
    let code = frame.get_u8();
    let return_code =
        ConnectReturnCode::from_u8(code).ok_or(ProtocolError::UnknownReturnCode(code))?;
    Ok(ConnAck {
        session_present,
        return_code,
    })
}

fn encode_publish(p: &Publish, body: &mut BytesMut) -> Result<(), ProtocolError> {
    if p.topic.is_empty() {
        return Err(ProtocolError::EmptyTopic);
    }
    write_string(&p.topic, body)?;
    match (p.qos, p.packet_id) {
        (QoS::AtMostOnce, None) => {}
        (QoS::AtMostOnce, Some(_)) | (_, None) => {
            return Err(ProtocolError::UnexpectedPacket("PUBLISH"));
        }
        (_, Some(packet_id)) => put_packet_id(packet_id, body)?,
    }
    body.put_slice(&p.payload);
    Ok(())
}

fn decode_publish(header: u8, frame: &mut Bytes) -> Result<Publish, ProtocolError> {
    let qos_bits = (header >> 1) & 0x03;
    let qos = QoS::from_u8(qos_bits).ok_or(ProtocolError::InvalidQos(qos_bits))?;
    let topic = read_string(frame)?;
    if topic.is_empty() {
        return Err(ProtocolError::EmptyTopic);
    }
    let packet_id = if qos == QoS::AtMostOnce {
        None
    } else {
        Some(read_packet_id(frame)?)
    };
    Ok(Publish {
        topic,
        payload: frame.split_off(0),
        qos,
        packet_id,
        dup: header & 0x08 != 0,
        retain: header & 0x01 != 0,
    })
}

fn decode_subscribe(frame: &mut Bytes) -> Result<Subscribe, ProtocolError> {
    let packet_id = read_packet_id(frame)?;
    let mut filters = Vec::new();
    while !frame.is_empty() {
        let filter = read_string(frame)?;
        if filter.is_empty() {
            return Err(ProtocolError::EmptyTopic);
        }
        if frame.is_empty() {
            return Err(ProtocolError::Truncated);
        }
        let qos_byte = frame.get_u8();
        let qos = QoS::from_u8(qos_byte).ok_or(ProtocolError::InvalidQos(qos_byte))?;
        filters.push((filter, qos));
    }
    if filters.is_empty() {
        return Err(ProtocolError::Truncated);
    }
    Ok(Subscribe { packet_id, filters })
}

fn decode_suback(frame: &mut Bytes) -> Result<SubAck, ProtocolError> {
    let packet_id = read_packet_id(frame)?;
    if frame.is_empty() {
        return Err(ProtocolError::Truncated);
    }
    Ok(SubAck {
        packet_id,
        return_codes: frame.to_vec(),
    })
}

fn decode_unsubscribe(frame: &mut Bytes) -> Result<Unsubscribe, ProtocolError> {
    let packet_id = read_packet_id(frame)?;
    let mut filters = Vec::new();
    while !frame.is_empty() {
        let filter = read_string(frame)?;
        if filter.is_empty() {
            return Err(ProtocolError::EmptyTopic);
        }
        filters.push(filter);
    }
    if filters.is_empty() {
        return Err(ProtocolError::Truncated);
    }
    Ok(Unsubscribe { packet_id, filters })
}

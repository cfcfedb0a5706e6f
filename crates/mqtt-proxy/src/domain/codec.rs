//! # MQTT Packet Codec
//!
//! Frame reading, control-packet decoding and the encoders the proxy needs
//! for refusals, bus deliveries and test clients. MQTT 3.1 and 3.1.1.
//!
//! ## Frame Layout
//!
//! ```text
//! ┌────────────┬───────────────────────┬──────────────────────┐
//! │ type|flags │ remaining length (1-4)│ body (remaining len) │
//! └────────────┴───────────────────────┴──────────────────────┘
//! ```
//!
//! A [`Frame`] keeps its raw bytes so the session can forward it verbatim
//! after inspecting it.

use crate::domain::errors::CodecError;
use bytes::{BufMut, Bytes, BytesMut};
use shared_types::Credential;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest value the remaining-length field can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Default limit on a frame's body size.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// SUBACK return code for a refused topic.
pub const SUBACK_FAILURE: u8 = 0x80;

/// Fixed-header flags SUBSCRIBE and UNSUBSCRIBE must carry.
const SUBSCRIBE_FLAGS: u8 = 0b0010;

// =============================================================================
// PACKET TYPES
// =============================================================================

/// MQTT control packet types (upper four bits of the fixed header).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    Connack = 2,
    Publish = 3,
    Puback = 4,
    Pubrec = 5,
    Pubrel = 6,
    Pubcomp = 7,
    Subscribe = 8,
    Suback = 9,
    Unsubscribe = 10,
    Unsuback = 11,
    Pingreq = 12,
    Pingresp = 13,
    Disconnect = 14,
}

impl PacketType {
    /// Upper-case protocol name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Connack => "CONNACK",
            Self::Publish => "PUBLISH",
            Self::Puback => "PUBACK",
            Self::Pubrec => "PUBREC",
            Self::Pubrel => "PUBREL",
            Self::Pubcomp => "PUBCOMP",
            Self::Subscribe => "SUBSCRIBE",
            Self::Suback => "SUBACK",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Unsuback => "UNSUBACK",
            Self::Pingreq => "PINGREQ",
            Self::Pingresp => "PINGRESP",
            Self::Disconnect => "DISCONNECT",
        }
    }
}

impl TryFrom<u8> for PacketType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Connect),
            2 => Ok(Self::Connack),
            3 => Ok(Self::Publish),
            4 => Ok(Self::Puback),
            5 => Ok(Self::Pubrec),
            6 => Ok(Self::Pubrel),
            7 => Ok(Self::Pubcomp),
            8 => Ok(Self::Subscribe),
            9 => Ok(Self::Suback),
            10 => Ok(Self::Unsubscribe),
            11 => Ok(Self::Unsuback),
            12 => Ok(Self::Pingreq),
            13 => Ok(Self::Pingresp),
            14 => Ok(Self::Disconnect),
            _ => Err(CodecError::InvalidPacketType(value)),
        }
    }
}

/// CONNACK return codes (MQTT 3.1.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnackCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUsernamePassword = 4,
    NotAuthorized = 5,
}

// =============================================================================
// FRAMES
// =============================================================================

/// One complete frame as read from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Bytes,
    body_start: usize,
}

impl Frame {
    /// Fixed-header byte.
    #[must_use]
    pub fn header(&self) -> u8 {
        self.bytes[0]
    }

    /// Fixed-header flags (lower four bits).
    #[must_use]
    pub fn flags(&self) -> u8 {
        self.header() & 0x0F
    }

    /// Packet type from the fixed header.
    pub fn packet_type(&self) -> Result<PacketType, CodecError> {
        PacketType::try_from(self.header() >> 4)
    }

    /// Variable header and payload.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.bytes[self.body_start..]
    }

    /// The frame exactly as received.
    #[must_use]
    pub fn as_bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Total encoded length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Always false; a frame has at least a fixed header.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

fn eof_is_truncated(e: io::Error) -> CodecError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        CodecError::Truncated
    } else {
        CodecError::Io(e)
    }
}

/// Read one frame whose body is at most `max_size` bytes.
///
/// A clean end of stream before the fixed header is
/// [`CodecError::ConnectionClosed`]; an end of stream inside a frame is
/// [`CodecError::Truncated`].
pub async fn read_frame<R>(reader: &mut R, max_size: usize) -> Result<Frame, CodecError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let header = match reader.read_u8().await {
        Ok(byte) => byte,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(CodecError::ConnectionClosed)
        }
        Err(e) => return Err(CodecError::Io(e)),
    };
    PacketType::try_from(header >> 4)?;

    let mut raw = BytesMut::with_capacity(5);
    raw.put_u8(header);

    let mut remaining = 0usize;
    let mut shift = 0u32;
    loop {
        let byte = reader.read_u8().await.map_err(eof_is_truncated)?;
        raw.put_u8(byte);
        remaining |= usize::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 21 {
            return Err(CodecError::MalformedRemainingLength);
        }
    }

    if remaining > max_size {
        return Err(CodecError::FrameTooLarge {
            size: remaining,
            max: max_size,
        });
    }

    let body_start = raw.len();
    raw.resize(body_start + remaining, 0);
    reader
        .read_exact(&mut raw[body_start..])
        .await
        .map_err(eof_is_truncated)?;

    Ok(Frame {
        bytes: raw.freeze(),
        body_start,
    })
}

// =============================================================================
// PACKETS
// =============================================================================

/// CONNECT fields the proxy looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectPacket {
    pub protocol_name: String,
    pub protocol_level: u8,
    pub client_id: String,
    pub username: Option<String>,
    /// The password field; empty when absent.
    pub credential: Credential,
    pub keep_alive: u16,
    pub clean_session: bool,
}

/// SUBSCRIBE request: packet identifier and (topic filter, requested QoS).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribePacket {
    pub packet_id: u16,
    pub topics: Vec<(String, u8)>,
}

/// UNSUBSCRIBE request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubscribePacket {
    pub packet_id: u16,
    pub topics: Vec<String>,
}

/// PUBLISH; the payload is never interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishPacket {
    pub topic: String,
    pub qos: u8,
    pub retain: bool,
    pub dup: bool,
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

/// A decoded control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(ConnectPacket),
    Subscribe(SubscribePacket),
    Unsubscribe(UnsubscribePacket),
    Publish(PublishPacket),
    /// Any other frame, relayed as-is.
    Passthrough(PacketType),
}

struct Body<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Body<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8], CodecError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| CodecError::Malformed(format!("{what} runs past end of packet")))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self, what: &str) -> Result<u8, CodecError> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &str) -> Result<u16, CodecError> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn binary(&mut self, what: &str) -> Result<&'a [u8], CodecError> {
        let len = self.u16(what)?;
        self.take(usize::from(len), what)
    }

    fn string(&mut self, what: &str) -> Result<String, CodecError> {
        let raw = self.binary(what)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| CodecError::Malformed(format!("{what} is not valid UTF-8")))
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }
}

impl Packet {
    /// Decode a frame into a control packet.
    pub fn decode(frame: &Frame) -> Result<Self, CodecError> {
        match frame.packet_type()? {
            PacketType::Connect => decode_connect(frame).map(Self::Connect),
            PacketType::Subscribe => decode_subscribe(frame).map(Self::Subscribe),
            PacketType::Unsubscribe => decode_unsubscribe(frame).map(Self::Unsubscribe),
            PacketType::Publish => decode_publish(frame).map(Self::Publish),
            other => Ok(Self::Passthrough(other)),
        }
    }

    /// Packet type of this packet.
    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Connect(_) => PacketType::Connect,
            Self::Subscribe(_) => PacketType::Subscribe,
            Self::Unsubscribe(_) => PacketType::Unsubscribe,
            Self::Publish(_) => PacketType::Publish,
            Self::Passthrough(kind) => *kind,
        }
    }
}

fn decode_connect(frame: &Frame) -> Result<ConnectPacket, CodecError> {
    if frame.flags() != 0 {
        return Err(CodecError::InvalidFlags {
            packet: PacketType::Connect.name(),
            flags: frame.flags(),
        });
    }
    let mut body = Body::new(frame.body());

    let protocol_name = body.string("protocol name")?;
    let protocol_level = body.u8("protocol level")?;
    let supported = matches!(
        (protocol_name.as_str(), protocol_level),
        ("MQTT", 4) | ("MQIsdp", 3)
    );
    if !supported {
        return Err(CodecError::UnsupportedProtocol {
            name: protocol_name,
            level: protocol_level,
        });
    }

    let flags = body.u8("connect flags")?;
    if flags & 0x01 != 0 {
        return Err(CodecError::Malformed("reserved connect flag set".into()));
    }
    let keep_alive = body.u16("keep alive")?;
    let client_id = body.string("client identifier")?;

    if flags & 0x04 != 0 {
        body.string("will topic")?;
        body.binary("will message")?;
    }
    let username = if flags & 0x80 != 0 {
        Some(body.string("username")?)
    } else {
        None
    };
    let credential = if flags & 0x40 != 0 {
        let raw = body.binary("password")?;
        let secret = std::str::from_utf8(raw)
            .map_err(|_| CodecError::Malformed("password is not valid UTF-8".into()))?;
        Credential::new(secret)
    } else {
        Credential::new("")
    };

    Ok(ConnectPacket {
        protocol_name,
        protocol_level,
        client_id,
        username,
        credential,
        keep_alive,
        clean_session: flags & 0x02 != 0,
    })
}

fn check_subscribe_flags(frame: &Frame, kind: PacketType) -> Result<(), CodecError> {
    if frame.flags() == SUBSCRIBE_FLAGS {
        Ok(())
    } else {
        Err(CodecError::InvalidFlags {
            packet: kind.name(),
            flags: frame.flags(),
        })
    }
}

fn decode_subscribe(frame: &Frame) -> Result<SubscribePacket, CodecError> {
    check_subscribe_flags(frame, PacketType::Subscribe)?;
    let mut body = Body::new(frame.body());
    let packet_id = body.u16("packet identifier")?;

    let mut topics = Vec::new();
    while !body.is_empty() {
        let topic = body.string("topic filter")?;
        let qos = body.u8("requested QoS")?;
        if qos > 2 {
            return Err(CodecError::InvalidQos(qos));
        }
        topics.push((topic, qos));
    }
    if topics.is_empty() {
        return Err(CodecError::Malformed("SUBSCRIBE without topics".into()));
    }
    Ok(SubscribePacket { packet_id, topics })
}

fn decode_unsubscribe(frame: &Frame) -> Result<UnsubscribePacket, CodecError> {
    check_subscribe_flags(frame, PacketType::Unsubscribe)?;
    let mut body = Body::new(frame.body());
    let packet_id = body.u16("packet identifier")?;

    let mut topics = Vec::new();
    while !body.is_empty() {
        topics.push(body.string("topic filter")?);
    }
    if topics.is_empty() {
        return Err(CodecError::Malformed("UNSUBSCRIBE without topics".into()));
    }
    Ok(UnsubscribePacket { packet_id, topics })
}

fn decode_publish(frame: &Frame) -> Result<PublishPacket, CodecError> {
    let flags = frame.flags();
    let qos = (flags >> 1) & 0x03;
    if qos == 3 {
        return Err(CodecError::InvalidQos(qos));
    }

    let mut body = Body::new(frame.body());
    let topic = body.string("topic name")?;
    let packet_id = if qos > 0 {
        Some(body.u16("packet identifier")?)
    } else {
        None
    };
    let payload = frame.as_bytes().slice(frame.body_start + body.pos..);

    Ok(PublishPacket {
        topic,
        qos,
        retain: flags & 0x01 != 0,
        dup: flags & 0x08 != 0,
        packet_id,
        payload,
    })
}

// =============================================================================
// ENCODERS
// =============================================================================

fn put_remaining_length(buf: &mut BytesMut, mut len: usize) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if len == 0 {
            break;
        }
    }
}

fn put_string(buf: &mut BytesMut, s: &str) -> Result<(), CodecError> {
    put_binary(buf, s.as_bytes())
}

fn put_binary(buf: &mut BytesMut, data: &[u8]) -> Result<(), CodecError> {
    let len = u16::try_from(data.len()).map_err(|_| CodecError::FieldTooLong(data.len()))?;
    buf.put_u16(len);
    buf.put_slice(data);
    Ok(())
}

fn encode_frame(header: u8, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(body.len() + 5);
    buf.put_u8(header);
    put_remaining_length(&mut buf, body.len());
    buf.put_slice(body);
    buf.freeze()
}

/// CONNACK with the given return code.
#[must_use]
pub fn encode_connack(session_present: bool, code: ConnackCode) -> Bytes {
    encode_frame(0x20, &[u8::from(session_present), code as u8])
}

/// SUBACK with one return code per requested topic.
#[must_use]
pub fn encode_suback(packet_id: u16, return_codes: &[u8]) -> Bytes {
    let mut body = BytesMut::with_capacity(2 + return_codes.len());
    body.put_u16(packet_id);
    body.put_slice(return_codes);
    encode_frame(0x90, &body)
}

/// QoS 0 PUBLISH.
pub fn encode_publish(topic: &str, payload: &[u8]) -> Result<Bytes, CodecError> {
    let size = 2 + topic.len() + payload.len();
    if size > MAX_REMAINING_LENGTH {
        return Err(CodecError::FrameTooLarge {
            size,
            max: MAX_REMAINING_LENGTH,
        });
    }
    let mut body = BytesMut::with_capacity(size);
    put_string(&mut body, topic)?;
    body.put_slice(payload);
    Ok(encode_frame(0x30, &body))
}

/// Client CONNECT (MQTT 3.1.1, clean session).
///
/// Fails with `FieldTooLong` if any string exceeds 65535 bytes.
pub fn encode_connect(
    client_id: &str,
    username: Option<&str>,
    password: Option<&str>,
    keep_alive: u16,
) -> Result<Bytes, CodecError> {
    let mut flags = 0x02;
    if username.is_some() {
        flags |= 0x80;
    }
    if password.is_some() {
        flags |= 0x40;
    }

    let mut body = BytesMut::new();
    put_string(&mut body, "MQTT")?;
    body.put_u8(4);
    body.put_u8(flags);
    body.put_u16(keep_alive);
    put_string(&mut body, client_id)?;
    if let Some(username) = username {
        put_string(&mut body, username)?;
    }
    if let Some(password) = password {
        put_binary(&mut body, password.as_bytes())?;
    }
    Ok(encode_frame(0x10, &body))
}

/// Client SUBSCRIBE requesting QoS 0 for every topic.
pub fn encode_subscribe(packet_id: u16, topics: &[&str]) -> Result<Bytes, CodecError> {
    let mut body = BytesMut::new();
    body.put_u16(packet_id);
    for topic in topics {
        put_string(&mut body, topic)?;
        body.put_u8(0);
    }
    Ok(encode_frame(0x80 | SUBSCRIBE_FLAGS, &body))
}

/// Client UNSUBSCRIBE.
pub fn encode_unsubscribe(packet_id: u16, topics: &[&str]) -> Result<Bytes, CodecError> {
    let mut body = BytesMut::new();
    body.put_u16(packet_id);
    for topic in topics {
        put_string(&mut body, topic)?;
    }
    Ok(encode_frame(0xA0 | SUBSCRIBE_FLAGS, &body))
}

/// PINGREQ.
#[must_use]
pub fn encode_pingreq() -> Bytes {
    encode_frame(0xC0, &[])
}

/// DISCONNECT.
#[must_use]
pub fn encode_disconnect() -> Bytes {
    encode_frame(0xE0, &[])
}

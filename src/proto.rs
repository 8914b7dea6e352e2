//! Minimal protobuf wire-format reader/writer for the dozen Mumble control
//! messages this gateway speaks, instead of pulling in a full `protoc`
//! build step for a fixed, small message set. Wire types 0 (varint), 1
//! (fixed64), 2 (length-delimited) and 5 (fixed32) are all that's needed;
//! unknown fields are skipped by wire type so a newer server can add
//! fields without breaking us.
//!
//! Field numbers below are fixed by the upstream Mumble protocol and must
//! match it bit-exactly; they are not renegotiable.

use bytes::{Buf, BufMut, BytesMut};
use std::io;

use crate::error::MumbleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WireType {
    Varint = 0,
    Fixed64 = 1,
    LengthDelimited = 2,
    Fixed32 = 5,
}

impl WireType {
    fn from_tag(tag: u64) -> io::Result<(u32, WireType)> {
        let field_number = (tag >> 3) as u32;
        let wire_type = match tag & 0x7 {
            0 => WireType::Varint,
            1 => WireType::Fixed64,
            2 => WireType::LengthDelimited,
            5 => WireType::Fixed32,
            n => return Err(io::Error::new(io::ErrorKind::InvalidData, format!("unsupported wire type {n}"))),
        };
        Ok((field_number, wire_type))
    }
}

/// Reads a standard protobuf varint (LEB128, distinct from [`crate::varint`]'s
/// Mumble-specific encoding).
fn read_proto_varint(buf: &mut impl Buf) -> io::Result<u64> {
    let mut result: u64 = 0;
    let mut shift = 0;
    loop {
        if !buf.has_remaining() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated varint"));
        }
        let byte = buf.get_u8();
        result |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
        if shift >= 64 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "varint too long"));
        }
    }
}

fn write_proto_varint(dst: &mut BytesMut, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            dst.put_u8(byte);
            break;
        }
        dst.put_u8(byte | 0x80);
    }
}

fn write_tag(dst: &mut BytesMut, field_number: u32, wire_type: WireType) {
    write_proto_varint(dst, (u64::from(field_number) << 3) | (wire_type as u64));
}

pub fn write_string_field(dst: &mut BytesMut, field_number: u32, value: &str) {
    write_tag(dst, field_number, WireType::LengthDelimited);
    write_proto_varint(dst, value.len() as u64);
    dst.extend_from_slice(value.as_bytes());
}

pub fn write_bytes_field(dst: &mut BytesMut, field_number: u32, value: &[u8]) {
    write_tag(dst, field_number, WireType::LengthDelimited);
    write_proto_varint(dst, value.len() as u64);
    dst.extend_from_slice(value);
}

pub fn write_varint_field(dst: &mut BytesMut, field_number: u32, value: u64) {
    write_tag(dst, field_number, WireType::Varint);
    write_proto_varint(dst, value);
}

/// Signed 32-bit fields use plain (non-zigzag) sign-extended varint
/// encoding on the Mumble wire, matching `protoc`'s `int32` (not `sint32`).
pub fn write_sint32_field(dst: &mut BytesMut, field_number: u32, value: i32) {
    write_varint_field(dst, field_number, value as i64 as u64);
}

pub fn write_bool_field(dst: &mut BytesMut, field_number: u32, value: bool) {
    write_varint_field(dst, field_number, u64::from(value));
}

/// One decoded field, pre-classified by wire type. Message decoders match
/// on `field_number` and pull the payload out with the matching `as_*`
/// accessor; anything unrecognized is simply never matched and dropped.
pub struct RawField {
    pub field_number: u32,
    wire_type: WireType,
    varint: u64,
    bytes: bytes::Bytes,
}

impl RawField {
    pub fn as_u64(&self) -> u64 {
        self.varint
    }

    pub fn as_u32(&self) -> u32 {
        self.varint as u32
    }

    pub fn as_i32(&self) -> i32 {
        self.varint as i32
    }

    pub fn as_bool(&self) -> bool {
        self.varint != 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_str(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Iterates the fields of a message body, skipping unknown wire types per
/// the format's forward-compatibility rule.
pub fn decode_fields(mut body: bytes::Bytes) -> io::Result<Vec<RawField>> {
    let mut fields = Vec::new();

    while body.has_remaining() {
        let tag = read_proto_varint(&mut body)?;
        let (field_number, wire_type) = WireType::from_tag(tag)?;

        match wire_type {
            WireType::Varint => {
                let v = read_proto_varint(&mut body)?;
                fields.push(RawField {
                    field_number,
                    wire_type,
                    varint: v,
                    bytes: bytes::Bytes::new(),
                });
            }
            WireType::Fixed64 => {
                if body.remaining() < 8 {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated fixed64"));
                }
                body.advance(8);
            }
            WireType::Fixed32 => {
                if body.remaining() < 4 {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated fixed32"));
                }
                body.advance(4);
            }
            WireType::LengthDelimited => {
                let len = read_proto_varint(&mut body)? as usize;
                if body.remaining() < len {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated length-delimited field"));
                }
                let payload = body.copy_to_bytes(len);
                fields.push(RawField {
                    field_number,
                    wire_type,
                    varint: 0,
                    bytes: payload,
                });
            }
        }
    }

    Ok(fields)
}

/// Numeric Mumble control message type ids, used as the length-prefixed
/// frame's two-byte discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageKind {
    Version = 0,
    UdpTunnel = 1,
    Authenticate = 2,
    Ping = 3,
    Reject = 4,
    ServerSync = 5,
    ChannelRemove = 6,
    ChannelState = 7,
    UserRemove = 8,
    UserState = 9,
    TextMessage = 11,
    PermissionDenied = 12,
    CryptSetup = 15,
    CodecVersion = 21,
}

impl MessageKind {
    pub fn from_u16(v: u16) -> Option<MessageKind> {
        use MessageKind::*;
        Some(match v {
            0 => Version,
            1 => UdpTunnel,
            2 => Authenticate,
            3 => Ping,
            4 => Reject,
            5 => ServerSync,
            6 => ChannelRemove,
            7 => ChannelState,
            8 => UserRemove,
            9 => UserState,
            11 => TextMessage,
            12 => PermissionDenied,
            15 => CryptSetup,
            21 => CodecVersion,
            _ => return None,
        })
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Frames one already-encoded message body as `[u16 type | u32 length |
/// payload]` and appends it to `dst`.
pub fn write_frame(dst: &mut BytesMut, kind: MessageKind, body: &[u8]) {
    dst.reserve(6 + body.len());
    dst.put_u16(kind as u16);
    dst.put_u32(body.len() as u32);
    dst.put_slice(body);
}

/// Accumulates bytes read off the TLS stream and yields whole `(kind,
/// body)` frames as they complete, leaving any partial frame buffered for
/// the next read.
#[derive(Default)]
pub struct FrameReader {
    buf: BytesMut,
}

impl FrameReader {
    pub fn new() -> Self {
        Self { buf: BytesMut::with_capacity(8192) }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pulls one frame out of the buffer if a complete one is available.
    pub fn next_frame(&mut self) -> Result<Option<(MessageKind, bytes::Bytes)>, MumbleError> {
        if self.buf.len() < 6 {
            return Ok(None);
        }

        let kind_raw = u16::from_be_bytes([self.buf[0], self.buf[1]]);
        let len = u32::from_be_bytes([self.buf[2], self.buf[3], self.buf[4], self.buf[5]]) as usize;

        if self.buf.len() < 6 + len {
            return Ok(None);
        }

        let kind = MessageKind::from_u16(kind_raw).ok_or(MumbleError::UnknownMessageType(kind_raw))?;

        self.buf.advance(6);
        let body = self.buf.split_to(len).freeze();

        Ok(Some((kind, body)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_roundtrip() {
        for &n in &[0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut buf = BytesMut::new();
            write_proto_varint(&mut buf, n);
            let mut cursor = &buf[..];
            let decoded = read_proto_varint(&mut cursor).unwrap();
            assert_eq!(decoded, n);
        }
    }

    #[test]
    fn decode_fields_skips_unknown_wire_types() {
        let mut body = BytesMut::new();
        write_varint_field(&mut body, 1, 42);
        // Fixed64 field 2 (unsupported, skip-only).
        write_tag(&mut body, 2, WireType::Fixed64);
        body.extend_from_slice(&[0u8; 8]);
        write_string_field(&mut body, 3, "hello");

        let fields = decode_fields(body.freeze()).unwrap();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].field_number, 1);
        assert_eq!(fields[0].as_u64(), 42);
        assert_eq!(fields[1].field_number, 3);
        assert_eq!(fields[1].as_str(), "hello");
    }

    #[test]
    fn frame_reader_buffers_partial_frames() {
        let mut reader = FrameReader::new();
        let mut body = BytesMut::new();
        write_varint_field(&mut body, 1, 1);
        let mut frame = BytesMut::new();
        write_frame(&mut frame, MessageKind::Ping, &body);

        // Feed one byte at a time; only the last feed should yield a frame.
        let bytes = frame.freeze();
        for (i, byte) in bytes.iter().enumerate() {
            reader.feed(&[*byte]);
            let got = reader.next_frame().unwrap();
            if i + 1 == bytes.len() {
                assert!(got.is_some());
            } else {
                assert!(got.is_none());
            }
        }
    }

    #[test]
    fn sint32_is_sign_extended_not_zigzag() {
        let mut buf = BytesMut::new();
        write_sint32_field(&mut buf, 1, -1);
        let fields = decode_fields(buf.freeze()).unwrap();
        assert_eq!(fields[0].as_i32(), -1);
    }
}

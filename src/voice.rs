//! Mumble protocol-v1 ("legacy") voice packet framing.
//!
//! One-byte header `(type:3 | target:5)`. Only two packet types are in use
//! by this gateway: `Ping` (type 1) for UDP RTT probing, and `Opus` (type
//! 4) for voice frames. CELT/Speex framing and Mumble 1.5's protocol-v2
//! voice packets are out of scope — the gateway pins protocol v1.4.
//!
//! The wire shape differs slightly by direction: a client→server packet
//! omits the speaker's session id (the server infers it from the
//! connection), while a server→client packet carries it. [`Serverbound`]
//! and [`Clientbound`] are zero-sized marker types selecting which shape
//! [`VoicePacket::Audio::session_id`] takes.

use crate::varint::{get_varint, put_varint, BufMutExt, ReadExt};
use bytes::{Buf, BufMut, BytesMut};
use std::fmt::Debug;
use std::io;
use std::io::{Cursor, Read};
use std::marker::PhantomData;

pub const MAX_OPUS_LEN: usize = 0x1fff;

#[derive(Debug, thiserror::Error)]
pub enum VoiceCodecError {
    #[error("packet truncated")]
    Eof,
    #[error("unknown voice packet type {0}")]
    UnknownType(u8),
    #[error("opus payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Serverbound;
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Clientbound;

pub trait VoicePacketDst: Default + PartialEq {
    type SessionId: Debug + Clone + PartialEq;
    fn read_session_id<R: Read>(buf: &mut R) -> io::Result<Self::SessionId>;
    fn write_session_id(buf: &mut BytesMut, session_id: &Self::SessionId);
}

impl VoicePacketDst for Serverbound {
    type SessionId = ();

    fn read_session_id<R: Read>(_buf: &mut R) -> io::Result<Self::SessionId> {
        Ok(())
    }

    fn write_session_id(_buf: &mut BytesMut, _session_id: &Self::SessionId) {}
}

impl VoicePacketDst for Clientbound {
    type SessionId = u32;

    fn read_session_id<R: Read>(buf: &mut R) -> io::Result<Self::SessionId> {
        Ok(buf.read_varint()? as u32)
    }

    fn write_session_id(buf: &mut BytesMut, session_id: &Self::SessionId) {
        buf.put_varint(u64::from(*session_id));
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VoicePacket<Dst: VoicePacketDst> {
    /// Opaque RTT timestamp, echoed back by whichever side didn't send it.
    Ping { timestamp: u64 },
    Audio {
        _dst: PhantomData<Dst>,
        /// 5-bit routing target: 0 is normal speech, other values are
        /// whisper/shout targets (opaque to the gateway).
        target: u8,
        session_id: Dst::SessionId,
        sequence: u64,
        opus: bytes::Bytes,
        is_last_frame: bool,
    },
}

impl VoicePacket<Serverbound> {
    pub fn into_client_bound(self, session_id: u32) -> VoicePacket<Clientbound> {
        match self {
            VoicePacket::Ping { timestamp } => VoicePacket::Ping { timestamp },
            VoicePacket::Audio {
                target,
                sequence,
                opus,
                is_last_frame,
                ..
            } => VoicePacket::Audio {
                _dst: PhantomData,
                target,
                session_id,
                sequence,
                opus,
                is_last_frame,
            },
        }
    }
}

/// Decodes one legacy voice packet from a fully-buffered, already-decrypted
/// datagram (or tunnelled payload). Any trailing bytes after a recognized
/// packet are ignored by the caller; this function consumes what it reads.
pub fn decode_voice_packet<Dst: VoicePacketDst>(buf: &[u8]) -> Result<VoicePacket<Dst>, VoiceCodecError> {
    if buf.is_empty() {
        return Err(VoiceCodecError::Eof);
    }

    let mut cursor = Cursor::new(buf);
    let header = {
        let mut b = [0u8; 1];
        cursor.read_exact(&mut b).map_err(|_| VoiceCodecError::Eof)?;
        b[0]
    };
    let kind = header >> 5;
    let target = header & 0x1f;

    match kind {
        1 => {
            let timestamp = cursor.read_varint().map_err(|_| VoiceCodecError::Eof)?;
            Ok(VoicePacket::Ping { timestamp })
        }
        4 => {
            let session_id = Dst::read_session_id(&mut cursor).map_err(|_| VoiceCodecError::Eof)?;
            let sequence = cursor.read_varint().map_err(|_| VoiceCodecError::Eof)?;
            let size_term = cursor.read_varint().map_err(|_| VoiceCodecError::Eof)?;
            let is_last_frame = size_term & 0x2000 != 0;
            let size = (size_term & 0x1fff) as usize;

            let pos = cursor.position() as usize;
            let remaining = &buf[pos..];
            if size > remaining.len() {
                return Err(VoiceCodecError::Eof);
            }

            Ok(VoicePacket::Audio {
                _dst: PhantomData,
                target,
                session_id,
                sequence,
                opus: bytes::Bytes::copy_from_slice(&remaining[..size]),
                is_last_frame,
            })
        }
        _ => Err(VoiceCodecError::UnknownType(kind)),
    }
}

/// Same as [`decode_voice_packet`] but consumes a [`Buf`] in place, for the
/// hot path where the packet already lives in a `BytesMut` we own.
pub fn decode_voice_packet_buf<Dst: VoicePacketDst>(
    buf: &mut BytesMut,
) -> Result<VoicePacket<Dst>, VoiceCodecError> {
    if !buf.has_remaining() {
        return Err(VoiceCodecError::Eof);
    }

    let header = buf.get_u8();
    let kind = header >> 5;
    let target = header & 0x1f;

    match kind {
        1 => {
            let timestamp = get_varint(buf)?;
            Ok(VoicePacket::Ping { timestamp })
        }
        4 => {
            // Parse the (possibly empty) session id and the two varints
            // that follow it out of a throwaway cursor, then advance `buf`
            // by exactly what was consumed. Keeps a single source of truth
            // for session-id parsing in `VoicePacketDst::read_session_id`.
            let mut cursor = Cursor::new(&buf[..]);
            let session_id = Dst::read_session_id(&mut cursor)?;
            let sequence = cursor.read_varint()?;
            let size_term = cursor.read_varint()?;
            let header_len = cursor.position() as usize;
            buf.advance(header_len);

            let is_last_frame = size_term & 0x2000 != 0;
            let size = (size_term & 0x1fff) as usize;

            if buf.remaining() < size {
                return Err(VoiceCodecError::Eof);
            }

            let opus = buf.split_to(size).freeze();

            Ok(VoicePacket::Audio {
                _dst: PhantomData,
                target,
                session_id,
                sequence,
                opus,
                is_last_frame,
            })
        }
        _ => Err(VoiceCodecError::UnknownType(kind)),
    }
}

pub fn encode_voice_packet<Dst: VoicePacketDst>(
    packet: &VoicePacket<Dst>,
    dst: &mut BytesMut,
) -> Result<(), VoiceCodecError> {
    match packet {
        VoicePacket::Ping { timestamp } => {
            dst.reserve(10);
            dst.put_u8(1 << 5);
            dst.put_varint(*timestamp);
        }
        VoicePacket::Audio {
            target,
            session_id,
            sequence,
            opus,
            is_last_frame,
        } => {
            if opus.len() > MAX_OPUS_LEN {
                return Err(VoiceCodecError::PayloadTooLarge(opus.len()));
            }

            dst.reserve(1 + 10 + 10 + opus.len());
            dst.put_u8((4 << 5) | (target & 0x1f));
            Dst::write_session_id(dst, session_id);
            dst.put_varint(*sequence);

            let size_term = if *is_last_frame {
                (opus.len() as u64) | 0x2000
            } else {
                opus.len() as u64
            };
            dst.put_varint(size_term);
            dst.put_slice(opus);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn encode_client_audio(target: u8, sequence: u64, opus: &[u8], last: bool) -> BytesMut {
        let packet = VoicePacket::<Serverbound>::Audio {
            _dst: PhantomData,
            target,
            session_id: (),
            sequence,
            opus: Bytes::copy_from_slice(opus),
            is_last_frame: last,
        };
        let mut buf = BytesMut::new();
        encode_voice_packet(&packet, &mut buf).unwrap();
        buf
    }

    #[test]
    fn client_audio_roundtrip() {
        for target in [0u8, 1, 31] {
            for sequence in [0u64, 42, (1 << 30) - 1] {
                for last in [false, true] {
                    let opus = vec![0xabu8; 32];
                    let mut buf = encode_client_audio(target, sequence, &opus, last);
                    let decoded: VoicePacket<Serverbound> = decode_voice_packet_buf(&mut buf).unwrap();
                    match decoded {
                        VoicePacket::Audio {
                            target: t,
                            sequence: s,
                            opus: o,
                            is_last_frame: l,
                            ..
                        } => {
                            assert_eq!(t, target);
                            assert_eq!(s, sequence);
                            assert_eq!(o.as_ref(), opus.as_slice());
                            assert_eq!(l, last);
                        }
                        _ => panic!("expected audio packet"),
                    }
                }
            }
        }
    }

    #[test]
    fn ping_roundtrip() {
        let packet = VoicePacket::<Serverbound>::Ping { timestamp: 123456 };
        let mut buf = BytesMut::new();
        encode_voice_packet(&packet, &mut buf).unwrap();
        let decoded: VoicePacket<Serverbound> = decode_voice_packet_buf(&mut buf).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn rejects_oversized_opus_payload() {
        let packet = VoicePacket::<Serverbound>::Audio {
            _dst: PhantomData,
            target: 0,
            session_id: (),
            sequence: 0,
            opus: Bytes::from(vec![0u8; MAX_OPUS_LEN + 1]),
            is_last_frame: false,
        };
        let mut buf = BytesMut::new();
        assert!(matches!(
            encode_voice_packet(&packet, &mut buf),
            Err(VoiceCodecError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn rejects_truncated_payload() {
        // Header says type=4 (opus), size=10, but no payload bytes follow.
        let mut buf = BytesMut::new();
        buf.put_u8(4 << 5);
        buf.put_varint(0); // sequence
        buf.put_varint(10); // size term, no last-frame bit
        let decoded: Result<VoicePacket<Serverbound>, _> = decode_voice_packet_buf(&mut buf);
        assert!(matches!(decoded, Err(VoiceCodecError::Eof)));
    }

    #[test]
    fn clientbound_carries_session_id() {
        let packet = VoicePacket::<Clientbound>::Audio {
            _dst: PhantomData,
            target: 0,
            session_id: 7,
            sequence: 42,
            opus: Bytes::copy_from_slice(&[0xabu8; 32]),
            is_last_frame: false,
        };
        let mut buf = BytesMut::new();
        encode_voice_packet(&packet, &mut buf).unwrap();
        let decoded: VoicePacket<Clientbound> = decode_voice_packet_buf(&mut buf).unwrap();
        match decoded {
            VoicePacket::Audio { session_id, .. } => assert_eq!(session_id, 7),
            _ => panic!("expected audio packet"),
        }
    }
}

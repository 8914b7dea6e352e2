//! The JSON control envelope and binary voice envelope a browser peer
//! speaks over one WebSocket (§4.7). JSON messages are tagged by `type`
//! with camelCase field names so they serialize the way a browser client
//! expects without a hand-written adapter layer on either side.

use serde::{Deserialize, Serialize};

use crate::config::ServerSummary;
use crate::registry::{Channel, User};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PeerMessage {
    Connect { server_id: String, username: String, password: Option<String>, tokens: Option<Vec<String>> },
    Disconnect,
    JoinChannel { channel_id: u32 },
    TextSend { message: String, channel_id: Option<u32>, user_id: Option<u32> },
    Ping { client_time_ms: u64 },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum GatewayMessage {
    ServerList { servers: Vec<ServerSummary> },
    Connected {
        server_id: String,
        self_user_id: u32,
        root_channel_id: u32,
        welcome_message: Option<String>,
        server_version: Option<u32>,
        max_bandwidth: Option<u32>,
    },
    StateSnapshot { channels: Vec<ChannelView>, users: Vec<UserView> },
    ChannelUpsert { channel: ChannelView },
    ChannelRemove { channel_id: u32 },
    UserUpsert { user: UserView },
    UserRemove { user_id: u32 },
    TextRecv {
        sender_id: Option<u32>,
        message: String,
        target_users: Vec<u32>,
        target_channels: Vec<u32>,
        target_trees: Vec<u32>,
        timestamp_ms: u64,
    },
    Metrics(MetricsSnapshot),
    Pong { client_time_ms: u64, server_time_ms: u64 },
    Disconnected { reason: String },
    Error { code: &'static str, message: String, details: Option<String> },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelView {
    pub id: u32,
    pub name: String,
    pub parent_id: Option<u32>,
    pub position: Option<i32>,
    pub description: Option<String>,
    pub links: Vec<u32>,
}

impl From<&Channel> for ChannelView {
    fn from(c: &Channel) -> Self {
        ChannelView {
            id: c.id,
            name: c.name.clone(),
            parent_id: c.parent_id,
            position: c.position,
            description: c.description.clone(),
            links: c.links.iter().copied().collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserView {
    pub id: u32,
    pub name: String,
    pub channel_id: u32,
    pub mute: Option<bool>,
    pub deaf: Option<bool>,
    pub suppress: Option<bool>,
    pub self_mute: Option<bool>,
    pub self_deaf: Option<bool>,
}

impl From<&User> for UserView {
    fn from(u: &User) -> Self {
        UserView {
            id: u.id,
            name: u.name.clone(),
            channel_id: u.channel_id,
            mute: u.mute,
            deaf: u.deaf,
            suppress: u.suppress,
            self_mute: u.self_mute,
            self_deaf: u.self_deaf,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub voice_uplink_frames_total: u64,
    pub voice_downlink_frames_total: u64,
    pub voice_uplink_pacer_dropped_frames_total: u64,
    pub voice_downlink_dropped_frames: u64,
    pub uplink_fps: f64,
    pub downlink_fps: f64,
    pub uplink_kbps: f64,
    pub downlink_kbps: f64,
    pub server_rtt_ms: Option<u64>,
}

/// Decodes one incoming binary voice frame from the peer.
#[derive(Debug, Clone)]
pub enum UplinkVoiceFrame {
    Opus { target: u8, opus: bytes::Bytes },
    End,
}

const KIND_UPLINK_END: u8 = 0x03;
const KIND_DOWNLINK_OPUS: u8 = 0x11;
const KIND_UPLINK_OPUS: u8 = 0x12;

pub fn decode_uplink_frame(data: &[u8]) -> Option<UplinkVoiceFrame> {
    let (&kind, rest) = data.split_first()?;
    match kind {
        KIND_UPLINK_END => Some(UplinkVoiceFrame::End),
        KIND_UPLINK_OPUS => {
            if rest.len() < 3 {
                return None;
            }
            let target = rest[0] & 0x1f;
            // rest[1..3] is the reserved u16, intentionally ignored.
            let opus = &rest[3..];
            if opus.len() > crate::voice::MAX_OPUS_LEN {
                // Oversized uplink frame: reject per §4.1 rather than hand a
                // payload downstream that the legacy voice codec can't frame.
                return None;
            }
            Some(UplinkVoiceFrame::Opus { target, opus: bytes::Bytes::copy_from_slice(opus) })
        }
        _ => None,
    }
}

/// Encodes one downlink Opus frame: `[0x11 | userId:u32 | target:u8 |
/// flags:u8 | sequence:u32 | opus]`, 11-byte header, little-endian.
pub fn encode_downlink_opus(user_id: u32, target: u8, sequence: u64, is_last_frame: bool, opus: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(11 + opus.len());
    out.push(KIND_DOWNLINK_OPUS);
    out.extend_from_slice(&user_id.to_le_bytes());
    out.push(target & 0x1f);
    out.push(if is_last_frame { 0x01 } else { 0x00 });
    out.extend_from_slice(&(sequence as u32).to_le_bytes());
    out.extend_from_slice(opus);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_uplink_opus_frame() {
        let mut frame = vec![KIND_UPLINK_OPUS, 3, 0, 0];
        frame.extend_from_slice(&[0xaa, 0xbb]);
        match decode_uplink_frame(&frame).unwrap() {
            UplinkVoiceFrame::Opus { target, opus } => {
                assert_eq!(target, 3);
                assert_eq!(&opus[..], &[0xaa, 0xbb]);
            }
            _ => panic!("expected Opus"),
        }
    }

    #[test]
    fn decodes_uplink_end_marker_with_no_payload() {
        let frame = [KIND_UPLINK_END];
        assert!(matches!(decode_uplink_frame(&frame), Some(UplinkVoiceFrame::End)));
    }

    #[test]
    fn rejects_unknown_kind_byte() {
        assert!(decode_uplink_frame(&[0xff, 0, 0, 0]).is_none());
    }

    #[test]
    fn rejects_opus_payload_over_legacy_frame_limit() {
        let mut frame = vec![KIND_UPLINK_OPUS, 0, 0, 0];
        frame.extend(std::iter::repeat(0xab).take(crate::voice::MAX_OPUS_LEN + 1));
        assert!(decode_uplink_frame(&frame).is_none());
    }

    #[test]
    fn encodes_downlink_opus_with_expected_header_layout() {
        let encoded = encode_downlink_opus(7, 0, 42, false, &[0xab; 32]);
        assert_eq!(encoded[0], KIND_DOWNLINK_OPUS);
        assert_eq!(&encoded[1..5], &7u32.to_le_bytes());
        assert_eq!(encoded[5], 0);
        assert_eq!(encoded[6], 0);
        assert_eq!(&encoded[7..11], &42u32.to_le_bytes());
        assert_eq!(&encoded[11..], &[0xab; 32]);
    }
}

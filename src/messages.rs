//! Typed Mumble control messages, decoded from / encoded to the wire
//! format defined in [`crate::proto`]. Field numbers are fixed by the
//! upstream Mumble protocol; see the module docs there for which subset is
//! implemented.

use bytes::{Bytes, BytesMut};

use crate::proto::{
    decode_fields, write_bool_field, write_bytes_field, write_sint32_field, write_string_field,
    write_varint_field, MessageKind, RawField,
};

#[derive(Debug, Default, Clone)]
pub struct Version {
    pub version: u32,
    pub release: Option<String>,
    pub os: Option<String>,
    pub os_version: Option<String>,
}

impl Version {
    pub const PROTOCOL_1_4_0: u32 = (1 << 16) | (4 << 8);

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        write_varint_field(&mut buf, 1, u64::from(self.version));
        if let Some(release) = &self.release {
            write_string_field(&mut buf, 2, release);
        }
        if let Some(os) = &self.os {
            write_string_field(&mut buf, 3, os);
        }
        if let Some(os_version) = &self.os_version {
            write_string_field(&mut buf, 4, os_version);
        }
        buf
    }

    pub fn decode(body: Bytes) -> std::io::Result<Self> {
        let mut out = Version::default();
        for f in decode_fields(body)? {
            match f.field_number {
                1 => out.version = f.as_u32(),
                2 => out.release = Some(f.as_str()),
                3 => out.os = Some(f.as_str()),
                4 => out.os_version = Some(f.as_str()),
                _ => {}
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Default, Clone)]
pub struct Authenticate {
    pub username: String,
    pub password: Option<String>,
    pub tokens: Vec<String>,
    pub opus: bool,
    pub client_type: i32,
}

impl Authenticate {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        write_string_field(&mut buf, 1, &self.username);
        if let Some(password) = &self.password {
            write_string_field(&mut buf, 2, password);
        }
        for token in &self.tokens {
            write_string_field(&mut buf, 3, token);
        }
        write_bool_field(&mut buf, 5, self.opus);
        write_sint32_field(&mut buf, 6, self.client_type);
        buf
    }
}

#[derive(Debug, Default, Clone)]
pub struct Ping {
    pub timestamp: u64,
}

impl Ping {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        write_varint_field(&mut buf, 1, self.timestamp);
        buf
    }

    pub fn decode(body: Bytes) -> std::io::Result<Self> {
        let mut out = Ping::default();
        for f in decode_fields(body)? {
            if f.field_number == 1 {
                out.timestamp = f.as_u64();
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Default, Clone)]
pub struct Reject {
    pub reject_type: i32,
    pub reason: Option<String>,
}

impl Reject {
    pub fn decode(body: Bytes) -> std::io::Result<Self> {
        let mut out = Reject::default();
        for f in decode_fields(body)? {
            match f.field_number {
                1 => out.reject_type = f.as_i32(),
                2 => out.reason = Some(f.as_str()),
                _ => {}
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Default, Clone)]
pub struct ServerSync {
    pub session: u32,
    pub max_bandwidth: Option<u32>,
    pub welcome_text: Option<String>,
    pub permissions: Option<u64>,
}

impl ServerSync {
    pub fn decode(body: Bytes) -> std::io::Result<Self> {
        let mut out = ServerSync::default();
        for f in decode_fields(body)? {
            match f.field_number {
                1 => out.session = f.as_u32(),
                2 => out.max_bandwidth = Some(f.as_u32()),
                3 => out.welcome_text = Some(f.as_str()),
                4 => out.permissions = Some(f.as_u64()),
                _ => {}
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Default, Clone)]
pub struct ChannelState {
    pub channel_id: u32,
    pub parent: Option<u32>,
    pub name: Option<String>,
    pub links: Option<Vec<u32>>,
    pub links_add: Vec<u32>,
    pub links_remove: Vec<u32>,
    pub description: Option<String>,
    pub position: Option<i32>,
}

impl ChannelState {
    pub fn decode(body: Bytes) -> std::io::Result<Self> {
        let mut out = ChannelState::default();
        let mut links = Vec::new();
        let mut saw_links = false;

        for f in decode_fields(body)? {
            match f.field_number {
                1 => out.channel_id = f.as_u32(),
                2 => out.parent = Some(f.as_u32()),
                3 => out.name = Some(f.as_str()),
                4 => {
                    saw_links = true;
                    links.push(f.as_u32());
                }
                5 => out.description = Some(f.as_str()),
                6 => out.links_add.push(f.as_u32()),
                7 => out.links_remove.push(f.as_u32()),
                9 => out.position = Some(f.as_i32()),
                _ => {}
            }
        }

        if saw_links {
            out.links = Some(links);
        }

        Ok(out)
    }
}

#[derive(Debug, Default, Clone)]
pub struct ChannelRemove {
    pub channel_id: u32,
}

impl ChannelRemove {
    pub fn decode(body: Bytes) -> std::io::Result<Self> {
        let mut out = ChannelRemove::default();
        for f in decode_fields(body)? {
            if f.field_number == 1 {
                out.channel_id = f.as_u32();
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Default, Clone)]
pub struct UserState {
    pub session: u32,
    pub actor: Option<u32>,
    pub name: Option<String>,
    pub user_id: Option<u32>,
    pub channel_id: Option<u32>,
    pub mute: Option<bool>,
    pub deaf: Option<bool>,
    pub suppress: Option<bool>,
    pub self_mute: Option<bool>,
    pub self_deaf: Option<bool>,
}

impl UserState {
    /// Encodes only the subset the gateway sends outbound: `session` (when
    /// known) and `channel_id`, used for "join channel" requests.
    pub fn encode_join_channel(session: Option<u32>, channel_id: u32) -> BytesMut {
        let mut buf = BytesMut::new();
        if let Some(session) = session {
            write_varint_field(&mut buf, 1, u64::from(session));
        }
        write_varint_field(&mut buf, 5, u64::from(channel_id));
        buf
    }

    pub fn decode(body: Bytes) -> std::io::Result<Self> {
        let mut out = UserState::default();
        for f in decode_fields(body)? {
            match f.field_number {
                1 => out.session = f.as_u32(),
                2 => out.actor = Some(f.as_u32()),
                3 => out.name = Some(f.as_str()),
                4 => out.user_id = Some(f.as_u32()),
                5 => out.channel_id = Some(f.as_u32()),
                6 => out.mute = Some(f.as_bool()),
                7 => out.deaf = Some(f.as_bool()),
                8 => out.suppress = Some(f.as_bool()),
                9 => out.self_mute = Some(f.as_bool()),
                10 => out.self_deaf = Some(f.as_bool()),
                _ => {}
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Default, Clone)]
pub struct UserRemove {
    pub session: u32,
    pub actor: Option<u32>,
    pub reason: Option<String>,
    pub ban: bool,
}

impl UserRemove {
    pub fn decode(body: Bytes) -> std::io::Result<Self> {
        let mut out = UserRemove::default();
        for f in decode_fields(body)? {
            match f.field_number {
                1 => out.session = f.as_u32(),
                2 => out.actor = Some(f.as_u32()),
                3 => out.reason = Some(f.as_str()),
                4 => out.ban = f.as_bool(),
                _ => {}
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Default, Clone)]
pub struct TextMessage {
    pub actor: Option<u32>,
    pub session: Vec<u32>,
    pub channel_id: Vec<u32>,
    pub tree_id: Vec<u32>,
    pub message: String,
}

impl TextMessage {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        if let Some(actor) = self.actor {
            write_varint_field(&mut buf, 1, u64::from(actor));
        }
        for s in &self.session {
            write_varint_field(&mut buf, 2, u64::from(*s));
        }
        for c in &self.channel_id {
            write_varint_field(&mut buf, 3, u64::from(*c));
        }
        for t in &self.tree_id {
            write_varint_field(&mut buf, 4, u64::from(*t));
        }
        write_string_field(&mut buf, 5, &self.message);
        buf
    }

    pub fn decode(body: Bytes) -> std::io::Result<Self> {
        let mut out = TextMessage::default();
        for f in decode_fields(body)? {
            match f.field_number {
                1 => out.actor = Some(f.as_u32()),
                2 => out.session.push(f.as_u32()),
                3 => out.channel_id.push(f.as_u32()),
                4 => out.tree_id.push(f.as_u32()),
                5 => out.message = f.as_str(),
                _ => {}
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Default, Clone)]
pub struct PermissionDenied {
    pub permission: Option<u32>,
    pub channel_id: Option<u32>,
    pub session: Option<u32>,
    pub reason: Option<String>,
    pub deny_type: Option<i32>,
}

impl PermissionDenied {
    pub fn decode(body: Bytes) -> std::io::Result<Self> {
        let mut out = PermissionDenied::default();
        for f in decode_fields(body)? {
            match f.field_number {
                1 => out.permission = Some(f.as_u32()),
                2 => out.channel_id = Some(f.as_u32()),
                3 => out.session = Some(f.as_u32()),
                4 => out.reason = Some(f.as_str()),
                5 => out.deny_type = Some(f.as_i32()),
                _ => {}
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Default, Clone)]
pub struct CryptSetup {
    pub key: Option<Vec<u8>>,
    pub client_nonce: Option<Vec<u8>>,
    pub server_nonce: Option<Vec<u8>>,
}

impl CryptSetup {
    pub fn encode_client_nonce(client_nonce: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        write_bytes_field(&mut buf, 2, client_nonce);
        buf
    }

    pub fn decode(body: Bytes) -> std::io::Result<Self> {
        let mut out = CryptSetup::default();
        for f in decode_fields(body)? {
            match f.field_number {
                1 => out.key = Some(f.as_bytes().to_vec()),
                2 => out.client_nonce = Some(f.as_bytes().to_vec()),
                3 => out.server_nonce = Some(f.as_bytes().to_vec()),
                _ => {}
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Default, Clone)]
pub struct CodecVersion {
    pub alpha: i32,
    pub beta: i32,
    pub prefer_alpha: bool,
    pub opus: bool,
}

impl CodecVersion {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        write_sint32_field(&mut buf, 1, self.alpha);
        write_sint32_field(&mut buf, 2, self.beta);
        write_bool_field(&mut buf, 3, self.prefer_alpha);
        write_bool_field(&mut buf, 4, self.opus);
        buf
    }

    pub fn decode(body: Bytes) -> std::io::Result<Self> {
        let mut out = CodecVersion::default();
        for f in decode_fields(body)? {
            match f.field_number {
                1 => out.alpha = f.as_i32(),
                2 => out.beta = f.as_i32(),
                3 => out.prefer_alpha = f.as_bool(),
                4 => out.opus = f.as_bool(),
                _ => {}
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Default, Clone)]
pub struct UdpTunnel {
    pub packet: Vec<u8>,
}

impl UdpTunnel {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        write_bytes_field(&mut buf, 1, &self.packet);
        buf
    }

    pub fn decode(body: Bytes) -> std::io::Result<Self> {
        let mut out = UdpTunnel::default();
        for f in decode_fields(body)? {
            if f.field_number == 1 {
                out.packet = f.as_bytes().to_vec();
            }
        }
        Ok(out)
    }
}

/// A decoded incoming control message, tagged by the same [`MessageKind`]
/// the frame header carried.
#[derive(Debug)]
pub enum ControlMessage {
    Version(Version),
    UdpTunnel(UdpTunnel),
    Ping(Ping),
    Reject(Reject),
    ServerSync(ServerSync),
    ChannelRemove(ChannelRemove),
    ChannelState(ChannelState),
    UserRemove(UserRemove),
    UserState(UserState),
    TextMessage(TextMessage),
    PermissionDenied(PermissionDenied),
    CryptSetup(CryptSetup),
    CodecVersion(CodecVersion),
}

pub fn decode_control_message(kind: MessageKind, body: Bytes) -> std::io::Result<ControlMessage> {
    Ok(match kind {
        MessageKind::Version => ControlMessage::Version(Version::decode(body)?),
        MessageKind::UdpTunnel => ControlMessage::UdpTunnel(UdpTunnel::decode(body)?),
        MessageKind::Ping => ControlMessage::Ping(Ping::decode(body)?),
        MessageKind::Reject => ControlMessage::Reject(Reject::decode(body)?),
        MessageKind::ServerSync => ControlMessage::ServerSync(ServerSync::decode(body)?),
        MessageKind::ChannelRemove => ControlMessage::ChannelRemove(ChannelRemove::decode(body)?),
        MessageKind::ChannelState => ControlMessage::ChannelState(ChannelState::decode(body)?),
        MessageKind::UserRemove => ControlMessage::UserRemove(UserRemove::decode(body)?),
        MessageKind::UserState => ControlMessage::UserState(UserState::decode(body)?),
        MessageKind::TextMessage => ControlMessage::TextMessage(TextMessage::decode(body)?),
        MessageKind::PermissionDenied => ControlMessage::PermissionDenied(PermissionDenied::decode(body)?),
        MessageKind::CryptSetup => ControlMessage::CryptSetup(CryptSetup::decode(body)?),
        MessageKind::CodecVersion => ControlMessage::CodecVersion(CodecVersion::decode(body)?),
        MessageKind::Authenticate => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "Authenticate is client-to-server only",
            ))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_roundtrip() {
        let v = Version {
            version: Version::PROTOCOL_1_4_0,
            release: Some("gateway".into()),
            os: Some("linux".into()),
            os_version: None,
        };
        let decoded = Version::decode(v.encode().freeze()).unwrap();
        assert_eq!(decoded.version, Version::PROTOCOL_1_4_0);
        assert_eq!(decoded.release.as_deref(), Some("gateway"));
        assert_eq!(decoded.os.as_deref(), Some("linux"));
    }

    #[test]
    fn user_state_defaults_channel_to_absent() {
        let buf = BytesMut::new();
        let decoded = UserState::decode(buf.freeze()).unwrap();
        assert_eq!(decoded.channel_id, None);
    }

    #[test]
    fn channel_state_link_delta_vs_full_replace() {
        let mut full = BytesMut::new();
        write_varint_field(&mut full, 1, 5);
        write_varint_field(&mut full, 4, 1);
        write_varint_field(&mut full, 4, 2);
        let decoded = ChannelState::decode(full.freeze()).unwrap();
        assert_eq!(decoded.links, Some(vec![1, 2]));

        let mut delta = BytesMut::new();
        write_varint_field(&mut delta, 1, 5);
        write_varint_field(&mut delta, 6, 3);
        let decoded = ChannelState::decode(delta.freeze()).unwrap();
        assert_eq!(decoded.links, None);
        assert_eq!(decoded.links_add, vec![3]);
    }
}

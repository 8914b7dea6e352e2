//! TLS control channel to an upstream Mumble server (§4.4).
//!
//! Owns the outbound connection for the lifetime of one peer's session:
//! dials out, runs the `Version`/`Authenticate`/`CryptSetup` handshake,
//! then reads framed control messages off the stream forever and turns
//! them into [`ControlEvent`]s for the session orchestrator to act on.
//! Mirrors Zumble's `Client::init` handshake shape, just aimed the other
//! direction — we're the one sending `Authenticate` and receiving
//! `ServerSync`, not the one emitting `Version` first.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::rustls::{self, Certificate, OwnedTrustAnchor, RootCertStore};
use tokio_rustls::{client::TlsStream, TlsConnector};

use crate::error::MumbleError;
use crate::messages::{
    Authenticate, ChannelRemove, ChannelState, CodecVersion, ControlMessage, CryptSetup, PermissionDenied, Ping,
    Reject, ServerSync, TextMessage, UserRemove, UserState, Version,
};
use crate::proto::{write_frame, FrameReader, MessageKind};
use crate::sync::{RwLock, RwLockExt};

const CLIENT_RELEASE: &str = env!("CARGO_PKG_VERSION");
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Everything the control channel learned this tick, handed to the session
/// orchestrator over an mpsc channel so it never has to lock the write half
/// just to read state.
#[derive(Debug)]
pub enum ControlEvent {
    Synced { session: u32, welcome_text: Option<String> },
    CryptSetup(CryptSetup),
    ChannelState(ChannelState),
    ChannelRemove(ChannelRemove),
    UserState(UserState),
    UserRemove(UserRemove),
    TextMessage(TextMessage),
    PermissionDenied(PermissionDenied),
    Rejected { reject_type: i32, reason: Option<String> },
    Pong { rtt: Duration },
    UdpTunnelVoice(Bytes),
    /// The server's own `Version` announcement (distinct from the
    /// client→server `Version` this gateway sends during the handshake).
    ServerVersion(Version),
    CodecVersion(CodecVersion),
    Disconnected { reason: String },
}

pub struct ControlChannel {
    write: RwLock<WriteHalf<TlsStream<TcpStream>>>,
}

/// Connects out to `host:port`, optionally skipping certificate
/// verification (the whitelist's `tls.rejectUnauthorized: false` escape
/// hatch for self-signed native servers), and returns the raw TLS stream
/// before any Mumble handshake has happened.
pub async fn connect(
    host: &str,
    port: u16,
    reject_unauthorized: bool,
) -> Result<TlsStream<TcpStream>, MumbleError> {
    let tcp = TcpStream::connect((host, port)).await.map_err(MumbleError::Io)?;
    tcp.set_nodelay(true).ok();

    let mut roots = RootCertStore::empty();
    roots.add_server_trust_anchors(webpki_roots_anchors());
    let mut config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();

    if !reject_unauthorized {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoCertificateVerification));
    }

    let connector = TlsConnector::from(Arc::new(config));
    let server_name = rustls::ServerName::try_from(host)
        .map_err(|_| MumbleError::BadFrame("invalid server hostname".into()))?;

    tokio::time::timeout(HANDSHAKE_TIMEOUT, connector.connect(server_name, tcp))
        .await
        .map_err(|_| MumbleError::HandshakeTimeout)?
        .map_err(MumbleError::Io)
}

fn webpki_roots_anchors() -> impl Iterator<Item = OwnedTrustAnchor> {
    webpki_roots::TLS_SERVER_ROOTS.0.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(ta.subject, ta.spki, ta.name_constraints)
    })
}

struct NoCertificateVerification;

impl rustls::client::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

impl ControlChannel {
    /// Runs the handshake (our `Version` + `Authenticate`, then reading
    /// until `CryptSetup` arrives) and spawns the read loop. Returns the
    /// channel plus the receiving end of its event stream; the caller
    /// drives `events.recv()` in its own select loop.
    pub async fn handshake(
        mut stream: TlsStream<TcpStream>,
        username: String,
        tokens: Vec<String>,
    ) -> Result<(ControlChannel, mpsc::Receiver<ControlEvent>), MumbleError> {
        let version = Version {
            version: Version::PROTOCOL_1_4_0,
            release: Some(format!("gateway-{CLIENT_RELEASE}")),
            os: Some(std::env::consts::OS.to_string()),
            os_version: Some(std::env::consts::FAMILY.to_string()),
        };

        let mut out = BytesMut::new();
        write_frame(&mut out, MessageKind::Version, &version.encode());
        stream.write_all(&out).await.map_err(MumbleError::Io)?;

        let auth = Authenticate {
            username,
            password: None,
            tokens,
            opus: true,
            client_type: 0,
        };
        let mut out = BytesMut::new();
        write_frame(&mut out, MessageKind::Authenticate, &auth.encode());
        stream.write_all(&out).await.map_err(MumbleError::Io)?;

        let (read_half, write_half) = tokio::io::split(stream);

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(read_loop(read_half, tx));

        Ok((ControlChannel { write: RwLock::new(write_half) }, rx))
    }

    async fn send_frame(&self, kind: MessageKind, body: &[u8]) -> Result<(), MumbleError> {
        let mut out = BytesMut::new();
        write_frame(&mut out, kind, body);
        let mut write = self.write.write_err().await?;
        write.write_all(&out).await.map_err(MumbleError::Io)
    }

    pub async fn send_ping(&self, timestamp: u64) -> Result<(), MumbleError> {
        self.send_frame(MessageKind::Ping, &Ping { timestamp }.encode()).await
    }

    pub async fn join_channel(&self, channel_id: u32) -> Result<(), MumbleError> {
        self.send_frame(MessageKind::UserState, &UserState::encode_join_channel(None, channel_id)).await
    }

    pub async fn send_text(&self, channel_id: u32, message: String) -> Result<(), MumbleError> {
        let text = TextMessage {
            actor: None,
            session: Vec::new(),
            channel_id: vec![channel_id],
            tree_id: Vec::new(),
            message,
        };
        self.send_frame(MessageKind::TextMessage, &text.encode()).await
    }

    pub async fn send_udp_tunnel(&self, packet: Vec<u8>) -> Result<(), MumbleError> {
        self.send_frame(MessageKind::UdpTunnel, &crate::messages::UdpTunnel { packet }.encode()).await
    }
}

async fn read_loop(mut read: tokio::io::ReadHalf<TlsStream<TcpStream>>, tx: mpsc::Sender<ControlEvent>) {
    let mut reader = FrameReader::new();
    let mut scratch = [0u8; 8192];

    loop {
        let n = match read.read(&mut scratch).await {
            Ok(0) => {
                let _ = tx.send(ControlEvent::Disconnected { reason: "mumble_disconnect".into() }).await;
                return;
            }
            Ok(n) => n,
            Err(e) => {
                let _ = tx.send(ControlEvent::Disconnected { reason: format!("io error: {e}") }).await;
                return;
            }
        };

        reader.feed(&scratch[..n]);

        loop {
            match reader.next_frame() {
                Ok(Some((kind, body))) => {
                    if let Some(event) = dispatch(kind, body) {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("control frame error: {e}");
                    let _ = tx.send(ControlEvent::Disconnected { reason: format!("framing error: {e}") }).await;
                    return;
                }
            }
        }
    }
}

fn dispatch(kind: MessageKind, body: Bytes) -> Option<ControlEvent> {
    let message = match crate::messages::decode_control_message(kind, body) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!("failed to decode {kind}: {e}");
            return None;
        }
    };

    Some(match message {
        ControlMessage::ServerSync(sync) => ControlEvent::Synced { session: sync.session, welcome_text: sync.welcome_text },
        ControlMessage::CryptSetup(setup) => ControlEvent::CryptSetup(setup),
        ControlMessage::ChannelState(state) => ControlEvent::ChannelState(state),
        ControlMessage::ChannelRemove(remove) => ControlEvent::ChannelRemove(remove),
        ControlMessage::UserState(state) => ControlEvent::UserState(state),
        ControlMessage::UserRemove(remove) => ControlEvent::UserRemove(remove),
        ControlMessage::TextMessage(text) => ControlEvent::TextMessage(text),
        ControlMessage::PermissionDenied(denied) => ControlEvent::PermissionDenied(denied),
        ControlMessage::Reject(reject) => ControlEvent::Rejected { reject_type: reject.reject_type, reason: reject.reason },
        ControlMessage::Ping(ping) => {
            let now = crate::time::monotonic_millis();
            let sent = ping.timestamp;
            let rtt = Duration::from_millis(now.saturating_sub(sent));
            ControlEvent::Pong { rtt }
        }
        ControlMessage::UdpTunnel(tunnel) => ControlEvent::UdpTunnelVoice(Bytes::from(tunnel.packet)),
        ControlMessage::Version(version) => ControlEvent::ServerVersion(version),
        ControlMessage::CodecVersion(codec) => ControlEvent::CodecVersion(codec),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_ping_computes_rtt_from_echoed_timestamp() {
        let sent = crate::time::monotonic_millis().saturating_sub(5);
        let body = Ping { timestamp: sent }.encode().freeze();
        let event = dispatch(MessageKind::Ping, body).unwrap();
        match event {
            ControlEvent::Pong { rtt } => assert!(rtt.as_millis() >= 0),
            _ => panic!("expected Pong"),
        }
    }

    #[test]
    fn dispatch_surfaces_server_version_announcement() {
        let body = Version { version: Version::PROTOCOL_1_4_0, ..Version::default() }.encode().freeze();
        match dispatch(MessageKind::Version, body).unwrap() {
            ControlEvent::ServerVersion(v) => assert_eq!(v.version, Version::PROTOCOL_1_4_0),
            other => panic!("expected ServerVersion, got {other:?}"),
        }
    }

    #[test]
    fn dispatch_surfaces_codec_version_announcement() {
        let body = CodecVersion { alpha: 0, beta: -1, prefer_alpha: true, opus: true }.encode().freeze();
        match dispatch(MessageKind::CodecVersion, body).unwrap() {
            ControlEvent::CodecVersion(c) => assert!(c.opus),
            other => panic!("expected CodecVersion, got {other:?}"),
        }
    }
}

//! Ties the TLS control channel and the UDP/tunnel voice path into one
//! upstream Mumble session (§4.6). Owned exclusively by the per-peer
//! supervisor — nothing else ever touches a `MumbleSession` concurrently.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::error::MumbleError;
use crate::mumble::control::{self, ControlChannel, ControlEvent};
use crate::mumble::voice_client::{self, VoiceClient, VoiceClientEvent, VoiceLinkState};
use crate::registry::Registry;
use crate::sync::{RwLock, RwLockExt};
use crate::voice::{Serverbound, VoicePacket};

const SYNC_TIMEOUT: Duration = Duration::from_secs(15);
const UDP_FALLBACK_TIMEOUT: Duration = Duration::from_millis(2500);
const DEDUP_EVICT_AGE: Duration = Duration::from_millis(1500);
const DEDUP_SOFT_CAP: usize = 2048;
const DEDUP_HARD_CAP: usize = 4096;
const VOICE_CHANNEL_CAPACITY: usize = 64;
/// Below this many free slots in the outbound voice channel, the uplink
/// pacer treats the session as congested (§4.7) rather than waiting to
/// observe an actual `try_send` failure.
const UPLINK_CONGESTION_FREE_SLOTS: usize = 8;

/// Whether outbound voice currently travels over UDP or falls back to the
/// TCP tunnel embedded in control frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceTransport {
    Udp,
    Tunnel,
}

#[derive(Debug)]
pub enum SessionEvent {
    Synced { session: u32, welcome_text: Option<String> },
    ChannelUpserted(crate::registry::Channel),
    ChannelRemoved { channel_id: u32 },
    UserUpserted(crate::registry::User),
    UserRemoved { user_id: u32 },
    TextMessage(crate::messages::TextMessage),
    PermissionDenied(crate::messages::PermissionDenied),
    Rejected { reject_type: i32, reason: Option<String> },
    VoiceTransportChanged(VoiceTransport),
    /// Control-plane keepalive RTT sample (§4.4), echoed back from a `Ping`
    /// this session sent. Triggers an out-of-band metrics emission in
    /// addition to the regular 2s cadence.
    ServerRtt { rtt_ms: u64 },
    IncomingVoice {
        session_id: u32,
        target: u8,
        sequence: u64,
        opus: bytes::Bytes,
        is_last_frame: bool,
    },
    Disconnected { reason: String },
}

pub struct MumbleSession {
    control: ControlChannel,
    voice_tx: Option<mpsc::Sender<VoicePacket<Serverbound>>>,
    transport: VoiceTransport,
    registry: Arc<RwLock<Registry>>,
    next_sequence: u64,
    dedup: VoiceDedup,
}

/// Dual-path de-duplication table for voice arriving redundantly over UDP
/// and the tunnel, keyed on `(sessionId, target, sequence)`. Split out of
/// `MumbleSession` so it can be exercised without a live control channel.
#[derive(Default)]
struct VoiceDedup {
    seen: HashMap<(u32, u8, u64), Instant>,
}

impl VoiceDedup {
    /// Returns `true` the first time this triple is seen, `false` on a
    /// repeat. Evicts entries older than 1.5s once the table exceeds 2048
    /// entries, and hard-clears if it is still oversized after that pass.
    fn observe(&mut self, session_id: u32, target: u8, sequence: u64) -> bool {
        let key = (session_id, target, sequence);
        let now = Instant::now();

        if self.seen.contains_key(&key) {
            return false;
        }

        if self.seen.len() > DEDUP_SOFT_CAP {
            self.seen.retain(|_, seen_at| now.duration_since(*seen_at) < DEDUP_EVICT_AGE);
            if self.seen.len() > DEDUP_HARD_CAP {
                self.seen.clear();
            }
        }

        self.seen.insert(key, now);
        true
    }
}

impl MumbleSession {
    /// Dials out, runs the control handshake, and blocks until either
    /// `ServerSync` arrives or `SYNC_TIMEOUT` elapses. On success spawns the
    /// background control-read and UDP-voice tasks and returns a session
    /// plus the merged event stream the supervisor should poll.
    pub async fn connect(
        host: &str,
        port: u16,
        reject_unauthorized: bool,
        username: String,
        tokens: Vec<String>,
    ) -> Result<(MumbleSession, mpsc::Receiver<SessionEvent>), MumbleError> {
        let stream = control::connect(host, port, reject_unauthorized).await?;
        let (control, mut control_events) = ControlChannel::handshake(stream, username, tokens).await?;

        let (event_tx, event_rx) = mpsc::channel(256);
        let registry = Arc::new(RwLock::new(Registry::new()));
        let mut session = MumbleSession {
            control,
            voice_tx: None,
            transport: VoiceTransport::Tunnel,
            registry: registry.clone(),
            next_sequence: 0,
            dedup: VoiceDedup::default(),
        };

        let remote: SocketAddr = tokio::net::lookup_host((host, port))
            .await
            .map_err(MumbleError::Io)?
            .next()
            .ok_or_else(|| MumbleError::BadFrame("could not resolve server address".into()))?;

        let synced = timeout(SYNC_TIMEOUT, pump_until_synced(&registry, &mut control_events, event_tx.clone()))
            .await
            .map_err(|_| MumbleError::Timeout)??;

        let voice_client = VoiceClient::connect(remote).await.map_err(MumbleError::Io)?;
        session.start_voice(voice_client, synced, control_events, event_tx.clone());

        Ok((session, event_rx))
    }

    fn start_voice(
        &mut self,
        mut voice_client: VoiceClient,
        key_material: CryptKeyMaterial,
        mut control_events: mpsc::Receiver<ControlEvent>,
        event_tx: mpsc::Sender<SessionEvent>,
    ) {
        voice_client.install_key(&key_material.key, &key_material.client_nonce, &key_material.server_nonce);

        let (audio_tx, audio_rx) = mpsc::channel::<VoicePacket<Serverbound>>(VOICE_CHANNEL_CAPACITY);
        self.voice_tx = Some(audio_tx);

        let (voice_event_tx, mut voice_events) = mpsc::channel(256);
        tokio::spawn(voice_client::run(voice_client, voice_event_tx, audio_rx));

        let fallback_deadline = tokio::time::sleep(UDP_FALLBACK_TIMEOUT);
        tokio::pin!(fallback_deadline);
        let mut udp_ready = false;
        let mut fallback_fired = false;
        let registry = self.registry.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe_ctrl = control_events.recv() => {
                        match maybe_ctrl {
                            Some(event) => forward_control_event(event, &registry, &event_tx).await,
                            None => {
                                let _ = event_tx.send(SessionEvent::Disconnected { reason: "mumble_disconnect".into() }).await;
                                return;
                            }
                        }
                    }
                    Some(event) = voice_events.recv() => {
                        match event {
                            VoiceClientEvent::StateChanged(VoiceLinkState::UdpReady) => {
                                udp_ready = true;
                                let _ = event_tx.send(SessionEvent::VoiceTransportChanged(VoiceTransport::Udp)).await;
                            }
                            VoiceClientEvent::StateChanged(_) => {}
                            VoiceClientEvent::Audio(packet, _outcome) => {
                                if let VoicePacket::Audio { target, session_id, sequence, opus, is_last_frame, .. } = packet {
                                    let _ = event_tx.send(SessionEvent::IncomingVoice {
                                        session_id, target, sequence, opus, is_last_frame,
                                    }).await;
                                }
                            }
                        }
                    }
                    _ = &mut fallback_deadline, if !udp_ready && !fallback_fired => {
                        fallback_fired = true;
                        let _ = event_tx.send(SessionEvent::VoiceTransportChanged(VoiceTransport::Tunnel)).await;
                    }
                }
            }
        });
    }

    /// Forwards one outbound voice frame, choosing UDP if it's ready and
    /// falling back to the tunnel otherwise, with a monotonically
    /// increasing sequence number per §4.6.
    pub async fn send_voice(&mut self, target: u8, opus: bytes::Bytes, is_last_frame: bool) -> Result<(), MumbleError> {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        let packet = VoicePacket::<Serverbound>::Audio {
            _dst: std::marker::PhantomData,
            target,
            session_id: (),
            sequence,
            opus,
            is_last_frame,
        };

        if self.transport == VoiceTransport::Udp {
            if let Some(tx) = &self.voice_tx {
                if tx.try_send(packet.clone()).is_ok() {
                    return Ok(());
                }
            }
        }

        let mut encoded = bytes::BytesMut::new();
        crate::voice::encode_voice_packet(&packet, &mut encoded)
            .map_err(|e| MumbleError::BadFrame(e.to_string()))?;
        self.control.send_udp_tunnel(encoded.to_vec()).await
    }

    pub fn set_transport(&mut self, transport: VoiceTransport) {
        self.transport = transport;
    }

    /// Best-effort congestion probe for the uplink pacer (§4.7): true once
    /// the outbound voice channel's free capacity drops below the reserve,
    /// i.e. `send_voice` is falling behind actually writing packets out.
    pub fn uplink_congested(&self) -> bool {
        match &self.voice_tx {
            Some(tx) => tx.capacity() < UPLINK_CONGESTION_FREE_SLOTS,
            None => false,
        }
    }

    pub async fn join_channel(&self, channel_id: u32) -> Result<(), MumbleError> {
        self.control.join_channel(channel_id).await
    }

    pub async fn send_text(&self, channel_id: u32, message: String) -> Result<(), MumbleError> {
        self.control.send_text(channel_id, message).await
    }

    pub async fn send_ping(&self) -> Result<(), MumbleError> {
        self.control.send_ping(crate::time::monotonic_millis()).await
    }

    /// Returns a cheaply-cloneable handle to the shared registry, for
    /// peer-facing code that needs to read a snapshot.
    pub fn registry_handle(&self) -> Arc<RwLock<Registry>> {
        self.registry.clone()
    }

    pub fn dedup_voice(&mut self, session_id: u32, target: u8, sequence: u64) -> bool {
        self.dedup.observe(session_id, target, sequence)
    }
}

struct CryptKeyMaterial {
    key: Vec<u8>,
    client_nonce: Vec<u8>,
    server_nonce: Vec<u8>,
}

/// Drains control events until `ServerSync` + `CryptSetup` have both been
/// seen (order is not guaranteed by the server), applying registry updates
/// as they arrive so nothing is lost before synced.
async fn pump_until_synced(
    registry: &Arc<RwLock<Registry>>,
    control_events: &mut mpsc::Receiver<ControlEvent>,
    event_tx: mpsc::Sender<SessionEvent>,
) -> Result<CryptKeyMaterial, MumbleError> {
    let mut crypt_setup = None;
    let mut session_id = None;

    loop {
        let event = control_events.recv().await.ok_or(MumbleError::ConnectionClosed)?;
        match event {
            ControlEvent::CryptSetup(setup) => crypt_setup = Some(setup),
            ControlEvent::Synced { session, welcome_text } => {
                session_id = Some(session);
                let mut registry = registry.write_err().await?;
                registry.server_info.self_user_id = session;
                registry.server_info.welcome_message = welcome_text.clone();
                registry.server_info.synced = true;
                drop(registry);
                let _ = event_tx.send(SessionEvent::Synced { session, welcome_text }).await;
            }
            ControlEvent::Rejected { reject_type, reason } => {
                return Err(MumbleError::Rejected(reason.unwrap_or_else(|| format!("type {reject_type}"))));
            }
            ControlEvent::ChannelState(state) => registry.write_err().await?.apply_channel_state(state),
            ControlEvent::UserState(state) => registry.write_err().await?.apply_user_state(state),
            ControlEvent::ServerVersion(version) => registry.write_err().await?.server_info.version = Some(version.version),
            ControlEvent::CodecVersion(codec) => registry.write_err().await?.server_info.opus = Some(codec.opus),
            ControlEvent::Disconnected { reason } => return Err(MumbleError::Rejected(reason)),
            _ => {}
        }

        if let (Some(setup), Some(_session)) = (&crypt_setup, session_id) {
            let (key, client_nonce, server_nonce) = match (&setup.key, &setup.client_nonce, &setup.server_nonce) {
                (Some(k), Some(c), Some(s)) => (k.clone(), c.clone(), s.clone()),
                _ => continue,
            };
            return Ok(CryptKeyMaterial { key, client_nonce, server_nonce });
        }
    }
}

async fn forward_control_event(event: ControlEvent, registry: &Arc<RwLock<Registry>>, tx: &mpsc::Sender<SessionEvent>) {
    let forwarded = match event {
        ControlEvent::ChannelState(state) => {
            let channel_id = state.channel_id;
            let mut registry = match registry.write_err().await {
                Ok(registry) => registry,
                Err(_) => return,
            };
            registry.apply_channel_state(state);
            registry.channel(channel_id).cloned().map(SessionEvent::ChannelUpserted)
        }
        ControlEvent::ChannelRemove(remove) => {
            if let Ok(mut registry) = registry.write_err().await {
                registry.remove_channel(remove.channel_id);
            }
            Some(SessionEvent::ChannelRemoved { channel_id: remove.channel_id })
        }
        ControlEvent::UserState(state) => {
            let session = state.session;
            let mut registry = match registry.write_err().await {
                Ok(registry) => registry,
                Err(_) => return,
            };
            registry.apply_user_state(state);
            registry.user(session).cloned().map(SessionEvent::UserUpserted)
        }
        ControlEvent::UserRemove(remove) => {
            if let Ok(mut registry) = registry.write_err().await {
                registry.remove_user(remove.session);
            }
            Some(SessionEvent::UserRemoved { user_id: remove.session })
        }
        ControlEvent::TextMessage(text) => Some(SessionEvent::TextMessage(text)),
        ControlEvent::PermissionDenied(denied) => Some(SessionEvent::PermissionDenied(denied)),
        ControlEvent::Rejected { reject_type, reason } => Some(SessionEvent::Rejected { reject_type, reason }),
        ControlEvent::Disconnected { reason } => Some(SessionEvent::Disconnected { reason }),
        ControlEvent::Pong { rtt } => Some(SessionEvent::ServerRtt { rtt_ms: rtt.as_millis() as u64 }),
        ControlEvent::UdpTunnelVoice(packet) => {
            match crate::voice::decode_voice_packet::<crate::voice::Clientbound>(&packet) {
                Ok(crate::voice::VoicePacket::Audio { session_id, target, sequence, opus, is_last_frame, .. }) => {
                    Some(SessionEvent::IncomingVoice { session_id, target, sequence, opus, is_last_frame })
                }
                Ok(crate::voice::VoicePacket::Ping { .. }) => None,
                Err(e) => {
                    tracing::debug!("dropping malformed tunnelled voice packet: {e}");
                    None
                }
            }
        }
        ControlEvent::ServerVersion(version) => {
            if let Ok(mut registry) = registry.write_err().await {
                registry.server_info.version = Some(version.version);
            }
            None
        }
        ControlEvent::CodecVersion(codec) => {
            if let Ok(mut registry) = registry.write_err().await {
                registry.server_info.opus = Some(codec.opus);
            }
            None
        }
        ControlEvent::Synced { .. } | ControlEvent::CryptSetup(_) => None,
    };

    if let Some(event) = forwarded {
        let _ = tx.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_rejects_exact_repeat_and_allows_distinct_sequence() {
        let mut dedup = VoiceDedup::default();
        assert!(dedup.observe(7, 0, 1));
        assert!(!dedup.observe(7, 0, 1));
        assert!(dedup.observe(7, 0, 2));
    }

    #[test]
    fn dedup_distinguishes_by_target_and_session() {
        let mut dedup = VoiceDedup::default();
        assert!(dedup.observe(7, 0, 1));
        assert!(dedup.observe(7, 1, 1));
        assert!(dedup.observe(8, 0, 1));
    }

    #[tokio::test]
    async fn forward_control_event_emits_user_upsert_with_merged_state() {
        let registry = Arc::new(RwLock::new(Registry::new()));
        let (tx, mut rx) = mpsc::channel(8);

        forward_control_event(
            ControlEvent::UserState(crate::messages::UserState {
                session: 7,
                name: Some("alice".into()),
                ..Default::default()
            }),
            &registry,
            &tx,
        )
        .await;

        match rx.recv().await.unwrap() {
            SessionEvent::UserUpserted(user) => {
                assert_eq!(user.id, 7);
                assert_eq!(user.name, "alice");
                assert_eq!(user.channel_id, 0);
            }
            other => panic!("expected UserUpserted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn forward_control_event_emits_channel_remove() {
        let registry = Arc::new(RwLock::new(Registry::new()));
        let (tx, mut rx) = mpsc::channel(8);

        forward_control_event(ControlEvent::ChannelRemove(crate::messages::ChannelRemove { channel_id: 3 }), &registry, &tx).await;

        match rx.recv().await.unwrap() {
            SessionEvent::ChannelRemoved { channel_id } => assert_eq!(channel_id, 3),
            other => panic!("expected ChannelRemoved, got {other:?}"),
        }
    }
}

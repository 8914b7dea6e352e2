//! UDP voice path to the upstream Mumble server (§4.5).
//!
//! Runs a small state machine: `NoKey` until a `CryptSetup` arrives on the
//! control channel, `KeyedNotReady` while probing the UDP path with pings,
//! and `UdpReady` once a ping round-trip actually completes over UDP. The
//! session orchestrator falls back to the TCP tunnel until `UdpReady` is
//! reached, and forever after if the fallback timer in §4.6 fires first.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::crypt::{CryptState, DecryptOutcome};
use crate::voice::{Clientbound, VoicePacket};

const PING_INTERVAL: Duration = Duration::from_secs(5);
const RTT_HISTORY_CAP: usize = 10;
const MAX_DATAGRAM: usize = 2048;

fn codec_err_to_io(e: crate::voice::VoiceCodecError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, e)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceLinkState {
    NoKey,
    KeyedNotReady,
    UdpReady,
}

pub enum VoiceClientEvent {
    StateChanged(VoiceLinkState),
    Audio(VoicePacket<Clientbound>, DecryptOutcome),
}

pub struct VoiceClient {
    socket: Arc<UdpSocket>,
    crypt: CryptState,
    state: VoiceLinkState,
    rtt_history: VecDeque<Duration>,
    last_ping_sent_at: Option<Instant>,
}

impl VoiceClient {
    pub async fn connect(remote: SocketAddr) -> std::io::Result<Self> {
        let local_addr: SocketAddr = if remote.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" }.parse().unwrap();
        let socket = UdpSocket::bind(local_addr).await?;
        socket.connect(remote).await?;

        Ok(VoiceClient {
            socket: Arc::new(socket),
            crypt: CryptState::default(),
            state: VoiceLinkState::NoKey,
            rtt_history: VecDeque::with_capacity(RTT_HISTORY_CAP),
            last_ping_sent_at: None,
        })
    }

    pub fn state(&self) -> VoiceLinkState {
        self.state
    }

    pub fn install_key(&mut self, key: &[u8], client_nonce: &[u8], server_nonce: &[u8]) {
        self.crypt.set_key(key, client_nonce, server_nonce);
        self.state = VoiceLinkState::KeyedNotReady;
    }

    pub fn rtt_average(&self) -> Option<Duration> {
        if self.rtt_history.is_empty() {
            return None;
        }
        let total: Duration = self.rtt_history.iter().sum();
        Some(total / self.rtt_history.len() as u32)
    }

    /// Sends one encrypted ping datagram if it's time, per the 5s cadence.
    pub async fn maybe_ping(&mut self) -> std::io::Result<()> {
        if self.state == VoiceLinkState::NoKey {
            return Ok(());
        }
        let due = match self.last_ping_sent_at {
            None => true,
            Some(at) => at.elapsed() >= PING_INTERVAL,
        };
        if !due {
            return Ok(());
        }

        let mut payload = bytes::BytesMut::new();
        let ping = VoicePacket::<crate::voice::Serverbound>::Ping { timestamp: crate::time::monotonic_millis() };
        self.crypt.encrypt(&ping, &mut payload).map_err(codec_err_to_io)?;
        self.socket.send(&payload).await?;
        self.last_ping_sent_at = Some(Instant::now());
        Ok(())
    }

    /// Encrypts and sends one voice frame over UDP. Fails without sending
    /// anything if the frame doesn't fit the legacy codec (e.g. an
    /// oversized Opus payload) rather than panicking; callers should
    /// already be rejecting oversized frames at the browser-facing
    /// boundary, but this stays defensive in case that guard is ever
    /// bypassed further up the call chain.
    pub async fn send_audio(&mut self, packet: &VoicePacket<crate::voice::Serverbound>) -> std::io::Result<()> {
        let mut payload = bytes::BytesMut::new();
        self.crypt.encrypt(packet, &mut payload).map_err(codec_err_to_io)?;
        self.socket.send(&payload).await?;
        Ok(())
    }

    /// Reads one datagram (non-blocking caller responsibility: wrap in
    /// `tokio::select!`), decrypts it, and updates link state/RTT history.
    pub async fn recv(&mut self) -> std::io::Result<Option<VoiceClientEvent>> {
        let mut buf = [0u8; MAX_DATAGRAM];
        let n = self.socket.recv(&mut buf).await?;

        let Some((packet, outcome)) = self.crypt.decrypt::<Clientbound>(&buf[..n]) else {
            return Ok(None);
        };

        if let VoicePacket::Ping { timestamp } = &packet {
            let now = crate::time::monotonic_millis();
            let rtt = Duration::from_millis(now.saturating_sub(*timestamp));
            if self.rtt_history.len() == RTT_HISTORY_CAP {
                self.rtt_history.pop_front();
            }
            self.rtt_history.push_back(rtt);

            if self.state != VoiceLinkState::UdpReady {
                self.state = VoiceLinkState::UdpReady;
                return Ok(Some(VoiceClientEvent::StateChanged(VoiceLinkState::UdpReady)));
            }
            return Ok(None);
        }

        Ok(Some(VoiceClientEvent::Audio(packet, outcome)))
    }
}

/// Drives the ping cadence, drains outbound audio handed in over
/// `audio_rx`, and forwards decoded inbound events to `tx`, until the
/// socket errors out or both channels close. Spawned by the session
/// orchestrator once a key has been installed; owns the only mutable
/// handle to the `CryptState`, so encrypt and decrypt never race.
pub async fn run(
    mut client: VoiceClient,
    tx: mpsc::Sender<VoiceClientEvent>,
    mut audio_rx: mpsc::Receiver<VoicePacket<crate::voice::Serverbound>>,
) {
    let mut ping_tick = tokio::time::interval(Duration::from_millis(500));

    loop {
        tokio::select! {
            _ = ping_tick.tick() => {
                if let Err(e) = client.maybe_ping().await {
                    tracing::debug!("udp ping send failed: {e}");
                }
            }
            maybe_packet = audio_rx.recv() => {
                match maybe_packet {
                    Some(packet) => {
                        if let Err(e) = client.send_audio(&packet).await {
                            tracing::debug!("udp voice send failed: {e}");
                        }
                    }
                    None => return,
                }
            }
            result = client.recv() => {
                match result {
                    Ok(Some(event)) => {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::debug!("udp recv failed: {e}");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtt_history_caps_at_ten_entries() {
        let mut history = VecDeque::with_capacity(RTT_HISTORY_CAP);
        for i in 0..15u64 {
            if history.len() == RTT_HISTORY_CAP {
                history.pop_front();
            }
            history.push_back(Duration::from_millis(i));
        }
        assert_eq!(history.len(), RTT_HISTORY_CAP);
        assert_eq!(history.front(), Some(&Duration::from_millis(5)));
    }
}

//! Per-peer session supervisor (§4.8). One instance per browser WebSocket
//! connection, owning at most one [`MumbleSession`] at a time and the
//! uplink pacer feeding it. The WebSocket actor in `ws` hands this the raw
//! JSON/binary frames it receives and forwards whatever comes back out on
//! `outbox` to the socket.
//!
//! Mirrors the suspension-point discipline called for by an event loop that
//! can tear its own session down mid-await: every background task checks a
//! generation counter before acting, so a stale event from a session that
//! has already been replaced or closed is silently dropped instead of
//! corrupting the new one.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::config::{GatewayConfig, Whitelist};
use crate::error::ErrorCode;
use crate::metrics;
use crate::mumble::session::{MumbleSession, SessionEvent};
use crate::peer::pacer::{self, Pacer, UplinkFrame, UplinkSink};
use crate::peer::protocol::{ChannelView, GatewayMessage, MetricsSnapshot, UplinkVoiceFrame, UserView};
use crate::sync::RwLockExt;

pub enum Outbound {
    Json(GatewayMessage),
    Binary(Vec<u8>),
}

/// Above this many bytes sitting unwritten in the outbox, voice frames are
/// dropped instead of queued (§4.7); control messages are never dropped.
const DOWNLINK_BACKPRESSURE_LIMIT: usize = 2 * 1024 * 1024;

pub struct Supervisor {
    whitelist: Arc<Whitelist>,
    config: GatewayConfig,
    outbox: mpsc::Sender<Outbound>,
    downlink_pending_bytes: Arc<AtomicUsize>,
    generation: Arc<AtomicU64>,
    session: Option<SessionHandle>,
}

struct SessionHandle {
    server_id: String,
    uplink_tx: mpsc::Sender<UplinkFrame>,
    control: Arc<tokio::sync::Mutex<MumbleSession>>,
    metrics: Arc<PeerMetrics>,
}

#[derive(Default)]
struct PeerMetrics {
    uplink_frames: AtomicU64,
    uplink_bytes: AtomicU64,
    downlink_frames: AtomicU64,
    downlink_bytes: AtomicU64,
    uplink_dropped: Arc<AtomicU64>,
    downlink_dropped: AtomicU64,
}

/// Counter values captured at the previous metrics tick, so `emit_metrics`
/// can turn monotonic totals into per-interval rates (§4.7).
#[derive(Default)]
struct RateSample {
    uplink_frames: u64,
    uplink_bytes: u64,
    downlink_frames: u64,
    downlink_bytes: u64,
    at: Option<std::time::Instant>,
}

impl Supervisor {
    pub fn new(
        whitelist: Arc<Whitelist>,
        config: GatewayConfig,
        outbox: mpsc::Sender<Outbound>,
        downlink_pending_bytes: Arc<AtomicUsize>,
    ) -> Self {
        Supervisor { whitelist, config, outbox, downlink_pending_bytes, generation: Arc::new(AtomicU64::new(0)), session: None }
    }

    /// Sends the `serverList` envelope. Called once, right after the socket
    /// opens, per §4.8 step 1.
    pub async fn send_server_list(&self) {
        let _ = self
            .outbox
            .send(Outbound::Json(GatewayMessage::ServerList { servers: self.whitelist.as_summary() }))
            .await;
    }

    pub async fn handle_connect(
        &mut self,
        server_id: String,
        username: String,
        _password: Option<String>,
        tokens: Option<Vec<String>>,
    ) {
        self.teardown("client_disconnect").await;

        let Some((host, port, reject_unauthorized)) = crate::config::resolve_server(&self.whitelist, &server_id)
        else {
            self.send_error(ErrorCode::UnknownServer, "unknown serverId", None).await;
            return;
        };

        let my_generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let connect_result =
            MumbleSession::connect(&host, port, reject_unauthorized, username, tokens.unwrap_or_default()).await;

        if self.generation.load(Ordering::SeqCst) != my_generation {
            // A newer connect (or a disconnect) raced ahead of us while we
            // awaited the handshake; this result is stale.
            return;
        }

        let (session, mut events) = match connect_result {
            Ok(pair) => pair,
            Err(e) => {
                metrics::CONNECTION_ATTEMPTS_TOTAL.with_label_values(&["error"]).inc();
                self.send_error(ErrorCode::ConnectFailed, &e.to_string(), None).await;
                return;
            }
        };
        metrics::CONNECTION_ATTEMPTS_TOTAL.with_label_values(&["ok"]).inc();
        metrics::ACTIVE_SESSIONS.with_label_values(&["connected"]).inc();

        let metrics = Arc::new(PeerMetrics::default());
        let control = Arc::new(tokio::sync::Mutex::new(session));

        let (uplink_tx, uplink_rx) = mpsc::channel::<UplinkFrame>(256);
        let pacer = Pacer::new(self.config.pacing.clone()).with_drop_counter(metrics.uplink_dropped.clone());
        let sink = SessionSink { control: control.clone(), generation: self.generation.clone(), my_generation };
        tokio::spawn(pacer::run(pacer, uplink_rx, sink));
        tokio::spawn(run_keepalive(control.clone(), self.generation.clone(), my_generation));

        self.session = Some(SessionHandle { server_id: server_id.clone(), uplink_tx, control: control.clone(), metrics: metrics.clone() });

        let outbox = self.outbox.clone();
        let downlink_pending_bytes = self.downlink_pending_bytes.clone();
        let generation = self.generation.clone();
        let control_for_events = control.clone();
        tokio::spawn(async move {
            run_event_loop(server_id, control_for_events, &mut events, outbox, downlink_pending_bytes, generation, my_generation, metrics).await;
        });
    }

    pub async fn handle_disconnect(&mut self) {
        self.teardown("client_disconnect").await;
    }

    pub async fn handle_join_channel(&mut self, channel_id: u32) {
        let Some(handle) = &self.session else {
            self.send_error(ErrorCode::NotConnected, "no active session", None).await;
            return;
        };
        if let Err(e) = handle.control.lock().await.join_channel(channel_id).await {
            self.send_error(ErrorCode::MumbleError, &e.to_string(), None).await;
        }
    }

    pub async fn handle_text_send(&mut self, message: String, channel_id: Option<u32>, _user_id: Option<u32>) {
        let Some(handle) = &self.session else {
            self.send_error(ErrorCode::NotConnected, "no active session", None).await;
            return;
        };
        let channel_id = channel_id.unwrap_or(0);
        if let Err(e) = handle.control.lock().await.send_text(channel_id, message).await {
            self.send_error(ErrorCode::MumbleError, &e.to_string(), None).await;
        }
    }

    pub async fn handle_ping(&mut self, client_time_ms: u64) {
        let _ = self
            .outbox
            .send(Outbound::Json(GatewayMessage::Pong { client_time_ms, server_time_ms: crate::time::epoch_millis() }))
            .await;
    }

    /// One binary uplink voice frame, decoded from the WebSocket message by
    /// the caller and handed straight to the pacer.
    pub async fn handle_uplink_voice(&mut self, frame: crate::peer::protocol::UplinkVoiceFrame) {
        let Some(handle) = &self.session else {
            return;
        };
        handle.metrics.uplink_frames.fetch_add(1, Ordering::Relaxed);
        metrics::VOICE_FRAMES_TOTAL.with_label_values(&["uplink"]).inc();
        let mapped = match frame {
            UplinkVoiceFrame::Opus { target, opus } => {
                handle.metrics.uplink_bytes.fetch_add(opus.len() as u64, Ordering::Relaxed);
                UplinkFrame::Opus { target, opus }
            }
            UplinkVoiceFrame::End => UplinkFrame::End,
        };
        let _ = handle.uplink_tx.send(mapped).await;
    }

    async fn send_error(&self, code: ErrorCode, message: &str, details: Option<String>) {
        let _ = self
            .outbox
            .send(Outbound::Json(GatewayMessage::Error { code: code.as_str(), message: message.to_string(), details }))
            .await;
    }

    /// Tears down the current session (if any): bumps the generation so any
    /// in-flight background task stops acting, drops the pacer/session, and
    /// emits `disconnected{reason}`.
    async fn teardown(&mut self, reason: &str) {
        if self.session.take().is_some() {
            self.generation.fetch_add(1, Ordering::SeqCst);
            metrics::ACTIVE_SESSIONS.with_label_values(&["connected"]).dec();
            let _ = self.outbox.send(Outbound::Json(GatewayMessage::Disconnected { reason: reason.to_string() })).await;
        }
    }
}

/// Emits the control-plane keepalive `Ping` every 10s (§4.4), for as long as
/// this connection's generation stays current. Mirrors the pacer/event-loop
/// suspension-point guard: a superseded session's ticker just stops firing
/// pings into a lock nobody reads from anymore.
async fn run_keepalive(control: Arc<tokio::sync::Mutex<MumbleSession>>, generation: Arc<AtomicU64>, my_generation: u64) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(10));
    ticker.tick().await; // first tick fires immediately; the keepalive shouldn't.
    loop {
        ticker.tick().await;
        if generation.load(Ordering::SeqCst) != my_generation {
            return;
        }
        if control.lock().await.send_ping().await.is_err() {
            return;
        }
    }
}

struct SessionSink {
    control: Arc<tokio::sync::Mutex<MumbleSession>>,
    generation: Arc<AtomicU64>,
    my_generation: u64,
}

impl UplinkSink for SessionSink {
    fn is_congested(&self) -> bool {
        // Best-effort, non-blocking: if the session is momentarily locked by
        // another task (e.g. a concurrent join/text send), treat it as not
        // congested rather than stall the pacer's synchronous push path.
        self.control.try_lock().map(|session| session.uplink_congested()).unwrap_or(false)
    }

    fn send(&mut self, frame: &UplinkFrame) {
        if self.generation.load(Ordering::SeqCst) != self.my_generation {
            return;
        }
        let control = self.control.clone();
        match frame {
            UplinkFrame::Opus { target, opus } => {
                let target = *target;
                let opus = opus.clone();
                tokio::spawn(async move {
                    let _ = control.lock().await.send_voice(target, opus, false).await;
                });
            }
            UplinkFrame::End => {
                tokio::spawn(async move {
                    let _ = control.lock().await.send_voice(0, Bytes::new(), true).await;
                });
            }
        }
    }
}

/// Drains `MumbleSession` events for one connection generation, translating
/// them into `GatewayMessage`s on `outbox`. Exits (and implicitly tears the
/// generation down) the moment a terminal event arrives or the generation
/// is superseded by a new connect/disconnect.
#[allow(clippy::too_many_arguments)]
async fn run_event_loop(
    server_id: String,
    control: Arc<tokio::sync::Mutex<MumbleSession>>,
    events: &mut mpsc::Receiver<SessionEvent>,
    outbox: mpsc::Sender<Outbound>,
    downlink_pending_bytes: Arc<AtomicUsize>,
    generation: Arc<AtomicU64>,
    my_generation: u64,
    metrics: Arc<PeerMetrics>,
) {
    let mut metrics_tick = tokio::time::interval(std::time::Duration::from_secs(2));
    let mut last_rtt_ms: Option<u64> = None;
    let mut rate_sample = RateSample::default();

    loop {
        if generation.load(Ordering::SeqCst) != my_generation {
            return;
        }

        tokio::select! {
            maybe_event = events.recv() => {
                let Some(event) = maybe_event else { return };
                if generation.load(Ordering::SeqCst) != my_generation {
                    return;
                }
                let terminal = handle_session_event(&server_id, event, &control, &outbox, &downlink_pending_bytes, &metrics, &mut last_rtt_ms, &mut rate_sample).await;
                if terminal {
                    generation.fetch_add(1, Ordering::SeqCst);
                    return;
                }
            }
            _ = metrics_tick.tick() => {
                emit_metrics(&outbox, &metrics, last_rtt_ms, &mut rate_sample).await;
            }
        }
    }
}

/// Returns `true` if this event ends the session (disconnect or a reject
/// the server sent before/instead of a sync).
async fn handle_session_event(
    server_id: &str,
    event: SessionEvent,
    control: &Arc<tokio::sync::Mutex<MumbleSession>>,
    outbox: &mpsc::Sender<Outbound>,
    downlink_pending_bytes: &Arc<AtomicUsize>,
    metrics: &Arc<PeerMetrics>,
    last_rtt_ms: &mut Option<u64>,
    rate_sample: &mut RateSample,
) -> bool {
    match event {
        SessionEvent::Synced { session, welcome_text } => {
            let registry = control.lock().await.registry_handle();
            let registry = registry.read_err().await.ok();
            let (root, max_bandwidth, version) = registry
                .as_ref()
                .map(|r| (r.server_info.root_channel_id, r.server_info.max_bandwidth, r.server_info.version))
                .unwrap_or((0, None, None));

            let _ = outbox
                .send(Outbound::Json(GatewayMessage::Connected {
                    server_id: server_id.to_string(),
                    self_user_id: session,
                    root_channel_id: root,
                    welcome_message: welcome_text,
                    server_version: version,
                    max_bandwidth,
                }))
                .await;

            if let Some(registry) = registry {
                let channels = registry.channels.values().map(ChannelView::from).collect();
                let users = registry.users.values().map(UserView::from).collect();
                let _ = outbox.send(Outbound::Json(GatewayMessage::StateSnapshot { channels, users })).await;
            }
            false
        }
        SessionEvent::ChannelUpserted(channel) => {
            let _ = outbox.send(Outbound::Json(GatewayMessage::ChannelUpsert { channel: ChannelView::from(&channel) })).await;
            false
        }
        SessionEvent::ChannelRemoved { channel_id } => {
            let _ = outbox.send(Outbound::Json(GatewayMessage::ChannelRemove { channel_id })).await;
            false
        }
        SessionEvent::UserUpserted(user) => {
            let _ = outbox.send(Outbound::Json(GatewayMessage::UserUpsert { user: UserView::from(&user) })).await;
            false
        }
        SessionEvent::UserRemoved { user_id } => {
            let _ = outbox.send(Outbound::Json(GatewayMessage::UserRemove { user_id })).await;
            false
        }
        SessionEvent::TextMessage(text) => {
            let _ = outbox
                .send(Outbound::Json(GatewayMessage::TextRecv {
                    sender_id: text.actor,
                    message: text.message,
                    target_users: text.session,
                    target_channels: text.channel_id,
                    target_trees: text.tree_id,
                    timestamp_ms: crate::time::epoch_millis(),
                }))
                .await;
            false
        }
        SessionEvent::PermissionDenied(denied) => {
            let reason = denied.reason.unwrap_or_else(|| "permission denied".to_string());
            let _ = outbox
                .send(Outbound::Json(GatewayMessage::Error { code: ErrorCode::MumbleDenied.as_str(), message: reason, details: None }))
                .await;
            false
        }
        SessionEvent::Rejected { reject_type, reason } => {
            let message = reason.unwrap_or_else(|| format!("rejected (type {reject_type})"));
            let _ = outbox
                .send(Outbound::Json(GatewayMessage::Error { code: ErrorCode::MumbleReject.as_str(), message, details: None }))
                .await;
            let _ = outbox.send(Outbound::Json(GatewayMessage::Disconnected { reason: "mumble_disconnect".to_string() })).await;
            true
        }
        SessionEvent::VoiceTransportChanged(transport) => {
            control.lock().await.set_transport(transport);
            false
        }
        SessionEvent::ServerRtt { rtt_ms } => {
            *last_rtt_ms = Some(rtt_ms);
            emit_metrics(outbox, metrics, *last_rtt_ms, rate_sample).await;
            false
        }
        SessionEvent::IncomingVoice { session_id, target, sequence, opus, is_last_frame } => {
            let is_dup = !control.lock().await.dedup_voice(session_id, target, sequence);
            if is_dup {
                metrics::VOICE_FRAMES_DROPPED.with_label_values(&["dedup"]).inc();
                return false;
            }
            let encoded = crate::peer::protocol::encode_downlink_opus(session_id, target, sequence, is_last_frame, &opus);

            if downlink_pending_bytes.load(Ordering::Relaxed) + encoded.len() > DOWNLINK_BACKPRESSURE_LIMIT {
                metrics.downlink_dropped.fetch_add(1, Ordering::Relaxed);
                metrics::VOICE_FRAMES_DROPPED.with_label_values(&["downlink_backpressure"]).inc();
                return false;
            }

            metrics.downlink_frames.fetch_add(1, Ordering::Relaxed);
            metrics.downlink_bytes.fetch_add(opus.len() as u64, Ordering::Relaxed);
            metrics::VOICE_FRAMES_TOTAL.with_label_values(&["downlink"]).inc();
            downlink_pending_bytes.fetch_add(encoded.len(), Ordering::Relaxed);
            let _ = outbox.send(Outbound::Binary(encoded)).await;
            false
        }
        SessionEvent::Disconnected { reason } => {
            let _ = outbox.send(Outbound::Json(GatewayMessage::Disconnected { reason })).await;
            true
        }
    }
}

/// Emits a `metrics` envelope with running totals plus per-interval rates
/// derived from the delta against `sample`, the previous tick's counters
/// (§4.7). The first tick after a `connected` event has no prior sample and
/// reports zero rates even if traffic already occurred.
async fn emit_metrics(
    outbox: &mpsc::Sender<Outbound>,
    metrics: &Arc<PeerMetrics>,
    server_rtt_ms: Option<u64>,
    sample: &mut RateSample,
) {
    let uplink_frames = metrics.uplink_frames.load(Ordering::Relaxed);
    let uplink_bytes = metrics.uplink_bytes.load(Ordering::Relaxed);
    let downlink_frames = metrics.downlink_frames.load(Ordering::Relaxed);
    let downlink_bytes = metrics.downlink_bytes.load(Ordering::Relaxed);

    let now = std::time::Instant::now();
    let (uplink_fps, downlink_fps, uplink_kbps, downlink_kbps) = match sample.at {
        Some(prev) => {
            let elapsed = now.duration_since(prev).as_secs_f64().max(0.001);
            (
                (uplink_frames - sample.uplink_frames) as f64 / elapsed,
                (downlink_frames - sample.downlink_frames) as f64 / elapsed,
                (uplink_bytes - sample.uplink_bytes) as f64 * 8.0 / 1000.0 / elapsed,
                (downlink_bytes - sample.downlink_bytes) as f64 * 8.0 / 1000.0 / elapsed,
            )
        }
        None => (0.0, 0.0, 0.0, 0.0),
    };

    *sample = RateSample { uplink_frames, uplink_bytes, downlink_frames, downlink_bytes, at: Some(now) };

    let snapshot = MetricsSnapshot {
        voice_uplink_frames_total: uplink_frames,
        voice_downlink_frames_total: downlink_frames,
        voice_uplink_pacer_dropped_frames_total: metrics.uplink_dropped.load(Ordering::Relaxed),
        voice_downlink_dropped_frames: metrics.downlink_dropped.load(Ordering::Relaxed),
        uplink_fps,
        downlink_fps,
        uplink_kbps,
        downlink_kbps,
        server_rtt_ms,
    };
    let _ = outbox.send(Outbound::Json(GatewayMessage::Metrics(snapshot))).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServerEntry, ServerTls};

    fn empty_whitelist() -> Arc<Whitelist> {
        Arc::new(Whitelist { servers: Vec::new() })
    }

    fn test_config() -> GatewayConfig {
        GatewayConfig {
            port: 0,
            web_root: std::path::PathBuf::from("."),
            servers_config_path: std::path::PathBuf::from("."),
            debug: false,
            coop_coep: false,
            pacing: crate::config::PacingConfig { interval_ms: 20, max_queue_frames: 200, idle_timeout_ms: 250 },
        }
    }

    fn new_supervisor(whitelist: Arc<Whitelist>) -> (Supervisor, mpsc::Receiver<Outbound>) {
        let (outbox_tx, outbox_rx) = mpsc::channel(16);
        let supervisor = Supervisor::new(whitelist, test_config(), outbox_tx, Arc::new(AtomicUsize::new(0)));
        (supervisor, outbox_rx)
    }

    async fn expect_error(rx: &mut mpsc::Receiver<Outbound>) -> &'static str {
        match rx.recv().await.expect("expected an outbound message") {
            Outbound::Json(GatewayMessage::Error { code, .. }) => code,
            other => panic!("expected Error, got {other:?}"),
        }
    }

    impl std::fmt::Debug for Outbound {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Outbound::Json(msg) => write!(f, "Json({msg:?})"),
                Outbound::Binary(b) => write!(f, "Binary({} bytes)", b.len()),
            }
        }
    }

    #[tokio::test]
    async fn join_channel_without_session_emits_not_connected() {
        let (mut supervisor, mut rx) = new_supervisor(empty_whitelist());
        supervisor.handle_join_channel(1).await;
        assert_eq!(expect_error(&mut rx).await, ErrorCode::NotConnected.as_str());
    }

    #[tokio::test]
    async fn text_send_without_session_emits_not_connected() {
        let (mut supervisor, mut rx) = new_supervisor(empty_whitelist());
        supervisor.handle_text_send("hi".to_string(), None, None).await;
        assert_eq!(expect_error(&mut rx).await, ErrorCode::NotConnected.as_str());
    }

    #[tokio::test]
    async fn connect_with_unknown_server_id_emits_unknown_server() {
        let (mut supervisor, mut rx) = new_supervisor(empty_whitelist());
        supervisor.handle_connect("no-such-server".to_string(), "alice".to_string(), None, None).await;
        assert_eq!(expect_error(&mut rx).await, ErrorCode::UnknownServer.as_str());
    }

    #[tokio::test]
    async fn connect_with_unreachable_host_emits_connect_failed() {
        // Bind, read the ephemeral port, then drop the listener so the port
        // is definitely refusing connections by the time we dial it.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let whitelist = Arc::new(Whitelist {
            servers: vec![ServerEntry {
                id: "dead".into(),
                name: "Dead server".into(),
                host: "127.0.0.1".into(),
                port,
                tls: ServerTls { reject_unauthorized: false },
            }],
        });
        let (mut supervisor, mut rx) = new_supervisor(whitelist);
        supervisor.handle_connect("dead".to_string(), "alice".to_string(), None, None).await;
        assert_eq!(expect_error(&mut rx).await, ErrorCode::ConnectFailed.as_str());
    }

    // MumbleReject/MumbleDenied/MumbleError only fire from `handle_session_event`
    // against a live `MumbleSession`, which needs a real upstream connection to
    // construct; this test covers the code mapping, not those three triggers.
    #[tokio::test]
    async fn send_error_maps_every_variant_to_its_wire_code() {
        let codes = [
            ErrorCode::BadRequest,
            ErrorCode::UnknownServer,
            ErrorCode::ConnectFailed,
            ErrorCode::MumbleReject,
            ErrorCode::MumbleDenied,
            ErrorCode::MumbleError,
            ErrorCode::NotConnected,
            ErrorCode::Internal,
        ];
        let (supervisor, mut rx) = new_supervisor(empty_whitelist());
        for code in codes {
            supervisor.send_error(code, "test", None).await;
            assert_eq!(expect_error(&mut rx).await, code.as_str());
        }
    }
}

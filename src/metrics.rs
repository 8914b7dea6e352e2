//! Process-wide Prometheus counters, in the same style Zumble used for its
//! server-side wire counters: `lazy_static` vectors keyed by a small label
//! set, bumped inline at the call site.

use prometheus::{register_int_counter_vec, register_int_gauge_vec, IntCounterVec, IntGaugeVec};

lazy_static! {
    /// Control/voice messages seen, labelled by transport ("tcp"/"udp"/"ws"),
    /// direction ("input"/"output") and message kind.
    pub static ref MESSAGES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "gateway_messages_total",
        "Number of protocol messages processed",
        &["transport", "direction", "kind"]
    )
    .unwrap();

    /// Same axes as [`MESSAGES_TOTAL`] but counting payload bytes.
    pub static ref MESSAGES_BYTES: IntCounterVec = register_int_counter_vec!(
        "gateway_message_bytes_total",
        "Number of protocol bytes processed",
        &["transport", "direction", "kind"]
    )
    .unwrap();

    /// Currently active browser peer sessions.
    pub static ref ACTIVE_SESSIONS: IntGaugeVec = register_int_gauge_vec!(
        "gateway_active_sessions",
        "Number of browser peers with a live Mumble session",
        &["state"]
    )
    .unwrap();

    /// Voice frames dropped, labelled by reason ("downlink_backpressure",
    /// "uplink_pacer_congestion", "uplink_pacer_cap", "dedup").
    pub static ref VOICE_FRAMES_DROPPED: IntCounterVec = register_int_counter_vec!(
        "gateway_voice_frames_dropped_total",
        "Voice frames dropped before delivery",
        &["reason"]
    )
    .unwrap();

    /// Voice frames delivered, labelled by direction ("uplink"/"downlink").
    pub static ref VOICE_FRAMES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "gateway_voice_frames_total",
        "Voice frames delivered to their destination",
        &["direction"]
    )
    .unwrap();

    /// Browser→upstream connect attempts, labelled by outcome ("ok"/"error").
    pub static ref CONNECTION_ATTEMPTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "gateway_connection_attempts_total",
        "Upstream Mumble connect attempts",
        &["outcome"]
    )
    .unwrap();

    /// UDP voice packets rejected by `CryptState::decrypt`, labelled by
    /// reason ("eof", "stale", "replay", "not_keyed", "xexstar", "auth",
    /// "decode").
    pub static ref VOICE_DECRYPT_FAILURES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "gateway_voice_decrypt_failures_total",
        "UDP voice packets that failed to decrypt or authenticate",
        &["reason"]
    )
    .unwrap();
}

//! Time helpers. Mumble's `Ping` timestamp field is an opaque value the
//! client picks and the far end echoes back unmodified, so it's a good fit
//! for a true monotonic clock rather than wall time: an NTP step mid-flight
//! can't clamp the computed RTT to zero. Browser-facing timestamps the peer
//! actually displays still want real wall-clock time, which stays separate
//! in [`epoch_millis`].

use std::time::{Instant, SystemTime, UNIX_EPOCH};

lazy_static! {
    static ref PROCESS_START: Instant = Instant::now();
}

/// Milliseconds elapsed since this process started. Used for the Mumble
/// `Ping` round-trip value on both the control channel and the UDP voice
/// channel: as long as both ends of an RTT subtraction come from this
/// function, a wall-clock correction between send and receive can't affect
/// the result.
pub fn monotonic_millis() -> u64 {
    PROCESS_START.elapsed().as_millis() as u64
}

/// Wall-clock milliseconds since the Unix epoch, for browser-facing
/// timestamps that need to mean something outside this process (pacer
/// `clientTimeMs`/`serverTimeMs` echoes, text message `timestampMs`).
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_millis_never_decreases() {
        let a = monotonic_millis();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = monotonic_millis();
        assert!(b >= a);
    }

    #[test]
    fn epoch_millis_is_plausibly_current() {
        // Sanity bound only: some time after this module's authorship.
        assert!(epoch_millis() > 1_700_000_000_000);
    }
}

//! Uplink voice pacer (§4.7): smooths a peer's outbound Opus frames onto a
//! fixed tick instead of forwarding them to the Mumble session the instant
//! they arrive off the WebSocket, so a bursty browser encoder doesn't
//! translate directly into bursty UDP traffic upstream.
//!
//! Three fast paths keep the common case cheap: an empty queue with the
//! session not congested sends straight through with no pacer involved; a
//! congested session keeps only the single newest frame; an idle pacer
//! shuts itself down after `idle_timeout_ms` rather than ticking forever.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::Interval;

use crate::config::PacingConfig;

#[derive(Debug, Clone)]
pub enum UplinkFrame {
    Opus { target: u8, opus: bytes::Bytes },
    End,
}

/// Upstream sink the pacer drains into. Abstracted so the pacer can be unit
/// tested without a live `MumbleSession`.
pub trait UplinkSink {
    fn is_congested(&self) -> bool;
    fn send(&mut self, frame: &UplinkFrame);
}

pub struct Pacer {
    config: PacingConfig,
    queue: VecDeque<UplinkFrame>,
    dropped_frames: u64,
    shared_dropped: Option<Arc<AtomicU64>>,
    last_activity: Instant,
}

impl Pacer {
    pub fn new(config: PacingConfig) -> Self {
        Pacer { config, queue: VecDeque::new(), dropped_frames: 0, shared_dropped: None, last_activity: Instant::now() }
    }

    /// Mirrors every drop this pacer counts into `counter`, for callers
    /// that want the running total without polling the pacer itself (it
    /// moves into the spawned `run` task and isn't otherwise reachable).
    pub fn with_drop_counter(mut self, counter: Arc<AtomicU64>) -> Self {
        self.shared_dropped = Some(counter);
        self
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    fn record_drop(&mut self, n: u64) {
        self.dropped_frames += n;
        if let Some(counter) = &self.shared_dropped {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Enqueues (or fast-paths) one uplink frame. `sink` is consulted for
    /// congestion and for the idle-fast-path direct send.
    pub fn push(&mut self, frame: UplinkFrame, sink: &mut dyn UplinkSink) {
        self.last_activity = Instant::now();

        if matches!(frame, UplinkFrame::End) {
            // Only one pending `end` ever makes sense; drop any earlier one
            // still sitting in the queue before enqueueing this one.
            self.queue.retain(|f| !matches!(f, UplinkFrame::End));
            if self.queue.is_empty() {
                sink.send(&frame);
            } else {
                self.queue.push_back(frame);
            }
            return;
        }

        if self.queue.is_empty() && !sink.is_congested() {
            sink.send(&frame);
            return;
        }

        if sink.is_congested() {
            // Keep only the single most recent voice frame; count
            // everything else as dropped, including whatever was queued.
            let dropped = self.queue.iter().filter(|f| matches!(f, UplinkFrame::Opus { .. })).count();
            self.record_drop(dropped as u64);
            self.queue.retain(|f| matches!(f, UplinkFrame::End));
            self.queue.push_front(frame);
            return;
        }

        let cap = self.config.max_queue_frames as usize;
        self.queue.push_back(frame);
        while self.queue.len() > cap {
            if let Some(pos) = self.queue.iter().position(|f| matches!(f, UplinkFrame::Opus { .. })) {
                self.queue.remove(pos);
                self.record_drop(1);
            } else {
                break;
            }
        }
    }

    /// Called on every pacer tick. Drains at most one frame.
    pub fn tick(&mut self, sink: &mut dyn UplinkSink) {
        if let Some(frame) = self.queue.pop_front() {
            sink.send(&frame);
        }
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.last_activity.elapsed() >= Duration::from_millis(self.config.idle_timeout_ms)
    }

    pub fn tick_interval(&self) -> Interval {
        tokio::time::interval(Duration::from_millis(self.config.interval_ms))
    }
}

/// Drives `pacer` from an mpsc channel of inbound frames until the channel
/// closes or the pacer goes idle, at which point it returns so the caller
/// can tear the task down instead of ticking forever on a quiet peer.
pub async fn run(
    mut pacer: Pacer,
    mut frames_rx: mpsc::Receiver<UplinkFrame>,
    mut sink: impl UplinkSink,
) {
    let mut tick = pacer.tick_interval();
    loop {
        tokio::select! {
            maybe_frame = frames_rx.recv() => {
                match maybe_frame {
                    Some(frame) => pacer.push(frame, &mut sink),
                    None => return,
                }
            }
            _ = tick.tick() => {
                pacer.tick(&mut sink);
                if pacer.is_idle() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeSink {
        congested: bool,
        sent: Vec<UplinkFrame>,
    }

    impl UplinkSink for FakeSink {
        fn is_congested(&self) -> bool {
            self.congested
        }
        fn send(&mut self, frame: &UplinkFrame) {
            self.sent.push(frame.clone());
        }
    }

    fn opus(n: u8) -> UplinkFrame {
        UplinkFrame::Opus { target: 0, opus: bytes::Bytes::from(vec![n]) }
    }

    #[test]
    fn idle_fast_path_sends_directly_without_queueing() {
        let mut pacer = Pacer::new(PacingConfig { interval_ms: 20, max_queue_frames: 200, idle_timeout_ms: 250 });
        let mut sink = FakeSink { congested: false, sent: vec![] };
        pacer.push(opus(1), &mut sink);
        assert_eq!(sink.sent.len(), 1);
        assert!(pacer.queue.is_empty());
    }

    #[test]
    fn congestion_keeps_only_newest_frame_and_counts_drops() {
        let mut pacer = Pacer::new(PacingConfig { interval_ms: 20, max_queue_frames: 200, idle_timeout_ms: 250 });
        let mut sink = FakeSink { congested: true, sent: vec![] };
        pacer.push(opus(1), &mut sink);
        pacer.push(opus(2), &mut sink);
        pacer.push(opus(3), &mut sink);
        assert_eq!(pacer.queue.len(), 1);
        assert!(matches!(pacer.queue.front(), Some(UplinkFrame::Opus { opus, .. }) if opus[0] == 3));
        assert_eq!(pacer.dropped_frames(), 2);
    }

    #[test]
    fn hard_cap_drops_oldest_first() {
        let mut pacer = Pacer::new(PacingConfig { interval_ms: 20, max_queue_frames: 2, idle_timeout_ms: 250 });
        // Queue is non-empty by the second push, so the fast path no longer
        // applies and frames accumulate instead of being sent immediately.
        let mut sink = FakeSink { congested: false, sent: vec![] };
        pacer.queue.push_back(opus(0));
        pacer.push(opus(1), &mut sink);
        pacer.push(opus(2), &mut sink);
        pacer.push(opus(3), &mut sink);
        assert_eq!(pacer.queue.len(), 2);
        assert!(matches!(pacer.queue.front(), Some(UplinkFrame::Opus { opus, .. }) if opus[0] == 2));
        assert_eq!(pacer.dropped_frames(), 2);
    }

    #[test]
    fn end_marker_replaces_any_earlier_pending_end() {
        let mut pacer = Pacer::new(PacingConfig { interval_ms: 20, max_queue_frames: 200, idle_timeout_ms: 250 });
        let mut sink = FakeSink { congested: false, sent: vec![] };
        pacer.queue.push_back(opus(1));
        pacer.push(UplinkFrame::End, &mut sink);
        pacer.push(UplinkFrame::End, &mut sink);
        let end_count = pacer.queue.iter().filter(|f| matches!(f, UplinkFrame::End)).count();
        assert_eq!(end_count, 1);
    }

    #[test]
    fn end_marker_sent_immediately_when_queue_empty() {
        let mut pacer = Pacer::new(PacingConfig { interval_ms: 20, max_queue_frames: 200, idle_timeout_ms: 250 });
        let mut sink = FakeSink { congested: false, sent: vec![] };
        pacer.push(UplinkFrame::End, &mut sink);
        assert_eq!(sink.sent.len(), 1);
        assert!(pacer.queue.is_empty());
    }

    #[test]
    fn pacer_reports_idle_after_timeout_with_empty_queue() {
        let mut pacer = Pacer::new(PacingConfig { interval_ms: 20, max_queue_frames: 200, idle_timeout_ms: 50 });
        assert!(!pacer.is_idle());
        pacer.last_activity = Instant::now() - Duration::from_millis(60);
        assert!(pacer.is_idle());
    }
}

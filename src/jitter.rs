//! Playout pacing calculator
//!
//! Converts per-frame playout durations into real sleep intervals,
//! compensating for time the playout loop spends off the timer (locking,
//! assembly, delivery). The cumulative slept time tracks the sum of
//! producer timestamp deltas minus skipped durations, within timer
//! granularity.

use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Default)]
pub struct JitterTiming {
    processing_start: Option<Instant>,
    last_playout_ms: i64,
    processing_acc_ms: i64,
    stop_notify: Notify,
    stopped: std::sync::atomic::AtomicBool,
}

impl JitterTiming {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the start of a playout tick. From the second call on, whatever
    /// the previous tick spent beyond its scheduled sleep is added to the
    /// processing-time accumulator.
    pub fn start_frame_playout(&mut self) {
        let now = Instant::now();
        if let Some(prev) = self.processing_start {
            let tick_ms = now.duration_since(prev).as_millis() as i64;
            let overhead = tick_ms - self.last_playout_ms;
            if overhead > 0 {
                self.processing_acc_ms += overhead;
            }
        }
        self.processing_start = Some(now);
    }

    /// Shrink the frame's playout time by accumulated processing overhead,
    /// flooring at zero, and consume what was used from the accumulator.
    pub fn update_playout_time(&mut self, frame_playout_ms: i64) -> i64 {
        let consumed = self.processing_acc_ms.min(frame_playout_ms.max(0));
        self.processing_acc_ms -= consumed;
        let adjusted = (frame_playout_ms - consumed).max(0);
        self.last_playout_ms = adjusted;
        adjusted
    }

    /// Sleep the adjusted playout time; returns immediately on 0 (skip) or
    /// when `stop` fires.
    pub async fn run_playout_timer(&self, playout_ms: i64) {
        if playout_ms <= 0 || self.stopped.load(std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        let notified = self.stop_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(playout_ms as u64)) => {}
            _ = notified => {}
        }
    }

    /// Reset accumulators; pacing restarts from the next tick
    pub fn flush(&mut self) {
        self.processing_start = None;
        self.last_playout_ms = 0;
        self.processing_acc_ms = 0;
    }

    /// Wake a sleeping timer and refuse further sleeps
    pub fn stop(&self) {
        self.stopped
            .store(true, std::sync::atomic::Ordering::SeqCst);
        self.stop_notify.notify_waiters();
    }

    pub fn processing_acc_ms(&self) -> i64 {
        self.processing_acc_ms
    }
}

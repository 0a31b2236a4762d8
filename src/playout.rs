//! Playout: the loop that drives the playback timeline
//!
//! A generic `Playout` paces frames out of the buffer; a strategy decides
//! per sample whether to emit, skip (observable) or drop (silent). The
//! video strategy owns GOP validity: deltas after a gap are skipped until
//! the next key frame restores decodability.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::assembler::FrameInfo;
use crate::buffer::Buffer;
use crate::jitter::JitterTiming;
use crate::name::{PacketNo, PlaybackNo};
use crate::stats::{Indicator, StatisticsStorage};

/// What to do with the sample at the head of the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayoutDecision {
    /// Deliver to the downstream consumer
    Emit,
    /// Withhold and tell observers a frame was skipped
    Skip,
    /// Withhold silently
    Drop,
}

/// Per-sample policy hooks
pub trait PlayoutStrategy: Send + 'static {
    fn on_sample_ready(&mut self, info: &FrameInfo) -> PlayoutDecision;

    /// The head slot could not be reconstructed
    fn on_recovery_failure(&mut self, _info: &FrameInfo) {}

    fn on_queue_empty(&mut self) {}
}

/// Playout progress callbacks
pub trait PlayoutObserver: Send + Sync {
    fn frame_processed(&self, _playback_no: PlaybackNo, _is_key: bool) {}
    fn frame_skipped(&self, _playback_no: PlaybackNo, _is_key: bool) {}
    fn recovery_failure(&self, _sample_no: PacketNo, _is_key: bool) {}
    fn queue_empty(&self) {}
}

/// Downstream sink for reconstructed frames (the decoder seam)
pub trait EncodedFrameConsumer: Send + 'static {
    fn process_frame(&mut self, info: &FrameInfo, payload: &[u8]);
}

/// Strategy that emits every reconstructable sample
#[derive(Debug, Default)]
pub struct PassthroughStrategy;

impl PlayoutStrategy for PassthroughStrategy {
    fn on_sample_ready(&mut self, _info: &FrameInfo) -> PlayoutDecision {
        PlayoutDecision::Emit
    }
}

/// Video playout policy: GOP-validity tracking with delta skipping
#[derive(Debug)]
pub struct VideoStrategy {
    gop_valid: bool,
    current_play_no: Option<PlaybackNo>,
    gop_count: u64,
}

impl VideoStrategy {
    pub fn new() -> Self {
        Self {
            gop_valid: false,
            current_play_no: None,
            gop_count: 0,
        }
    }

    pub fn gop_valid(&self) -> bool {
        self.gop_valid
    }

    pub fn gop_count(&self) -> u64 {
        self.gop_count
    }
}

impl Default for VideoStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl PlayoutStrategy for VideoStrategy {
    fn on_sample_ready(&mut self, info: &FrameInfo) -> PlayoutDecision {
        let mut skipped = false;
        if info.is_key {
            self.gop_valid = true;
            self.gop_count += 1;
        } else if let Some(current) = self.current_play_no {
            if info.playback_no != current + 1 || !self.gop_valid {
                self.gop_valid = false;
                skipped = true;
            }
        }
        self.current_play_no = Some(info.playback_no);

        if skipped {
            PlayoutDecision::Skip
        } else if self.gop_valid {
            PlayoutDecision::Emit
        } else {
            // delta before the first key of the stream
            PlayoutDecision::Drop
        }
    }

    fn on_recovery_failure(&mut self, info: &FrameInfo) {
        // a lost key frame invalidates the GOP; a lost delta only widens
        // the gap the next sample will detect
        if info.is_key {
            self.gop_valid = false;
        }
    }

    fn on_queue_empty(&mut self) {}
}

/// The playout loop
pub struct Playout<S: PlayoutStrategy> {
    buffer: Arc<Buffer>,
    strategy: S,
    consumer: Box<dyn EncodedFrameConsumer>,
    observers: Vec<Arc<dyn PlayoutObserver>>,
    stats: Arc<StatisticsStorage>,
}

/// Video playout with GOP-validity skip logic
pub type VideoPlayout = Playout<VideoStrategy>;

impl<S: PlayoutStrategy> Playout<S> {
    pub fn new(
        buffer: Arc<Buffer>,
        strategy: S,
        consumer: Box<dyn EncodedFrameConsumer>,
        stats: Arc<StatisticsStorage>,
    ) -> Self {
        Self {
            buffer,
            strategy,
            consumer,
            observers: Vec::new(),
            stats,
        }
    }

    pub fn attach(&mut self, observer: Arc<dyn PlayoutObserver>) {
        self.observers.push(observer);
    }

    /// Spawn the playout task. `fast_forward_ms` is drained from the playout
    /// schedule before normal pacing begins, to catch up a late playhead.
    pub fn start(self, fast_forward_ms: i64) -> PlayoutHandle {
        let running = Arc::new(AtomicBool::new(true));
        let stop_notify = Arc::new(Notify::new());
        let join = tokio::spawn(Self::run(
            self,
            fast_forward_ms,
            running.clone(),
            stop_notify.clone(),
        ));
        PlayoutHandle {
            running,
            stop_notify,
            join: Some(join),
        }
    }

    async fn run(
        mut this: Self,
        fast_forward_ms: i64,
        running: Arc<AtomicBool>,
        stop_notify: Arc<Notify>,
    ) {
        let mut timing = JitterTiming::new();
        let mut ff_remaining = fast_forward_ms.max(0);
        tracing::debug!(fast_forward_ms, "playout started");

        while running.load(Ordering::SeqCst) {
            let Some(mut duration) = this.buffer.head_playout_duration_ms() else {
                this.strategy.on_queue_empty();
                for o in &this.observers {
                    o.queue_empty();
                }
                let notified = stop_notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                tokio::select! {
                    _ = this.buffer.wait_fresh_sample() => {}
                    _ = notified => {}
                }
                continue;
            };

            timing.start_frame_playout();
            if ff_remaining > 0 {
                let consumed = ff_remaining.min(duration);
                duration -= consumed;
                ff_remaining -= consumed;
            }
            let adjusted = timing.update_playout_time(duration);

            {
                let notified = stop_notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                tokio::select! {
                    _ = timing.run_playout_timer(adjusted) => {}
                    _ = notified => {}
                }
            }
            if !running.load(Ordering::SeqCst) {
                break;
            }

            let Some(acquired) = this.buffer.acquire_slot() else {
                continue;
            };
            let info = acquired.info;
            match acquired.frame {
                Ok(frame) => {
                    if frame.recovered {
                        this.stats.inc(Indicator::RecoveredNum);
                        if info.is_key {
                            this.stats.inc(Indicator::RecoveredKeyNum);
                        }
                    }
                    match this.strategy.on_sample_ready(&info) {
                        PlayoutDecision::Emit => {
                            this.consumer.process_frame(&info, &frame.payload);
                            for o in &this.observers {
                                o.frame_processed(info.playback_no, info.is_key);
                            }
                            this.stats.inc(Indicator::PlayedNum);
                            this.stats.set(Indicator::LastPlayedNo, info.playback_no);
                            if info.is_key {
                                this.stats.inc(Indicator::PlayedKeyNum);
                                if let Some(pno) = acquired.packet_no {
                                    this.stats.set(Indicator::LastPlayedKeyNo, pno);
                                }
                            } else if let Some(pno) = acquired.packet_no {
                                this.stats.set(Indicator::LastPlayedDeltaNo, pno);
                            }
                        }
                        PlayoutDecision::Skip => {
                            tracing::warn!(
                                playback_no = info.playback_no,
                                frame = %info.frame_prefix,
                                "frame skipped"
                            );
                            for o in &this.observers {
                                o.frame_skipped(info.playback_no, info.is_key);
                            }
                            this.stats.inc(Indicator::SkippedNum);
                        }
                        PlayoutDecision::Drop => {}
                    }
                }
                Err(e) => {
                    tracing::warn!(frame = %info.frame_prefix, error = %e, "recovery failed");
                    this.strategy.on_recovery_failure(&info);
                    for o in &this.observers {
                        o.recovery_failure(acquired.packet_no.unwrap_or(0), info.is_key);
                    }
                }
            }
            this.buffer.release_acquired_slot();
        }

        // free a slot left locked by an interrupted tick
        this.buffer.release_acquired_slot();
        tracing::debug!("playout stopped");
    }
}

/// Handle to a running playout task
pub struct PlayoutHandle {
    running: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
    join: Option<tokio::task::JoinHandle<()>>,
}

impl PlayoutHandle {
    /// Wake the loop, free any locked slot and wait for the task to exit.
    /// Idempotent.
    pub async fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.stop_notify.notify_waiters();
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

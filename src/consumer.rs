//! Consumer session: wiring and rebuffer orchestration
//!
//! Owns the buffer, the pipeliner task and the playout task. Playout is
//! started once the buffer holds the jitter target worth of content, and
//! restarted (rebuffer) when playback stalls or underruns pile up: the
//! buffer flushes, the queue clears, and the pipeliner bootstraps again
//! past the last pipelined frame.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::assembler::FrameInfo;
use crate::buffer::Buffer;
use crate::config::ConsumerConfig;
use crate::name::ThreadPrefix;
use crate::pipeliner::{InterestSink, Pipeliner};
use crate::playout::{EncodedFrameConsumer, Playout, PlayoutObserver, VideoStrategy};
use crate::stats::{Indicator, StatisticsStorage};

/// Downstream consumer shared across playout restarts
struct SharedConsumer(Arc<Mutex<Box<dyn EncodedFrameConsumer>>>);

impl EncodedFrameConsumer for SharedConsumer {
    fn process_frame(&mut self, info: &FrameInfo, payload: &[u8]) {
        self.0.lock().process_frame(info, payload);
    }
}

/// Tracks playback liveness for the rebuffer watchdog
struct ProgressObserver {
    origin: Instant,
    last_progress_ms: AtomicI64,
    underruns: AtomicU32,
    forced: std::sync::atomic::AtomicBool,
    stats: Arc<StatisticsStorage>,
}

impl ProgressObserver {
    fn new(stats: Arc<StatisticsStorage>) -> Self {
        Self {
            origin: Instant::now(),
            last_progress_ms: AtomicI64::new(0),
            underruns: AtomicU32::new(0),
            forced: std::sync::atomic::AtomicBool::new(false),
            stats,
        }
    }

    fn now_ms(&self) -> i64 {
        self.origin.elapsed().as_millis() as i64
    }

    fn touch(&self) {
        self.last_progress_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    fn stalled_for_ms(&self) -> i64 {
        self.now_ms() - self.last_progress_ms.load(Ordering::Relaxed)
    }

    fn reset(&self) {
        self.touch();
        self.underruns.store(0, Ordering::Relaxed);
        self.forced.store(false, Ordering::Relaxed);
    }
}

impl PlayoutObserver for ProgressObserver {
    fn frame_processed(&self, _playback_no: u64, _is_key: bool) {
        self.touch();
    }

    fn frame_skipped(&self, _playback_no: u64, _is_key: bool) {
        // a skip is still forward progress on the timeline
        self.touch();
    }

    fn queue_empty(&self) {
        self.underruns.fetch_add(1, Ordering::Relaxed);
        self.stats.inc(Indicator::UnderrunNum);
    }
}

/// A running video consumer
pub struct VideoConsumer {
    buffer: Arc<Buffer>,
    pipeliner: Arc<Pipeliner>,
    stats: Arc<StatisticsStorage>,
    progress: Arc<ProgressObserver>,
    consumer: Arc<Mutex<Box<dyn EncodedFrameConsumer>>>,
    observers: Vec<Arc<dyn PlayoutObserver>>,
    pipeliner_task: Option<tokio::task::JoinHandle<()>>,
    supervisor_task: Option<tokio::task::JoinHandle<()>>,
}

impl VideoConsumer {
    pub fn new(
        config: ConsumerConfig,
        thread: ThreadPrefix,
        interest_sink: Arc<dyn InterestSink>,
        frame_consumer: Box<dyn EncodedFrameConsumer>,
    ) -> Self {
        let stats = Arc::new(StatisticsStorage::new());
        let buffer = Arc::new(Buffer::new(config, thread));
        let pipeliner = Pipeliner::new(buffer.clone(), interest_sink);
        let progress = Arc::new(ProgressObserver::new(stats.clone()));
        Self {
            buffer,
            pipeliner,
            stats,
            progress,
            consumer: Arc::new(Mutex::new(frame_consumer)),
            observers: Vec::new(),
            pipeliner_task: None,
            supervisor_task: None,
        }
    }

    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    pub fn stats(&self) -> &Arc<StatisticsStorage> {
        &self.stats
    }

    pub fn rebuffer_count(&self) -> u64 {
        self.stats.get(Indicator::RebufferNum)
    }

    pub fn attach(&mut self, observer: Arc<dyn PlayoutObserver>) {
        self.observers.push(observer);
    }

    /// Force a rebuffer cycle on the next watchdog tick
    pub fn trigger_rebuffer(&self) {
        self.progress.forced.store(true, Ordering::Relaxed);
    }

    /// Start the pipeliner and the playout supervisor
    pub fn start(&mut self) {
        if self.pipeliner_task.is_some() {
            return;
        }
        self.pipeliner_task = Some(self.pipeliner.spawn());

        let buffer = self.buffer.clone();
        let pipeliner = self.pipeliner.clone();
        let stats = self.stats.clone();
        let progress = self.progress.clone();
        let consumer = self.consumer.clone();
        let observers = self.observers.clone();
        self.supervisor_task = Some(tokio::spawn(Self::supervise(
            buffer, pipeliner, stats, progress, consumer, observers,
        )));
    }

    /// Stop everything; idempotent
    pub async fn stop(&mut self) {
        self.buffer.release();
        if let Some(task) = self.supervisor_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.pipeliner_task.take() {
            let _ = task.await;
        }
    }

    async fn supervise(
        buffer: Arc<Buffer>,
        pipeliner: Arc<Pipeliner>,
        stats: Arc<StatisticsStorage>,
        progress: Arc<ProgressObserver>,
        consumer: Arc<Mutex<Box<dyn EncodedFrameConsumer>>>,
        observers: Vec<Arc<dyn PlayoutObserver>>,
    ) {
        let config = buffer.config().clone();
        let check_interval = Duration::from_millis((config.rebuffer_threshold_ms / 4).max(50));

        loop {
            // buffering phase: wait for the jitter target worth of fully
            // reconstructable content. Ready events are left to this task
            // by the pipeliner's mask.
            loop {
                if buffer.is_released() {
                    return;
                }
                if buffer.ready_duration_ms() >= config.jitter_target_ms as i64 {
                    break;
                }
                let _ = buffer
                    .wait_for_events(crate::buffer::EventMask::READY, Duration::from_millis(200))
                    .await;
            }

            // drain whatever accumulated past the target during buffering,
            // so the queue settles back to the jitter target after start
            let fast_forward =
                (buffer.ready_duration_ms() - config.jitter_target_ms as i64).max(0);
            let mut playout = Playout::new(
                buffer.clone(),
                VideoStrategy::new(),
                Box::new(SharedConsumer(consumer.clone())),
                stats.clone(),
            );
            playout.attach(progress.clone() as Arc<dyn PlayoutObserver>);
            for observer in &observers {
                playout.attach(observer.clone());
            }
            progress.reset();
            let mut handle = playout.start(fast_forward);
            tracing::info!(fast_forward, "playback started");

            // monitor phase
            let rebuffer = loop {
                tokio::time::sleep(check_interval).await;
                // drop Ready events nobody will consume while playing
                while buffer.take_event(crate::buffer::EventMask::READY).is_some() {}
                if buffer.is_released() {
                    handle.stop().await;
                    return;
                }
                if progress.forced.load(Ordering::Relaxed) {
                    tracing::info!("rebuffer requested");
                    break true;
                }
                if progress.stalled_for_ms() > config.rebuffer_threshold_ms as i64 {
                    tracing::warn!("playback stalled, rebuffering");
                    break true;
                }
                if progress.underruns.load(Ordering::Relaxed) > config.max_underruns {
                    tracing::warn!("underrun limit exceeded, rebuffering");
                    break true;
                }
            };

            if rebuffer {
                stats.inc(Indicator::RebufferNum);
                handle.stop().await;
                pipeliner.reset_for_rebuffer();
                buffer.flush();
                progress.reset();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullSink;
    impl InterestSink for NullSink {
        fn express(&self, _interest: crate::name::Interest) {}
    }

    struct NullConsumer;
    impl EncodedFrameConsumer for NullConsumer {
        fn process_frame(&mut self, _info: &FrameInfo, _payload: &[u8]) {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stop() {
        let mut consumer = VideoConsumer::new(
            ConsumerConfig::default(),
            ThreadPrefix::new("/lab/cam", "hd"),
            Arc::new(NullSink),
            Box::new(NullConsumer),
        );
        consumer.start();
        // starting twice is a no-op
        consumer.start();
        tokio::time::sleep(Duration::from_millis(50)).await;

        consumer.stop().await;
        assert_eq!(consumer.rebuffer_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_observer_counts_underruns() {
        let stats = Arc::new(StatisticsStorage::new());
        let progress = ProgressObserver::new(stats.clone());
        progress.queue_empty();
        progress.queue_empty();
        assert_eq!(progress.underruns.load(Ordering::Relaxed), 2);
        assert_eq!(stats.get(Indicator::UnderrunNum), 2);

        progress.reset();
        assert_eq!(progress.underruns.load(Ordering::Relaxed), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_detection() {
        let stats = Arc::new(StatisticsStorage::new());
        let progress = ProgressObserver::new(stats);
        progress.touch();
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(progress.stalled_for_ms() >= 500);
        progress.frame_processed(1, false);
        assert!(progress.stalled_for_ms() < 10);
    }
}

//! Shared test rig: an in-memory producer↔consumer link with configurable
//! delay, jitter and loss, plus stub encoder and recording sinks

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::assembler::FrameInfo;
use crate::buffer::Buffer;
use crate::config::{ConsumerConfig, ProducerConfig};
use crate::consumer::VideoConsumer;
use crate::meter::WallClock;
use crate::name::{
    DataPacket, FrameClass, FramePrefix, Interest, InterestName, PacketNo, SegmentClass,
    SegmentName, ThreadPrefix,
};
use crate::pipeliner::InterestSink;
use crate::playout::{EncodedFrameConsumer, PlayoutObserver};
use crate::producer::{EncodedVideoFrame, ProducerPipeline, RawVideoFrame, VideoEncoder};
use crate::publisher::{NullSigner, Publisher, SegmentSink};
use crate::stats::StatisticsStorage;

pub fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Deterministic xorshift for delay deviation sampling
pub struct TestRng(AtomicU64);

impl TestRng {
    pub fn new(seed: u64) -> Self {
        Self(AtomicU64::new(seed.max(1)))
    }

    pub fn next(&self) -> u64 {
        let mut x = self.0.load(Ordering::Relaxed);
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0.store(x, Ordering::Relaxed);
        x
    }
}

#[derive(Clone)]
pub struct LinkConfig {
    /// One-way delay, each direction
    pub delay_ms: u64,
    /// Uniform deviation applied to each one-way trip
    pub deviation_ms: u64,
    pub seed: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            delay_ms: 20,
            deviation_ms: 0,
            seed: 0x5eed,
        }
    }
}

type DropFilter = Box<dyn Fn(&SegmentName) -> bool + Send + Sync>;

/// In-memory bidirectional link between one producer and one consumer.
///
/// Producer-bound interests either hit the content store of already
/// published segments or land in the producer's PIT; published segments
/// answer outstanding interests and fill the store. Every expressed
/// interest gets a deadline check: if its segment is still pending in the
/// consumer buffer by then, a timeout is surfaced.
pub struct TestLink {
    self_ref: Weak<TestLink>,
    config: LinkConfig,
    rng: TestRng,
    publisher: Mutex<Option<Arc<Publisher>>>,
    buffer: Mutex<Option<Arc<Buffer>>>,
    /// Published segments, as an in-network cache would hold them
    store: DashMap<SegmentName, DataPacket>,
    latest: DashMap<FrameClass, PacketNo>,
    /// Network-level pending interests awaiting a publish
    outstanding: DashMap<SegmentName, Interest>,
    outstanding_rightmost: DashMap<FrameClass, Interest>,
    /// Everything is dropped while set (network cut)
    cut: AtomicBool,
    drop_filter: Mutex<Option<DropFilter>>,
}

impl TestLink {
    pub fn new(config: LinkConfig) -> Arc<Self> {
        let seed = config.seed;
        Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            config,
            rng: TestRng::new(seed),
            publisher: Mutex::new(None),
            buffer: Mutex::new(None),
            store: DashMap::new(),
            latest: DashMap::new(),
            outstanding: DashMap::new(),
            outstanding_rightmost: DashMap::new(),
            cut: AtomicBool::new(false),
            drop_filter: Mutex::new(None),
        })
    }

    fn arc(&self) -> Arc<TestLink> {
        self.self_ref.upgrade().expect("link alive")
    }

    pub fn attach_publisher(&self, publisher: Arc<Publisher>) {
        *self.publisher.lock() = Some(publisher);
    }

    pub fn attach_buffer(&self, buffer: Arc<Buffer>) {
        *self.buffer.lock() = Some(buffer);
    }

    pub fn set_cut(&self, cut: bool) {
        self.cut.store(cut, Ordering::SeqCst);
    }

    /// Drop consumer-bound data packets matching the predicate
    pub fn set_drop_filter(&self, filter: Option<DropFilter>) {
        *self.drop_filter.lock() = filter;
    }

    fn one_way_delay(&self) -> Duration {
        let base = self.config.delay_ms;
        let dev = self.config.deviation_ms;
        let ms = if dev == 0 {
            base
        } else {
            let jitter = (self.rng.next() % (2 * dev + 1)) as i64 - dev as i64;
            (base as i64 + jitter).max(0) as u64
        };
        Duration::from_millis(ms)
    }

    fn deliver_data(&self, data: DataPacket) {
        if self.cut.load(Ordering::SeqCst) {
            return;
        }
        if let Some(filter) = self.drop_filter.lock().as_ref() {
            if filter(&data.name) {
                return;
            }
        }
        let link = self.arc();
        let delay = self.one_way_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let buffer = link.buffer.lock().clone();
            if let Some(buffer) = buffer {
                let _ = buffer.received(&data);
            }
        });
    }

    /// Producer-side arrival of one interest
    fn interest_arrived(&self, interest: Interest) {
        match &interest.name {
            InterestName::Rightmost { thread, class } => {
                let tip = self.latest.get(class).map(|e| *e.value());
                let answer = tip.filter(|tip| *tip >= interest.exclude_below.unwrap_or(0));
                if let Some(tip) = answer {
                    let name = FramePrefix::new(thread.clone(), *class, tip).segment(0);
                    if let Some(data) = self.store.get(&name) {
                        self.deliver_data(data.clone());
                        return;
                    }
                }
                self.outstanding_rightmost
                    .insert(*class, interest.clone());
                if let Some(publisher) = self.publisher.lock().clone() {
                    publisher.on_interest(&interest);
                }
            }
            InterestName::Segment(name) => {
                if let Some(data) = self.store.get(name) {
                    self.deliver_data(data.clone());
                    return;
                }
                self.outstanding.insert(name.clone(), interest.clone());
                if let Some(publisher) = self.publisher.lock().clone() {
                    publisher.on_interest(&interest);
                }
            }
            InterestName::Frame(_) => {
                if let Some(publisher) = self.publisher.lock().clone() {
                    publisher.on_interest(&interest);
                }
            }
        }
    }

    /// The consumer buffer decides whether the interest is really still
    /// unanswered; marking a fetched segment missing is rejected there.
    fn schedule_timeout(&self, interest: Interest) {
        let link = self.arc();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(interest.lifetime_ms)).await;
            let buffer = link.buffer.lock().clone();
            if let Some(buffer) = buffer {
                buffer.timeout(&interest);
            }
        });
    }
}

impl SegmentSink for TestLink {
    fn send(&self, data: DataPacket) {
        self.store.insert(data.name.clone(), data.clone());
        if data.name.class == SegmentClass::Data {
            self.latest
                .entry(data.name.frame.class)
                .and_modify(|tip| *tip = (*tip).max(data.name.frame.packet_no))
                .or_insert(data.name.frame.packet_no);
        }

        // answer a matching pending interest
        if self.outstanding.remove(&data.name).is_some() {
            self.deliver_data(data.clone());
            return;
        }
        if data.name.segment == 0 && data.name.class == SegmentClass::Data {
            let class = data.name.frame.class;
            let matched = self
                .outstanding_rightmost
                .remove(&class)
                .map(|(_, interest)| {
                    data.name.frame.packet_no >= interest.exclude_below.unwrap_or(0)
                })
                .unwrap_or(false);
            if matched {
                self.deliver_data(data);
            }
        }
    }
}

impl InterestSink for TestLink {
    fn express(&self, interest: Interest) {
        self.schedule_timeout(interest.clone());
        if self.cut.load(Ordering::SeqCst) {
            return;
        }
        let link = self.arc();
        let delay = self.one_way_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !link.cut.load(Ordering::SeqCst) {
                link.interest_arrived(interest);
            }
        });
    }
}

/// Encoder producing deterministic payloads; key frames on request
pub struct PatternEncoder {
    pub frame_bytes: usize,
    counter: u32,
}

impl PatternEncoder {
    pub fn new(frame_bytes: usize) -> Self {
        Self {
            frame_bytes,
            counter: 0,
        }
    }
}

impl VideoEncoder for PatternEncoder {
    fn encode(&mut self, frame: &RawVideoFrame<'_>, force_key: bool) -> Option<EncodedVideoFrame> {
        self.counter += 1;
        let payload: Vec<u8> = (0..self.frame_bytes)
            .map(|i| ((i as u32).wrapping_mul(self.counter) % 251) as u8)
            .collect();
        Some(EncodedVideoFrame {
            payload: Bytes::from(payload),
            is_key: force_key,
            timestamp: self.counter * 3000,
            width: frame.width(),
            height: frame.height(),
        })
    }
}

/// Records every delivered frame with its arrival instant
#[derive(Clone, Default)]
pub struct CollectingConsumer {
    pub delivered: Arc<Mutex<Vec<(FrameInfo, Instant, usize)>>>,
}

impl EncodedFrameConsumer for CollectingConsumer {
    fn process_frame(&mut self, info: &FrameInfo, payload: &[u8]) {
        self.delivered
            .lock()
            .push((info.clone(), Instant::now(), payload.len()));
    }
}

/// Records skip and recovery-failure callbacks
#[derive(Default)]
pub struct EventRecorder {
    pub skipped: Mutex<Vec<(u64, bool)>>,
    pub recovery_failures: Mutex<Vec<(u64, bool)>>,
}

impl PlayoutObserver for EventRecorder {
    fn frame_skipped(&self, playback_no: u64, is_key: bool) {
        self.skipped.lock().push((playback_no, is_key));
    }

    fn recovery_failure(&self, sample_no: u64, is_key: bool) {
        self.recovery_failures.lock().push((sample_no, is_key));
    }
}

/// A complete producer-to-consumer rig over one link
pub struct Rig {
    pub link: Arc<TestLink>,
    pub producer_stats: Arc<StatisticsStorage>,
    pub pipeline: ProducerPipeline,
    pub consumer: VideoConsumer,
    pub delivered: CollectingConsumer,
    pub recorder: Arc<EventRecorder>,
}

pub fn rig(
    link_config: LinkConfig,
    producer_config: ProducerConfig,
    consumer_config: ConsumerConfig,
    frame_bytes: usize,
) -> Rig {
    init_logging();
    let link = TestLink::new(link_config);
    let clock = Arc::new(WallClock::new());
    let producer_stats = Arc::new(StatisticsStorage::new());

    let publisher = Arc::new(Publisher::new(
        producer_config.clone(),
        link.clone() as Arc<dyn SegmentSink>,
        Arc::new(NullSigner),
        clock.clone(),
        producer_stats.clone(),
    ));
    link.attach_publisher(publisher.clone());
    let pipeline = ProducerPipeline::new(
        &producer_config,
        Box::new(PatternEncoder::new(frame_bytes)),
        publisher,
        clock,
        producer_stats.clone(),
    );

    let thread = ThreadPrefix::new(
        producer_config.stream_prefix.clone(),
        producer_config.thread_name.clone(),
    );
    let delivered = CollectingConsumer::default();
    let recorder = Arc::new(EventRecorder::default());
    let mut consumer = VideoConsumer::new(
        consumer_config,
        thread,
        link.clone() as Arc<dyn InterestSink>,
        Box::new(delivered.clone()),
    );
    consumer.attach(recorder.clone() as Arc<dyn PlayoutObserver>);
    link.attach_buffer(consumer.buffer().clone());

    Rig {
        link,
        producer_stats,
        pipeline,
        consumer,
        delivered,
        recorder,
    }
}

/// Drive the raw-frame source at `fps` for `frames` frames
pub async fn run_source(pipeline: &mut ProducerPipeline, fps: f64, frames: u32) {
    let pixels = vec![0u8; 64 * 64 * 4];
    let interval = Duration::from_secs_f64(1.0 / fps);
    for _ in 0..frames {
        pipeline.incoming_argb_frame(64, 64, &pixels).unwrap();
        tokio::time::sleep(interval).await;
    }
}

//! Producer pipeline: raw frames in, published segments out
//!
//! Runs synchronously with the raw-frame source. Pixel buffers are
//! borrowed for the duration of the call only; the encoder seam is a black
//! box that turns them into opaque encoded frames.

use std::sync::Arc;

use bytes::Bytes;

use crate::config::ProducerConfig;
use crate::error::PublishError;
use crate::meter::WallClock;
use crate::name::{FrameClass, PacketNo};
use crate::publisher::{OutgoingFrame, Publisher};
use crate::stats::{Indicator, StatisticsStorage};
use crate::wire::FrameHeader;

/// A borrowed raw video frame
#[derive(Debug)]
pub enum RawVideoFrame<'a> {
    Argb {
        width: u32,
        height: u32,
        data: &'a [u8],
    },
    I420 {
        width: u32,
        height: u32,
        stride_y: usize,
        stride_u: usize,
        stride_v: usize,
        y: &'a [u8],
        u: &'a [u8],
        v: &'a [u8],
    },
}

impl RawVideoFrame<'_> {
    pub fn width(&self) -> u32 {
        match self {
            RawVideoFrame::Argb { width, .. } | RawVideoFrame::I420 { width, .. } => *width,
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            RawVideoFrame::Argb { height, .. } | RawVideoFrame::I420 { height, .. } => *height,
        }
    }
}

/// Output of the black-box encoder
#[derive(Debug, Clone)]
pub struct EncodedVideoFrame {
    /// Opaque codec bytes
    pub payload: Bytes,
    pub is_key: bool,
    /// Codec timestamp (90 kHz units)
    pub timestamp: u32,
    pub width: u32,
    pub height: u32,
}

/// Codec seam. `force_key` asks for a key frame; the encoder reports what
/// it actually produced. `None` means the frame was consumed without
/// output (dropped or buffered).
pub trait VideoEncoder: Send {
    fn encode(&mut self, frame: &RawVideoFrame<'_>, force_key: bool) -> Option<EncodedVideoFrame>;
}

/// Raw-frame intake plus frame numbering, classing and publishing
pub struct ProducerPipeline {
    encoder: Box<dyn VideoEncoder>,
    publisher: Arc<Publisher>,
    clock: Arc<WallClock>,
    stats: Arc<StatisticsStorage>,
    gop_size: u32,
    delta_seq: PacketNo,
    key_seq: PacketNo,
    playback_no: u64,
    frames_since_key: u32,
}

impl ProducerPipeline {
    pub fn new(
        config: &ProducerConfig,
        encoder: Box<dyn VideoEncoder>,
        publisher: Arc<Publisher>,
        clock: Arc<WallClock>,
        stats: Arc<StatisticsStorage>,
    ) -> Self {
        Self {
            encoder,
            publisher,
            clock,
            stats,
            gop_size: config.gop_size.max(1),
            delta_seq: 0,
            key_seq: 0,
            playback_no: 0,
            frames_since_key: 0,
        }
    }

    pub fn publisher(&self) -> &Arc<Publisher> {
        &self.publisher
    }

    pub fn playback_no(&self) -> u64 {
        self.playback_no
    }

    /// ARGB intake from the raw-frame source
    pub fn incoming_argb_frame(
        &mut self,
        width: u32,
        height: u32,
        data: &[u8],
    ) -> Result<(), PublishError> {
        self.process(&RawVideoFrame::Argb {
            width,
            height,
            data,
        })
    }

    /// Planar I420 intake
    #[allow(clippy::too_many_arguments)]
    pub fn incoming_i420_frame(
        &mut self,
        width: u32,
        height: u32,
        stride_y: usize,
        stride_u: usize,
        stride_v: usize,
        y: &[u8],
        u: &[u8],
        v: &[u8],
    ) -> Result<(), PublishError> {
        self.process(&RawVideoFrame::I420 {
            width,
            height,
            stride_y,
            stride_u,
            stride_v,
            y,
            u,
            v,
        })
    }

    fn process(&mut self, raw: &RawVideoFrame<'_>) -> Result<(), PublishError> {
        self.stats.inc(Indicator::CapturedNum);
        let capture_time_ms = self.clock.now_ms();

        let force_key = self.frames_since_key == 0;
        let Some(encoded) = self.encoder.encode(raw, force_key) else {
            self.stats.inc(Indicator::DroppedNum);
            return Ok(());
        };
        self.stats.inc(Indicator::ProcessedNum);
        self.stats.inc(Indicator::EncodedNum);

        let (class, packet_no, paired_seq) = if encoded.is_key {
            let seq = self.key_seq;
            self.key_seq += 1;
            self.frames_since_key = 1;
            // a key pairs with the delta that will follow it
            (FrameClass::Key, seq, self.delta_seq)
        } else {
            let seq = self.delta_seq;
            self.delta_seq += 1;
            self.frames_since_key += 1;
            // a delta pairs with the most recent key
            (FrameClass::Delta, seq, self.key_seq.saturating_sub(1))
        };
        if self.frames_since_key >= self.gop_size {
            self.frames_since_key = 0;
        }

        let header = FrameHeader {
            encoded_width: encoded.width,
            encoded_height: encoded.height,
            timestamp: encoded.timestamp,
            capture_time_ms,
            frame_type: class,
            complete: true,
            packet_rate: self.publisher.packet_rate(),
            producer_timestamp_ms: self.clock.now_ms(),
        };

        let frame = OutgoingFrame {
            class,
            packet_no,
            playback_no: self.playback_no,
            paired_seq,
            header,
            payload: encoded.payload,
        };
        self.playback_no += 1;
        self.publisher.publish_frame(&frame)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::name::DataPacket;
    use crate::publisher::{NullSigner, SegmentSink};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CollectingSink {
        sent: Mutex<Vec<DataPacket>>,
    }

    impl SegmentSink for CollectingSink {
        fn send(&self, data: DataPacket) {
            self.sent.lock().push(data);
        }
    }

    /// Encoder that emits a deterministic payload derived from frame size
    struct StubEncoder {
        counter: u32,
        drop_every: Option<u32>,
    }

    impl VideoEncoder for StubEncoder {
        fn encode(
            &mut self,
            frame: &RawVideoFrame<'_>,
            force_key: bool,
        ) -> Option<EncodedVideoFrame> {
            self.counter += 1;
            if let Some(n) = self.drop_every {
                if self.counter % n == 0 {
                    return None;
                }
            }
            Some(EncodedVideoFrame {
                payload: Bytes::from(vec![self.counter as u8; 1200]),
                is_key: force_key,
                timestamp: self.counter * 3000,
                width: frame.width(),
                height: frame.height(),
            })
        }
    }

    fn pipeline(sink: Arc<CollectingSink>, gop_size: u32, drop_every: Option<u32>) -> ProducerPipeline {
        let config = ProducerConfig {
            gop_size,
            segment_payload_size: 1000,
            ..ProducerConfig::default()
        };
        let clock = Arc::new(WallClock::new());
        let stats = Arc::new(StatisticsStorage::new());
        let publisher = Arc::new(Publisher::new(
            config.clone(),
            sink,
            Arc::new(NullSigner),
            clock.clone(),
            stats.clone(),
        ));
        ProducerPipeline::new(&config, Box::new(StubEncoder { counter: 0, drop_every }), publisher, clock, stats)
    }

    #[tokio::test]
    async fn test_gop_cadence_and_numbering() {
        let sink = Arc::new(CollectingSink::default());
        let mut pipeline = pipeline(sink.clone(), 4, None);

        let pixels = vec![0u8; 64 * 64 * 4];
        for _ in 0..9 {
            pipeline.incoming_argb_frame(64, 64, &pixels).unwrap();
        }

        let sent = sink.sent.lock();
        // pattern over 9 frames with gop 4: K d d d K d d d K
        let classes: Vec<FrameClass> = sent
            .iter()
            .filter(|d| d.name.segment == 0 && matches!(d.name.class, crate::name::SegmentClass::Data))
            .map(|d| d.name.frame.class)
            .collect();
        assert_eq!(
            classes,
            vec![
                FrameClass::Key,
                FrameClass::Delta,
                FrameClass::Delta,
                FrameClass::Delta,
                FrameClass::Key,
                FrameClass::Delta,
                FrameClass::Delta,
                FrameClass::Delta,
                FrameClass::Key,
            ]
        );

        // per-namespace sequence numbers are independent and monotonic
        let key_seqs: Vec<u64> = sent
            .iter()
            .filter(|d| d.name.frame.class == FrameClass::Key && d.name.segment == 0)
            .filter(|d| matches!(d.name.class, crate::name::SegmentClass::Data))
            .map(|d| d.name.frame.packet_no)
            .collect();
        assert_eq!(key_seqs, vec![0, 1, 2]);

        // playback numbers are monotonic across both namespaces
        let playback: Vec<u64> = sent
            .iter()
            .filter(|d| d.name.segment == 0 && matches!(d.name.class, crate::name::SegmentClass::Data))
            .map(|d| d.prefix_meta.playback_no)
            .collect();
        assert_eq!(playback, (0..9).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_paired_sequences() {
        let sink = Arc::new(CollectingSink::default());
        let mut pipeline = pipeline(sink.clone(), 3, None);
        let pixels = vec![0u8; 16 * 16 * 4];
        for _ in 0..6 {
            pipeline.incoming_argb_frame(16, 16, &pixels).unwrap();
        }

        let sent = sink.sent.lock();
        let heads: Vec<&DataPacket> = sent
            .iter()
            .filter(|d| d.name.segment == 0 && matches!(d.name.class, crate::name::SegmentClass::Data))
            .collect();

        // K0 pairs with the upcoming delta 0; deltas pair with key 0;
        // K1 pairs with the upcoming delta 2
        assert_eq!(heads[0].name.frame.class, FrameClass::Key);
        assert_eq!(heads[0].prefix_meta.paired_seq, 0);
        assert_eq!(heads[1].name.frame.class, FrameClass::Delta);
        assert_eq!(heads[1].prefix_meta.paired_seq, 0);
        assert_eq!(heads[2].prefix_meta.paired_seq, 0);
        assert_eq!(heads[3].name.frame.class, FrameClass::Key);
        assert_eq!(heads[3].prefix_meta.paired_seq, 2);
    }

    #[tokio::test]
    async fn test_encoder_drop_accounting() {
        let sink = Arc::new(CollectingSink::default());
        let mut pipeline = pipeline(sink.clone(), 30, Some(3));
        let pixels = vec![0u8; 16 * 16 * 4];
        for _ in 0..9 {
            pipeline.incoming_argb_frame(16, 16, &pixels).unwrap();
        }

        assert_eq!(pipeline.stats.get(Indicator::CapturedNum), 9);
        assert_eq!(pipeline.stats.get(Indicator::DroppedNum), 3);
        assert_eq!(pipeline.stats.get(Indicator::EncodedNum), 6);
        assert_eq!(pipeline.stats.get(Indicator::PublishedNum), 6);
    }

    #[tokio::test]
    async fn test_i420_intake() {
        let sink = Arc::new(CollectingSink::default());
        let mut pipeline = pipeline(sink.clone(), 30, None);
        let y = vec![0u8; 32 * 32];
        let u = vec![0u8; 16 * 16];
        let v = vec![0u8; 16 * 16];
        pipeline
            .incoming_i420_frame(32, 32, 32, 16, 16, &y, &u, &v)
            .unwrap();
        assert!(!sink.sent.lock().is_empty());
    }
}

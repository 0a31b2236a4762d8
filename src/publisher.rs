//! Producer-side segmentation and publishing
//!
//! An encoded frame is packed behind its header, sliced into fixed-size
//! segments, named, stamped with per-segment metadata from the pending
//! interest table, signed and sent in ascending segment order, followed by
//! the frame's parity segments. Once the whole frame is out, leftover
//! interests under its prefix are evicted from the PIT.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::config::ProducerConfig;
use crate::error::PublishError;
use crate::fec::ReedSolomon;
use crate::meter::{DataRateMeter, FrequencyMeter, WallClock};
use crate::name::{
    DataPacket, FrameClass, FramePrefix, Interest, PacketNo, PrefixMetaInfo, SegmentName,
    ThreadPrefix,
};
use crate::pit::PendingInterestTable;
use crate::stats::{Indicator, StatisticsStorage};
use crate::wire::{crc32, FrameHeader, FramePacket, ParityPayload, SegmentData, SegmentMetaHeader};

/// Transport seam: outgoing segments are handed here in publish order
pub trait SegmentSink: Send + Sync {
    fn send(&self, data: DataPacket);
}

/// Signing seam
pub trait SegmentSigner: Send + Sync {
    fn sign(&self, data: &mut DataPacket);
}

/// Signer that stamps an empty signature, for tests and local loops
#[derive(Debug, Default)]
pub struct NullSigner;

impl SegmentSigner for NullSigner {
    fn sign(&self, data: &mut DataPacket) {
        data.signature = Some(Bytes::new());
    }
}

/// Slice a frame packet into payload-size shards
pub fn segmentize(packet: &[u8], segment_payload_size: usize) -> Vec<&[u8]> {
    packet.chunks(segment_payload_size).collect()
}

/// A frame handed over for publishing
#[derive(Debug, Clone)]
pub struct OutgoingFrame {
    pub class: FrameClass,
    pub packet_no: PacketNo,
    pub playback_no: u64,
    /// Delta: most recent key. Key: next delta.
    pub paired_seq: PacketNo,
    pub header: FrameHeader,
    pub payload: Bytes,
}

/// Publishes encoded frames as named, signed segments
pub struct Publisher {
    config: ProducerConfig,
    thread: ThreadPrefix,
    pit: Arc<PendingInterestTable>,
    sink: Arc<dyn SegmentSink>,
    signer: Arc<dyn SegmentSigner>,
    clock: Arc<WallClock>,
    stats: Arc<StatisticsStorage>,
    packet_meter: FrequencyMeter,
    data_meter: DataRateMeter,
    /// Highest packet number published per namespace, for interest triage
    last_delta: AtomicI64,
    last_key: AtomicI64,
}

impl Publisher {
    pub fn new(
        config: ProducerConfig,
        sink: Arc<dyn SegmentSink>,
        signer: Arc<dyn SegmentSigner>,
        clock: Arc<WallClock>,
        stats: Arc<StatisticsStorage>,
    ) -> Self {
        let thread = ThreadPrefix::new(config.stream_prefix.clone(), config.thread_name.clone());
        Self {
            config,
            thread,
            pit: Arc::new(PendingInterestTable::new()),
            sink,
            signer,
            clock,
            stats,
            packet_meter: FrequencyMeter::new(1000),
            data_meter: DataRateMeter::new(1000),
            last_delta: AtomicI64::new(-1),
            last_key: AtomicI64::new(-1),
        }
    }

    pub fn thread_prefix(&self) -> &ThreadPrefix {
        &self.thread
    }

    pub fn pit(&self) -> &Arc<PendingInterestTable> {
        &self.pit
    }

    /// Observed publish rate, packets per second
    pub fn packet_rate(&self) -> f64 {
        self.packet_meter.rate()
    }

    /// Observed publish bitrate, bits per second
    pub fn bitrate(&self) -> f64 {
        self.data_meter.bitrate()
    }

    /// An interest arrived from the network. Interests for frames at or
    /// below the published tip are stale (a cache can answer them);
    /// everything else waits in the PIT.
    pub fn on_interest(&self, interest: &Interest) {
        let tip = match interest.name.class() {
            FrameClass::Delta => self.last_delta.load(Ordering::Relaxed),
            FrameClass::Key => self.last_key.load(Ordering::Relaxed),
        };
        match interest.name.packet_no() {
            Some(packet_no) if (packet_no as i64) <= tip => {
                tracing::debug!(name = %interest.name, "interest for already published frame");
            }
            _ => {
                self.pit
                    .add(&interest.name, interest.nonce, self.clock.now_ms());
            }
        }
    }

    /// Segment, stamp, sign and send one encoded frame. Returns the number
    /// of segments published (data plus parity).
    pub fn publish_frame(&self, frame: &OutgoingFrame) -> Result<u32, PublishError> {
        if frame.payload.is_empty() {
            return Err(PublishError::EmptyPayload);
        }

        let packet = FramePacket::pack(&frame.header, &frame.payload);
        let stride = self.config.segment_payload_size;
        let shards = segmentize(&packet, stride);
        let total = shards.len();
        if total > u16::MAX as usize {
            return Err(PublishError::TooManySegments { segments: total });
        }

        let prefix = FramePrefix::new(self.thread.clone(), frame.class, frame.packet_no);
        let meta = PrefixMetaInfo {
            total_segments: total as u32,
            playback_no: frame.playback_no,
            paired_seq: frame.paired_seq,
            crc: crc32(&packet),
        };

        let mut published = 0u32;
        for (no, shard) in shards.iter().enumerate() {
            let name = prefix.segment(no as u32);
            let content = SegmentData::pack(&self.segment_meta(&name), shard);
            self.send_segment(DataPacket {
                name,
                prefix_meta: meta,
                final_block_id: total as u32 - 1,
                freshness_ms: self.config.freshness_ms,
                content,
                signature: None,
            });
            published += 1;
        }

        // parity over the zero-padded shard layout
        let parity_count = self.config.fec.parity_count(total);
        if parity_count > 0 {
            let mut padded = packet.to_vec();
            padded.resize(total * stride, 0);
            let padded_shards: Vec<&[u8]> = padded.chunks(stride).collect();
            let rs = ReedSolomon::new(total, parity_count)?;
            let parity_shards = rs.encode(&padded_shards)?;

            for (no, shard) in parity_shards.iter().enumerate() {
                let name = prefix.parity_segment(no as u32);
                let content = SegmentData::pack(
                    &self.segment_meta(&name),
                    &ParityPayload::pack(packet.len() as u32, shard),
                );
                self.send_segment(DataPacket {
                    name,
                    prefix_meta: meta,
                    final_block_id: parity_count as u32 - 1,
                    freshness_ms: self.config.freshness_ms,
                    content,
                    signature: None,
                });
                published += 1;
            }
        }

        // frame is fully out: stale interests under it will never match
        self.pit.evict_frame(&prefix);

        match frame.class {
            FrameClass::Delta => self
                .last_delta
                .fetch_max(frame.packet_no as i64, Ordering::Relaxed),
            FrameClass::Key => self
                .last_key
                .fetch_max(frame.packet_no as i64, Ordering::Relaxed),
        };

        self.stats.inc(Indicator::PublishedNum);
        if frame.class.is_key() {
            self.stats.inc(Indicator::PublishedKeyNum);
        }
        self.stats
            .add(Indicator::RawBytesPublished, frame.payload.len() as u64);
        self.packet_meter.tick();

        tracing::debug!(
            frame = %prefix,
            segments = published,
            bytes = packet.len(),
            "published frame"
        );
        Ok(published)
    }

    fn segment_meta(&self, name: &SegmentName) -> SegmentMetaHeader {
        match self.pit.take_match(name) {
            Some(entry) => {
                let now = self.clock.now_ms();
                SegmentMetaHeader {
                    nonce: entry.nonce,
                    interest_arrival_ms: entry.arrival_ms.max(0) as u64,
                    generation_delay_ms: (now - entry.arrival_ms).max(0) as u32,
                }
            }
            None => SegmentMetaHeader::default(),
        }
    }

    fn send_segment(&self, mut data: DataPacket) {
        self.signer.sign(&mut data);
        self.stats.inc(Indicator::SignNum);
        self.stats.inc(Indicator::PublishedSegmentsNum);
        self.stats
            .add(Indicator::BytesPublished, data.content.len() as u64);
        self.data_meter.add(data.content.len());
        self.sink.send(data);
    }
}

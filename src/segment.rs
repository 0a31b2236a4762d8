//! Per-segment assembly state

use tokio::time::Instant;

use crate::name::SegmentNo;
use crate::wire::SegmentMetaHeader;

/// Segment lifecycle: NotUsed → Pending → {Fetched | Missing}; Missing may
/// re-enter Pending on retransmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    NotUsed,
    Pending,
    Missing,
    Fetched,
}

/// Information derived from one data arrival
#[derive(Debug, Clone, Copy)]
pub struct ArrivalInfo {
    /// The echoed nonce equals the one we sent: this is a direct response,
    /// not a cached copy
    pub is_original: bool,
    /// Network round-trip sample (arrival − request − generation delay),
    /// milliseconds. Only present for originals.
    pub rtt_ms: Option<f64>,
}

/// One addressable unit of a frame under assembly
#[derive(Debug, Clone, Default)]
pub struct Segment {
    number: Option<SegmentNo>,
    state: Option<SegmentState>,
    payload_size: usize,
    request_time: Option<Instant>,
    arrival_time: Option<Instant>,
    interest_nonce: Option<u32>,
    data_nonce: Option<u32>,
    interest_arrival_ms: Option<u64>,
    generation_delay_ms: Option<u32>,
    request_count: u32,
}

impl Segment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SegmentState {
        self.state.unwrap_or(SegmentState::NotUsed)
    }

    pub fn number(&self) -> Option<SegmentNo> {
        self.number
    }

    pub fn set_number(&mut self, number: SegmentNo) {
        self.number = Some(number);
    }

    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    pub fn request_count(&self) -> u32 {
        self.request_count
    }

    /// An interest went out for this segment
    pub fn interest_issued(&mut self, nonce: u32) {
        debug_assert_ne!(nonce, 0);
        self.state = Some(SegmentState::Pending);
        self.request_time = Some(Instant::now());
        self.interest_nonce = Some(nonce);
        self.request_count += 1;
    }

    /// The interest timed out
    pub fn mark_missed(&mut self) {
        self.state = Some(SegmentState::Missing);
    }

    /// Data arrived. Fields become read-only until the owning slot resets.
    pub fn data_arrived(&mut self, meta: &SegmentMetaHeader, payload_size: usize) -> ArrivalInfo {
        let arrival = Instant::now();
        self.state = Some(SegmentState::Fetched);
        self.arrival_time = Some(arrival);
        self.data_nonce = Some(meta.nonce);
        self.interest_arrival_ms = Some(meta.interest_arrival_ms);
        self.generation_delay_ms = Some(meta.generation_delay_ms);
        self.payload_size = payload_size;

        let is_original = self.is_original();
        let rtt_ms = if is_original {
            self.request_time.map(|req| {
                let raw = arrival.duration_since(req).as_secs_f64() * 1000.0;
                (raw - meta.generation_delay_ms as f64).max(0.0)
            })
        } else {
            None
        };
        ArrivalInfo { is_original, rtt_ms }
    }

    /// True if the echoed nonce matches the nonce this consumer sent
    pub fn is_original(&self) -> bool {
        match (self.interest_nonce, self.data_nonce) {
            (Some(sent), Some(echoed)) => sent != 0 && sent == echoed,
            _ => false,
        }
    }

    /// Return the segment to its unused state
    pub fn discard(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle() {
        let mut seg = Segment::new();
        assert_eq!(seg.state(), SegmentState::NotUsed);

        seg.interest_issued(0x1234);
        assert_eq!(seg.state(), SegmentState::Pending);
        assert_eq!(seg.request_count(), 1);

        seg.mark_missed();
        assert_eq!(seg.state(), SegmentState::Missing);

        // retransmission
        seg.interest_issued(0x5678);
        assert_eq!(seg.state(), SegmentState::Pending);
        assert_eq!(seg.request_count(), 2);

        tokio::time::advance(Duration::from_millis(40)).await;
        let info = seg.data_arrived(
            &SegmentMetaHeader {
                nonce: 0x5678,
                interest_arrival_ms: 100,
                generation_delay_ms: 10,
            },
            1000,
        );
        assert_eq!(seg.state(), SegmentState::Fetched);
        assert!(info.is_original);
        // 40 ms wire time minus 10 ms generation delay
        let rtt = info.rtt_ms.unwrap();
        assert!((rtt - 30.0).abs() < 1.0, "rtt {}", rtt);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_copy_is_not_original() {
        let mut seg = Segment::new();
        seg.interest_issued(0x1111);
        let info = seg.data_arrived(
            &SegmentMetaHeader {
                nonce: 0x2222,
                interest_arrival_ms: 0,
                generation_delay_ms: 0,
            },
            500,
        );
        assert!(!info.is_original);
        assert!(info.rtt_ms.is_none());
    }

    #[test]
    fn test_discard_clears_sentinels() {
        let mut seg = Segment::new();
        seg.interest_issued(0x1234);
        seg.discard();
        assert_eq!(seg.state(), SegmentState::NotUsed);
        assert!(!seg.is_original());
        assert_eq!(seg.request_count(), 0);
    }
}

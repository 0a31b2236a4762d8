//! Per-component statistics counters
//!
//! Counters are updated lock-free from any task; aggregation is pull-only
//! through [`StatisticsStorage::snapshot`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics indicator. `*Num` entries are counters, `Last*` entries are
/// gauges holding the most recent value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum Indicator {
    // capture & encode
    CapturedNum,
    ProcessedNum,
    EncodedNum,
    DroppedNum,
    // publishing
    PublishedNum,
    PublishedKeyNum,
    PublishedSegmentsNum,
    BytesPublished,
    RawBytesPublished,
    SignNum,
    // playout
    RecoveredNum,
    RecoveredKeyNum,
    SkippedNum,
    PlayedNum,
    PlayedKeyNum,
    LastPlayedNo,
    LastPlayedKeyNo,
    LastPlayedDeltaNo,
    // consumer session
    RebufferNum,
    UnderrunNum,
}

impl Indicator {
    pub const COUNT: usize = 20;

    pub const ALL: [Indicator; Self::COUNT] = [
        Indicator::CapturedNum,
        Indicator::ProcessedNum,
        Indicator::EncodedNum,
        Indicator::DroppedNum,
        Indicator::PublishedNum,
        Indicator::PublishedKeyNum,
        Indicator::PublishedSegmentsNum,
        Indicator::BytesPublished,
        Indicator::RawBytesPublished,
        Indicator::SignNum,
        Indicator::RecoveredNum,
        Indicator::RecoveredKeyNum,
        Indicator::SkippedNum,
        Indicator::PlayedNum,
        Indicator::PlayedKeyNum,
        Indicator::LastPlayedNo,
        Indicator::LastPlayedKeyNo,
        Indicator::LastPlayedDeltaNo,
        Indicator::RebufferNum,
        Indicator::UnderrunNum,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Indicator::CapturedNum => "captured",
            Indicator::ProcessedNum => "processed",
            Indicator::EncodedNum => "encoded",
            Indicator::DroppedNum => "dropped",
            Indicator::PublishedNum => "published",
            Indicator::PublishedKeyNum => "published_key",
            Indicator::PublishedSegmentsNum => "published_segments",
            Indicator::BytesPublished => "bytes_published",
            Indicator::RawBytesPublished => "raw_bytes_published",
            Indicator::SignNum => "signed",
            Indicator::RecoveredNum => "recovered",
            Indicator::RecoveredKeyNum => "recovered_key",
            Indicator::SkippedNum => "skipped",
            Indicator::PlayedNum => "played",
            Indicator::PlayedKeyNum => "played_key",
            Indicator::LastPlayedNo => "last_played_no",
            Indicator::LastPlayedKeyNo => "last_played_key_no",
            Indicator::LastPlayedDeltaNo => "last_played_delta_no",
            Indicator::RebufferNum => "rebuffer",
            Indicator::UnderrunNum => "underrun",
        }
    }
}

/// Lock-free counter storage shared by the components of one producer or
/// consumer instance.
#[derive(Debug)]
pub struct StatisticsStorage {
    counters: [AtomicU64; Indicator::COUNT],
}

impl StatisticsStorage {
    pub fn new() -> Self {
        Self {
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub fn inc(&self, indicator: Indicator) {
        self.add(indicator, 1);
    }

    pub fn add(&self, indicator: Indicator, value: u64) {
        self.counters[indicator as usize].fetch_add(value, Ordering::Relaxed);
    }

    pub fn set(&self, indicator: Indicator, value: u64) {
        self.counters[indicator as usize].store(value, Ordering::Relaxed);
    }

    pub fn get(&self, indicator: Indicator) -> u64 {
        self.counters[indicator as usize].load(Ordering::Relaxed)
    }

    /// Pull a consistent-enough view of all counters for reporting
    pub fn snapshot(&self) -> HashMap<&'static str, u64> {
        Indicator::ALL
            .iter()
            .map(|i| (i.name(), self.get(*i)))
            .collect()
    }
}

impl Default for StatisticsStorage {
    fn default() -> Self {
        Self::new()
    }
}

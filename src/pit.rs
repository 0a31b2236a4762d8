//! Producer-side pending interest table
//!
//! Maps segment names to the interest that asked for them, so outgoing
//! segments can echo the nonce and report generation delay. Entries die
//! when matched with data or when their whole frame has been published.

use dashmap::DashMap;

use crate::name::{FrameClass, FramePrefix, InterestName, SegmentName};

/// What the producer remembers about one pending interest
#[derive(Debug, Clone, Copy)]
pub struct PitEntry {
    /// Producer wall clock when the interest arrived, unix ms
    pub arrival_ms: i64,
    /// Nonce to echo back in the matching data
    pub nonce: u32,
}

/// Keys cover exact segment interests plus the prefix forms a consumer
/// uses before it knows the frame geometry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PitKey {
    Segment(SegmentName),
    Frame(FramePrefix),
    Rightmost(FrameClass),
}

#[derive(Debug, Default)]
pub struct PendingInterestTable {
    entries: DashMap<PitKey, PitEntry>,
}

impl PendingInterestTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record an arriving interest
    pub fn add(&self, name: &InterestName, nonce: u32, arrival_ms: i64) {
        let key = match name {
            InterestName::Segment(s) => PitKey::Segment(s.clone()),
            InterestName::Frame(f) => PitKey::Frame(f.clone()),
            InterestName::Rightmost { class, .. } => PitKey::Rightmost(*class),
        };
        if self.entries.contains_key(&key) {
            tracing::debug!(name = %name, "pit entry already exists");
        }
        self.entries.insert(key, PitEntry { arrival_ms, nonce });
    }

    /// Find and consume the pending interest a published segment answers.
    /// Exact segment names match first; segment 0 of a frame also answers a
    /// frame-prefix or rightmost interest.
    pub fn take_match(&self, name: &SegmentName) -> Option<PitEntry> {
        if let Some((_, entry)) = self.entries.remove(&PitKey::Segment(name.clone())) {
            return Some(entry);
        }
        if name.segment == 0 {
            if let Some((_, entry)) = self.entries.remove(&PitKey::Frame(name.frame.clone())) {
                return Some(entry);
            }
            if let Some((_, entry)) = self
                .entries
                .remove(&PitKey::Rightmost(name.frame.class))
            {
                return Some(entry);
            }
        }
        None
    }

    /// Drop every entry still pending under a fully-published frame
    pub fn evict_frame(&self, frame: &FramePrefix) {
        self.entries.retain(|key, _| match key {
            PitKey::Segment(s) => s.frame != *frame,
            PitKey::Frame(f) => f != frame,
            PitKey::Rightmost(_) => true,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::name::ThreadPrefix;

    fn prefix(packet_no: u64) -> FramePrefix {
        FramePrefix::new(
            ThreadPrefix::new("/lab/cam", "hd"),
            FrameClass::Delta,
            packet_no,
        )
    }

    #[test]
    fn test_exact_match_consumes_entry() {
        let pit = PendingInterestTable::new();
        let name = prefix(5).segment(2);
        pit.add(&InterestName::Segment(name.clone()), 0x42, 1000);
        assert_eq!(pit.len(), 1);

        let entry = pit.take_match(&name).unwrap();
        assert_eq!(entry.nonce, 0x42);
        assert_eq!(entry.arrival_ms, 1000);
        assert!(pit.take_match(&name).is_none());
        assert!(pit.is_empty());
    }

    #[test]
    fn test_rightmost_matched_by_first_segment() {
        let pit = PendingInterestTable::new();
        pit.add(
            &InterestName::Rightmost {
                thread: ThreadPrefix::new("/lab/cam", "hd"),
                class: FrameClass::Delta,
            },
            0x99,
            2000,
        );

        // segment 1 does not answer a prefix interest
        assert!(pit.take_match(&prefix(7).segment(1)).is_none());
        let entry = pit.take_match(&prefix(7).segment(0)).unwrap();
        assert_eq!(entry.nonce, 0x99);
    }

    #[test]
    fn test_evict_frame() {
        let pit = PendingInterestTable::new();
        pit.add(&InterestName::Segment(prefix(5).segment(0)), 1, 0);
        pit.add(&InterestName::Segment(prefix(5).segment(3)), 2, 0);
        pit.add(&InterestName::Segment(prefix(6).segment(0)), 3, 0);
        pit.add(&InterestName::Frame(prefix(5)), 4, 0);

        pit.evict_frame(&prefix(5));
        assert_eq!(pit.len(), 1);
        assert!(pit.take_match(&prefix(6).segment(0)).is_some());
    }
}

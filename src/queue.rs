//! Playback queue: an order-maintaining view over buffered slots
//!
//! The queue holds pool indices and re-sorts on every push and pop with a
//! stable sort, so slots whose ordering keys are still unknown keep their
//! relative positions while assembly refines them.

use std::cmp::Ordering;

use crate::name::FrameClass;
use crate::slot::{Consistency, Slot, SlotId, SlotPool};

/// Compare two slots for playout order, degrading gracefully across
/// consistency levels:
///
/// 1. both have header metadata: producer capture timestamp
/// 2. exactly one has header metadata: that one first
/// 3. both have prefix metadata: playback number
/// 4. same namespace: sequence number
/// 5. a delta with prefix metadata against a key without: the delta's
///    paired sequence against the key's sequence (ties put the key first)
/// 6. different namespaces, neither informed: delta precedes key
pub fn compare_slots(a: &Slot, b: &Slot) -> Ordering {
    let a_header = a.consistency().has(Consistency::HEADER_META);
    let b_header = b.consistency().has(Consistency::HEADER_META);

    match (a_header, b_header) {
        (true, true) => a.producer_timestamp_ms().cmp(&b.producer_timestamp_ms()),
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => {
            let a_prefix = a.consistency().has(Consistency::PREFIX_META);
            let b_prefix = b.consistency().has(Consistency::PREFIX_META);
            if a_prefix && b_prefix {
                return a.playback_no().cmp(&b.playback_no());
            }
            if a.class() == b.class() {
                return a.packet_no().cmp(&b.packet_no());
            }
            // cross-namespace with partial knowledge
            if a_prefix && a.class() == Some(FrameClass::Delta) {
                return match a.paired_no().cmp(&b.packet_no()) {
                    Ordering::Less => Ordering::Less,
                    // the paired key itself plays before its delta
                    _ => Ordering::Greater,
                };
            }
            if b_prefix && b.class() == Some(FrameClass::Delta) {
                return match b.paired_no().cmp(&a.packet_no()) {
                    Ordering::Less => Ordering::Greater,
                    _ => Ordering::Less,
                };
            }
            // heuristic tie-break: delta precedes key
            match (a.class(), b.class()) {
                (Some(FrameClass::Delta), Some(FrameClass::Key)) => Ordering::Less,
                (Some(FrameClass::Key), Some(FrameClass::Delta)) => Ordering::Greater,
                _ => Ordering::Equal,
            }
        }
    }
}

/// Sorted sequence of buffered slots due for playout
#[derive(Debug)]
pub struct PlaybackQueue {
    items: Vec<SlotId>,
    playback_rate: f64,
}

impl PlaybackQueue {
    pub fn new(playback_rate: f64) -> Self {
        Self {
            items: Vec::new(),
            playback_rate,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn update_rate(&mut self, playback_rate: f64) {
        if playback_rate > 0.0 {
            self.playback_rate = playback_rate;
        }
    }

    /// Frame duration inferred from the declared production rate
    pub fn inferred_frame_duration_ms(&self) -> i64 {
        if self.playback_rate <= 0.0 {
            return 0;
        }
        (1000.0 / self.playback_rate).round() as i64
    }

    pub fn push(&mut self, id: SlotId, pool: &SlotPool) {
        self.items.push(id);
        self.sort(pool);
    }

    pub fn peek(&self) -> Option<SlotId> {
        self.items.first().copied()
    }

    pub fn pop(&mut self, pool: &SlotPool) -> Option<SlotId> {
        if self.items.is_empty() {
            return None;
        }
        let head = self.items.remove(0);
        self.sort(pool);
        Some(head)
    }

    /// Drop a specific slot from the queue (freed out of band)
    pub fn remove(&mut self, id: SlotId) {
        self.items.retain(|x| *x != id);
    }

    pub fn contains(&self, id: SlotId) -> bool {
        self.items.contains(&id)
    }

    /// Slot ids in current playout order
    pub fn iter_ids(&self) -> impl Iterator<Item = SlotId> + '_ {
        self.items.iter().copied()
    }

    pub fn sort(&mut self, pool: &SlotPool) {
        self.items
            .sort_by(|a, b| compare_slots(pool.get(*a), pool.get(*b)));
    }

    /// Estimated playable duration of the queued content in milliseconds.
    /// With `estimate`, unknown inter-slot gaps count as one inferred frame
    /// and the tail frame is always added; otherwise only header-backed
    /// durations count, plus one inferred frame if the tail is not fully
    /// consistent.
    pub fn playback_duration(&self, pool: &SlotPool, estimate: bool) -> i64 {
        let mut duration = 0i64;
        if self.items.is_empty() {
            return duration;
        }

        for pair in self.items.windows(2) {
            let (first, second) = (pool.get(pair[0]), pool.get(pair[1]));
            let both_header = first.consistency().has(Consistency::HEADER_META)
                && second.consistency().has(Consistency::HEADER_META);
            if both_header {
                duration += second.producer_timestamp_ms().unwrap_or(0)
                    - first.producer_timestamp_ms().unwrap_or(0);
            } else if estimate {
                duration += self.inferred_frame_duration_ms();
            }
        }

        let last = pool.get(*self.items.last().unwrap());
        if estimate || !last.consistency().has(Consistency::CONSISTENT) {
            duration += self.inferred_frame_duration_ms();
        }
        duration
    }

    /// Recompute every slot's playback deadline relative to the head
    pub fn update_deadlines(&self, pool: &mut SlotPool) {
        let mut deadline = 0i64;
        for (i, id) in self.items.iter().enumerate() {
            pool.get_mut(*id).set_playback_deadline(deadline);
            if let Some(next_id) = self.items.get(i + 1) {
                let both_header = pool.get(*id).consistency().has(Consistency::HEADER_META)
                    && pool
                        .get(*next_id)
                        .consistency()
                        .has(Consistency::HEADER_META);
                if both_header {
                    deadline += pool.get(*next_id).producer_timestamp_ms().unwrap_or(0)
                        - pool.get(*id).producer_timestamp_ms().unwrap_or(0);
                } else {
                    deadline += self.inferred_frame_duration_ms();
                }
            }
        }
    }
}

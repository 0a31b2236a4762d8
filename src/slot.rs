//! Frame slot: assembly state for one frame, and the fixed pool that owns
//! slot storage
//!
//! A slot walks Free → New → Assembling → Ready → Locked → Free. Segment
//! payloads are copied into a contiguous buffer at `index *
//! segment_payload_size`, so the assembler sees a single byte range.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::error::SlotError;
use crate::name::{
    DataPacket, FrameClass, InterestName, PacketNo, PlaybackNo, SegmentClass, SegmentNo,
};
use crate::segment::{ArrivalInfo, Segment, SegmentState};
use crate::wire::{FrameHeader, SegmentData};

/// How much of a slot's identity is trusted. Bits are only ever gained
/// until `reset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Consistency(u8);

impl Consistency {
    /// Name known only because an interest was issued
    pub const INCONSISTENT: Consistency = Consistency(0);
    /// Any segment arrived: sequence, paired and playback numbers and the
    /// segment count are trusted
    pub const PREFIX_META: Consistency = Consistency(1);
    /// Segment 0 arrived: producer timestamp and rate are trusted
    pub const HEADER_META: Consistency = Consistency(2);
    pub const CONSISTENT: Consistency = Consistency(3);

    pub fn has(&self, other: Consistency) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Consistency) {
        self.0 |= other.0;
    }
}

impl std::fmt::Display for Consistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            0 => f.write_str("inconsistent"),
            1 => f.write_str("prefix"),
            2 => f.write_str("header"),
            _ => f.write_str("consistent"),
        }
    }
}

/// Slot lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    New,
    Assembling,
    Ready,
    Locked,
}

impl SlotState {
    pub fn name(&self) -> &'static str {
        match self {
            SlotState::Free => "free",
            SlotState::New => "new",
            SlotState::Assembling => "assembling",
            SlotState::Ready => "ready",
            SlotState::Locked => "locked",
        }
    }
}

/// Outcome of a successful `add_interest`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterestAdded {
    Added,
    /// The segment was already pending or fetched; recoverable anomaly
    Duplicate,
}

/// Outcome of a successful `append_data`
#[derive(Debug, Clone, Copy)]
pub struct AppendOutcome {
    pub state: SlotState,
    /// This was the slot's first data arrival
    pub first_data: bool,
    pub gained_prefix_meta: bool,
    pub gained_header_meta: bool,
    pub arrival: ArrivalInfo,
}

/// Consumer-side storage for one frame under assembly
#[derive(Debug)]
pub struct Slot {
    state: SlotState,
    stashed_state: SlotState,
    consistency: Consistency,

    class: Option<FrameClass>,
    packet_no: Option<PacketNo>,
    paired_no: Option<PacketNo>,
    playback_no: Option<PlaybackNo>,
    producer_timestamp_ms: Option<i64>,
    packet_rate: Option<f64>,
    playback_deadline_ms: Option<i64>,
    crc: Option<u32>,
    frame_header: Option<FrameHeader>,

    segment_payload_size: usize,
    total_segments: Option<u32>,
    storage: Vec<u8>,
    assembled_bytes: usize,

    segments: BTreeMap<SegmentNo, Segment>,
    /// Placeholder for a rightmost-child interest; promoted to a concrete
    /// index on first data
    rightmost: Option<Segment>,
    parity_segments: BTreeMap<SegmentNo, Segment>,
    parity_shards: BTreeMap<SegmentNo, Bytes>,
    parity_total: Option<u32>,
    parity_frame_len: Option<u32>,

    n_pending: u32,
    n_missing: u32,
    n_fetched: u32,
}

impl Slot {
    pub fn new(segment_payload_size: usize) -> Self {
        Self {
            state: SlotState::Free,
            stashed_state: SlotState::Free,
            consistency: Consistency::INCONSISTENT,
            class: None,
            packet_no: None,
            paired_no: None,
            playback_no: None,
            producer_timestamp_ms: None,
            packet_rate: None,
            playback_deadline_ms: None,
            crc: None,
            frame_header: None,
            segment_payload_size,
            total_segments: None,
            storage: Vec::new(),
            assembled_bytes: 0,
            segments: BTreeMap::new(),
            rightmost: None,
            parity_segments: BTreeMap::new(),
            parity_shards: BTreeMap::new(),
            parity_total: None,
            parity_frame_len: None,
            n_pending: 0,
            n_missing: 0,
            n_fetched: 0,
        }
    }

    // accessors

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn consistency(&self) -> Consistency {
        self.consistency
    }

    pub fn class(&self) -> Option<FrameClass> {
        self.class
    }

    pub fn packet_no(&self) -> Option<PacketNo> {
        self.packet_no
    }

    pub fn paired_no(&self) -> Option<PacketNo> {
        self.paired_no
    }

    pub fn playback_no(&self) -> Option<PlaybackNo> {
        self.playback_no
    }

    pub fn producer_timestamp_ms(&self) -> Option<i64> {
        self.producer_timestamp_ms
    }

    pub fn packet_rate(&self) -> Option<f64> {
        self.packet_rate
    }

    pub fn playback_deadline_ms(&self) -> Option<i64> {
        self.playback_deadline_ms
    }

    pub fn set_playback_deadline(&mut self, deadline_ms: i64) {
        self.playback_deadline_ms = Some(deadline_ms);
    }

    pub fn crc(&self) -> Option<u32> {
        self.crc
    }

    pub fn frame_header(&self) -> Option<&FrameHeader> {
        self.frame_header.as_ref()
    }

    pub fn total_segments(&self) -> Option<u32> {
        self.total_segments
    }

    pub fn fetched_segments(&self) -> u32 {
        self.n_fetched
    }

    pub fn pending_segments(&self) -> u32 {
        self.n_pending
    }

    pub fn missing_segments(&self) -> u32 {
        self.n_missing
    }

    pub fn segment_payload_size(&self) -> usize {
        self.segment_payload_size
    }

    pub fn assembled_bytes(&self) -> usize {
        self.assembled_bytes
    }

    pub fn storage(&self) -> &[u8] {
        &self.storage
    }

    /// Indices of data segments that arrived
    pub fn fetched_indices(&self) -> impl Iterator<Item = SegmentNo> + '_ {
        self.segments
            .iter()
            .filter(|(_, s)| s.state() == SegmentState::Fetched)
            .map(|(no, _)| *no)
    }

    /// Actual payload size of a fetched data segment
    pub fn segment_size(&self, segment: SegmentNo) -> Option<usize> {
        self.segments.get(&segment).map(|s| s.payload_size())
    }

    pub fn segment_state(&self, class: SegmentClass, segment: SegmentNo) -> Option<SegmentState> {
        match class {
            SegmentClass::Data => self.segments.get(&segment).map(|s| s.state()),
            SegmentClass::Parity => self.parity_segments.get(&segment).map(|s| s.state()),
        }
    }

    pub fn parity_shards(&self) -> &BTreeMap<SegmentNo, Bytes> {
        &self.parity_shards
    }

    pub fn parity_total(&self) -> Option<u32> {
        self.parity_total
    }

    pub fn parity_frame_len(&self) -> Option<u32> {
        self.parity_frame_len
    }

    /// Fraction of data segments assembled, for logs
    pub fn assembled_level(&self) -> f64 {
        match self.total_segments {
            Some(total) if total > 0 => self.n_fetched as f64 / total as f64,
            _ => 0.0,
        }
    }

    /// Register an interest for one of this slot's segments. The first
    /// successful call binds the slot's namespace (and packet number, when
    /// the name carries one).
    pub fn add_interest(
        &mut self,
        name: &InterestName,
        nonce: u32,
    ) -> Result<InterestAdded, SlotError> {
        match self.state {
            SlotState::Free | SlotState::New | SlotState::Assembling => {}
            SlotState::Locked => return Err(SlotError::Locked),
            _ => {
                return Err(SlotError::InvalidState {
                    state: self.state.name(),
                })
            }
        }

        if let Some(bound) = self.class {
            if bound != name.class() {
                return Err(SlotError::NameMismatch);
            }
        }
        if let (Some(bound), Some(got)) = (self.packet_no, name.packet_no()) {
            if bound != got {
                return Err(SlotError::PacketNumberConflict { bound, got });
            }
        }

        let added = match name.segment_no() {
            None => {
                // rightmost-child (or bare frame) interest: keep a placeholder
                // until data tells us the real segment index
                match &self.rightmost {
                    Some(seg) if seg.state() == SegmentState::Pending => InterestAdded::Duplicate,
                    Some(_) | None => {
                        let seg = self.rightmost.get_or_insert_with(Segment::new);
                        if seg.state() == SegmentState::Missing {
                            self.n_missing = self.n_missing.saturating_sub(1);
                        }
                        seg.interest_issued(nonce);
                        self.n_pending += 1;
                        InterestAdded::Added
                    }
                }
            }
            Some((class, segment_no)) => {
                let map = match class {
                    SegmentClass::Data => &mut self.segments,
                    SegmentClass::Parity => &mut self.parity_segments,
                };
                match map.get_mut(&segment_no) {
                    Some(seg) if seg.state() == SegmentState::Missing => {
                        // retransmission
                        seg.interest_issued(nonce);
                        self.n_missing -= 1;
                        self.n_pending += 1;
                        InterestAdded::Added
                    }
                    Some(_) => InterestAdded::Duplicate,
                    None => {
                        let mut seg = Segment::new();
                        seg.set_number(segment_no);
                        seg.interest_issued(nonce);
                        map.insert(segment_no, seg);
                        self.n_pending += 1;
                        InterestAdded::Added
                    }
                }
            }
        };

        if added == InterestAdded::Added {
            self.class = Some(name.class());
            if let Some(pno) = name.packet_no() {
                self.packet_no = Some(pno);
            }
            if self.state == SlotState::Free {
                self.state = SlotState::New;
            }
        }
        Ok(added)
    }

    /// Mark a pending segment as missing after its interest timed out
    pub fn mark_missing(&mut self, name: &InterestName) -> Result<(), SlotError> {
        if self.state == SlotState::Locked {
            return Err(SlotError::Locked);
        }

        match name.segment_no() {
            None => match &mut self.rightmost {
                Some(seg) if seg.state() == SegmentState::Pending => {
                    seg.mark_missed();
                    self.n_pending -= 1;
                    self.n_missing += 1;
                    Ok(())
                }
                _ => Err(SlotError::NotPending(0)),
            },
            Some((class, segment_no)) => {
                let map = match class {
                    SegmentClass::Data => &mut self.segments,
                    SegmentClass::Parity => &mut self.parity_segments,
                };
                let seg = map
                    .get_mut(&segment_no)
                    .ok_or(SlotError::UnknownSegment(segment_no))?;
                if seg.state() != SegmentState::Pending {
                    return Err(SlotError::NotPending(segment_no));
                }
                seg.mark_missed();
                self.n_pending -= 1;
                self.n_missing += 1;
                Ok(())
            }
        }
    }

    /// Accept an arriving data object and route it by segment index
    pub fn append_data(&mut self, data: &DataPacket) -> Result<AppendOutcome, SlotError> {
        match self.state {
            SlotState::New | SlotState::Assembling => {}
            SlotState::Locked => return Err(SlotError::Locked),
            _ => {
                return Err(SlotError::InvalidState {
                    state: self.state.name(),
                })
            }
        }
        // the slot must still be expecting segments
        if self.n_pending == 0 && self.n_missing == 0 && self.rightmost.is_none() {
            return Err(SlotError::InvalidState {
                state: self.state.name(),
            });
        }

        let packet_no = data.name.frame.packet_no;
        if self.rightmost.is_none() {
            match self.packet_no {
                Some(bound) if bound != packet_no => return Err(SlotError::NameMismatch),
                _ => {}
            }
        }

        let first_data = self.state == SlotState::New;
        self.fix_rightmost(packet_no, data.name.class, data.name.segment);

        let gained_prefix_meta = !self.consistency.has(Consistency::PREFIX_META);
        if gained_prefix_meta {
            self.packet_no = Some(packet_no);
            self.playback_no = Some(data.prefix_meta.playback_no);
            self.paired_no = Some(data.prefix_meta.paired_seq);
            self.total_segments = Some(data.prefix_meta.total_segments);
            self.crc = Some(data.prefix_meta.crc);
            self.consistency.insert(Consistency::PREFIX_META);
            self.init_missing_segments();
        }

        let (seg_meta, payload) =
            SegmentData::unpack(&data.content).map_err(|_| SlotError::NameMismatch)?;

        let mut gained_header_meta = false;
        let arrival = match data.name.class {
            SegmentClass::Parity => {
                self.parity_total = Some(data.final_block_id + 1);
                let (frame_len, shard) = crate::wire::ParityPayload::unpack(&payload)
                    .map_err(|_| SlotError::NameMismatch)?;
                self.parity_frame_len = Some(frame_len);

                let seg = self
                    .parity_segments
                    .entry(data.name.segment)
                    .or_insert_with(|| {
                        let mut s = Segment::new();
                        s.set_number(data.name.segment);
                        s
                    });
                let was_pending = seg.state() == SegmentState::Pending;
                let was_missing = seg.state() == SegmentState::Missing;
                let arrival = seg.data_arrived(&seg_meta, shard.len());
                if was_pending {
                    self.n_pending -= 1;
                } else if was_missing {
                    self.n_missing -= 1;
                }
                self.parity_shards.insert(data.name.segment, shard);
                arrival
            }
            SegmentClass::Data => {
                let segment_no = data.name.segment;
                let stride = self.segment_payload_size;
                let offset = segment_no as usize * stride;
                let needed = match self.total_segments {
                    Some(total) => (total as usize * stride).max(offset + payload.len()),
                    None => offset + payload.len(),
                };
                if self.storage.len() < needed {
                    self.storage.resize(needed, 0);
                }
                self.storage[offset..offset + payload.len()].copy_from_slice(&payload);

                let seg = self.segments.entry(segment_no).or_insert_with(|| {
                    let mut s = Segment::new();
                    s.set_number(segment_no);
                    s
                });
                let already_fetched = seg.state() == SegmentState::Fetched;
                let was_pending = seg.state() == SegmentState::Pending;
                let was_missing = seg.state() == SegmentState::Missing;
                let arrival = seg.data_arrived(&seg_meta, payload.len());
                if !already_fetched {
                    if was_pending {
                        self.n_pending -= 1;
                    } else if was_missing {
                        self.n_missing -= 1;
                    }
                    self.n_fetched += 1;
                    self.assembled_bytes += payload.len();
                }

                if segment_no == 0 && !self.consistency.has(Consistency::HEADER_META) {
                    if let Ok(header) = FrameHeader::decode(&mut &self.storage[..]) {
                        self.producer_timestamp_ms = Some(header.producer_timestamp_ms);
                        self.packet_rate = Some(header.packet_rate);
                        self.frame_header = Some(header);
                        self.consistency.insert(Consistency::HEADER_META);
                        gained_header_meta = true;
                    }
                }
                arrival
            }
        };

        if let Some(total) = self.total_segments {
            let recoverable = self.n_fetched + self.parity_shards.len() as u32 >= total;
            if self.n_fetched >= total || recoverable {
                self.state = SlotState::Ready;
            } else {
                self.state = SlotState::Assembling;
            }
        } else {
            self.state = SlotState::Assembling;
        }

        Ok(AppendOutcome {
            state: self.state,
            first_data,
            gained_prefix_meta,
            gained_header_meta,
            arrival,
        })
    }

    /// Stash the current state and lock the slot for playout. All mutating
    /// operations fail while locked.
    pub fn lock(&mut self) -> Result<(), SlotError> {
        match self.state {
            SlotState::New | SlotState::Assembling | SlotState::Ready => {
                self.stashed_state = self.state;
                self.state = SlotState::Locked;
                Ok(())
            }
            SlotState::Locked => Err(SlotError::Locked),
            SlotState::Free => Err(SlotError::InvalidState { state: "free" }),
        }
    }

    pub fn unlock(&mut self) {
        if self.state == SlotState::Locked {
            self.state = self.stashed_state;
        }
    }

    /// Return to Free and drop all assembly state. Fails while locked.
    pub fn reset(&mut self) -> Result<(), SlotError> {
        if self.state == SlotState::Locked {
            return Err(SlotError::Locked);
        }
        let stride = self.segment_payload_size;
        *self = Slot::new(stride);
        Ok(())
    }

    fn fix_rightmost(&mut self, packet_no: PacketNo, class: SegmentClass, segment_no: SegmentNo) {
        let Some(placeholder) = self.rightmost.take() else {
            return;
        };
        self.packet_no = Some(packet_no);
        let map = match class {
            SegmentClass::Data => &mut self.segments,
            SegmentClass::Parity => &mut self.parity_segments,
        };
        if let std::collections::btree_map::Entry::Vacant(entry) = map.entry(segment_no) {
            let mut seg = placeholder;
            seg.set_number(segment_no);
            entry.insert(seg);
        } else {
            match placeholder.state() {
                SegmentState::Pending => self.n_pending -= 1,
                SegmentState::Missing => self.n_missing -= 1,
                _ => {}
            }
        }
    }

    /// Once the segment count is known, create Missing entries for every
    /// index nothing has been issued for, and drop entries past the end.
    fn init_missing_segments(&mut self) {
        let Some(total) = self.total_segments else {
            return;
        };
        for segment_no in 0..total {
            if !self.segments.contains_key(&segment_no) {
                let mut seg = Segment::new();
                seg.set_number(segment_no);
                seg.mark_missed();
                self.segments.insert(segment_no, seg);
                self.n_missing += 1;
            }
        }
        let extra: Vec<SegmentNo> = self
            .segments
            .range(total..)
            .map(|(no, _)| *no)
            .collect();
        for segment_no in extra {
            if let Some(seg) = self.segments.remove(&segment_no) {
                match seg.state() {
                    SegmentState::Pending => self.n_pending -= 1,
                    SegmentState::Missing => self.n_missing -= 1,
                    _ => {}
                }
            }
        }
    }
}

/// Pool index of a slot. Handles are plain indices; the pool is the sole
/// owner of slot memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(pub(crate) usize);

/// Fixed-capacity free list of slots
#[derive(Debug)]
pub struct SlotPool {
    slots: Vec<Slot>,
    free: Vec<SlotId>,
}

impl SlotPool {
    pub fn new(capacity: usize, segment_payload_size: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot::new(segment_payload_size))
            .collect();
        let free = (0..capacity).rev().map(SlotId).collect();
        Self { slots, free }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn reserve(&mut self) -> Option<SlotId> {
        self.free.pop()
    }

    /// Reset the slot and put it back on the free list
    pub fn release(&mut self, id: SlotId) -> Result<(), SlotError> {
        self.slots[id.0].reset()?;
        self.free.push(id);
        Ok(())
    }

    pub fn get(&self, id: SlotId) -> &Slot {
        &self.slots[id.0]
    }

    pub fn get_mut(&mut self, id: SlotId) -> &mut Slot {
        &mut self.slots[id.0]
    }
}

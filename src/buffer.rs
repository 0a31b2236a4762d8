//! Consumer frame buffer
//!
//! Brokers between the interest issuer (pipeliner), the network receiver,
//! and the playout loop. The slot map, free list and playback queue live
//! under one mutex; the pending-event list uses a reader-writer discipline
//! so waiters can scan while only the dequeuer takes the write lock.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use crate::assembler::{self, AssembledFrame, FrameInfo};
use crate::config::ConsumerConfig;
use crate::error::{AssembleError, BufferError};
use crate::name::{
    generate_nonce, DataPacket, FrameClass, FramePrefix, Interest, InterestName, PacketNo,
    PlaybackNo, SegmentClass, SegmentNo, ThreadPrefix,
};
use crate::queue::PlaybackQueue;
use crate::slot::{Consistency, InterestAdded, Slot, SlotId, SlotPool, SlotState};

/// Key of an active slot: namespace plus packet number. A rightmost-child
/// reservation has no packet number until its first data arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub class: FrameClass,
    pub packet_no: Option<PacketNo>,
}

impl SlotKey {
    fn from_interest(name: &InterestName) -> Self {
        Self {
            class: name.class(),
            packet_no: name.packet_no(),
        }
    }
}

/// Buffer event kinds, maskable for `wait_for_events`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    FreeSlot,
    FirstSegment,
    Ready,
    Timeout,
    StateChanged,
    Error,
}

impl EventKind {
    pub fn mask(&self) -> EventMask {
        match self {
            EventKind::FreeSlot => EventMask::FREE_SLOT,
            EventKind::FirstSegment => EventMask::FIRST_SEGMENT,
            EventKind::Ready => EventMask::READY,
            EventKind::Timeout => EventMask::TIMEOUT,
            EventKind::StateChanged => EventMask::STATE_CHANGED,
            EventKind::Error => EventMask::ERROR,
        }
    }
}

/// Bitmask over event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventMask(pub u32);

impl EventMask {
    pub const FREE_SLOT: EventMask = EventMask(1 << 0);
    pub const FIRST_SEGMENT: EventMask = EventMask(1 << 1);
    pub const READY: EventMask = EventMask(1 << 2);
    pub const TIMEOUT: EventMask = EventMask(1 << 3);
    pub const STATE_CHANGED: EventMask = EventMask(1 << 4);
    pub const ERROR: EventMask = EventMask(1 << 5);
    pub const ALL: EventMask = EventMask(0x3f);

    pub fn contains(&self, kind: EventKind) -> bool {
        self.0 & kind.mask().0 != 0
    }
}

impl std::ops::BitOr for EventMask {
    type Output = EventMask;
    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

/// State snapshot of the frame a buffer event refers to
#[derive(Debug, Clone)]
pub struct FrameSnapshot {
    pub class: FrameClass,
    pub packet_no: Option<PacketNo>,
    pub playback_no: Option<PlaybackNo>,
    pub paired_seq: Option<PacketNo>,
    pub state: SlotState,
    pub consistency: Consistency,
    pub total_segments: Option<u32>,
    pub fetched: u32,
    pub pending: u32,
    pub missing: u32,
}

fn snapshot(slot: &Slot) -> FrameSnapshot {
    FrameSnapshot {
        class: slot.class().unwrap_or(FrameClass::Delta),
        packet_no: slot.packet_no(),
        playback_no: slot.playback_no(),
        paired_seq: slot.paired_no(),
        state: slot.state(),
        consistency: slot.consistency(),
        total_segments: slot.total_segments(),
        fetched: slot.fetched_segments(),
        pending: slot.pending_segments(),
        missing: slot.missing_segments(),
    }
}

/// One buffer synchronization event
#[derive(Debug, Clone)]
pub struct BufferEvent {
    pub kind: EventKind,
    pub frame: Option<FrameSnapshot>,
    /// For Timeout events: the interest that went unanswered
    pub interest: Option<Interest>,
}

impl BufferEvent {
    fn bare(kind: EventKind) -> Self {
        Self {
            kind,
            frame: None,
            interest: None,
        }
    }
}

/// A head slot locked for playout, with its reconstruction result
#[derive(Debug)]
pub struct AcquiredSlot {
    pub info: FrameInfo,
    pub packet_no: Option<PacketNo>,
    pub frame: Result<AssembledFrame, AssembleError>,
}

/// Round-trip estimator fed only by original (non-cached) arrivals
#[derive(Debug, Default)]
pub struct RttEstimator {
    estimate_ms: f64,
    deviation_ms: f64,
    samples: u64,
}

impl RttEstimator {
    const ALPHA: f64 = 0.125;
    const BETA: f64 = 0.25;

    pub fn update(&mut self, sample_ms: f64) {
        if self.samples == 0 {
            self.estimate_ms = sample_ms;
            self.deviation_ms = sample_ms / 2.0;
        } else {
            self.deviation_ms = (1.0 - Self::BETA) * self.deviation_ms
                + Self::BETA * (sample_ms - self.estimate_ms).abs();
            self.estimate_ms = (1.0 - Self::ALPHA) * self.estimate_ms + Self::ALPHA * sample_ms;
        }
        self.samples += 1;
    }

    pub fn estimate_ms(&self) -> Option<f64> {
        (self.samples > 0).then_some(self.estimate_ms)
    }

    pub fn deviation_ms(&self) -> f64 {
        self.deviation_ms
    }
}

struct Inner {
    pool: SlotPool,
    active: HashMap<SlotKey, SlotId>,
    queue: PlaybackQueue,
    /// Slot currently locked by the playout loop
    acquired: Option<SlotId>,
    estimated_ms: i64,
    estimation_needed: bool,
}

impl Inner {
    fn estimate(&mut self) -> i64 {
        if self.estimation_needed {
            self.queue.sort(&self.pool);
            self.estimated_ms = self.queue.playback_duration(&self.pool, true);
            self.estimation_needed = false;
        }
        self.estimated_ms
    }

    fn second_in_queue(&self) -> Option<SlotId> {
        let head = self.queue.peek()?;
        self.queue.iter_ids().find(|id| *id != head)
    }

    fn key_of(&self, id: SlotId) -> SlotKey {
        let slot = self.pool.get(id);
        SlotKey {
            class: slot.class().unwrap_or(FrameClass::Delta),
            packet_no: slot.packet_no(),
        }
    }
}

/// The consumer-side assembly buffer
pub struct Buffer {
    config: ConsumerConfig,
    thread: ThreadPrefix,
    inner: Mutex<Inner>,
    events: RwLock<VecDeque<BufferEvent>>,
    event_notify: Notify,
    sample_notify: Notify,
    forced_release: AtomicBool,
    rtt: Mutex<RttEstimator>,
}

impl Buffer {
    pub fn new(config: ConsumerConfig, thread: ThreadPrefix) -> Self {
        let pool = SlotPool::new(config.buffer_capacity, config.segment_payload_size);
        let queue = PlaybackQueue::new(config.producer_rate_fps);
        let buffer = Self {
            config,
            thread,
            inner: Mutex::new(Inner {
                pool,
                active: HashMap::new(),
                queue,
                acquired: None,
                estimated_ms: 0,
                estimation_needed: true,
            }),
            events: RwLock::new(VecDeque::new()),
            event_notify: Notify::new(),
            sample_notify: Notify::new(),
            forced_release: AtomicBool::new(false),
            rtt: Mutex::new(RttEstimator::default()),
        };
        // seed the pipeliner: one FreeSlot event per pool slot
        for _ in 0..buffer.config.buffer_capacity {
            buffer.add_event(BufferEvent::bare(EventKind::FreeSlot));
        }
        buffer
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn thread_prefix(&self) -> &ThreadPrefix {
        &self.thread
    }

    pub fn target_size_ms(&self) -> i64 {
        self.config.jitter_target_ms as i64
    }

    pub fn rtt_estimate_ms(&self) -> Option<f64> {
        self.rtt.lock().estimate_ms()
    }

    pub fn rtt_deviation_ms(&self) -> f64 {
        self.rtt.lock().deviation_ms()
    }

    /// Look up or reserve a slot for the interest's frame and register the
    /// interest with it. Assigns a nonce if the interest has none.
    pub fn request_issued(&self, interest: &mut Interest) -> Result<SlotState, BufferError> {
        if interest.nonce == 0 {
            interest.nonce = generate_nonce();
        }
        let key = SlotKey::from_interest(&interest.name);

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let (id, newly_reserved) = match inner.active.get(&key) {
            Some(id) => (*id, false),
            None => {
                let id = inner.pool.reserve().ok_or(BufferError::NoFreeSlots)?;
                inner.active.insert(key, id);
                (id, true)
            }
        };

        match inner
            .pool
            .get_mut(id)
            .add_interest(&interest.name, interest.nonce)
        {
            Ok(InterestAdded::Added) => {}
            Ok(InterestAdded::Duplicate) => {
                tracing::warn!(name = %interest.name, "duplicate interest");
            }
            Err(e) => {
                if newly_reserved {
                    inner.active.remove(&key);
                    let _ = inner.pool.release(id);
                }
                return Err(e.into());
            }
        }

        if newly_reserved {
            inner.queue.push(id, &inner.pool);
            self.sample_notify.notify_waiters();
        }
        inner.estimation_needed = true;
        Ok(inner.pool.get(id).state())
    }

    /// Issue interests for a contiguous range of segments of one frame,
    /// each with the caller-chosen lifetime. Returns the slot state and
    /// the interests actually issued (duplicates are skipped).
    pub fn request_range_issued(
        &self,
        frame: &FramePrefix,
        class: SegmentClass,
        start: SegmentNo,
        end: SegmentNo,
        lifetime_ms: u64,
    ) -> Result<(SlotState, Vec<Interest>), BufferError> {
        let key = SlotKey {
            class: frame.class,
            packet_no: Some(frame.packet_no),
        };

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let (id, newly_reserved) = match inner.active.get(&key) {
            Some(id) => (*id, false),
            None => {
                let id = inner.pool.reserve().ok_or(BufferError::NoFreeSlots)?;
                inner.active.insert(key, id);
                (id, true)
            }
        };

        let mut issued = Vec::new();
        for segment_no in start..=end {
            let name = match class {
                SegmentClass::Data => InterestName::Segment(frame.segment(segment_no)),
                SegmentClass::Parity => InterestName::Segment(frame.parity_segment(segment_no)),
            };
            let mut interest = Interest::new(name, lifetime_ms);
            interest.nonce = generate_nonce();
            match inner
                .pool
                .get_mut(id)
                .add_interest(&interest.name, interest.nonce)
            {
                Ok(InterestAdded::Added) => issued.push(interest),
                Ok(InterestAdded::Duplicate) => {}
                Err(e) => {
                    tracing::warn!(name = %interest.name, error = %e, "range interest rejected");
                    break;
                }
            }
        }

        if newly_reserved {
            inner.queue.push(id, &inner.pool);
            self.sample_notify.notify_waiters();
        }
        inner.estimation_needed = true;
        Ok((inner.pool.get(id).state(), issued))
    }

    /// Route an arriving data object to its slot
    pub fn received(&self, data: &DataPacket) -> Result<SlotState, BufferError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        // resolve a pending rightmost reservation to the learned number
        let placeholder = SlotKey {
            class: data.name.frame.class,
            packet_no: None,
        };
        let target = SlotKey {
            class: data.name.frame.class,
            packet_no: Some(data.name.frame.packet_no),
        };
        if let Some(id) = inner.active.get(&placeholder).copied() {
            if !inner.active.contains_key(&target) {
                inner.active.remove(&placeholder);
                inner.active.insert(target, id);
                tracing::debug!(frame = %data.name.frame, "fixed rightmost reservation");
            }
        }

        let Some(id) = inner.active.get(&target).copied() else {
            tracing::warn!(name = %data.name, "data for unknown slot");
            return Err(BufferError::UnknownSlot(data.name.to_string()));
        };

        let outcome = inner.pool.get_mut(id).append_data(data)?;

        if outcome.gained_header_meta {
            if let Some(rate) = inner.pool.get(id).packet_rate() {
                inner.queue.update_rate(rate);
            }
            inner.queue.sort(&inner.pool);
        }
        if outcome.gained_prefix_meta || outcome.gained_header_meta {
            inner.queue.update_deadlines(&mut inner.pool);
        }
        inner.estimation_needed = true;

        if let Some(rtt) = outcome.arrival.rtt_ms {
            self.rtt.lock().update(rtt);
        }

        let snap = snapshot(inner.pool.get(id));
        let state = outcome.state;
        drop(guard);

        if outcome.first_data {
            self.add_event(BufferEvent {
                kind: EventKind::FirstSegment,
                frame: Some(snap.clone()),
                interest: None,
            });
        }
        if state == SlotState::Ready {
            self.add_event(BufferEvent {
                kind: EventKind::Ready,
                frame: Some(snap),
                interest: None,
            });
            self.sample_notify.notify_waiters();
        }

        Ok(state)
    }

    /// An interest went unanswered
    pub fn timeout(&self, interest: &Interest) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let key = SlotKey::from_interest(&interest.name);
        let Some(id) = inner.active.get(&key).copied() else {
            tracing::warn!(name = %interest.name, "timeout for unknown slot");
            return;
        };
        match inner.pool.get_mut(id).mark_missing(&interest.name) {
            Ok(()) => {
                let snap = snapshot(inner.pool.get(id));
                drop(guard);
                self.add_event(BufferEvent {
                    kind: EventKind::Timeout,
                    frame: Some(snap),
                    interest: Some(interest.clone()),
                });
            }
            Err(e) => {
                tracing::warn!(name = %interest.name, error = %e, "timeout for segment not pending");
            }
        }
    }

    /// Return a slot to the pool unless it is locked
    pub fn free_slot(
        &self,
        class: FrameClass,
        packet_no: Option<PacketNo>,
    ) -> Result<(), BufferError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let key = SlotKey { class, packet_no };
        let Some(id) = inner.active.get(&key).copied() else {
            return Err(BufferError::UnknownSlot(format!(
                "{}/{:?}",
                class, packet_no
            )));
        };
        if inner.pool.get(id).state() == SlotState::Locked {
            return Err(BufferError::Slot(crate::error::SlotError::Locked));
        }
        inner.active.remove(&key);
        inner.queue.remove(id);
        inner
            .pool
            .release(id)
            .expect("slot in neither free list nor locked");
        inner.estimation_needed = true;
        drop(guard);
        self.add_event(BufferEvent::bare(EventKind::FreeSlot));
        Ok(())
    }

    /// While the estimated playable duration exceeds the target, pop and
    /// free head slots. Returns the number of recycled slots.
    pub fn recycle_old(&self) -> usize {
        let mut recycled = 0;
        loop {
            let freed = {
                let mut guard = self.inner.lock();
                let inner = &mut *guard;
                if inner.estimate() <= self.target_size_ms() {
                    break;
                }
                let Some(id) = inner.queue.peek() else { break };
                if inner.pool.get(id).state() == SlotState::Locked {
                    break;
                }
                inner.queue.pop(&inner.pool);
                let key = inner.key_of(id);
                inner.active.remove(&key);
                inner
                    .pool
                    .release(id)
                    .expect("recycled slot must be releasable");
                inner.estimation_needed = true;
                true
            };
            if freed {
                recycled += 1;
                self.add_event(BufferEvent::bare(EventKind::FreeSlot));
            }
        }
        if recycled > 0 {
            tracing::debug!(recycled, "recycled old slots");
        }
        recycled
    }

    /// Playable milliseconds counting only header-backed inter-frame gaps
    pub fn playable_duration_ms(&self) -> i64 {
        let guard = self.inner.lock();
        guard.queue.playback_duration(&guard.pool, false)
    }

    /// Milliseconds of fully reconstructable content: Ready slots at one
    /// inferred frame each
    pub fn ready_duration_ms(&self) -> i64 {
        let guard = self.inner.lock();
        let ready = guard
            .queue
            .iter_ids()
            .filter(|id| guard.pool.get(*id).state() == SlotState::Ready)
            .count() as i64;
        ready * guard.queue.inferred_frame_duration_ms()
    }

    /// Estimated buffered milliseconds (unknown gaps count as one frame)
    pub fn estimated_duration_ms(&self) -> i64 {
        self.inner.lock().estimate()
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn free_slots(&self) -> usize {
        self.inner.lock().pool.free_count()
    }

    pub fn active_slots(&self) -> usize {
        self.inner.lock().active.len()
    }

    /// Milliseconds the head frame should play for: gap to the next slot's
    /// producer timestamp when known, one inferred frame otherwise. `None`
    /// when the queue is empty.
    pub fn head_playout_duration_ms(&self) -> Option<i64> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.queue.sort(&inner.pool);
        let head = inner.queue.peek()?;
        let head_slot = inner.pool.get(head);
        let head_header = head_slot.consistency().has(Consistency::HEADER_META);
        let head_ts = head_slot.producer_timestamp_ms();

        let duration = match (head_header, inner.second_in_queue()) {
            (true, Some(next_id)) => {
                let next_slot = inner.pool.get(next_id);
                if next_slot.consistency().has(Consistency::HEADER_META) {
                    next_slot.producer_timestamp_ms().unwrap_or(0) - head_ts.unwrap_or(0)
                } else {
                    inner.queue.inferred_frame_duration_ms()
                }
            }
            _ => inner.queue.inferred_frame_duration_ms(),
        };
        Some(duration.max(0))
    }

    /// Lock the head slot and attempt to reconstruct its frame
    pub fn acquire_slot(&self) -> Option<AcquiredSlot> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.queue.sort(&inner.pool);
        let id = inner.queue.peek()?;
        if inner.pool.get_mut(id).lock().is_err() {
            return None;
        }
        inner.acquired = Some(id);

        let slot = inner.pool.get(id);
        let class = slot.class().unwrap_or(FrameClass::Delta);
        let prefix = slot
            .packet_no()
            .map(|pno| FramePrefix::new(self.thread.clone(), class, pno).to_string())
            .unwrap_or_else(|| format!("{}/{}", self.thread, class));
        let info = FrameInfo {
            timestamp_us: slot.producer_timestamp_ms().unwrap_or(0).max(0) as u64 * 1000,
            playback_no: slot.playback_no().unwrap_or(0),
            frame_prefix: prefix,
            is_key: class.is_key(),
        };
        let packet_no = slot.packet_no();
        let frame = assembler::assemble(slot);
        Some(AcquiredSlot {
            info,
            packet_no,
            frame,
        })
    }

    /// Pop and free the slot locked by `acquire_slot`. Returns the playout
    /// duration to the next frame (header-backed gap or one inferred frame).
    pub fn release_acquired_slot(&self) -> i64 {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(id) = inner.acquired.take() else {
            return inner.queue.inferred_frame_duration_ms();
        };

        let released_ts = inner.pool.get(id).producer_timestamp_ms();
        inner.queue.remove(id);
        inner.queue.sort(&inner.pool);

        let duration = match (released_ts, inner.queue.peek()) {
            (Some(ts), Some(next)) => {
                let next_slot = inner.pool.get(next);
                if next_slot.consistency().has(Consistency::HEADER_META) {
                    (next_slot.producer_timestamp_ms().unwrap_or(0) - ts).max(0)
                } else {
                    inner.queue.inferred_frame_duration_ms()
                }
            }
            _ => inner.queue.inferred_frame_duration_ms(),
        };

        inner.pool.get_mut(id).unlock();
        let key = inner.key_of(id);
        inner.active.remove(&key);
        inner
            .pool
            .release(id)
            .expect("released playout slot must be resettable");
        inner.estimation_needed = true;
        drop(guard);
        self.add_event(BufferEvent::bare(EventKind::FreeSlot));
        duration
    }

    /// Reset every non-locked slot and drop all pending events
    pub fn flush(&self) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        self.events.write().clear();

        let keys: Vec<SlotKey> = inner.active.keys().copied().collect();
        let mut freed = 0;
        for key in keys {
            let id = inner.active[&key];
            if inner.pool.get(id).state() == SlotState::Locked {
                continue;
            }
            inner.active.remove(&key);
            inner.queue.remove(id);
            inner.pool.release(id).expect("non-locked slot resets");
            freed += 1;
        }
        inner.estimation_needed = true;
        drop(guard);

        tracing::debug!(freed, "buffer flushed");
        self.add_event(BufferEvent::bare(EventKind::StateChanged));
        for _ in 0..freed {
            self.add_event(BufferEvent::bare(EventKind::FreeSlot));
        }
    }

    /// Force all waiters out with an Error event
    pub fn release(&self) {
        self.forced_release.store(true, Ordering::SeqCst);
        self.event_notify.notify_waiters();
        self.sample_notify.notify_waiters();
    }

    pub fn is_released(&self) -> bool {
        self.forced_release.load(Ordering::SeqCst)
    }

    /// Block until an event matching `mask` is available, or `timeout`
    /// elapses (an Error event is returned), or the buffer is released.
    /// Non-matching events stay queued in order.
    pub async fn wait_for_events(&self, mask: EventMask, timeout: Duration) -> BufferEvent {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.forced_release.load(Ordering::SeqCst) {
                return BufferEvent::bare(EventKind::Error);
            }

            let notified = self.event_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(event) = self.try_take_event(mask) {
                return event;
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return BufferEvent::bare(EventKind::Error);
                }
            }
        }
    }

    /// Put an undispatched event back for other waiters
    pub fn recycle_event(&self, event: BufferEvent) {
        self.add_event(event);
    }

    /// Non-blocking variant of `wait_for_events`
    pub fn take_event(&self, mask: EventMask) -> Option<BufferEvent> {
        self.try_take_event(mask)
    }

    /// Wait until a fresh sample may be available for playout
    pub async fn wait_fresh_sample(&self) {
        let notified = self.sample_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.forced_release.load(Ordering::SeqCst) || self.queue_len() > 0 {
            return;
        }
        notified.await;
    }

    fn try_take_event(&self, mask: EventMask) -> Option<BufferEvent> {
        {
            let events = self.events.read();
            events.iter().position(|e| mask.contains(e.kind))?;
        }
        let mut events = self.events.write();
        let idx = events.iter().position(|e| mask.contains(e.kind))?;
        events.remove(idx)
    }

    fn add_event(&self, event: BufferEvent) {
        self.events.write().push_back(event);
        self.event_notify.notify_waiters();
    }
}

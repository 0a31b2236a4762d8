//! Interest pipelining
//!
//! The pipeliner turns buffer events into outgoing interests: a rightmost
//! bootstrap on join, the next sequential delta frame whenever a slot
//! frees up, the rest of a frame's segments (parity included) as soon as
//! its first segment reveals the geometry, paired key frames as deltas
//! reference them, and retransmissions on timeout.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::buffer::{Buffer, BufferEvent, EventKind, EventMask, FrameSnapshot};
use crate::name::{FrameClass, FramePrefix, Interest, InterestName, PacketNo, SegmentClass};
use crate::slot::SlotState;

/// Transport seam: interests leave the consumer through this
pub trait InterestSink: Send + Sync {
    fn express(&self, interest: Interest);
}

#[derive(Debug, Default)]
struct PipelinerState {
    /// Next delta frame to request; `None` until the key bootstrap
    /// resolves and hands us its paired delta
    next_delta: Option<PacketNo>,
    /// Next key frame worth requesting
    next_key: Option<PacketNo>,
    /// A rightmost interest is in flight
    bootstrap_pending: bool,
    /// Delta pipelining must not restart below this (set on rebuffer)
    exclude_below: Option<PacketNo>,
    /// Rightmost key answers must land at or past this (set on rebuffer)
    exclude_key_below: Option<PacketNo>,
    /// Highest delta frame requested so far
    last_pipelined: Option<PacketNo>,
    /// Highest delta frame that produced data; the speculation window runs
    /// `pipeline_depth` frames past this
    newest_data: Option<PacketNo>,
}

/// Consumer-side interest driver
pub struct Pipeliner {
    buffer: Arc<Buffer>,
    sink: Arc<dyn InterestSink>,
    state: Mutex<PipelinerState>,
    key_timeouts: AtomicU32,
}

impl Pipeliner {
    pub fn new(buffer: Arc<Buffer>, sink: Arc<dyn InterestSink>) -> Arc<Self> {
        Arc::new(Self {
            buffer,
            sink,
            state: Mutex::new(PipelinerState::default()),
            key_timeouts: AtomicU32::new(0),
        })
    }

    /// Key-frame interest timeouts since the last reset; the consumer
    /// session reads this for its rebuffer policy
    pub fn key_timeouts(&self) -> u32 {
        self.key_timeouts.load(Ordering::Relaxed)
    }

    pub fn last_pipelined_delta(&self) -> Option<PacketNo> {
        self.state.lock().last_pipelined
    }

    /// Forget sequencing and bootstrap again past the last pipelined frame
    pub fn reset_for_rebuffer(&self) {
        let mut state = self.state.lock();
        let exclude = state.last_pipelined.map(|p| p + 1);
        let exclude_key = state.next_key.map(|nk| nk.saturating_sub(1));
        *state = PipelinerState {
            exclude_below: exclude,
            exclude_key_below: exclude_key,
            ..PipelinerState::default()
        };
        self.key_timeouts.store(0, Ordering::Relaxed);
        tracing::debug!(?exclude, ?exclude_key, "pipeliner reset");
    }

    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.run().await })
    }

    async fn run(self: Arc<Self>) {
        let mask = EventMask::FREE_SLOT
            | EventMask::FIRST_SEGMENT
            | EventMask::TIMEOUT
            | EventMask::ERROR;
        let tick = Duration::from_millis(self.buffer.config().interest_lifetime_ms);

        loop {
            let event = self.buffer.wait_for_events(mask, tick).await;
            match event.kind {
                EventKind::Error => {
                    if self.buffer.is_released() {
                        break;
                    }
                    // idle tick: nothing to dispatch
                }
                EventKind::FreeSlot => self.fill_window(),
                EventKind::FirstSegment => {
                    if let Some(snap) = event.frame.as_ref() {
                        self.pipeline_segments(snap);
                    }
                    self.fill_window();
                }
                EventKind::Timeout => self.handle_timeout(&event),
                _ => {}
            }
        }
        tracing::debug!("pipeliner exited");
    }

    /// Keep requesting frames until the buffer window is full
    fn fill_window(&self) {
        while self.request_next_frame() {}
    }

    /// Interest lifetime sized from the measured round trip (estimate plus
    /// four deviations), floored at the configured value so cache hits and
    /// cold starts keep a sane minimum.
    fn interest_lifetime_ms(&self) -> u64 {
        let configured = self.buffer.config().interest_lifetime_ms;
        match self.buffer.rtt_estimate_ms() {
            Some(estimate) => {
                let rto = (estimate + 4.0 * self.buffer.rtt_deviation_ms()).ceil() as u64;
                configured.max(rto)
            }
            None => configured,
        }
    }

    /// Request the next frame in the schedule. Returns true if an interest
    /// went out.
    fn request_next_frame(&self) -> bool {
        let mut state = self.state.lock();
        match state.next_delta {
            None => {
                if state.bootstrap_pending {
                    return false;
                }
                // join on the key namespace: the newest key's paired
                // sequence tells us which delta starts its group
                let mut interest = Interest::new(
                    InterestName::Rightmost {
                        thread: self.buffer.thread_prefix().clone(),
                        class: FrameClass::Key,
                    },
                    self.interest_lifetime_ms(),
                );
                interest.exclude_below = state.exclude_key_below;
                match self.buffer.request_issued(&mut interest) {
                    Ok(_) => {
                        state.bootstrap_pending = true;
                        tracing::debug!(name = %interest.name, "bootstrap interest");
                        self.sink.express(interest);
                        true
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "bootstrap reservation failed");
                        false
                    }
                }
            }
            Some(next) => {
                // stay within the speculation window ahead of observed
                // data, and keep one slot spare for key frames
                if self.buffer.free_slots() <= 1 {
                    return false;
                }
                let depth = self.buffer.config().pipeline_depth as PacketNo;
                if let Some(newest) = state.newest_data {
                    if next > newest + depth {
                        return false;
                    }
                }
                let frame = FramePrefix::new(
                    self.buffer.thread_prefix().clone(),
                    FrameClass::Delta,
                    next,
                );
                let mut interest = Interest::new(
                    InterestName::Segment(frame.segment(0)),
                    self.interest_lifetime_ms(),
                );
                match self.buffer.request_issued(&mut interest) {
                    Ok(_) => {
                        state.next_delta = Some(next + 1);
                        state.last_pipelined = Some(next);
                        self.sink.express(interest);
                        true
                    }
                    Err(crate::error::BufferError::NoFreeSlots) => {
                        self.buffer.recycle_old();
                        false
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, frame = %frame, "frame request failed");
                        false
                    }
                }
            }
        }
    }

    /// First segment of a frame arrived: fetch the rest of it
    fn pipeline_segments(&self, snap: &FrameSnapshot) {
        let Some(packet_no) = snap.packet_no else {
            return;
        };
        let frame = FramePrefix::new(
            self.buffer.thread_prefix().clone(),
            snap.class,
            packet_no,
        );

        {
            let mut state = self.state.lock();
            match snap.class {
                FrameClass::Key => {
                    state.bootstrap_pending = false;
                    // delta pipelining starts at this key's paired delta
                    if state.next_delta.is_none() {
                        if let Some(paired) = snap.paired_seq {
                            let start = paired.max(state.exclude_below.unwrap_or(0));
                            state.next_delta = Some(start);
                            state.newest_data = Some(start.saturating_sub(1));
                            tracing::debug!(start, "delta pipeline anchored");
                        }
                    }
                    // keep one key interest waiting ahead of production
                    if state.next_key.map_or(true, |nk| packet_no + 1 >= nk) {
                        state.next_key = Some(packet_no + 2);
                        drop(state);
                        self.request_key_frame(packet_no + 1);
                    }
                }
                FrameClass::Delta => {
                    // fallback anchor if a delta beats the bootstrap answer
                    if state.next_delta.is_none() {
                        state.next_delta = Some(packet_no + 1);
                        state.last_pipelined = Some(packet_no);
                        state.bootstrap_pending = false;
                    }
                    state.newest_data = Some(state.newest_data.unwrap_or(0).max(packet_no));
                    // request the key this delta depends on
                    if let Some(paired) = snap.paired_seq {
                        if state.next_key.map_or(true, |nk| paired >= nk) {
                            state.next_key = Some(paired + 1);
                            drop(state);
                            self.request_key_frame(paired);
                        }
                    }
                }
            }
        }

        let Some(total) = snap.total_segments else {
            return;
        };
        let lifetime = self.interest_lifetime_ms();
        if total > 1 {
            match self
                .buffer
                .request_range_issued(&frame, SegmentClass::Data, 0, total - 1, lifetime)
            {
                Ok((_, interests)) => {
                    for interest in interests {
                        self.sink.express(interest);
                    }
                }
                Err(e) => tracing::warn!(error = %e, frame = %frame, "segment pipelining failed"),
            }
        }
        let parity = self.buffer.config().fec.parity_count(total as usize) as u32;
        if parity > 0 {
            match self
                .buffer
                .request_range_issued(&frame, SegmentClass::Parity, 0, parity - 1, lifetime)
            {
                Ok((_, interests)) => {
                    for interest in interests {
                        self.sink.express(interest);
                    }
                }
                Err(e) => tracing::warn!(error = %e, frame = %frame, "parity pipelining failed"),
            }
        }
    }

    fn request_key_frame(&self, packet_no: PacketNo) {
        let frame = FramePrefix::new(
            self.buffer.thread_prefix().clone(),
            FrameClass::Key,
            packet_no,
        );
        let mut interest = Interest::new(
            InterestName::Segment(frame.segment(0)),
            self.interest_lifetime_ms(),
        );
        match self.buffer.request_issued(&mut interest) {
            Ok(_) => self.sink.express(interest),
            Err(crate::error::BufferError::NoFreeSlots) => {
                tracing::warn!(frame = %frame, "no slot for key frame");
            }
            Err(e) => tracing::warn!(error = %e, frame = %frame, "key request failed"),
        }
    }

    /// A segment interest went unanswered: usually re-express, unless the
    /// frame fell behind the exclude filter
    fn handle_timeout(&self, event: &BufferEvent) {
        let Some(interest) = event.interest.as_ref() else {
            return;
        };
        let snap = event.frame.as_ref();

        if interest.name.class() == FrameClass::Key {
            self.key_timeouts.fetch_add(1, Ordering::Relaxed);
        }

        let exclude = self.state.lock().exclude_below;
        if let (Some(limit), Some(packet_no)) = (exclude, interest.name.packet_no()) {
            // the exclude filter tracks delta numbering only
            if interest.name.class() == FrameClass::Delta && packet_no < limit {
                let _ = self
                    .buffer
                    .free_slot(interest.name.class(), Some(packet_no));
                return;
            }
        }
        if let Some(snap) = snap {
            if snap.state == SlotState::Ready {
                // frame already complete via FEC, nothing to re-fetch
                return;
            }
        }

        let mut retry = interest.clone();
        retry.nonce = 0;
        retry.lifetime_ms = self.interest_lifetime_ms();
        match self.buffer.request_issued(&mut retry) {
            Ok(_) => {
                tracing::debug!(name = %retry.name, "retransmit");
                self.sink.express(retry);
            }
            Err(e) => {
                tracing::warn!(name = %interest.name, error = %e, "retransmit failed");
            }
        }
    }
}

//! Typed name model
//!
//! A frame lives at `{streamPrefix}/{thread}/{k|d}/{seq}`; one of its
//! segments at `.../{seq}/{seg}` (data) or `.../{seq}/parity/{seg}`
//! (FEC parity). Every published segment additionally carries a
//! `PrefixMetaInfo` name suffix and a finalBlockId component, so a consumer
//! can learn the frame geometry from any single arrival.

use std::fmt;

/// Per-namespace frame sequence number
pub type PacketNo = u64;
/// Monotonic playback number spanning both namespaces
pub type PlaybackNo = u64;
/// Zero-based segment index within a frame
pub type SegmentNo = u32;

/// Key/delta namespace selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameClass {
    Key,
    Delta,
}

impl FrameClass {
    pub fn component(&self) -> &'static str {
        match self {
            FrameClass::Key => "k",
            FrameClass::Delta => "d",
        }
    }

    pub fn is_key(&self) -> bool {
        matches!(self, FrameClass::Key)
    }
}

impl fmt::Display for FrameClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.component())
    }
}

/// Data or parity subspace of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SegmentClass {
    #[default]
    Data,
    Parity,
}

/// Stream prefix plus media thread name, e.g. `/ndn/alice/streams/cam` + `hd`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThreadPrefix {
    pub stream: String,
    pub thread: String,
}

impl ThreadPrefix {
    pub fn new(stream: impl Into<String>, thread: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            thread: thread.into(),
        }
    }
}

impl fmt::Display for ThreadPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.stream, self.thread)
    }
}

/// Name of one frame: thread prefix, namespace and sequence number
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FramePrefix {
    pub thread: ThreadPrefix,
    pub class: FrameClass,
    pub packet_no: PacketNo,
}

impl FramePrefix {
    pub fn new(thread: ThreadPrefix, class: FrameClass, packet_no: PacketNo) -> Self {
        Self {
            thread,
            class,
            packet_no,
        }
    }

    /// Name of the `segment`-th data segment of this frame
    pub fn segment(&self, segment: SegmentNo) -> SegmentName {
        SegmentName {
            frame: self.clone(),
            class: SegmentClass::Data,
            segment,
        }
    }

    /// Name of the `segment`-th parity segment of this frame
    pub fn parity_segment(&self, segment: SegmentNo) -> SegmentName {
        SegmentName {
            frame: self.clone(),
            class: SegmentClass::Parity,
            segment,
        }
    }
}

impl fmt::Display for FramePrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.thread, self.class, self.packet_no)
    }
}

/// Full segment name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SegmentName {
    pub frame: FramePrefix,
    pub class: SegmentClass,
    pub segment: SegmentNo,
}

impl fmt::Display for SegmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.class {
            SegmentClass::Data => write!(f, "{}/{}", self.frame, self.segment),
            SegmentClass::Parity => write!(f, "{}/parity/{}", self.frame, self.segment),
        }
    }
}

/// Metadata appended to every segment name, repeated on each slice so the
/// consumer can extract it from any arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefixMetaInfo {
    /// Number of data segments of the frame
    pub total_segments: u32,
    /// Monotonic playback position
    pub playback_no: PlaybackNo,
    /// Delta: sequence of the most recent key. Key: sequence of the next delta.
    pub paired_seq: PacketNo,
    /// CRC-32 of the whole frame packet
    pub crc: u32,
}

/// Name carried by an interest
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InterestName {
    /// Full segment name
    Segment(SegmentName),
    /// Frame prefix without a segment component
    Frame(FramePrefix),
    /// Rightmost-child interest: namespace prefix without a packet number,
    /// asking for the highest-numbered frame. Used on stream join.
    Rightmost { thread: ThreadPrefix, class: FrameClass },
}

impl InterestName {
    pub fn class(&self) -> FrameClass {
        match self {
            InterestName::Segment(s) => s.frame.class,
            InterestName::Frame(f) => f.class,
            InterestName::Rightmost { class, .. } => *class,
        }
    }

    /// Packet number, if the name carries one
    pub fn packet_no(&self) -> Option<PacketNo> {
        match self {
            InterestName::Segment(s) => Some(s.frame.packet_no),
            InterestName::Frame(f) => Some(f.packet_no),
            InterestName::Rightmost { .. } => None,
        }
    }

    /// Segment number, if the name carries one
    pub fn segment_no(&self) -> Option<(SegmentClass, SegmentNo)> {
        match self {
            InterestName::Segment(s) => Some((s.class, s.segment)),
            _ => None,
        }
    }
}

impl fmt::Display for InterestName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterestName::Segment(s) => s.fmt(f),
            InterestName::Frame(p) => p.fmt(f),
            InterestName::Rightmost { thread, class } => write!(f, "{}/{}", thread, class),
        }
    }
}

/// A pull request by name
#[derive(Debug, Clone)]
pub struct Interest {
    pub name: InterestName,
    /// Consumer-chosen tag echoed back in the data's per-segment metadata
    pub nonce: u32,
    pub lifetime_ms: u64,
    /// For rightmost-child interests after a rebuffer: answers must carry a
    /// packet number at or above this
    pub exclude_below: Option<PacketNo>,
}

impl Interest {
    pub fn new(name: InterestName, lifetime_ms: u64) -> Self {
        Self {
            name,
            nonce: 0,
            lifetime_ms,
            exclude_below: None,
        }
    }
}

/// Fresh 32-bit interest nonce
pub fn generate_nonce() -> u32 {
    let nonce = uuid::Uuid::new_v4().as_fields().0;
    // 0 means "no pending interest" on the wire
    if nonce == 0 {
        1
    } else {
        nonce
    }
}

/// The named, signed response: segment content plus the name-borne metadata
#[derive(Debug, Clone)]
pub struct DataPacket {
    pub name: SegmentName,
    /// Name-suffix metadata, present on every published segment
    pub prefix_meta: PrefixMetaInfo,
    /// Last segment index within this segment's subspace
    pub final_block_id: SegmentNo,
    pub freshness_ms: u64,
    /// `SegmentData` bytes: meta header followed by the payload slice
    pub content: bytes::Bytes,
    pub signature: Option<bytes::Bytes>,
}

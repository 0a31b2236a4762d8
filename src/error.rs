use thiserror::Error;

use crate::name::{PacketNo, SegmentNo};

/// Main error type for the streaming library
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("wire format error: {0}")]
    Wire(#[from] WireError),

    #[error("slot error: {0}")]
    Slot(#[from] SlotError),

    #[error("buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Errors raised while encoding or decoding wire structures
#[derive(Error, Debug)]
pub enum WireError {
    #[error("buffer too short: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("bad header marker: {0:#06x}")]
    BadHeaderMarker(u16),

    #[error("bad body marker: {0:#06x}")]
    BadBodyMarker(u16),

    #[error("frame payload checksum mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { expected: u32, computed: u32 },

    #[error("segment payload exceeds declared size: {actual} > {declared}")]
    OversizedPayload { actual: usize, declared: usize },
}

/// Slot-local errors. The slot's state is unchanged when these are returned.
#[derive(Error, Debug)]
pub enum SlotError {
    #[error("operation not allowed in state {state}")]
    InvalidState { state: &'static str },

    #[error("slot is locked")]
    Locked,

    #[error("packet number conflict: slot is bound to {bound}, got {got}")]
    PacketNumberConflict { bound: PacketNo, got: PacketNo },

    #[error("segment {0} is not pending")]
    NotPending(SegmentNo),

    #[error("no such segment: {0}")]
    UnknownSegment(SegmentNo),

    #[error("data name does not match slot binding")]
    NameMismatch,
}

/// Buffer-global errors
#[derive(Error, Debug)]
pub enum BufferError {
    #[error("no free slots")]
    NoFreeSlots,

    #[error("no slot reserved for {0}")]
    UnknownSlot(String),

    #[error("buffer released")]
    Released,

    #[error(transparent)]
    Slot(#[from] SlotError),
}

/// Producer-side publishing errors
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("empty frame payload")]
    EmptyPayload,

    #[error("frame too large: {segments} segments")]
    TooManySegments { segments: usize },

    #[error("parity encoding failed: {0}")]
    Fec(#[from] FecError),
}

/// Erasure-coding errors
#[derive(Error, Debug)]
pub enum FecError {
    #[error("invalid shard geometry: {data} data + {parity} parity")]
    BadGeometry { data: usize, parity: usize },

    #[error("shard length mismatch: expected {expected}, got {got}")]
    ShardLength { expected: usize, got: usize },

    #[error("not enough shards to reconstruct: have {have}, need {need}")]
    NotEnoughShards { have: usize, need: usize },
}

/// Frame assembly errors
#[derive(Error, Debug)]
pub enum AssembleError {
    #[error("slot holds no frame data")]
    Empty,

    #[error("missing {missing} of {total} segments and parity cannot cover the gap")]
    NotRecoverable { missing: u32, total: u32 },

    #[error(transparent)]
    Fec(#[from] FecError),

    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Convenience result alias
pub type Result<T> = std::result::Result<T, StreamError>;

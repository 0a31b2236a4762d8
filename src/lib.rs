//! # ndnstream
//!
//! Real-time video transport over a named-data substrate: a producer
//! fragments, names, signs and serves encoded video frames as addressable
//! data objects; a consumer pipelines interests for them, reassembles
//! frames from out-of-order segment arrivals, paces them onto a playback
//! timeline that honors producer capture timing, and recovers from loss,
//! jitter and burst arrival.
//!
//! ## Consumer side
//!
//! [`buffer::Buffer`] owns the slot pool and routes arriving segments into
//! per-frame [`slot::Slot`]s; [`queue::PlaybackQueue`] keeps the buffered
//! frames in playout order even while their ordering keys are still being
//! learned; [`playout::Playout`] paces frames to a downstream decoder with
//! [`jitter::JitterTiming`] compensating for loop overhead;
//! [`pipeliner::Pipeliner`] turns buffer events into outgoing interests.
//! [`consumer::VideoConsumer`] wires these into a session with rebuffer
//! handling.
//!
//! ## Producer side
//!
//! [`producer::ProducerPipeline`] takes raw frames, runs them through a
//! black-box encoder seam and hands them to [`publisher::Publisher`],
//! which segments, stamps per-segment metadata from the
//! [`pit::PendingInterestTable`], signs and sends, parity segments
//! included.
//!
//! The NDN wire protocol itself, the codec, and the rendering path are
//! collaborator seams: [`pipeliner::InterestSink`],
//! [`publisher::SegmentSink`], [`publisher::SegmentSigner`],
//! [`producer::VideoEncoder`] and [`playout::EncodedFrameConsumer`].

pub mod assembler;
pub mod buffer;
pub mod config;
pub mod consumer;
pub mod error;
pub mod fec;
pub mod jitter;
pub mod meter;
pub mod name;
pub mod pipeliner;
pub mod pit;
pub mod playout;
pub mod producer;
pub mod publisher;
pub mod queue;
pub mod segment;
pub mod slot;
pub mod stats;
pub mod wire;

#[cfg(test)]
mod integration;

pub use config::{ConsumerConfig, FecConfig, ProducerConfig, StreamConfig};
pub use error::{Result, StreamError};
pub use name::{
    DataPacket, FrameClass, FramePrefix, Interest, InterestName, SegmentName, ThreadPrefix,
};

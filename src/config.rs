//! Consumer and producer configuration

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::StreamError;

/// Forward-error-correction configuration, shared by both sides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FecConfig {
    /// Parity segments per data segment (e.g. 0.2 = one parity per five data)
    pub parity_ratio: f64,
}

impl Default for FecConfig {
    fn default() -> Self {
        Self { parity_ratio: 0.2 }
    }
}

impl FecConfig {
    /// Number of parity segments generated for `data_segments` data segments.
    /// A non-zero ratio always yields at least one parity segment.
    pub fn parity_count(&self, data_segments: usize) -> usize {
        if self.parity_ratio <= 0.0 || data_segments == 0 {
            return 0;
        }
        ((data_segments as f64 * self.parity_ratio).ceil() as usize).max(1)
    }
}

/// Consumer-side configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Slot pool capacity (frames that can be assembled concurrently)
    pub buffer_capacity: usize,

    /// Declared segment payload size in bytes; slot storage is laid out
    /// at this stride
    pub segment_payload_size: usize,

    /// Jitter buffer target in milliseconds; playout starts once this much
    /// playable content is buffered
    pub jitter_target_ms: u64,

    /// Producer frame rate used to infer frame durations before header
    /// metadata arrives
    pub producer_rate_fps: f64,

    /// Interest lifetime in milliseconds; a segment unanswered for this
    /// long times out
    pub interest_lifetime_ms: u64,

    /// How far ahead of the last requested frame the pipeliner may run
    pub pipeline_depth: usize,

    /// Rebuffer when the playout queue has been empty for this long
    pub rebuffer_threshold_ms: u64,

    /// Rebuffer after this many consecutive underruns
    pub max_underruns: u32,

    /// FEC geometry, mirrored from the producer
    pub fec: FecConfig,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 60,
            segment_payload_size: 1000,
            jitter_target_ms: 100,
            producer_rate_fps: 30.0,
            interest_lifetime_ms: 500,
            pipeline_depth: 10,
            rebuffer_threshold_ms: 3000,
            max_underruns: 10,
            fec: FecConfig::default(),
        }
    }
}

impl ConsumerConfig {
    /// Frame duration inferred from the configured producer rate
    pub fn inferred_frame_duration_ms(&self) -> u64 {
        if self.producer_rate_fps <= 0.0 {
            return 0;
        }
        (1000.0 / self.producer_rate_fps).round() as u64
    }
}

/// Producer-side configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// Stream prefix, e.g. "/ndn/alice/streams/camera"
    pub stream_prefix: String,

    /// Media thread name under the stream prefix
    pub thread_name: String,

    /// Segment payload size in bytes (frame packets are sliced at this size)
    pub segment_payload_size: usize,

    /// Data freshness period in milliseconds
    pub freshness_ms: u64,

    /// Delta frames between key frames
    pub gop_size: u32,

    /// FEC geometry
    pub fec: FecConfig,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            stream_prefix: "/ndnstream/producer".to_string(),
            thread_name: "video0".to_string(),
            segment_payload_size: 1000,
            freshness_ms: 1000,
            gop_size: 30,
            fec: FecConfig::default(),
        }
    }
}

/// Top-level configuration file contents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub producer: ProducerConfig,
}

impl StreamConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, StreamError> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| StreamError::Config(format!("read {}: {}", path.as_ref().display(), e)))?;
        toml::from_str(&text).map_err(|e| StreamError::Config(e.to_string()))
    }
}

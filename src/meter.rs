//! Rate meters and the producer wall clock
//!
//! Meters use the tokio clock so that paused-time tests observe the same
//! timeline as the rest of the pipeline.

use std::collections::VecDeque;
use parking_lot::Mutex;
use tokio::time::Instant;

/// Millisecond wall clock anchored at construction time. Produces unix-style
/// timestamps that advance with the tokio clock, so producer metadata stays
/// coherent under test-controlled time.
#[derive(Debug)]
pub struct WallClock {
    base_unix_ms: i64,
    origin: Instant,
}

impl WallClock {
    pub fn new() -> Self {
        Self {
            base_unix_ms: chrono::Utc::now().timestamp_millis(),
            origin: Instant::now(),
        }
    }

    /// Current time in unix milliseconds
    pub fn now_ms(&self) -> i64 {
        self.base_unix_ms + self.origin.elapsed().as_millis() as i64
    }

    /// Current time in microseconds since the clock origin
    pub fn elapsed_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Sliding-window event-per-second meter
#[derive(Debug)]
pub struct FrequencyMeter {
    window_ms: u64,
    ticks: Mutex<VecDeque<Instant>>,
}

impl FrequencyMeter {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            ticks: Mutex::new(VecDeque::new()),
        }
    }

    pub fn tick(&self) {
        let now = Instant::now();
        let mut ticks = self.ticks.lock();
        ticks.push_back(now);
        Self::prune(&mut ticks, now, self.window_ms);
    }

    /// Events per second over the sliding window
    pub fn rate(&self) -> f64 {
        let now = Instant::now();
        let mut ticks = self.ticks.lock();
        Self::prune(&mut ticks, now, self.window_ms);
        ticks.len() as f64 * 1000.0 / self.window_ms as f64
    }

    fn prune(ticks: &mut VecDeque<Instant>, now: Instant, window_ms: u64) {
        while let Some(front) = ticks.front() {
            if now.duration_since(*front).as_millis() as u64 > window_ms {
                ticks.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Sliding-window byte-rate meter (bits per second)
#[derive(Debug)]
pub struct DataRateMeter {
    window_ms: u64,
    samples: Mutex<VecDeque<(Instant, usize)>>,
}

impl DataRateMeter {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            samples: Mutex::new(VecDeque::new()),
        }
    }

    pub fn add(&self, bytes: usize) {
        let now = Instant::now();
        let mut samples = self.samples.lock();
        samples.push_back((now, bytes));
        Self::prune(&mut samples, now, self.window_ms);
    }

    /// Bits per second over the sliding window
    pub fn bitrate(&self) -> f64 {
        let now = Instant::now();
        let mut samples = self.samples.lock();
        Self::prune(&mut samples, now, self.window_ms);
        let bytes: usize = samples.iter().map(|(_, b)| b).sum();
        bytes as f64 * 8.0 * 1000.0 / self.window_ms as f64
    }

    fn prune(samples: &mut VecDeque<(Instant, usize)>, now: Instant, window_ms: u64) {
        while let Some((front, _)) = samples.front() {
            if now.duration_since(*front).as_millis() as u64 > window_ms {
                samples.pop_front();
            } else {
                break;
            }
        }
    }
}

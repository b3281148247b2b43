//! Sliding-window throughput accounting.
//!
//! Each session carries one meter per stream (audio, waterfall). A meter
//! keeps a monotonic byte total plus a one-second window of
//! `(timestamp, cumulative)` samples, so the admin surface can report both
//! instantaneous and lifetime-average kbps without ever scanning packets.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Width of the instantaneous-rate window.
pub const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Fixed multiplier accounting for WebSocket framing + TCP/IP overhead on
/// the delivery path. Applied to the instantaneous rate only.
pub const WIRE_OVERHEAD: f64 = 1.33;

/// Hard cap on retained samples. At typical packet rates the one-second
/// window holds far fewer; the cap bounds memory if a caller records in a
/// tight loop.
const MAX_SAMPLES: usize = 512;

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    cumulative: u64,
}

/// Monotonic byte counter with a sliding one-second sample window.
#[derive(Debug, Default)]
pub struct ThroughputMeter {
    cumulative: u64,
    samples: VecDeque<Sample>,
}

impl ThroughputMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes recorded over the meter's lifetime.
    pub fn cumulative(&self) -> u64 {
        self.cumulative
    }

    /// Record `bytes` delivered at `now` and prune samples that fell out of
    /// the window.
    pub fn record(&mut self, bytes: u64, now: Instant) {
        self.cumulative += bytes;
        if self.samples.len() == MAX_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(Sample {
            at: now,
            cumulative: self.cumulative,
        });
        self.prune(now);
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.samples.front() {
            if now.duration_since(oldest.at) > RATE_WINDOW {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Instantaneous rate in kbit/s over the last second, including the
    /// wire overhead factor. Returns 0.0 once no bytes have arrived for a
    /// full window.
    pub fn instantaneous_kbps(&self, now: Instant) -> f64 {
        let mut newest = None;
        let mut oldest = None;
        for s in self.samples.iter().rev() {
            if now.duration_since(s.at) > RATE_WINDOW {
                break;
            }
            if newest.is_none() {
                newest = Some(*s);
            }
            oldest = Some(*s);
        }
        let (Some(newest), Some(oldest)) = (newest, oldest) else {
            return 0.0;
        };

        let elapsed = newest.at.duration_since(oldest.at).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        let bytes = (newest.cumulative - oldest.cumulative) as f64;
        bytes / elapsed * 8.0 / 1000.0 * WIRE_OVERHEAD
    }

    /// Lifetime-average rate in kbit/s given the session's creation time.
    pub fn average_kbps(&self, created_at: Instant, now: Instant) -> f64 {
        let lifetime = now.duration_since(created_at).as_secs_f64();
        if lifetime <= 0.0 {
            return 0.0;
        }
        self.cumulative as f64 * 8.0 / 1000.0 / lifetime
    }
}

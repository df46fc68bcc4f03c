use std::collections::VecDeque;
use std::time::{Duration, Instant};

const DEFAULT_WINDOW: Duration = Duration::from_secs(10);
const DEFAULT_MAX_SAMPLES: usize = 128;

/// Throughput estimate over a sliding window of byte-count samples.
///
/// Feed it the number of bytes completed since the previous sample (one
/// sample per uploaded chunk works well).
#[derive(Debug)]
pub struct SpeedCalculator {
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
    max_samples: usize,
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_MAX_SAMPLES)
    }
}

impl SpeedCalculator {
    pub fn new(window: Duration, max_samples: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            window,
            max_samples: max_samples.max(2),
        }
    }

    /// Records `bytes` completed now.
    pub fn record(&mut self, bytes: u64) {
        self.record_at(Instant::now(), bytes);
    }

    fn record_at(&mut self, at: Instant, bytes: u64) {
        self.samples.push_back((at, bytes));
        while let Some(&(oldest, _)) = self.samples.front() {
            let stale = at.saturating_duration_since(oldest) > self.window;
            if stale || self.samples.len() > self.max_samples {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Average bytes per second across the window. Zero until two samples
    /// spanning a non-zero interval exist.
    pub fn bytes_per_second(&self) -> f64 {
        let (Some(&(first, _)), Some(&(last, _))) = (self.samples.front(), self.samples.back())
        else {
            return 0.0;
        };
        let span = last.saturating_duration_since(first);
        if span.is_zero() {
            return 0.0;
        }
        // The first sample marks the start of the interval.
        let bytes: u64 = self.samples.iter().skip(1).map(|&(_, b)| b).sum();
        bytes as f64 / span.as_secs_f64()
    }

    /// Time left for `remaining` bytes at the current speed.
    pub fn eta(&self, remaining: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        if speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining as f64 / speed))
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

//! Progress tracking
//!
//! [`ProgressSnapshot`] is the progress shape reported for connections,
//! downloads and tasks. [`SpeedWindow`] estimates transfer rate from a
//! sliding window of cumulative byte samples.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Default sliding window for speed estimation
pub const DEFAULT_SPEED_WINDOW: Duration = Duration::from_secs(3);

/// Point-in-time progress of a transfer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Bytes downloaded so far
    pub bytes_downloaded: u64,
    /// Total bytes to download, if known
    pub bytes_to_download: Option<u64>,
    /// Current transfer rate estimate
    pub bytes_per_second: u64,
}

impl ProgressSnapshot {
    /// Sum two snapshots (used to aggregate sibling connections)
    pub fn merge(self, other: ProgressSnapshot) -> ProgressSnapshot {
        ProgressSnapshot {
            bytes_downloaded: self.bytes_downloaded + other.bytes_downloaded,
            bytes_to_download: match (self.bytes_to_download, other.bytes_to_download) {
                (Some(a), Some(b)) => Some(a + b),
                (a, b) => a.or(b),
            },
            bytes_per_second: self.bytes_per_second + other.bytes_per_second,
        }
    }
}

/// Sliding-window speed estimator.
///
/// Samples are `{cumulative bytes, timestamp}`; the rate is
/// `(newest.bytes - oldest.bytes) / elapsed` over samples inside the window.
#[derive(Debug)]
pub struct SpeedWindow {
    window: Duration,
    samples: VecDeque<(u64, Instant)>,
}

impl SpeedWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    /// Record the current cumulative byte count
    pub fn sample(&mut self, total_bytes: u64) {
        self.sample_at(total_bytes, Instant::now());
    }

    fn sample_at(&mut self, total_bytes: u64, now: Instant) {
        self.samples.push_back((total_bytes, now));
        let Some(cutoff) = now.checked_sub(self.window) else {
            return;
        };
        while let Some(&(_, at)) = self.samples.front() {
            if at < cutoff && self.samples.len() > 1 {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Current bytes-per-second estimate
    pub fn bytes_per_second(&self) -> u64 {
        let (first, last) = match (self.samples.front(), self.samples.back()) {
            (Some(f), Some(l)) if f.1 < l.1 => (f, l),
            _ => return 0,
        };
        let elapsed = last.1.duration_since(first.1).as_secs_f64();
        if elapsed <= 0.0 {
            return 0;
        }
        ((last.0.saturating_sub(first.0)) as f64 / elapsed) as u64
    }

    /// Drop all samples (e.g. on pause or restart)
    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

impl Default for SpeedWindow {
    fn default() -> Self {
        Self::new(DEFAULT_SPEED_WINDOW)
    }
}

//! Fetch statistics and transient download progress.

use std::time::{Duration, Instant};

use serde::Serialize;

/// Progress of one in-flight download.
///
/// Owned by the fetch that creates it and dropped when that fetch ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressState {
    /// Bytes appended to the buffer so far.
    pub received: u64,
    /// Declared total length, when the server sent one.
    pub total: Option<u64>,
}

impl ProgressState {
    #[must_use]
    pub const fn new(total: Option<u64>) -> Self {
        Self { received: 0, total }
    }

    /// Percent complete rounded to one decimal place.
    ///
    /// Reads 100.0 only once every declared byte has arrived; until then it
    /// stays at or below 99.9. `None` when the total is unknown, callers fall
    /// back to a byte counter.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn percent(&self) -> Option<f64> {
        let total = self.total?;
        if total == 0 || self.received >= total {
            return Some(100.0);
        }
        let pct = (self.received as f64 / total as f64 * 1000.0).round() / 10.0;
        Some(pct.min(99.9))
    }

    /// Whether every declared byte has arrived.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.total.is_some_and(|t| self.received >= t)
    }
}

/// Statistics for a single completed fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchStats {
    /// Size of the payload in bytes.
    pub size: u64,
    /// Time from lookup to assembled buffer.
    pub elapsed: Duration,
    /// Average transfer speed in bytes per second (0 for cache hits).
    pub average_speed: u64,
    /// Fastest speed observed while streaming.
    pub peak_speed: u64,
    /// Served from the cache namespace without touching the network.
    pub from_cache: bool,
}

/// Tracks timing for a single fetch as chunks arrive.
pub struct FetchStatsTracker {
    start_time: Instant,
    received: u64,
    peak_speed: u64,
}

impl Default for FetchStatsTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl FetchStatsTracker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            received: 0,
            peak_speed: 0,
        }
    }

    /// Records a chunk and returns the running average speed in bytes/sec.
    pub fn record_bytes(&mut self, bytes: u64) -> u64 {
        self.received += bytes;
        let speed = self.average_speed();
        self.peak_speed = self.peak_speed.max(speed);
        speed
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn average_speed(&self) -> u64 {
        let secs = self.elapsed().as_secs_f64();
        if secs > 0.0 {
            (self.received as f64 / secs) as u64
        } else {
            0
        }
    }

    /// Final stats for a streamed download.
    #[must_use]
    pub fn finish(self) -> FetchStats {
        FetchStats {
            size: self.received,
            elapsed: self.elapsed(),
            average_speed: self.average_speed(),
            peak_speed: self.peak_speed,
            from_cache: false,
        }
    }

    /// Final stats for a payload served from the cache.
    #[must_use]
    pub fn finish_cached(self, size: u64) -> FetchStats {
        FetchStats {
            size,
            elapsed: self.elapsed(),
            average_speed: 0,
            peak_speed: 0,
            from_cache: true,
        }
    }
}

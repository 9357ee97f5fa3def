//! Bandwidth limiter for uploads
//!
//! Paces a single upload stream to a KB/s ceiling by sleeping between
//! chunks. The window restarts once the stream has caught up, so an idle
//! pause does not bank credit for a later burst.

use std::time::{Duration, Instant};

/// Bytes per "KB" in the configured limit
const KB: u64 = 1024;

/// Longest window before the accounting restarts
const MAX_WINDOW: Duration = Duration::from_secs(2);

/// Per-stream bandwidth limiter
#[derive(Debug, Clone)]
pub struct Throttle {
    bytes_per_sec: u64,
    window_start: Instant,
    window_bytes: u64,
}

impl Throttle {
    /// Limit to `limit_kbps` KB/s; 0 means unlimited
    pub fn new(limit_kbps: u64) -> Self {
        Self {
            bytes_per_sec: limit_kbps.saturating_mul(KB),
            window_start: Instant::now(),
            window_bytes: 0,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub fn is_limited(&self) -> bool {
        self.bytes_per_sec > 0
    }

    /// Account for `bytes` just sent; returns how long to pause to stay
    /// under the limit
    pub fn consume(&mut self, bytes: u64) -> Option<Duration> {
        if !self.is_limited() {
            return None;
        }

        let elapsed = self.window_start.elapsed();
        if elapsed >= MAX_WINDOW && self.expected(self.window_bytes) <= elapsed {
            self.window_start = Instant::now();
            self.window_bytes = 0;
        }

        self.window_bytes += bytes;
        let expected = self.expected(self.window_bytes);
        let elapsed = self.window_start.elapsed();
        if expected > elapsed {
            Some(expected - elapsed)
        } else {
            None
        }
    }

    /// Async pacing for tokio-driven clients
    pub async fn pace(&mut self, bytes: u64) {
        if let Some(delay) = self.consume(bytes) {
            tokio::time::sleep(delay).await;
        }
    }

    /// Pacing for clients running on a blocking thread
    pub fn pace_blocking(&mut self, bytes: u64) {
        if let Some(delay) = self.consume(bytes) {
            std::thread::sleep(delay);
        }
    }

    /// Time `bytes` should take at the configured rate
    fn expected(&self, bytes: u64) -> Duration {
        Duration::from_secs_f64(bytes as f64 / self.bytes_per_sec as f64)
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::unlimited()
    }
}

//! Sliding-window throughput sampling.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Computes current speed from the bytes moved during the last window.
///
/// Samples older than the window are dropped, except the newest one that
/// predates it, which anchors the window start.
#[derive(Debug, Clone)]
pub struct SpeedSampler {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
}

impl SpeedSampler {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window: window.max(Duration::from_millis(1)),
            samples: VecDeque::new(),
        }
    }

    /// Records the cumulative byte count observed at `now`.
    pub fn record(&mut self, now: Instant, total_bytes: u64) {
        self.samples.push_back((now, total_bytes));
        while self.samples.len() > 2
            && self
                .samples
                .get(1)
                .is_some_and(|(at, _)| now.saturating_duration_since(*at) >= self.window)
        {
            self.samples.pop_front();
        }
    }

    /// Bytes per second over the current window; 0 until two samples exist.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn bytes_per_second(&self) -> f64 {
        let (Some((first_at, first_bytes)), Some((last_at, last_bytes))) =
            (self.samples.front(), self.samples.back())
        else {
            return 0.0;
        };
        let elapsed = last_at.saturating_duration_since(*first_at).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        last_bytes.saturating_sub(*first_bytes) as f64 / elapsed
    }
}

use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::RetryConfig;

/// Exponential backoff with jitter, bounded by a max interval and a max
/// elapsed budget. `next()` returns `None` once the budget is spent.
pub struct Backoff {
    current: Duration,
    max_interval: Duration,
    deadline: Instant,
}

impl Backoff {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            current: Duration::from_millis(config.initial_delay_ms.max(1)),
            max_interval: Duration::from_secs(config.max_interval_secs.max(1)),
            deadline: Instant::now() + Duration::from_secs(config.max_elapsed_secs),
        }
    }

    pub fn next(&mut self) -> Option<Duration> {
        if Instant::now() >= self.deadline {
            return None;
        }
        let jitter = Duration::from_millis(
            rand::thread_rng().gen_range(0..=self.current.as_millis().max(1) as u64 / 2),
        );
        let delay = (self.current + jitter).min(self.max_interval);
        self.current = (self.current * 2).min(self.max_interval);
        Some(delay)
    }
}

/// Randomized 0–3 s delay before the single extra attempt granted to
/// authorization failures on non-refreshable credentials.
pub fn denied_retry_delay() -> Duration {
    Duration::from_secs(rand::thread_rng().gen_range(0..3))
}

//! Exponential backoff schedule shared by upstream fetches and batch writes

use rand::Rng;
use std::time::Duration;

/// Exponential backoff configuration
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub factor: f64,
    pub jitter_percent: f64,
    pub max_ms: u64,
    pub max_attempts: usize,
}

impl Default for BackoffConfig {
    /// 3 attempts, 1s, 2s, 4s, no jitter
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            factor: 2.0,
            jitter_percent: 0.0,
            max_ms: 30_000,
            max_attempts: 3,
        }
    }
}

impl BackoffConfig {
    /// Calculate backoff duration for a zero-based attempt, with jitter
    pub fn calculate_backoff(&self, attempt: usize) -> Duration {
        // base * factor^attempt, capped
        let base_backoff =
            (self.base_ms as f64 * self.factor.powi(attempt as i32)).min(self.max_ms as f64);

        if self.jitter_percent <= 0.0 {
            return Duration::from_millis(base_backoff as u64);
        }

        // ±jitter_percent
        let mut rng = rand::thread_rng();
        let jitter_range = base_backoff * self.jitter_percent;
        let jitter = rng.gen_range(-jitter_range..=jitter_range);

        let backoff_ms = (base_backoff + jitter).max(0.0) as u64;
        Duration::from_millis(backoff_ms)
    }

    /// Whether another attempt follows `attempt` (zero-based)
    pub fn has_next(&self, attempt: usize) -> bool {
        attempt + 1 < self.max_attempts
    }

    /// Sum of every backoff slept between attempts
    pub fn total_backoff(&self) -> Duration {
        (0..self.max_attempts.saturating_sub(1))
            .map(|attempt| self.calculate_backoff(attempt))
            .sum()
    }
}

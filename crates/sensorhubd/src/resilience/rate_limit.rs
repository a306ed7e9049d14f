//! Token bucket rate limiter
//!
//! One bucket is shared by every device polling the same upstream quota. Refill
//! is lazy: it happens at the start of each `consume`/`wait_time` call.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Absorbs float drift so a caller that slept `wait_time()` gets its token
const EPSILON: f64 = 1e-9;

#[derive(Debug)]
struct BucketState {
    /// Current token count, always within `0..=capacity`
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket shared across pollers
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    /// Tokens per second
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Bucket holding `capacity` tokens that refills fully over `period`
    pub fn new(capacity: u32, period: Duration) -> Self {
        let period = period.as_secs_f64().max(f64::MIN_POSITIVE);
        Self::with_rate(capacity as f64, capacity as f64 / period)
    }

    pub fn with_rate(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refill_locked(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.capacity);
        state.last_refill = now;
    }

    /// Add tokens for the time elapsed since the last refill
    pub fn refill(&self) {
        let mut state = self.lock();
        self.refill_locked(&mut state);
    }

    /// Take `n` tokens if available; state is untouched otherwise
    pub fn consume(&self, n: u32) -> bool {
        let mut state = self.lock();
        self.refill_locked(&mut state);

        let n = n as f64;
        if state.tokens + EPSILON >= n {
            state.tokens = (state.tokens - n).max(0.0);
            true
        } else {
            false
        }
    }

    /// Time until at least one token is available
    pub fn wait_time(&self) -> Duration {
        let mut state = self.lock();
        self.refill_locked(&mut state);

        let missing = (1.0 - state.tokens).max(0.0);
        if missing <= EPSILON {
            return Duration::ZERO;
        }
        if self.refill_rate <= 0.0 {
            return Duration::MAX;
        }
        Duration::from_secs_f64(missing / self.refill_rate)
    }

    /// Current tokens after a refill
    pub fn tokens_available(&self) -> f64 {
        let mut state = self.lock();
        self.refill_locked(&mut state);
        state.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }
}

impl Default for TokenBucket {
    /// 4 requests per minute
    fn default() -> Self {
        Self::new(4, Duration::from_secs(60))
    }
}

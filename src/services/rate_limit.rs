//! Process-wide token bucket bounding outbound provider calls per second.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::{sleep, Instant};

/// Token bucket rate limiter with blocking `acquire`.
///
/// A caller that finds the bucket empty reserves the next token (driving the
/// balance negative) and sleeps exactly until that token has refilled, so
/// waiters line up behind each other instead of polling. A waiter dropped
/// before its sleep ends hands the reserved token back.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiterStats {
    pub capacity: f64,
    pub tokens: f64,
    pub refill_per_sec: f64,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: u32) -> Self {
        let cap = capacity.max(1) as f64;
        Self {
            capacity: cap,
            refill_per_sec: refill_per_sec.max(1) as f64,
            state: Mutex::new(BucketState {
                tokens: cap,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Capacity and refill rate both set to `per_second`.
    pub fn per_second(per_second: u32) -> Self {
        Self::new(per_second, per_second)
    }

    /// Wait until a token is available and consume it. Never fails.
    pub async fn acquire(&self) {
        let wait = {
            let mut state = self.lock();
            self.refill(&mut state, Instant::now());

            state.tokens -= 1.0;
            if state.tokens >= 0.0 {
                return;
            }
            Duration::from_secs_f64(-state.tokens / self.refill_per_sec)
        };

        let reservation = Reservation { bucket: self };
        tracing::trace!("Rate limit reached, waiting {:?} for a token", wait);
        sleep(wait).await;
        std::mem::forget(reservation);
    }

    pub fn snapshot(&self) -> RateLimiterStats {
        let mut state = self.lock();
        self.refill(&mut state, Instant::now());
        RateLimiterStats {
            capacity: self.capacity,
            tokens: state.tokens,
            refill_per_sec: self.refill_per_sec,
        }
    }

    // Never held across an await; a poisoned lock still holds a valid balance.
    fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;
    }
}

/// A token taken ahead of time by a sleeping waiter. Dropping it returns the
/// token to the bucket.
struct Reservation<'a> {
    bucket: &'a TokenBucket,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        let mut state = self.bucket.lock();
        self.bucket.refill(&mut state, Instant::now());
        state.tokens = (state.tokens + 1.0).min(self.bucket.capacity);
    }
}

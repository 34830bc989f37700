use std::num::NonZeroUsize;
use std::ops::ControlFlow;
use std::time::Duration;

use quanta::Clock;

use super::Algorithm;
use super::Permit;
use super::Reason;
use super::Strategy;
use crate::keyed::Keyed;

const NANOS_PER_SEC: f64 = 1_000_000_000.0;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: u64,
}

/// A per-client token bucket.
///
/// Each client starts with a full bucket of `capacity` tokens that refills continuously
/// at `increment` tokens per `interval`. Fractional tokens are kept between calls, so the
/// refill rate stays exact no matter how often a client calls.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: usize,
    refill_per_sec: f64,
    clients: Keyed<Bucket>,
}

impl Strategy for TokenBucket {
    fn process(&self, key: &str) -> ControlFlow<Reason, Permit> {
        let outcome = self.clients.with(
            key,
            |now| Bucket {
                tokens: self.capacity as f64,
                last_refill: now,
            },
            |bucket, now| {
                self.refill(bucket, now);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    ControlFlow::Continue(Permit::new(bucket.tokens.floor() as usize))
                } else {
                    let wait = (1.0 - bucket.tokens) / self.refill_per_sec;
                    ControlFlow::Break(Reason::Overloaded {
                        retry_after: Duration::from_secs_f64(wait),
                    })
                }
            },
        );
        tracing::trace!(key, algorithm = %Algorithm::TokenBucket, ?outcome, "checked");
        outcome
    }

    fn limit(&self) -> usize {
        self.capacity
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::TokenBucket
    }
}

impl TokenBucket {
    /// Creates a new `TokenBucket` strategy.
    ///
    /// # Arguments
    ///
    /// * `capacity` - The burst size; every client starts with this many tokens.
    /// * `increment` - Tokens added per `interval`.
    /// * `interval` - The refill period. A zero interval is treated as one nanosecond.
    pub fn new(capacity: NonZeroUsize, increment: NonZeroUsize, interval: Duration) -> Self {
        Self::with_clock(capacity, increment, interval, Clock::new())
    }

    pub fn with_clock(
        capacity: NonZeroUsize,
        increment: NonZeroUsize,
        interval: Duration,
        clock: Clock,
    ) -> Self {
        let interval = interval.max(Duration::from_nanos(1));
        Self {
            capacity: capacity.get(),
            refill_per_sec: increment.get() as f64 / interval.as_secs_f64(),
            clients: Keyed::with_clock(clock),
        }
    }

    /// Tokens added per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_per_sec
    }

    /// Number of clients with state.
    pub fn clients(&self) -> usize {
        self.clients.len()
    }

    /// Forget clients idle for at least `idle`. Returns how many were dropped.
    pub fn evict_idle(&self, idle: Duration) -> usize {
        self.clients.evict_idle(idle)
    }

    fn refill(&self, bucket: &mut Bucket, now: u64) {
        let elapsed = now.saturating_sub(bucket.last_refill) as f64 / NANOS_PER_SEC;
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity as f64);
        bucket.last_refill = now;
    }

    #[cfg(test)]
    fn tokens(&self, key: &str) -> Option<f64> {
        self.clients.peek(key, |bucket| bucket.tokens)
    }
}

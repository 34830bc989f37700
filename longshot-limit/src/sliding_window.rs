use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::ops::ControlFlow;
use std::time::Duration;

use quanta::Clock;

use super::Algorithm;
use super::Permit;
use super::Reason;
use super::Strategy;
use crate::keyed::Keyed;

/// A Sliding Window Log implementation.
///
/// Every admitted request is recorded with its timestamp. A request is admitted when fewer
/// than `capacity` recorded requests fall inside the window `(now - period, now]`.
/// Entries that have slid out of the window are purged before every decision.
///
/// Unlike a fixed window, there is no boundary at which a client can burst twice.
#[derive(Debug)]
pub struct SlidingWindow {
    capacity: usize,
    period_ns: u64,
    clients: Keyed<VecDeque<u64>>,
}

impl SlidingWindow {
    pub fn new(capacity: NonZeroUsize, period: Duration) -> Self {
        Self::with_clock(capacity, period, Clock::new())
    }

    pub fn with_clock(capacity: NonZeroUsize, period: Duration, clock: Clock) -> Self {
        Self {
            capacity: capacity.get(),
            period_ns: (period.as_nanos() as u64).max(1),
            clients: Keyed::with_clock(clock),
        }
    }

    pub fn clients(&self) -> usize {
        self.clients.len()
    }

    /// Forget clients idle for at least `idle`. Returns how many were dropped.
    pub fn evict_idle(&self, idle: Duration) -> usize {
        self.clients.evict_idle(idle)
    }
}

impl Strategy for SlidingWindow {
    #[inline]
    fn process(&self, key: &str) -> ControlFlow<Reason, Permit> {
        let outcome = self.clients.with(
            key,
            |_| VecDeque::new(),
            |log, now| {
                // 1. Purge everything that has slid out of the window
                while log
                    .front()
                    .is_some_and(|&oldest| now - oldest >= self.period_ns)
                {
                    log.pop_front();
                }

                // 2. Admit if there is room
                if log.len() < self.capacity {
                    let remaining = self.capacity - log.len() - 1;
                    log.push_back(now);
                    ControlFlow::Continue(Permit::new(remaining))
                } else {
                    // The oldest entry leaving the window frees the next slot
                    let oldest = log.front().copied().unwrap_or(now);
                    ControlFlow::Break(Reason::Overloaded {
                        retry_after: Duration::from_nanos(oldest + self.period_ns - now),
                    })
                }
            },
        );
        tracing::trace!(key, algorithm = %Algorithm::SlidingWindow, ?outcome, "checked");
        outcome
    }

    fn limit(&self) -> usize {
        self.capacity
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::SlidingWindow
    }
}

use std::num::NonZeroUsize;
use std::ops::ControlFlow;
use std::time::Duration;

use quanta::Clock;

use super::Algorithm;
use super::Permit;
use super::Reason;
use super::Strategy;
use crate::keyed::Keyed;

#[derive(Debug)]
struct Window {
    count: usize,
    start: u64,
}

/// A simple window-based limiter.
///
/// Each client's window opens on its first request and lasts `interval`. The first
/// request after a window has elapsed opens a new one, however many windows were
/// skipped while the client was idle.
///
/// It is the cheapest strategy but is susceptible to "boundary bursts": up to double the
/// limit can be admitted in an `interval`-long span that straddles two windows.
#[derive(Debug)]
pub struct FixedWindow {
    capacity: usize,
    interval: u64,
    clients: Keyed<Window>,
}

impl Strategy for FixedWindow {
    fn process(&self, key: &str) -> ControlFlow<Reason, Permit> {
        let outcome = self.clients.with(
            key,
            |now| Window {
                count: 0,
                start: now,
            },
            |window, now| {
                if now - window.start >= self.interval {
                    window.count = 0;
                    window.start = now;
                }

                if window.count < self.capacity {
                    window.count += 1;
                    ControlFlow::Continue(Permit::new(self.capacity - window.count))
                } else {
                    ControlFlow::Break(Reason::Overloaded {
                        retry_after: Duration::from_nanos(window.start + self.interval - now),
                    })
                }
            },
        );
        tracing::trace!(key, algorithm = %Algorithm::FixedWindow, ?outcome, "checked");
        outcome
    }

    fn limit(&self) -> usize {
        self.capacity
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::FixedWindow
    }
}

impl FixedWindow {
    /// Creates a new `FixedWindow` strategy.
    ///
    /// # Arguments
    ///
    /// * `capacity` - The maximum number of requests allowed within a single window.
    /// * `interval` - The duration of the fixed time window.
    pub fn new(capacity: NonZeroUsize, interval: Duration) -> Self {
        Self::with_clock(capacity, interval, Clock::new())
    }

    pub fn with_clock(capacity: NonZeroUsize, interval: Duration, clock: Clock) -> Self {
        Self {
            capacity: capacity.get(),
            interval: (interval.as_nanos() as u64).max(1),
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

use std::num::NonZeroUsize;
use std::ops::ControlFlow;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use quanta::Clock;
use quanta::Instant;

use crate::Admission;
use crate::Algorithm;
use crate::Permit;
use crate::Reason;
use crate::store::EntryId;
use crate::store::SharedStore;

/// What a [`Distributed`] limiter does when its store cannot be reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Admit the request, flagging the [`Permit`] as degraded.
    #[default]
    Open,
    /// Reject the request with [`Reason::Unavailable`].
    Closed,
}

/// A sliding window log whose state lives in a [`SharedStore`].
///
/// Every process pointing at the same store (and prefix) enforces one shared limit per
/// key. Timestamps are wall-clock milliseconds so that separate processes agree on them.
#[derive(Debug)]
pub struct Distributed<St> {
    store: St,
    capacity: usize,
    window: Duration,
    policy: FailurePolicy,
    prefix: String,
    clock: Clock,
    anchor: Instant,
    epoch_ms: u64,
}

impl<St> Distributed<St>
where
    St: SharedStore,
{
    pub fn new(store: St, capacity: NonZeroUsize, window: Duration) -> Self {
        Self::with_clock(store, capacity, window, Clock::new())
    }

    pub fn with_clock(store: St, capacity: NonZeroUsize, window: Duration, clock: Clock) -> Self {
        let anchor = clock.now();
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self {
            store,
            capacity: capacity.get(),
            window: window.max(Duration::from_millis(1)),
            policy: FailurePolicy::default(),
            prefix: "ratelimit".to_string(),
            clock,
            anchor,
            epoch_ms,
        }
    }

    /// Set the behaviour when the store is unreachable.
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Namespace for store keys, so several limiters can share one store.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn store(&self) -> &St {
        &self.store
    }

    /// The store key used for a client.
    pub fn store_key(&self, key: &str) -> String {
        format!("{}:{key}", self.prefix)
    }

    /// Drop store state for clients whose whole log has left the window.
    pub fn evict_expired(&self) -> usize {
        self.store.evict_expired(self.now_ms(), self.window)
    }

    fn now_ms(&self) -> u64 {
        self.epoch_ms + self.clock.now().duration_since(self.anchor).as_millis() as u64
    }

    pub async fn process(&self, key: &str) -> ControlFlow<Reason, Permit> {
        let now_ms = self.now_ms();
        let entry = EntryId::generate(now_ms);
        let store_key = self.store_key(key);

        match self
            .store
            .admit(&store_key, &entry, now_ms, self.window, self.capacity)
            .await
        {
            Ok(count) if count.admitted => {
                tracing::trace!(key, %entry, count = count.count, "admitted");
                ControlFlow::Continue(Permit::new(self.capacity.saturating_sub(count.count)))
            }
            Ok(count) => {
                let oldest = count.oldest_ms.unwrap_or(now_ms);
                let free_at = oldest + self.window.as_millis() as u64;
                ControlFlow::Break(Reason::Overloaded {
                    retry_after: Duration::from_millis(free_at.saturating_sub(now_ms)),
                })
            }
            Err(err) => match self.policy {
                FailurePolicy::Open => {
                    tracing::warn!(
                        key,
                        store = self.store.name(),
                        %err,
                        "shared store unavailable, failing open"
                    );
                    ControlFlow::Continue(Permit {
                        remaining: 0,
                        degraded: true,
                    })
                }
                FailurePolicy::Closed => {
                    tracing::warn!(
                        key,
                        store = self.store.name(),
                        %err,
                        "shared store unavailable, failing closed"
                    );
                    ControlFlow::Break(Reason::Unavailable)
                }
            },
        }
    }
}

#[async_trait]
impl<St> Admission for Distributed<St>
where
    St: SharedStore,
{
    async fn check(&self, key: &str) -> ControlFlow<Reason, Permit> {
        self.process(key).await
    }

    fn limit(&self) -> usize {
        self.capacity
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::Distributed
    }
}

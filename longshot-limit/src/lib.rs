//! # longshot-limit
//!
//! `longshot-limit` provides keyed rate limiting strategies: every decision is made for a
//! client identity (an IP address, an API key, a user id) and each identity carries its
//! own state.
//!
//! ## Core Philosophy
//!
//! Per-client state lives in a sharded [`dashmap::DashMap`]. Each entry is guarded by its
//! own short critical section, so concurrent checks for the *same* client serialize while
//! checks for *different* clients never wait on each other.
//!
//! ## Key Concepts
//!
//! * **Lazy Evaluation**: Tokens and windows are recalculated at the moment of the request,
//!   eliminating the need for background worker threads or timers.
//! * **Lazy State**: A client's state is created on its first request.
//! * **Strategy Trait**: A unified interface for the in-process algorithms.
//! * **Admission Trait**: An async, object safe interface covering every strategy plus the
//!   shared-store [`Distributed`] limiter.
//!
//! ## Example
//!
//! ```rust
//! use longshot_limit::TokenBucket;
//! use longshot_limit::Strategy;
//! use std::time::Duration;
//! use std::num::NonZeroUsize;
//!
//! let capacity = NonZeroUsize::new(100).unwrap();
//! let increment = NonZeroUsize::new(10).unwrap();
//! let bucket = TokenBucket::new(capacity, increment, Duration::from_secs(1));
//!
//! if bucket.process("10.0.0.1").is_continue() {
//!     // Request allowed
//! }
//! ```

use std::fmt;
use std::fmt::Debug;
use std::ops::ControlFlow;
use std::time::Duration;

use async_trait::async_trait;

mod distributed;
mod fixed_window;
mod keyed;
mod sliding_window;
mod store;
mod token_bucket;

pub use distributed::Distributed;
pub use distributed::FailurePolicy;
pub use fixed_window::FixedWindow;
pub use sliding_window::SlidingWindow;
pub use store::EntryId;
pub use store::MemoryStore;
#[cfg(feature = "redis")]
pub use store::RedisStore;
pub use store::SharedStore;
pub use store::StoreError;
pub use store::WindowCount;
pub use token_bucket::TokenBucket;

/// Reasons why a request might be rejected by a strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum Reason {
    /// The client has used its allowance. Retrying before `retry_after` cannot succeed.
    Overloaded { retry_after: Duration },
    /// The shared store backing a [`Distributed`] limiter could not be reached and the
    /// limiter is configured to fail closed.
    Unavailable,
}

impl Reason {
    /// `retry_after` rounded up to whole seconds, as used by the `Retry-After` header.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::Overloaded { retry_after } => {
                let secs = retry_after.as_secs();
                if retry_after.subsec_nanos() > 0 {
                    Some(secs + 1)
                } else {
                    Some(secs)
                }
            }
            Self::Unavailable => None,
        }
    }
}

/// An admission grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permit {
    /// How many more requests the client may make right now.
    pub remaining: usize,
    /// Set when the decision was made without consulting the shared store
    /// (a fail-open [`Distributed`] limiter whose store was unreachable).
    pub degraded: bool,
}

impl Permit {
    pub(crate) fn new(remaining: usize) -> Self {
        Self {
            remaining,
            degraded: false,
        }
    }
}

/// The rate limiting algorithm behind a limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    TokenBucket,
    FixedWindow,
    SlidingWindow,
    Distributed,
}

impl Algorithm {
    pub const ALL: [Algorithm; 4] = [
        Algorithm::TokenBucket,
        Algorithm::FixedWindow,
        Algorithm::SlidingWindow,
        Algorithm::Distributed,
    ];

    /// The kebab-case name used in URLs and the `X-RateLimit-Algorithm` header.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::TokenBucket => "token-bucket",
            Self::FixedWindow => "fixed-window",
            Self::SlidingWindow => "sliding-window",
            Self::Distributed => "distributed",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The core trait for the in-process rate limiting algorithms.
///
/// Strategies must be `Send` and `Sync` to allow sharing across thread boundaries
/// via `Arc`.
pub trait Strategy: Debug + Send + Sync {
    /// Attempts to admit a single request for `key`.
    ///
    /// This method never blocks on another client's state.
    ///
    /// # Errors
    ///
    /// Returns `Reason` if the rate limit for `key` has been reached.
    fn process(&self, key: &str) -> ControlFlow<Reason, Permit>;

    /// The maximum number of requests a client may make in a burst.
    fn limit(&self) -> usize;

    fn algorithm(&self) -> Algorithm;
}

/// Async admission control, implemented by every [`Strategy`] and by [`Distributed`].
///
/// This is the interface a request pipeline holds (usually as `Arc<dyn Admission>`),
/// so in-process and shared-store limiters are interchangeable.
#[async_trait]
pub trait Admission: Debug + Send + Sync {
    async fn check(&self, key: &str) -> ControlFlow<Reason, Permit>;

    fn limit(&self) -> usize;

    fn algorithm(&self) -> Algorithm;
}

#[async_trait]
impl<S> Admission for S
where
    S: Strategy,
{
    async fn check(&self, key: &str) -> ControlFlow<Reason, Permit> {
        self.process(key)
    }

    fn limit(&self) -> usize {
        Strategy::limit(self)
    }

    fn algorithm(&self) -> Algorithm {
        Strategy::algorithm(self)
    }
}

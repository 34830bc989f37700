//! # longshot-poll
//!
//! Holds a request open until a named resource changes or a deadline passes.
//!
//! A [`Coordinator`] owns a set of resources, each with a value and an `updated_at`
//! timestamp. Callers ask [`Coordinator::await_change`] whether a resource moved past a
//! timestamp they have already seen: they get the new state immediately when it has, and
//! otherwise park until the next [`Coordinator::mutate`] or their timeout.
//!
//! Each parked call is backed by a [`Responder`], a one-shot slot that can be resolved
//! exactly once. Notification, timeout and cancellation all race for it, and only the
//! winner acts.
//!
//! ```rust
//! use std::time::Duration;
//!
//! use longshot_poll::Change;
//! use longshot_poll::Coordinator;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let coordinator = Coordinator::new();
//! coordinator.insert("EVENT#00", 0i64);
//!
//! let waiter = coordinator.clone();
//! let pending = tokio::spawn(async move {
//!     waiter.await_change("EVENT#00", 0, Duration::from_secs(30)).await
//! });
//!
//! while coordinator.waiting("EVENT#00") == 0 {
//!     tokio::task::yield_now().await;
//! }
//! coordinator.mutate("EVENT#00", 42).unwrap();
//!
//! match pending.await.unwrap().unwrap() {
//!     Change::Updated(snapshot) => assert_eq!(snapshot.value, 42),
//!     Change::TimedOut => unreachable!(),
//! }
//! # }
//! ```

mod clock;
mod coordinator;
mod error;
mod mutator;
mod responder;

pub use clock::Clock;
pub use clock::ManualClock;
pub use clock::SystemClock;
pub use coordinator::Change;
pub use coordinator::Coordinator;
pub use coordinator::Snapshot;
pub use coordinator::Stats;
pub use error::PollError;
pub use error::parse_last_seen;
pub use mutator::Mutator;
pub use mutator::MutatorConfig;
pub use mutator::MutatorHandle;
pub use responder::Responder;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::Clock;
use crate::PollError;
use crate::Responder;
use crate::SystemClock;

/// The state of a resource at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot<V> {
    pub id: String,
    pub value: V,
    /// Epoch milliseconds of the last mutation, `0` for a resource never mutated.
    pub updated_at: u64,
}

/// How an [`await_change`](Coordinator::await_change) call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change<V> {
    /// The resource is newer than the caller's `last_seen`.
    Updated(Snapshot<V>),
    /// The deadline passed first.
    TimedOut,
}

/// Counters for every wait that was ever parked.
///
/// Each registered wait ends in exactly one of the other three buckets, so once nothing is
/// parked `registered == resolved + timed_out + cancelled`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub registered: u64,
    pub resolved: u64,
    pub timed_out: u64,
    pub cancelled: u64,
}

impl Stats {
    /// Waits registered but not yet settled.
    pub fn pending(&self) -> u64 {
        self.registered
            .saturating_sub(self.resolved + self.timed_out + self.cancelled)
    }
}

#[derive(Debug, Default)]
struct Counters {
    registered: AtomicU64,
    resolved: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
}

struct Resource<V> {
    value: V,
    updated_at: u64,
    waiters: HashMap<u64, Responder<Snapshot<V>>>,
}

impl<V: Clone> Resource<V> {
    fn snapshot(&self, id: &str) -> Snapshot<V> {
        Snapshot {
            id: id.to_owned(),
            value: self.value.clone(),
            updated_at: self.updated_at,
        }
    }
}

type Shared<V> = Arc<Mutex<Resource<V>>>;

struct Inner<V, C> {
    resources: RwLock<HashMap<String, Shared<V>>>,
    clock: C,
    next_waiter: AtomicU64,
    counters: Counters,
}

/// Parks callers until a resource changes.
///
/// Cheap to clone; clones share every resource. The value and the waiters of a resource
/// sit behind one mutex, so a mutation and the notification of everyone parked on it
/// happen together: a wait registered before the commit is always woken by it, and one
/// registered after never is.
pub struct Coordinator<V, C = SystemClock> {
    inner: Arc<Inner<V, C>>,
}

impl<V, C> Clone for Coordinator<V, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V, C> fmt::Debug for Coordinator<V, C>
where
    V: Clone + Send + 'static,
    C: Clock,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("resources", &self.ids().len())
            .field("clock", &self.inner.clock)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<V> Coordinator<V, SystemClock>
where
    V: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl<V> Default for Coordinator<V, SystemClock>
where
    V: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V, C> Coordinator<V, C>
where
    V: Clone + Send + 'static,
    C: Clock,
{
    pub fn with_clock(clock: C) -> Self {
        Self {
            inner: Arc::new(Inner {
                resources: RwLock::new(HashMap::new()),
                clock,
                next_waiter: AtomicU64::new(0),
                counters: Counters::default(),
            }),
        }
    }

    /// Seed a resource with `updated_at = 0`. Returns `false`, changing nothing, if `id`
    /// already exists.
    pub fn insert(&self, id: impl Into<String>, value: V) -> bool {
        let id = id.into();
        let mut resources = self
            .inner
            .resources
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if resources.contains_key(&id) {
            return false;
        }
        tracing::debug!(%id, "resource registered");
        resources.insert(
            id,
            Arc::new(Mutex::new(Resource {
                value,
                updated_at: 0,
                waiters: HashMap::new(),
            })),
        );
        true
    }

    /// Every resource id, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .resources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort_unstable();
        ids
    }

    /// # Errors
    ///
    /// [`PollError::NotFound`] for an unknown id.
    pub fn snapshot(&self, id: &str) -> Result<Snapshot<V>, PollError> {
        let resource = self.resource(id)?;
        let snapshot = lock(&resource).snapshot(id);
        Ok(snapshot)
    }

    /// Every resource, sorted by id.
    pub fn snapshots(&self) -> Vec<Snapshot<V>> {
        self.ids()
            .iter()
            .filter_map(|id| self.snapshot(id).ok())
            .collect()
    }

    /// Calls currently parked on `id`.
    pub fn waiting(&self, id: &str) -> usize {
        self.resource(id)
            .map(|resource| lock(&resource).waiters.len())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> Stats {
        let counters = &self.inner.counters;
        Stats {
            registered: counters.registered.load(Ordering::Acquire),
            resolved: counters.resolved.load(Ordering::Acquire),
            timed_out: counters.timed_out.load(Ordering::Acquire),
            cancelled: counters.cancelled.load(Ordering::Acquire),
        }
    }

    /// Wait until `id` has been updated after `last_seen`, or `timeout` elapses.
    ///
    /// Returns at once if the resource is already newer. Dropping the returned future
    /// deregisters the wait.
    ///
    /// # Errors
    ///
    /// [`PollError::NotFound`] for an unknown id. Nothing is registered in that case.
    pub async fn await_change(
        &self,
        id: &str,
        last_seen: u64,
        timeout: Duration,
    ) -> Result<Change<V>, PollError> {
        let resource = self.resource(id)?;
        let deadline = Instant::now() + timeout;

        let (mut guard, mut rx) = {
            let mut state = lock(&resource);
            if state.updated_at > last_seen {
                tracing::trace!(%id, last_seen, updated_at = state.updated_at, "already changed");
                return Ok(Change::Updated(state.snapshot(id)));
            }

            let waiter = self.inner.next_waiter.fetch_add(1, Ordering::Relaxed);
            let (responder, rx) = Responder::new();
            state.waiters.insert(waiter, responder.clone());
            self.inner
                .counters
                .registered
                .fetch_add(1, Ordering::AcqRel);
            tracing::trace!(%id, waiter, last_seen, "parked");

            let guard = WaitGuard {
                coordinator: self,
                resource: Arc::clone(&resource),
                waiter,
                responder,
                armed: true,
            };
            (guard, rx)
        };

        if let Ok(Ok(snapshot)) = tokio::time::timeout_at(deadline, &mut rx).await {
            guard.disarm();
            return Ok(Change::Updated(snapshot));
        }

        Ok(guard.expire(rx).await)
    }

    /// Replace the value of `id` and wake everyone parked on it.
    ///
    /// `updated_at` becomes the current time, or one past the previous stamp if the clock
    /// has not moved on.
    ///
    /// # Errors
    ///
    /// [`PollError::NotFound`] for an unknown id.
    pub fn mutate(&self, id: &str, value: V) -> Result<Snapshot<V>, PollError> {
        self.update(id, |_| value)
    }

    /// Like [`mutate`](Self::mutate), computing the new value from the current one.
    ///
    /// # Errors
    ///
    /// [`PollError::NotFound`] for an unknown id.
    pub fn update<F>(&self, id: &str, f: F) -> Result<Snapshot<V>, PollError>
    where
        F: FnOnce(&V) -> V,
    {
        let resource = self.resource(id)?;
        let mut state = lock(&resource);

        state.value = f(&state.value);
        state.updated_at = self
            .inner
            .clock
            .now_millis()
            .max(state.updated_at.saturating_add(1));
        let snapshot = state.snapshot(id);

        let mut resolved = 0;
        for (_, responder) in state.waiters.drain() {
            if responder.resolve(snapshot.clone()) {
                resolved += 1;
            }
        }
        self.inner
            .counters
            .resolved
            .fetch_add(resolved, Ordering::AcqRel);

        tracing::debug!(%id, updated_at = snapshot.updated_at, resolved, "resource mutated");
        Ok(snapshot)
    }

    fn resource(&self, id: &str) -> Result<Shared<V>, PollError> {
        self.inner
            .resources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| PollError::NotFound(id.to_owned()))
    }
}

fn lock<V>(resource: &Mutex<Resource<V>>) -> MutexGuard<'_, Resource<V>> {
    resource.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Deregisters a parked wait if the `await_change` future is dropped before it settles.
struct WaitGuard<'a, V, C> {
    coordinator: &'a Coordinator<V, C>,
    resource: Shared<V>,
    waiter: u64,
    responder: Responder<Snapshot<V>>,
    armed: bool,
}

impl<V, C> WaitGuard<'_, V, C> {
    fn disarm(&mut self) {
        self.armed = false;
    }

    fn deregister(&self) {
        lock(&self.resource).waiters.remove(&self.waiter);
    }

    /// The deadline passed, or the channel closed. Either the timeout wins the responder,
    /// or a mutation beat it and its value is already on the way.
    async fn expire(mut self, rx: oneshot::Receiver<Snapshot<V>>) -> Change<V> {
        self.disarm();
        if self.responder.claim() {
            self.deregister();
            self.coordinator
                .inner
                .counters
                .timed_out
                .fetch_add(1, Ordering::AcqRel);
            tracing::trace!(waiter = self.waiter, "timed out");
            return Change::TimedOut;
        }
        match rx.await {
            Ok(snapshot) => Change::Updated(snapshot),
            Err(_) => Change::TimedOut,
        }
    }
}

impl<V, C> Drop for WaitGuard<'_, V, C> {
    fn drop(&mut self) {
        if self.armed && self.responder.claim() {
            self.deregister();
            self.coordinator
                .inner
                .counters
                .cancelled
                .fetch_add(1, Ordering::AcqRel);
            tracing::trace!(waiter = self.waiter, "cancelled");
        }
    }
}

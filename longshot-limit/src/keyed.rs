use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use dashmap::DashMap;
use quanta::Clock;
use quanta::Instant;

/// Per-client state for a strategy.
///
/// The map itself is only locked (per shard) long enough to clone out the client's slot;
/// all algorithm work happens under the slot's own mutex.
pub(crate) struct Keyed<T> {
    clients: DashMap<String, Arc<Mutex<Slot<T>>>>,
    clock: Clock,
    anchor: Instant,
}

struct Slot<T> {
    state: T,
    touched: u64,
}

impl<T> fmt::Debug for Keyed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keyed")
            .field("clients", &self.clients.len())
            .finish()
    }
}

impl<T> Keyed<T> {
    pub(crate) fn with_clock(clock: Clock) -> Self {
        let anchor = clock.now();
        Self {
            clients: DashMap::new(),
            clock,
            anchor,
        }
    }

    /// Nanoseconds since this map was created.
    pub(crate) fn now(&self) -> u64 {
        self.clock.now().duration_since(self.anchor).as_nanos() as u64
    }

    /// Run `f` against the state for `key`, creating it with `init` on first use.
    pub(crate) fn with<R>(
        &self,
        key: &str,
        init: impl FnOnce(u64) -> T,
        f: impl FnOnce(&mut T, u64) -> R,
    ) -> R {
        let slot = match self.clients.get(key) {
            Some(slot) => Arc::clone(slot.value()),
            None => {
                let now = self.now();
                Arc::clone(
                    self.clients
                        .entry(key.to_owned())
                        .or_insert_with(|| {
                            Arc::new(Mutex::new(Slot {
                                state: init(now),
                                touched: now,
                            }))
                        })
                        .value(),
                )
            }
        };

        let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
        // Read the clock while holding the lock so `now` never runs backwards for a client.
        let now = self.now().max(slot.touched);
        slot.touched = now;
        f(&mut slot.state, now)
    }

    /// Read-only access to an existing client's state.
    #[cfg(test)]
    pub(crate) fn peek<R>(&self, key: &str, f: impl FnOnce(&T) -> R) -> Option<R> {
        let slot = Arc::clone(self.clients.get(key)?.value());
        let slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
        Some(f(&slot.state))
    }

    pub(crate) fn len(&self) -> usize {
        self.clients.len()
    }

    /// Forget every client that has not been seen for at least `idle`.
    ///
    /// A client evicted while a check is in flight simply starts over with fresh state.
    pub(crate) fn evict_idle(&self, idle: Duration) -> usize {
        let now = self.now();
        let idle = idle.as_nanos() as u64;
        let before = self.clients.len();
        self.clients.retain(|_, slot| {
            let slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
            now.saturating_sub(slot.touched) < idle
        });
        before.saturating_sub(self.clients.len())
    }
}

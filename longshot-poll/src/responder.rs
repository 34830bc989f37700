use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use tokio::sync::oneshot;

struct Slot<T> {
    fired: AtomicBool,
    tx: Mutex<Option<oneshot::Sender<T>>>,
}

/// A one-shot answer to a parked request.
///
/// Clones share one slot. Whoever first wins the `fired` flag, through [`resolve`] or
/// [`claim`], decides the outcome; every later attempt is ignored.
///
/// [`resolve`]: Responder::resolve
/// [`claim`]: Responder::claim
pub struct Responder<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Responder<T> {
    /// A responder and the receiver its value is delivered to.
    pub fn new() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        let responder = Self {
            slot: Arc::new(Slot {
                fired: AtomicBool::new(false),
                tx: Mutex::new(Some(tx)),
            }),
        };
        (responder, rx)
    }

    /// Deliver `value` unless the responder already fired. Returns whether this call won.
    pub fn resolve(&self, value: T) -> bool {
        if !self.win() {
            return false;
        }
        let tx = self
            .slot
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = tx {
            // The receiver may be gone already; the responder still counts as fired.
            let _ = tx.send(value);
        }
        true
    }

    /// Fire without delivering anything. Returns whether this call won.
    pub fn claim(&self) -> bool {
        if !self.win() {
            return false;
        }
        self.slot
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        true
    }

    pub fn is_fired(&self) -> bool {
        self.slot.fired.load(Ordering::Acquire)
    }

    fn win(&self) -> bool {
        self.slot
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl<T> Clone for Responder<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> fmt::Debug for Responder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("fired", &self.is_fired())
            .finish()
    }
}

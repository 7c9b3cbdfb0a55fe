use parking_lot::{Condvar, Mutex};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

/// Single-assignment result slot shared between a producer and waiters.
///
/// The first [`set`](ResultCell::set) wins; later writes are ignored and
/// report `false`.
///
/// # Example
/// ```rust
/// use focus_core::prelude::ResultCell;
///
/// let cell = ResultCell::new();
/// assert!(cell.set(true));
/// assert!(!cell.set(false));
/// assert_eq!(cell.wait(), true);
/// ```
pub struct ResultCell<T> {
    inner: Arc<CellInner<T>>,
}

struct CellInner<T> {
    value: Mutex<Option<T>>,
    ready: Condvar,
}

impl<T> Clone for ResultCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for ResultCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ResultCell<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CellInner {
                value: Mutex::new(None),
                ready: Condvar::new(),
            }),
        }
    }

    /// Store `value` if nothing has been stored yet.
    pub fn set(&self, value: T) -> bool {
        let mut slot = self.inner.value.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        self.inner.ready.notify_all();
        true
    }

    pub fn is_set(&self) -> bool {
        self.inner.value.lock().is_some()
    }
}

impl<T: Clone> ResultCell<T> {
    pub fn try_get(&self) -> Option<T> {
        self.inner.value.lock().as_ref().cloned()
    }

    /// Block until a value is stored.
    pub fn wait(&self) -> T {
        let mut slot = self.inner.value.lock();
        loop {
            if let Some(value) = slot.as_ref() {
                return value.clone();
            }
            self.inner.ready.wait(&mut slot);
        }
    }

    /// Block for at most `timeout`; `None` if nothing arrived in time.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.inner.value.lock();
        loop {
            if let Some(value) = slot.as_ref() {
                return Some(value.clone());
            }
            if self.inner.ready.wait_until(&mut slot, deadline).timed_out() {
                return slot.as_ref().cloned();
            }
        }
    }
}

impl<T> std::fmt::Debug for ResultCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCell")
            .field("set", &self.is_set())
            .finish()
    }
}

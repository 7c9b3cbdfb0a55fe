//! Fixed-capacity, key-ordered ring buffer with reference-counted pinning.
//!
//! Elements are keyed by an `i64` (sensor timestamp or frame number). Once
//! the buffer is full, admitting a new key evicts the least-keyed unpinned
//! slot. One pin permit fewer than the number of resident slots is ever
//! available, so a full buffer always has an unpinned slot to evict.

use parking_lot::{Condvar, Mutex};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    panic::{AssertUnwindSafe, catch_unwind, resume_unwind},
    sync::Arc,
};

use crate::{executor::ExecutorHandle, metrics::RingMetrics};

/// Producer side of [`SharedRingBuffer::swap_least`].
///
/// Exactly one of `create`, `swap` or `update` runs per successful call.
/// Payloads are shared with pin holders by cloning, so `update` only makes
/// sense for payloads with interior mutability (typically an `Arc`).
pub trait SwapTask<E> {
    /// Build the payload for a new key while the buffer is under capacity.
    fn create(&mut self) -> E;

    /// Recycle the evicted payload into the payload for the new key.
    fn swap(&mut self, evicted: E) -> E;

    /// Merge into the payload already stored under the key.
    fn update(&mut self, existing: &E);

    /// A payload produced by `create` or `swap` could not be admitted.
    fn discard(&mut self, payload: E) {
        drop(payload);
    }
}

/// Listener for pin headroom transitions.
pub type PinStateListener = Arc<dyn Fn(bool) + Send + Sync>;

struct Slot<E> {
    payload: E,
    pins: u32,
}

struct RingState<E> {
    elements: BTreeMap<i64, Slot<E>>,
    unpinned: BTreeSet<i64>,
    pin_permits: isize,
    closed: bool,
    listener: Option<(ExecutorHandle, PinStateListener)>,
}

impl<E> RingState<E> {
    fn notify(&self, available: bool) {
        if let Some((executor, listener)) = &self.listener {
            let listener = listener.clone();
            let outcome = executor.execute(move || listener(available));
            if !outcome.is_ok() {
                tracing::debug!(?outcome, available, "pin state notification dropped");
            }
        }
    }

    fn pinned_slots(&self) -> usize {
        self.elements.len() - self.unpinned.len()
    }
}

/// Concurrent shared ring buffer.
///
/// `swap_least` calls are serialized against each other; pin and release
/// only take the short internal state lock and never block on a swap.
///
/// # Example
/// ```rust
/// use std::sync::Arc;
/// use focus_core::prelude::{SharedRingBuffer, SwapTask};
///
/// struct Insert(u32);
/// impl SwapTask<Arc<u32>> for Insert {
///     fn create(&mut self) -> Arc<u32> { Arc::new(self.0) }
///     fn swap(&mut self, _old: Arc<u32>) -> Arc<u32> { Arc::new(self.0) }
///     fn update(&mut self, _existing: &Arc<u32>) {}
/// }
///
/// let ring = SharedRingBuffer::new(2);
/// assert!(ring.swap_least(10, &mut Insert(1)));
/// assert!(ring.swap_least(20, &mut Insert(2)));
/// let (key, value) = ring.try_pin_greatest().unwrap();
/// assert_eq!((key, *value), (20, 2));
/// ring.release(key);
/// ```
pub struct SharedRingBuffer<E> {
    capacity: usize,
    swap_lock: Mutex<()>,
    state: Mutex<RingState<E>>,
    drained: Condvar,
    metrics: RingMetrics,
}

impl<E: Clone> SharedRingBuffer<E> {
    /// Create an empty buffer holding at most `capacity` elements.
    ///
    /// # Panics
    /// If `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be positive");
        Self {
            capacity,
            swap_lock: Mutex::new(()),
            state: Mutex::new(RingState {
                elements: BTreeMap::new(),
                unpinned: BTreeSet::new(),
                pin_permits: -1,
                closed: false,
                listener: None,
            }),
            drained: Condvar::new(),
            metrics: RingMetrics::default(),
        }
    }

    /// Register the pin headroom listener; notifications are posted to `executor`.
    pub fn set_listener<F>(&self, executor: ExecutorHandle, listener: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.state.lock().listener = Some((executor, Arc::new(listener)));
    }

    /// Insert or update the slot for `key`. Returns `false` only when closed.
    ///
    /// # Panics
    /// If the buffer is full and every slot is pinned, which the pin permit
    /// accounting rules out.
    pub fn swap_least<T>(&self, key: i64, task: &mut T) -> bool
    where
        T: SwapTask<E> + ?Sized,
    {
        let _serial = self.swap_lock.lock();

        let (existing, under_capacity) = {
            let state = self.state.lock();
            if state.closed {
                self.metrics.rejected();
                return false;
            }
            (
                state.elements.get(&key).map(|slot| slot.payload.clone()),
                state.elements.len() < self.capacity,
            )
        };

        if let Some(existing) = existing {
            task.update(&existing);
            self.metrics.updated();
            return true;
        }

        if under_capacity {
            let payload = task.create();
            let mut state = self.state.lock();
            if state.closed {
                drop(state);
                self.metrics.rejected();
                task.discard(payload);
                return false;
            }
            state.elements.insert(key, Slot { payload, pins: 0 });
            state.unpinned.insert(key);
            state.pin_permits += 1;
            if state.pin_permits == 1 {
                state.notify(true);
            }
            self.metrics.created();
            return true;
        }

        let (evicted_key, evicted) = {
            let mut state = self.state.lock();
            let Some(least) = state.unpinned.pop_first() else {
                panic!("ring buffer full with no unpinned element");
            };
            let Some(slot) = state.elements.remove(&least) else {
                panic!("unpinned index references missing key {least}");
            };
            (least, slot.payload)
        };

        let payload = match catch_unwind(AssertUnwindSafe(|| task.swap(evicted))) {
            Ok(payload) => payload,
            Err(panic) => {
                // The evicted slot is gone for good; give back its permit.
                let mut state = self.state.lock();
                state.pin_permits -= 1;
                if state.pin_permits == 0 {
                    state.notify(false);
                }
                drop(state);
                resume_unwind(panic);
            }
        };

        let mut state = self.state.lock();
        if state.closed {
            drop(state);
            task.discard(payload);
            return false;
        }
        state.elements.insert(key, Slot { payload, pins: 0 });
        state.unpinned.insert(key);
        debug_assert!(state.elements.len() <= self.capacity);
        self.metrics.evicted();
        tracing::trace!(evicted = evicted_key, key, "swapped least unpinned slot");
        true
    }

    /// Pin the slot at `key` without removing it.
    ///
    /// Fails when closed, when the key is absent, or when pinning an
    /// unpinned slot would leave the buffer without an evictable slot.
    pub fn try_pin(&self, key: i64) -> Option<(i64, E)> {
        let mut state = self.state.lock();
        self.pin_locked(&mut state, key)
    }

    fn pin_locked(&self, state: &mut RingState<E>, key: i64) -> Option<(i64, E)> {
        if state.closed {
            self.metrics.pin_miss();
            return None;
        }
        let Some(slot) = state.elements.get_mut(&key) else {
            self.metrics.pin_miss();
            return None;
        };
        let mut took_last_permit = false;
        if slot.pins == 0 {
            if state.pin_permits <= 0 {
                self.metrics.pin_miss();
                return None;
            }
            state.pin_permits -= 1;
            state.unpinned.remove(&key);
            took_last_permit = state.pin_permits <= 0;
        }
        slot.pins += 1;
        let payload = slot.payload.clone();
        if took_last_permit {
            state.notify(false);
        }
        self.metrics.pin_hit();
        Some((key, payload))
    }

    /// Drop one pin on `key`. Honored even after [`close`](Self::close).
    ///
    /// # Panics
    /// If `key` is not resident or not pinned.
    pub fn release(&self, key: i64) {
        let mut state = self.state.lock();
        let Some(slot) = state.elements.get_mut(&key) else {
            panic!("release of key {key} which is not in the ring buffer");
        };
        if slot.pins == 0 {
            panic!("release of key {key} which is not pinned");
        }
        slot.pins -= 1;
        if slot.pins == 0 {
            state.unpinned.insert(key);
            state.pin_permits += 1;
            if state.pin_permits == 1 {
                state.notify(true);
            }
            if state.closed {
                self.drained.notify_all();
            }
        }
    }

    /// Pin the slot with the greatest key.
    pub fn try_pin_greatest(&self) -> Option<(i64, E)> {
        let mut state = self.state.lock();
        let greatest = *state.elements.keys().next_back()?;
        self.pin_locked(&mut state, greatest)
    }

    /// Pin the greatest-keyed slot whose payload satisfies `selector`.
    ///
    /// Scans a snapshot of keys from greatest to least, holding at most one
    /// tentative pin at a time. Keys evicted after the snapshot count as misses.
    pub fn try_pin_greatest_selected<F>(&self, mut selector: F) -> Option<(i64, E)>
    where
        F: FnMut(&E) -> bool,
    {
        let keys: Vec<i64> = {
            let state = self.state.lock();
            if state.closed {
                return None;
            }
            state.elements.keys().copied().collect()
        };

        for key in keys.into_iter().rev() {
            let Some((key, payload)) = self.try_pin(key) else {
                continue;
            };
            match catch_unwind(AssertUnwindSafe(|| selector(&payload))) {
                Ok(true) => return Some((key, payload)),
                Ok(false) => self.release(key),
                Err(panic) => {
                    self.release(key);
                    resume_unwind(panic);
                }
            }
        }
        None
    }

    /// Close the buffer, wait for outstanding pins, then dispose every payload.
    ///
    /// Blocks until all pinned slots are released. Returns immediately if the
    /// buffer was already closed.
    pub fn close<F>(&self, mut dispose: F)
    where
        F: FnMut(E),
    {
        let mut state = {
            let _serial = self.swap_lock.lock();
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.notify(false);
            state
        };

        let pinned = state.pinned_slots();
        if pinned > 0 {
            tracing::debug!(pinned, "ring buffer close waiting for pins");
        }
        while state.pinned_slots() > 0 {
            self.drained.wait(&mut state);
        }

        let elements = std::mem::take(&mut state.elements);
        state.unpinned.clear();
        drop(state);

        for (_, slot) in elements {
            dispose(slot.payload);
        }
    }
}

impl<E> SharedRingBuffer<E> {
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().elements.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of slots with at least one pin.
    pub fn pinned_count(&self) -> usize {
        self.state.lock().pinned_slots()
    }

    /// True while another unpinned slot may be pinned.
    pub fn has_pin_headroom(&self) -> bool {
        let state = self.state.lock();
        !state.closed && state.pin_permits > 0
    }

    /// Resident keys in ascending order.
    pub fn keys(&self) -> Vec<i64> {
        self.state.lock().elements.keys().copied().collect()
    }

    pub fn metrics(&self) -> &RingMetrics {
        &self.metrics
    }
}

impl<E> fmt::Debug for SharedRingBuffer<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SharedRingBuffer")
            .field("capacity", &self.capacity)
            .field("len", &state.elements.len())
            .field("pinned", &state.pinned_slots())
            .field("closed", &state.closed)
            .finish()
    }
}

/// Pin that releases itself when dropped.
///
/// Moving the guard into a consumer task ties the release to the task's
/// completion, including unwinding.
pub struct PinGuard<E: Clone> {
    ring: Arc<SharedRingBuffer<E>>,
    key: i64,
    payload: E,
}

impl<E: Clone> PinGuard<E> {
    /// Take ownership of a pin obtained from `ring`.
    pub fn adopt(ring: Arc<SharedRingBuffer<E>>, (key, payload): (i64, E)) -> Self {
        Self { ring, key, payload }
    }

    pub fn key(&self) -> i64 {
        self.key
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }
}

impl<E: Clone> Drop for PinGuard<E> {
    fn drop(&mut self) {
        self.ring.release(self.key);
    }
}

impl<E: Clone> fmt::Debug for PinGuard<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinGuard").field("key", &self.key).finish()
    }
}

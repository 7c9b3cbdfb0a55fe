//! Correlates images and metadata into the shared ring buffer and resolves
//! capture requests against it.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, atomic::AtomicU64},
    time::{Duration, Instant},
};

use focus_core::prelude::*;
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;

use crate::{
    CaptureCallbacks,
    captured::CapturedPair,
    metadata_table::{MetadataChange, MetadataTable},
};

/// Image callbacks slower than this are logged.
pub const DEFAULT_CALLBACK_BUDGET: Duration = Duration::from_millis(25);

/// Predicate over frame metadata deciding whether a frame may be captured.
pub trait CaptureConstraint: Send + Sync {
    fn satisfied_by(&self, metadata: &CaptureMetadata) -> bool;
}

impl<F> CaptureConstraint for F
where
    F: Fn(&CaptureMetadata) -> bool + Send + Sync,
{
    fn satisfied_by(&self, metadata: &CaptureMetadata) -> bool {
        self(metadata)
    }
}

/// Constraints that must all hold for a frame to be selected.
pub type ConstraintSet = SmallVec<[Arc<dyn CaptureConstraint>; 4]>;

/// Receives the selected frame on the capture executor.
///
/// The image is only lent for the duration of the call; its slot is
/// released when the call returns.
pub trait ImageCaptureListener: Send + Sync {
    fn on_image_captured(&self, image: &Image, metadata: &CaptureMetadata);
}

impl<F> ImageCaptureListener for F
where
    F: Fn(&Image, &CaptureMetadata) + Send + Sync,
{
    fn on_image_captured(&self, image: &Image, metadata: &CaptureMetadata) {
        self(image, metadata)
    }
}

/// Notified on the listener executor when the latest value for a key changes.
pub trait MetadataChangeListener: Send + Sync {
    fn on_metadata_change(
        &self,
        key: MetadataKey,
        old: Option<&MetadataValue>,
        new: &MetadataValue,
        metadata: &CaptureMetadata,
    );
}

impl<F> MetadataChangeListener for F
where
    F: Fn(MetadataKey, Option<&MetadataValue>, &MetadataValue, &CaptureMetadata) + Send + Sync,
{
    fn on_metadata_change(
        &self,
        key: MetadataKey,
        old: Option<&MetadataValue>,
        new: &MetadataValue,
        metadata: &CaptureMetadata,
    ) {
        self(key, old, new, metadata)
    }
}

type Ring = SharedRingBuffer<Arc<CapturedPair>>;

struct PendingCapture {
    listener: Arc<dyn ImageCaptureListener>,
    constraints: ConstraintSet,
}

type ChangeListeners = HashMap<MetadataKey, Vec<(ListenerId, Arc<dyn MetadataChangeListener>)>>;

struct ImageSwap(Option<Image>);

impl SwapTask<Arc<CapturedPair>> for ImageSwap {
    fn create(&mut self) -> Arc<CapturedPair> {
        let pair = CapturedPair::default();
        if let Some(image) = self.0.take() {
            pair.add_image(image);
        }
        Arc::new(pair)
    }

    fn swap(&mut self, evicted: Arc<CapturedPair>) -> Arc<CapturedPair> {
        evicted.reset();
        if let Some(image) = self.0.take() {
            evicted.add_image(image);
        }
        evicted
    }

    fn update(&mut self, existing: &Arc<CapturedPair>) {
        if let Some(image) = self.0.take() {
            existing.add_image(image);
        }
    }

    fn discard(&mut self, payload: Arc<CapturedPair>) {
        payload.reset();
    }
}

struct MetadataSwap(Arc<CaptureMetadata>);

impl SwapTask<Arc<CapturedPair>> for MetadataSwap {
    fn create(&mut self) -> Arc<CapturedPair> {
        Arc::new(CapturedPair::with_metadata(self.0.clone()))
    }

    fn swap(&mut self, evicted: Arc<CapturedPair>) -> Arc<CapturedPair> {
        evicted.reset();
        evicted.add_metadata(self.0.clone());
        evicted
    }

    fn update(&mut self, existing: &Arc<CapturedPair>) {
        existing.add_metadata(self.0.clone());
    }

    fn discard(&mut self, payload: Arc<CapturedPair>) {
        payload.reset();
    }
}

/// Session-scoped correlator between the capture source and the ring buffer.
///
/// Images and metadata are merged per sensor timestamp. At most one
/// prospective capture request is pending at a time; a new one silently
/// replaces the old.
///
/// # Example
/// ```rust
/// use std::{num::NonZeroU32, sync::{Arc, mpsc}, time::Duration};
/// use focus_capture::prelude::*;
///
/// let listeners = TaskExecutor::serial("doc-listeners", 64).unwrap();
/// let captures = TaskExecutor::pool("doc-captures", 2, 64).unwrap();
/// let manager = ImageCaptureManager::new(3, listeners.handle(), captures.handle());
/// let pool = BufferPool::with_capacity(4, 16);
/// let one = NonZeroU32::new(1).unwrap();
///
/// let (tx, rx) = mpsc::channel();
/// let tx = parking_lot::Mutex::new(tx);
/// manager.capture_next(
///     Arc::new(move |image: &Image, _meta: &CaptureMetadata| {
///         let _ = tx.lock().send(image.timestamp());
///     }),
///     ConstraintSet::new(),
/// );
/// for ts in [100, 200] {
///     manager.on_image(Image::new(ts, ImageFormat::Jpeg, one, one, pool.lease()));
///     manager.on_metadata(Arc::new(CaptureMetadata::new(ts / 100, ts)));
/// }
/// assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 200);
/// ```
pub struct ImageCaptureManager {
    ring: Arc<Ring>,
    listener_executor: ExecutorHandle,
    capture_executor: ExecutorHandle,
    pending: Mutex<Option<PendingCapture>>,
    table: MetadataTable,
    change_listeners: RwLock<ChangeListeners>,
    ids: AtomicU64,
    callback_budget: Duration,
}

impl ImageCaptureManager {
    /// `capacity` is the ring size; listener callbacks run on
    /// `listener_executor`, capture hand-offs on `capture_executor`.
    pub fn new(
        capacity: usize,
        listener_executor: ExecutorHandle,
        capture_executor: ExecutorHandle,
    ) -> Self {
        Self {
            ring: Arc::new(SharedRingBuffer::new(capacity)),
            listener_executor,
            capture_executor,
            pending: Mutex::new(None),
            table: MetadataTable::default(),
            change_listeners: RwLock::new(HashMap::new()),
            ids: AtomicU64::new(0),
            callback_budget: DEFAULT_CALLBACK_BUDGET,
        }
    }

    pub fn with_callback_budget(mut self, budget: Duration) -> Self {
        self.callback_budget = budget;
        self
    }

    /// Admit an image into the ring; released immediately if not admitted.
    pub fn on_image(&self, image: Image) {
        let start = Instant::now();
        let timestamp = image.timestamp();
        let mut task = ImageSwap(Some(image));
        if !self.ring.swap_least(timestamp, &mut task) {
            tracing::debug!(timestamp, "image not admitted; closing");
        }
        drop(task);

        self.try_execute_pending(timestamp);

        let elapsed = start.elapsed();
        if elapsed > self.callback_budget {
            tracing::warn!(timestamp, ?elapsed, "image callback over budget");
        }
    }

    /// Admit the full metadata for a frame and fan out key changes.
    pub fn on_metadata(&self, metadata: Arc<CaptureMetadata>) {
        let timestamp = metadata.timestamp();
        let mut task = MetadataSwap(metadata.clone());
        if !self.ring.swap_least(timestamp, &mut task) {
            tracing::debug!(timestamp, "metadata not admitted");
        }
        self.record_changes(&metadata);
        self.try_execute_pending(timestamp);
    }

    /// Track early metadata without touching the ring.
    pub fn on_partial_metadata(&self, metadata: Arc<CaptureMetadata>) {
        self.record_changes(&metadata);
    }

    fn record_changes(&self, metadata: &Arc<CaptureMetadata>) {
        let changes = self.table.update(metadata);
        if changes.is_empty() {
            return;
        }
        let listeners = self.change_listeners.read();
        for MetadataChange { key, old, new } in changes {
            let Some(registered) = listeners.get(&key) else {
                continue;
            };
            for (_, listener) in registered {
                let listener = listener.clone();
                let metadata = metadata.clone();
                let old = old.clone();
                let new = new.clone();
                tracing::trace!(key = %key, "dispatching metadata change");
                let outcome = self.listener_executor.execute(move || {
                    listener.on_metadata_change(key, old.as_ref(), &new, &metadata);
                });
                if !outcome.is_ok() {
                    tracing::debug!(key = %key, ?outcome, "metadata change dropped");
                }
            }
        }
    }

    /// Arm a prospective capture of the next complete frame satisfying
    /// `constraints`, replacing any request already pending.
    pub fn capture_next(
        &self,
        listener: Arc<dyn ImageCaptureListener>,
        constraints: ConstraintSet,
    ) {
        let previous = self.pending.lock().replace(PendingCapture {
            listener,
            constraints,
        });
        if previous.is_some() {
            tracing::debug!("pending capture superseded");
        }
    }

    /// Drop the pending request, if any, without invoking it.
    pub fn cancel_pending_capture(&self) -> bool {
        self.pending.lock().take().is_some()
    }

    pub fn has_pending_capture(&self) -> bool {
        self.pending.lock().is_some()
    }

    fn try_execute_pending(&self, timestamp: i64) {
        let mut pending = self.pending.lock();
        let Some(request) = pending.as_ref() else {
            return;
        };
        let Some(pinned) = self.ring.try_pin(timestamp) else {
            return;
        };
        let guard = PinGuard::adopt(self.ring.clone(), pinned);
        let Some(metadata) = guard.payload().metadata() else {
            return;
        };
        if !guard.payload().has_image() {
            return;
        }
        if !request
            .constraints
            .iter()
            .all(|constraint| constraint.satisfied_by(&metadata))
        {
            return;
        }
        if self.hand_off(guard, request.listener.clone()) {
            *pending = None;
        }
    }

    /// Retroactively capture the newest complete frame satisfying `constraints`.
    ///
    /// Returns `false` without side effects when nothing matches or the
    /// capture executor refuses the hand-off.
    pub fn try_capture_existing(
        &self,
        listener: Arc<dyn ImageCaptureListener>,
        constraints: &[Arc<dyn CaptureConstraint>],
    ) -> bool {
        let selected = self.ring.try_pin_greatest_selected(|pair| {
            pair.with_parts(|_, metadata| constraints.iter().all(|c| c.satisfied_by(metadata)))
                .unwrap_or(false)
        });
        match selected {
            Some(pinned) => self.hand_off(PinGuard::adopt(self.ring.clone(), pinned), listener),
            None => false,
        }
    }

    fn hand_off(
        &self,
        guard: PinGuard<Arc<CapturedPair>>,
        listener: Arc<dyn ImageCaptureListener>,
    ) -> bool {
        let key = guard.key();
        let outcome = self.capture_executor.execute(move || {
            let delivered = guard
                .payload()
                .with_parts(|image, metadata| listener.on_image_captured(image, metadata));
            if delivered.is_none() {
                tracing::error!(key = guard.key(), "pinned frame lost its image or metadata");
            }
        });
        match outcome {
            SendOutcome::Ok => {
                tracing::debug!(key, "frame handed off");
                true
            }
            outcome => {
                tracing::warn!(key, ?outcome, "capture executor refused frame");
                false
            }
        }
    }

    /// Report pin headroom transitions on the listener executor.
    pub fn set_capture_ready_listener<F>(&self, listener: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.ring
            .set_listener(self.listener_executor.clone(), listener);
    }

    pub fn add_metadata_change_listener(
        &self,
        key: MetadataKey,
        listener: Arc<dyn MetadataChangeListener>,
    ) -> ListenerId {
        let id = ListenerId::next(&self.ids);
        self.change_listeners
            .write()
            .entry(key)
            .or_default()
            .push((id, listener));
        id
    }

    /// Returns `false` if `id` was not registered for `key`.
    pub fn remove_metadata_change_listener(&self, key: MetadataKey, id: ListenerId) -> bool {
        let mut listeners = self.change_listeners.write();
        let Some(registered) = listeners.get_mut(&key) else {
            return false;
        };
        let before = registered.len();
        registered.retain(|(existing, _)| *existing != id);
        let removed = registered.len() != before;
        if registered.is_empty() {
            listeners.remove(&key);
        }
        removed
    }

    /// Latest recorded value for `key`.
    pub fn latest(&self, key: MetadataKey) -> Option<MetadataValue> {
        self.table.get(key)
    }

    pub fn has_pin_headroom(&self) -> bool {
        self.ring.has_pin_headroom()
    }

    pub fn ring_metrics(&self) -> &RingMetrics {
        self.ring.metrics()
    }

    /// Timestamps currently resident in the ring.
    pub fn buffered_timestamps(&self) -> Vec<i64> {
        self.ring.keys()
    }

    /// Drop the pending request, wait for in-flight captures, and close every
    /// buffered image.
    pub fn close(&self) {
        self.cancel_pending_capture();
        self.ring.close(|pair| pair.reset());
        tracing::debug!("capture manager closed");
    }
}

impl CaptureCallbacks for ImageCaptureManager {
    fn on_image(&self, image: Image) {
        ImageCaptureManager::on_image(self, image);
    }

    fn on_partial_metadata(&self, metadata: Arc<CaptureMetadata>) {
        ImageCaptureManager::on_partial_metadata(self, metadata);
    }

    fn on_metadata(&self, metadata: Arc<CaptureMetadata>) {
        ImageCaptureManager::on_metadata(self, metadata);
    }
}

impl fmt::Debug for ImageCaptureManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageCaptureManager")
            .field("ring", &self.ring)
            .field("pending", &self.has_pending_capture())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroU32;
    use std::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(5);

    struct Harness {
        _listeners: TaskExecutor,
        captures: TaskExecutor,
        manager: ImageCaptureManager,
        pool: BufferPool,
    }

    impl Harness {
        fn new(capacity: usize) -> Self {
            let listeners = TaskExecutor::serial("test-listeners", 256).unwrap();
            let captures = TaskExecutor::pool("test-captures", 2, 256).unwrap();
            let manager = ImageCaptureManager::new(capacity, listeners.handle(), captures.handle());
            Self {
                _listeners: listeners,
                captures,
                manager,
                pool: BufferPool::with_capacity(capacity + 2, 16),
            }
        }

        fn image(&self, timestamp: i64) {
            let one = NonZeroU32::new(1).unwrap();
            let image = Image::new(timestamp, ImageFormat::Jpeg, one, one, self.pool.lease());
            self.manager.on_image(image);
        }

        fn metadata(&self, metadata: CaptureMetadata) {
            self.manager.on_metadata(Arc::new(metadata));
        }

        fn frame(&self, timestamp: i64) {
            self.image(timestamp);
            self.metadata(CaptureMetadata::new(timestamp, timestamp));
        }
    }

    fn recorder() -> (Arc<dyn ImageCaptureListener>, mpsc::Receiver<i64>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let listener: Arc<dyn ImageCaptureListener> =
            Arc::new(move |image: &Image, _: &CaptureMetadata| {
                let _ = tx.lock().send(image.timestamp());
            });
        (listener, rx)
    }

    fn flash_fired() -> ConstraintSet {
        let constraint = |meta: &CaptureMetadata| meta.flash_state() == Some(FlashState::Fired);
        let mut set = ConstraintSet::new();
        set.push(Arc::new(constraint));
        set
    }

    #[test]
    fn capture_next_waits_for_satisfying_frame() {
        let h = Harness::new(4);
        let (listener, rx) = recorder();
        h.manager.capture_next(listener, flash_fired());

        h.image(100);
        h.metadata(CaptureMetadata::new(1, 100).with(MetadataKey::FLASH_MODE, FlashMode::Off));
        assert!(h.manager.has_pending_capture());

        h.image(101);
        h.metadata(CaptureMetadata::new(2, 101).with(MetadataKey::FLASH_STATE, FlashState::Fired));
        assert_eq!(rx.recv_timeout(WAIT), Ok(101));
        assert!(!h.manager.has_pending_capture());

        h.captures.shutdown();
        assert!(rx.try_recv().is_err());
        assert_eq!(h.manager.ring.pinned_count(), 0);
    }

    #[test]
    fn metadata_first_then_image_resolves() {
        let h = Harness::new(3);
        let (listener, rx) = recorder();
        h.manager.capture_next(listener, ConstraintSet::new());
        h.metadata(CaptureMetadata::new(1, 10));
        h.metadata(CaptureMetadata::new(2, 20));
        assert!(h.manager.has_pending_capture());
        h.image(20);
        assert_eq!(rx.recv_timeout(WAIT), Ok(20));
    }

    #[test]
    fn superseded_request_never_fires() {
        let h = Harness::new(4);
        let (first, first_rx) = recorder();
        let (second, second_rx) = recorder();
        h.manager.capture_next(first, ConstraintSet::new());
        h.manager.capture_next(second, ConstraintSet::new());
        h.frame(1);
        h.frame(2);
        assert_eq!(second_rx.recv_timeout(WAIT), Ok(2));
        h.captures.shutdown();
        assert!(first_rx.try_recv().is_err());
    }

    #[test]
    fn existing_capture_picks_newest_match() {
        let h = Harness::new(4);
        for ts in 1..=4 {
            let state = if ts == 2 { FlashState::Fired } else { FlashState::Ready };
            h.image(ts);
            h.metadata(CaptureMetadata::new(ts, ts).with(MetadataKey::FLASH_STATE, state));
        }
        let (listener, rx) = recorder();
        assert!(h.manager.try_capture_existing(listener.clone(), &flash_fired()));
        assert_eq!(rx.recv_timeout(WAIT), Ok(2));

        let none: ConstraintSet = {
            let mut set = ConstraintSet::new();
            set.push(Arc::new(|_: &CaptureMetadata| false));
            set
        };
        assert!(!h.manager.try_capture_existing(listener, &none));
    }

    #[test]
    fn incomplete_frames_are_never_selected() {
        let h = Harness::new(4);
        h.frame(1);
        h.metadata(CaptureMetadata::new(2, 2));
        h.metadata(CaptureMetadata::new(3, 3));
        let (listener, rx) = recorder();
        assert!(h.manager.try_capture_existing(listener, &[]));
        assert_eq!(rx.recv_timeout(WAIT), Ok(1));
    }

    #[test]
    fn panicking_listener_still_releases_pin() {
        let h = Harness::new(4);
        for ts in 1..=3 {
            h.frame(ts);
        }
        struct Failing;
        impl ImageCaptureListener for Failing {
            fn on_image_captured(&self, _: &Image, _: &CaptureMetadata) {
                panic!("save failed");
            }
        }
        assert!(h.manager.try_capture_existing(Arc::new(Failing), &[]));
        h.captures.shutdown();
        assert_eq!(h.manager.ring.pinned_count(), 0);
    }

    #[test]
    fn refused_hand_off_releases_pin() {
        let h = Harness::new(4);
        for ts in 1..=3 {
            h.frame(ts);
        }
        h.captures.shutdown();
        let (listener, _rx) = recorder();
        assert!(!h.manager.try_capture_existing(listener, &[]));
        assert_eq!(h.manager.ring.pinned_count(), 0);
    }

    #[test]
    fn metadata_changes_fan_out_per_key() {
        let h = Harness::new(4);
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let listener = move |key: MetadataKey,
                             old: Option<&MetadataValue>,
                             new: &MetadataValue,
                             meta: &CaptureMetadata| {
            let _ = tx
                .lock()
                .send((key, old.cloned(), new.clone(), meta.frame_number()));
        };
        let id = h
            .manager
            .add_metadata_change_listener(MetadataKey::AE_STATE, Arc::new(listener));

        let ae = |frame: i64, state: AeState| {
            CaptureMetadata::new(frame, frame * 10).with(MetadataKey::AE_STATE, state)
        };
        h.manager.on_partial_metadata(Arc::new(ae(1, AeState::Searching)));
        h.metadata(ae(1, AeState::Searching));
        h.metadata(ae(3, AeState::Converged));
        h.metadata(ae(2, AeState::Precapture));

        let first = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(first, (MetadataKey::AE_STATE, None, AeState::Searching.value(), 1));
        let second = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(
            second,
            (
                MetadataKey::AE_STATE,
                Some(AeState::Searching.value()),
                AeState::Converged.value(),
                3
            )
        );
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(h.manager.latest(MetadataKey::AE_STATE), Some(AeState::Converged.value()));

        assert!(h.manager.remove_metadata_change_listener(MetadataKey::AE_STATE, id));
        assert!(!h.manager.remove_metadata_change_listener(MetadataKey::AE_STATE, id));
    }

    #[test]
    fn pinned_frame_is_reset_only_after_release() {
        let h = Harness::new(3);
        for ts in 1..=3 {
            h.frame(ts);
        }
        let guard = PinGuard::adopt(h.manager.ring.clone(), h.manager.ring.try_pin(2).unwrap());
        let pair = guard.payload().clone();
        for ts in 4..=10 {
            h.frame(ts);
        }
        assert!(h.manager.buffered_timestamps().contains(&2));
        assert_eq!(
            pair.with_parts(|image, meta| (image.timestamp(), meta.timestamp())),
            Some((2, 2))
        );

        drop(guard);
        for ts in 11..=13 {
            h.frame(ts);
        }
        assert!(!h.manager.buffered_timestamps().contains(&2));
        assert_ne!(pair.with_parts(|image, _| image.timestamp()), Some(2));
        assert_eq!(h.pool.metrics().outstanding(), 3);

        let guard = PinGuard::adopt(h.manager.ring.clone(), h.manager.ring.try_pin(12).unwrap());
        let pair = guard.payload().clone();
        std::thread::scope(|scope| {
            let closing = scope.spawn(|| h.manager.close());
            std::thread::sleep(Duration::from_millis(30));
            assert!(!closing.is_finished());
            assert!(pair.has_image());
            drop(guard);
            closing.join().unwrap();
        });
        assert!(!pair.has_image());
        assert_eq!(h.pool.metrics().outstanding(), 0);
    }

    #[test]
    fn close_disposes_every_image() {
        let h = Harness::new(3);
        for ts in 1..=10 {
            h.frame(ts);
        }
        h.image(11);
        h.manager.close();
        assert_eq!(h.pool.metrics().outstanding(), 0);

        h.image(12);
        assert_eq!(h.pool.metrics().outstanding(), 0);
        assert!(h.manager.buffered_timestamps().is_empty());
    }

    #[test]
    fn ready_listener_tracks_headroom() {
        let h = Harness::new(2);
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        h.manager.set_capture_ready_listener(move |ready| {
            let _ = tx.lock().send(ready);
        });
        h.frame(1);
        h.frame(2);
        assert_eq!(rx.recv_timeout(WAIT), Ok(true));
        assert!(h.manager.has_pin_headroom());
    }
}

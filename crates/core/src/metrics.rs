use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for ring-buffer admission and pinning.
///
/// # Example
/// ```rust
/// use focus_core::metrics::RingMetrics;
///
/// let metrics = RingMetrics::default();
/// metrics.pin_hit();
/// assert_eq!(metrics.pin_hits(), 1);
/// ```
#[derive(Debug, Default)]
pub struct RingMetrics {
    created: AtomicU64,
    evicted: AtomicU64,
    updated: AtomicU64,
    rejected: AtomicU64,
    pin_hits: AtomicU64,
    pin_misses: AtomicU64,
}

impl RingMetrics {
    /// A new slot was created under capacity.
    pub fn created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    /// The least unpinned slot was evicted to admit a new key.
    pub fn evicted(&self) {
        self.evicted.fetch_add(1, Ordering::Relaxed);
    }

    /// An existing slot was updated in place.
    pub fn updated(&self) {
        self.updated.fetch_add(1, Ordering::Relaxed);
    }

    /// A swap was refused because the buffer is closed.
    pub fn rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// A pin attempt succeeded.
    pub fn pin_hit(&self) {
        self.pin_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// A pin attempt failed (absent key, closed, or no pin permit).
    pub fn pin_miss(&self) {
        self.pin_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn creations(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    pub fn updates(&self) -> u64 {
        self.updated.load(Ordering::Relaxed)
    }

    pub fn rejections(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn pin_hits(&self) -> u64 {
        self.pin_hits.load(Ordering::Relaxed)
    }

    pub fn pin_misses(&self) -> u64 {
        self.pin_misses.load(Ordering::Relaxed)
    }
}

/// Counters for image buffer pooling.
///
/// `outstanding` is the number of leases currently alive, i.e. the number of
/// open images.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    allocations: AtomicU64,
    outstanding: AtomicU64,
}

impl PoolMetrics {
    pub fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn alloc(&self) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn opened(&self) -> u64 {
        self.outstanding.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn closed(&self) -> u64 {
        self.outstanding.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Leases handed out and not yet returned.
    pub fn outstanding(&self) -> u64 {
        self.outstanding.load(Ordering::Acquire)
    }
}

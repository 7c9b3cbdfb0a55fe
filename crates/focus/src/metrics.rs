use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;

const DEFAULT_WINDOW: usize = 64;

/// Rolling window of latency samples.
///
/// # Example
/// ```rust
/// use focus::prelude::LatencyWindow;
///
/// let window = LatencyWindow::default();
/// window.record(std::time::Duration::from_millis(4));
/// window.record(std::time::Duration::from_millis(6));
/// assert_eq!(window.avg_millis(), Some(5.0));
/// ```
#[derive(Default, Clone)]
pub struct LatencyWindow {
    inner: Arc<WindowState>,
}

#[derive(Default)]
struct WindowState {
    count: AtomicU64,
    last_nanos: AtomicU64,
    samples: Mutex<VecDeque<u64>>,
}

impl LatencyWindow {
    pub fn record(&self, dur: Duration) {
        let nanos = dur.as_nanos().min(u64::MAX as u128) as u64;
        self.inner.count.fetch_add(1, Ordering::Relaxed);
        self.inner.last_nanos.store(nanos, Ordering::Relaxed);
        let mut samples = self.inner.samples.lock();
        samples.push_back(nanos);
        while samples.len() > DEFAULT_WINDOW {
            samples.pop_front();
        }
    }

    /// Samples within the current window.
    pub fn samples(&self) -> usize {
        self.inner.samples.lock().len()
    }

    pub fn total_samples(&self) -> u64 {
        self.inner.count.load(Ordering::Relaxed)
    }

    pub fn avg_millis(&self) -> Option<f64> {
        let samples = self.inner.samples.lock();
        if samples.is_empty() {
            return None;
        }
        let total: u128 = samples.iter().map(|n| *n as u128).sum();
        Some(total as f64 / 1_000_000.0 / samples.len() as f64)
    }

    pub fn max_millis(&self) -> Option<f64> {
        self.inner
            .samples
            .lock()
            .iter()
            .max()
            .map(|n| *n as f64 / 1_000_000.0)
    }

    pub fn last_millis(&self) -> Option<f64> {
        if self.total_samples() == 0 {
            return None;
        }
        Some(self.inner.last_nanos.load(Ordering::Relaxed) as f64 / 1_000_000.0)
    }
}

/// Counters and latency windows for picture requests.
#[derive(Default, Clone)]
pub struct CaptureMetrics {
    /// Request to start of picture delivery.
    pub shutter_lag: LatencyWindow,
    /// Time spent inside the picture callback.
    pub handoff: LatencyWindow,
    requested: Arc<AtomicU64>,
    retroactive: Arc<AtomicU64>,
    delivered: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

impl CaptureMetrics {
    pub(crate) fn record_request(&self) {
        self.requested.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retroactive(&self) {
        self.retroactive.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delivery(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requested(&self) -> u64 {
        self.requested.load(Ordering::Relaxed)
    }

    /// Requests served from an already buffered frame.
    pub fn retroactive(&self) -> u64 {
        self.retroactive.load(Ordering::Relaxed)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for CaptureMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureMetrics")
            .field("requested", &self.requested())
            .field("retroactive", &self.retroactive())
            .field("delivered", &self.delivered())
            .field("failed", &self.failed())
            .field("shutter_lag_ms", &self.shutter_lag.avg_millis())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_keeps_most_recent_samples() {
        let window = LatencyWindow::default();
        assert_eq!(window.last_millis(), None);
        for ms in 0..(DEFAULT_WINDOW as u64 + 10) {
            window.record(Duration::from_millis(ms));
        }
        assert_eq!(window.samples(), DEFAULT_WINDOW);
        assert_eq!(window.total_samples(), DEFAULT_WINDOW as u64 + 10);
        assert_eq!(window.last_millis(), Some((DEFAULT_WINDOW + 9) as f64));
        assert_eq!(window.max_millis(), Some((DEFAULT_WINDOW + 9) as f64));
    }

    #[test]
    fn clones_share_counters() {
        let metrics = CaptureMetrics::default();
        let clone = metrics.clone();
        clone.record_request();
        clone.record_failure();
        assert_eq!(metrics.requested(), 1);
        assert_eq!(metrics.failed(), 1);
        assert_eq!(metrics.delivered(), 0);
    }
}

use std::{thread, time::Duration};

use focus_core::prelude::DEFAULT_QUEUE_DEPTH;

use crate::error::CameraError;

/// Default number of images the capture stream may hold open at once.
pub const DEFAULT_MAX_IMAGES: usize = 10;
/// Slots kept back from the ring for images still owned by the pipeline.
pub const PIPELINE_HEADROOM: usize = 2;
/// Default jank threshold for the image callback (milliseconds).
pub const DEFAULT_CALLBACK_BUDGET_MS: u64 = 25;
/// Default time focus stays locked after a triggered scan (milliseconds).
pub const DEFAULT_FOCUS_HOLD_MS: u64 = 3000;

/// Camera construction parameters.
///
/// # Example
/// ```rust
/// use focus::prelude::*;
///
/// let config = CameraConfig::new()
///     .with_max_images(6)
///     .with_worker_threads(2)
///     .with_zsl(false);
/// config.validate()?;
/// assert_eq!(config.ring_capacity(), 4);
/// assert!(!config.zsl_enabled());
/// # Ok::<(), CameraError>(())
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CameraConfig {
    max_images: usize,
    worker_threads: usize,
    zsl_enabled: bool,
    executor_queue_depth: usize,
    callback_budget_ms: u64,
    focus_hold_ms: u64,
}

impl CameraConfig {
    /// Start from defaults.
    pub fn new() -> Self {
        Self {
            max_images: DEFAULT_MAX_IMAGES,
            worker_threads: thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            zsl_enabled: true,
            executor_queue_depth: DEFAULT_QUEUE_DEPTH,
            callback_budget_ms: DEFAULT_CALLBACK_BUDGET_MS,
            focus_hold_ms: DEFAULT_FOCUS_HOLD_MS,
        }
    }

    pub fn with_max_images(mut self, max_images: usize) -> Self {
        self.max_images = max_images;
        self
    }

    /// Save pool size.
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    pub fn with_zsl(mut self, enabled: bool) -> Self {
        self.zsl_enabled = enabled;
        self
    }

    pub fn with_executor_queue_depth(mut self, depth: usize) -> Self {
        self.executor_queue_depth = depth;
        self
    }

    pub fn with_callback_budget(mut self, budget: Duration) -> Self {
        self.callback_budget_ms = budget.as_millis().min(u64::MAX as u128) as u64;
        self
    }

    /// How long a triggered focus lock is held before continuous focus resumes.
    pub fn with_focus_hold(mut self, hold: Duration) -> Self {
        self.focus_hold_ms = hold.as_millis().min(u64::MAX as u128) as u64;
        self
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), CameraError> {
        if self.max_images <= PIPELINE_HEADROOM {
            return Err(CameraError::InvalidConfig(format!(
                "max_images must be at least {}, got {}",
                PIPELINE_HEADROOM + 1,
                self.max_images
            )));
        }
        if self.worker_threads == 0 {
            return Err(CameraError::InvalidConfig(
                "worker_threads must be at least 1".into(),
            ));
        }
        if self.executor_queue_depth == 0 {
            return Err(CameraError::InvalidConfig(
                "executor_queue_depth must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn ring_capacity(&self) -> usize {
        self.max_images.saturating_sub(PIPELINE_HEADROOM)
    }

    pub fn max_images(&self) -> usize {
        self.max_images
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    pub fn zsl_enabled(&self) -> bool {
        self.zsl_enabled
    }

    pub fn executor_queue_depth(&self) -> usize {
        self.executor_queue_depth
    }

    pub fn callback_budget(&self) -> Duration {
        Duration::from_millis(self.callback_budget_ms)
    }

    pub fn focus_hold(&self) -> Duration {
        Duration::from_millis(self.focus_hold_ms)
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_leave_pipeline_headroom() {
        let config = CameraConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_images(), 10);
        assert_eq!(config.ring_capacity(), 8);
        assert!(config.worker_threads() >= 1);
        assert_eq!(config.callback_budget(), Duration::from_millis(25));
        assert_eq!(config.focus_hold(), Duration::from_secs(3));
    }

    #[test]
    fn too_few_images_is_rejected() {
        let err = CameraConfig::new().with_max_images(2).validate().unwrap_err();
        assert_eq!(err.code(), "invalid_config");
        assert!(CameraConfig::new().with_max_images(3).validate().is_ok());
    }

    #[test]
    fn zero_sized_executors_are_rejected() {
        assert!(CameraConfig::new().with_worker_threads(0).validate().is_err());
        assert!(CameraConfig::new().with_executor_queue_depth(0).validate().is_err());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn missing_fields_take_defaults() {
        let config: CameraConfig =
            serde_json::from_str(r#"{ "max_images": 5, "zsl_enabled": false }"#).unwrap();
        assert_eq!(config.ring_capacity(), 3);
        assert!(!config.zsl_enabled());
        assert_eq!(config.executor_queue_depth(), DEFAULT_QUEUE_DEPTH);
        assert_eq!(config.focus_hold(), Duration::from_millis(DEFAULT_FOCUS_HOLD_MS));
    }
}

use focus_capture::prelude::CaptureError;

/// Errors surfaced by [`ZslCamera`](crate::camera::ZslCamera).
///
/// # Example
/// ```rust
/// use focus::prelude::*;
///
/// let err = CameraError::from(CaptureError::Rejected("busy".into()));
/// assert_eq!(err.code(), "capture_rejected");
/// assert!(err.retryable());
/// assert!(!CameraError::Closed.retryable());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CameraError {
    #[error("invalid camera config: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("camera closed")]
    Closed,
    #[error("camera setup failed: {0}")]
    SetupFailed(String),
}

impl CameraError {
    /// Stable string code for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            CameraError::InvalidConfig(_) => "invalid_config",
            CameraError::Capture(CaptureError::Closed) => "capture_closed",
            CameraError::Capture(CaptureError::Rejected(_)) => "capture_rejected",
            CameraError::Capture(CaptureError::Backend(_)) => "capture_backend",
            CameraError::Closed => "closed",
            CameraError::SetupFailed(_) => "setup_failed",
        }
    }

    /// Whether the error may succeed when retried.
    pub fn retryable(&self) -> bool {
        match self {
            CameraError::Capture(err) => err.retryable(),
            CameraError::SetupFailed(_) => true,
            CameraError::InvalidConfig(_) | CameraError::Closed => false,
        }
    }
}

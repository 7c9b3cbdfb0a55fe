#![doc = include_str!("../README.md")]

use std::{collections::BTreeMap, sync::Arc};

use focus_core::prelude::*;

pub mod captured;
pub mod manager;
pub mod metadata_table;
pub mod virtual_backend;

/// Errors reported by a capture source.
///
/// # Example
/// ```rust
/// use focus_capture::prelude::CaptureError;
///
/// let err = CaptureError::Rejected("busy".into());
/// assert_eq!(err.code(), "rejected");
/// assert!(err.retryable());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("capture source closed")]
    Closed,
    #[error("capture request rejected: {0}")]
    Rejected(String),
    #[error("backend error: {0}")]
    Backend(String),
}

impl CaptureError {
    /// Stable string code for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            CaptureError::Closed => "closed",
            CaptureError::Rejected(_) => "rejected",
            CaptureError::Backend(_) => "backend_error",
        }
    }

    /// Whether the error may succeed when retried.
    pub fn retryable(&self) -> bool {
        matches!(self, CaptureError::Rejected(_) | CaptureError::Backend(_))
    }
}

/// Request template, mirroring the device's tuning presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum RequestTemplate {
    Preview,
    ZeroShutterLag,
    StillCapture,
}

/// A repeating or single capture request.
///
/// # Example
/// ```rust
/// use focus_capture::prelude::*;
///
/// let request = CaptureRequest::new(RequestTemplate::Preview)
///     .tag(RequestTag::Precapture)
///     .control(MetadataKey::AE_PRECAPTURE_TRIGGER, 1u32);
/// assert_eq!(request.tag_value(), Some(RequestTag::Precapture));
/// assert_eq!(
///     request.control_value(MetadataKey::AE_PRECAPTURE_TRIGGER),
///     Some(&MetadataValue::Uint(1))
/// );
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CaptureRequest {
    template: RequestTemplate,
    tag: Option<RequestTag>,
    controls: BTreeMap<MetadataKey, MetadataValue>,
}

impl CaptureRequest {
    pub fn new(template: RequestTemplate) -> Self {
        Self {
            template,
            tag: None,
            controls: BTreeMap::new(),
        }
    }

    /// Tag echoed back in the metadata of frames produced by this request.
    pub fn tag(mut self, tag: RequestTag) -> Self {
        self.tag = Some(tag);
        self
    }

    /// Set one control value.
    pub fn control(mut self, key: MetadataKey, value: impl Into<MetadataValue>) -> Self {
        self.controls.insert(key, value.into());
        self
    }

    pub fn template(&self) -> RequestTemplate {
        self.template
    }

    pub fn tag_value(&self) -> Option<RequestTag> {
        self.tag
    }

    pub fn control_value(&self, key: MetadataKey) -> Option<&MetadataValue> {
        self.controls.get(&key)
    }

    pub fn controls(&self) -> impl Iterator<Item = (MetadataKey, &MetadataValue)> {
        self.controls.iter().map(|(k, v)| (*k, v))
    }
}

/// Events delivered by a [`CaptureSource`] on its callback thread.
///
/// Images and metadata for the same frame share a sensor timestamp and may
/// arrive in either order. Implementations must return quickly.
pub trait CaptureCallbacks: Send + Sync {
    fn on_image(&self, image: Image);

    /// Early subset of a frame's metadata, delivered before the full result.
    fn on_partial_metadata(&self, metadata: Arc<CaptureMetadata>) {
        let _ = metadata;
    }

    fn on_metadata(&self, metadata: Arc<CaptureMetadata>);

    /// A request accepted earlier could not produce a frame.
    fn on_capture_failed(&self, tag: Option<RequestTag>, error: CaptureError) {
        tracing::warn!(?tag, code = error.code(), "capture failed: {error}");
    }
}

/// Opaque camera device session.
///
/// # Example
/// ```rust,ignore
/// use focus_capture::prelude::*;
///
/// struct Device;
/// impl CaptureSource for Device {
///     fn set_callbacks(&self, _callbacks: std::sync::Arc<dyn CaptureCallbacks>) {}
///     fn set_repeating(&self, _request: CaptureRequest) -> Result<(), CaptureError> { Ok(()) }
///     fn stop_repeating(&self) -> Result<(), CaptureError> { Ok(()) }
///     fn submit(&self, _request: CaptureRequest) -> Result<(), CaptureError> { Ok(()) }
/// }
/// ```
pub trait CaptureSource: Send + Sync {
    /// Route image and metadata events to `callbacks`.
    fn set_callbacks(&self, callbacks: Arc<dyn CaptureCallbacks>);

    /// Replace the repeating request driving the preview/ZSL stream.
    fn set_repeating(&self, request: CaptureRequest) -> Result<(), CaptureError>;

    fn stop_repeating(&self) -> Result<(), CaptureError>;

    /// Queue a single request ahead of the repeating stream.
    fn submit(&self, request: CaptureRequest) -> Result<(), CaptureError>;

    /// Release the device; later calls report [`CaptureError::Closed`].
    fn close(&self) {}
}

pub mod prelude {
    pub use crate::{
        CaptureCallbacks, CaptureError, CaptureRequest, CaptureSource, RequestTemplate,
        captured::CapturedPair,
        manager::{
            CaptureConstraint, ConstraintSet, ImageCaptureListener, ImageCaptureManager,
            MetadataChangeListener,
        },
        metadata_table::{MetadataChange, MetadataTable},
        virtual_backend::{VirtualCapture, VirtualConfig},
    };
    pub use focus_core::prelude::*;
}

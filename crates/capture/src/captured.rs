use std::{fmt, sync::Arc};

use focus_core::prelude::{CaptureMetadata, Image};
use parking_lot::RwLock;

#[derive(Default)]
struct Parts {
    image: Option<Image>,
    metadata: Option<Arc<CaptureMetadata>>,
}

/// Image and metadata for one sensor timestamp, stored in a ring slot.
///
/// Either half may arrive first. The image is owned by the pair until
/// [`reset`](CapturedPair::reset) closes it.
///
/// # Example
/// ```rust
/// use std::{num::NonZeroU32, sync::Arc};
/// use focus_capture::prelude::*;
///
/// let pool = BufferPool::with_capacity(1, 16);
/// let one = NonZeroU32::new(1).unwrap();
/// let pair = CapturedPair::default();
/// pair.add_metadata(Arc::new(CaptureMetadata::new(1, 50)));
/// assert!(!pair.is_complete());
/// pair.add_image(Image::new(50, ImageFormat::Jpeg, one, one, pool.lease()));
/// assert!(pair.is_complete());
/// pair.reset();
/// assert_eq!(pool.metrics().outstanding(), 0);
/// ```
#[derive(Default)]
pub struct CapturedPair {
    parts: RwLock<Parts>,
}

impl CapturedPair {
    pub fn with_image(image: Image) -> Self {
        let pair = Self::default();
        pair.add_image(image);
        pair
    }

    pub fn with_metadata(metadata: Arc<CaptureMetadata>) -> Self {
        let pair = Self::default();
        pair.add_metadata(metadata);
        pair
    }

    /// # Panics
    /// If an image is already present.
    pub fn add_image(&self, image: Image) {
        let mut parts = self.parts.write();
        if parts.image.is_some() {
            panic!("captured pair already holds an image");
        }
        parts.image = Some(image);
    }

    /// # Panics
    /// If metadata is already present.
    pub fn add_metadata(&self, metadata: Arc<CaptureMetadata>) {
        let mut parts = self.parts.write();
        if parts.metadata.is_some() {
            panic!("captured pair already holds metadata");
        }
        parts.metadata = Some(metadata);
    }

    pub fn is_complete(&self) -> bool {
        let parts = self.parts.read();
        parts.image.is_some() && parts.metadata.is_some()
    }

    pub fn has_image(&self) -> bool {
        self.parts.read().image.is_some()
    }

    pub fn metadata(&self) -> Option<Arc<CaptureMetadata>> {
        self.parts.read().metadata.clone()
    }

    /// Borrow both halves; `None` unless the pair is complete.
    pub fn with_parts<R>(&self, f: impl FnOnce(&Image, &CaptureMetadata) -> R) -> Option<R> {
        let parts = self.parts.read();
        match (parts.image.as_ref(), parts.metadata.as_deref()) {
            (Some(image), Some(metadata)) => Some(f(image, metadata)),
            _ => None,
        }
    }

    /// Close the image (if any) and forget the metadata. Idempotent.
    pub fn reset(&self) {
        let image = {
            let mut parts = self.parts.write();
            parts.metadata = None;
            parts.image.take()
        };
        if let Some(image) = image {
            image.close();
        }
    }
}

impl fmt::Debug for CapturedPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = self.parts.read();
        f.debug_struct("CapturedPair")
            .field("image", &parts.image.as_ref().map(Image::timestamp))
            .field("metadata", &parts.metadata.as_ref().map(|m| m.frame_number()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use focus_core::prelude::{BufferPool, ImageFormat};
    use std::num::NonZeroU32;

    fn image(pool: &BufferPool, timestamp: i64) -> Image {
        let one = NonZeroU32::new(1).unwrap();
        Image::new(timestamp, ImageFormat::Yuv420, one, one, pool.lease())
    }

    #[test]
    fn reset_closes_image_once() {
        let pool = BufferPool::with_capacity(2, 8);
        let pair = CapturedPair::with_image(image(&pool, 3));
        assert_eq!(pool.metrics().outstanding(), 1);
        pair.reset();
        pair.reset();
        assert_eq!(pool.metrics().outstanding(), 0);
        assert!(!pair.has_image());
    }

    #[test]
    fn parts_are_only_lent_when_complete() {
        let pool = BufferPool::with_capacity(1, 8);
        let pair = CapturedPair::with_image(image(&pool, 9));
        assert_eq!(pair.with_parts(|img, _| img.timestamp()), None);
        pair.add_metadata(Arc::new(CaptureMetadata::new(2, 9)));
        assert_eq!(pair.with_parts(|img, meta| (img.timestamp(), meta.frame_number())), Some((9, 2)));
    }

    #[test]
    #[should_panic(expected = "already holds metadata")]
    fn duplicate_metadata_panics() {
        let pair = CapturedPair::with_metadata(Arc::new(CaptureMetadata::new(1, 1)));
        pair.add_metadata(Arc::new(CaptureMetadata::new(1, 1)));
    }
}

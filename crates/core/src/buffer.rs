use std::{fmt, num::NonZeroU32, sync::Arc};

use parking_lot::Mutex;

use crate::metrics::PoolMetrics;

/// Handle to a pooled byte buffer.
///
/// When dropped, the buffer is returned to the originating pool so the capture
/// stream can reuse memory without reallocating per frame.
///
/// # Example
/// ```rust
/// use focus_core::prelude::BufferPool;
///
/// let pool = BufferPool::with_capacity(2, 1024);
/// let mut lease = pool.lease();
/// lease.resize(16);
/// assert_eq!(lease.len(), 16);
/// assert_eq!(pool.metrics().outstanding(), 1);
/// drop(lease);
/// assert_eq!(pool.metrics().outstanding(), 0);
/// ```
pub struct BufferLease {
    pool: Arc<PoolInner>,
    buf: Option<Vec<u8>>,
}

impl BufferLease {
    /// Borrow as an immutable slice.
    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }

    /// Borrow as a mutable slice.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }

    pub fn len(&self) -> usize {
        self.buf.as_ref().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Set the length to `len` bytes, zero-filling any new bytes.
    pub fn resize(&mut self, len: usize) {
        if let Some(buf) = self.buf.as_mut() {
            buf.resize(len, 0);
        }
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.recycle(buf);
        }
    }
}

impl fmt::Debug for BufferLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferLease").field("len", &self.len()).finish()
    }
}

/// Buffer pool backing captured images.
///
/// Tracks outstanding leases so callers can assert that every image handed
/// to the pipeline was eventually released.
///
/// # Example
/// ```rust
/// use focus_core::prelude::BufferPool;
///
/// let pool = BufferPool::with_limits(4, 1 << 16, 8);
/// let _lease = pool.lease();
/// assert_eq!(pool.metrics().hits(), 1);
/// ```
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool with `capacity` preallocated buffers of `chunk_size` bytes.
    pub fn with_capacity(capacity: usize, chunk_size: usize) -> Self {
        Self::with_limits(capacity, chunk_size, capacity)
    }

    /// Create a pool with `capacity` preallocated buffers and a maximum retained free list.
    pub fn with_limits(capacity: usize, chunk_size: usize, max_free: usize) -> Self {
        let free = (0..capacity).map(|_| Vec::with_capacity(chunk_size)).collect();
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
                chunk_size,
                max_free,
                metrics: PoolMetrics::default(),
            }),
        }
    }

    /// Acquire a buffer, allocating if the pool is empty.
    pub fn lease(&self) -> BufferLease {
        let recycled = self.inner.free.lock().pop();
        let buf = match recycled {
            Some(buf) => {
                self.inner.metrics.hit();
                buf
            }
            None => {
                self.inner.metrics.miss();
                self.inner.metrics.alloc();
                Vec::with_capacity(self.inner.chunk_size)
            }
        };
        self.inner.metrics.opened();
        BufferLease {
            pool: self.inner.clone(),
            buf: Some(buf),
        }
    }

    /// Counters for this pool.
    pub fn metrics(&self) -> &PoolMetrics {
        &self.inner.metrics
    }
}

struct PoolInner {
    free: Mutex<Vec<Vec<u8>>>,
    chunk_size: usize,
    max_free: usize,
    metrics: PoolMetrics,
}

impl PoolInner {
    fn recycle(&self, mut buf: Vec<u8>) {
        self.metrics.closed();
        buf.clear();
        let mut free = self.free.lock();
        if free.len() < self.max_free {
            free.push(buf);
        }
    }
}

/// Encoding of the bytes carried by an [`Image`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ImageFormat {
    /// Hardware-encoded JPEG stream.
    Jpeg,
    /// Planar YUV 4:2:0, software encoded downstream.
    Yuv420,
}

/// Move-only handle to a captured image.
///
/// The backing memory is returned to its pool exactly once: when the handle
/// is dropped or explicitly [`closed`](Image::close). There is no way to
/// clone an `Image`; consumers borrow it for the duration of a callback.
///
/// # Example
/// ```rust
/// use std::num::NonZeroU32;
/// use focus_core::prelude::*;
///
/// let pool = BufferPool::with_capacity(1, 64);
/// let mut lease = pool.lease();
/// lease.resize(4);
/// let w = NonZeroU32::new(2).unwrap();
/// let h = NonZeroU32::new(2).unwrap();
/// let image = Image::new(100, ImageFormat::Jpeg, w, h, lease);
/// assert_eq!(image.timestamp(), 100);
/// image.close();
/// assert_eq!(pool.metrics().outstanding(), 0);
/// ```
pub struct Image {
    timestamp: i64,
    format: ImageFormat,
    width: NonZeroU32,
    height: NonZeroU32,
    data: BufferLease,
}

impl Image {
    pub fn new(
        timestamp: i64,
        format: ImageFormat,
        width: NonZeroU32,
        height: NonZeroU32,
        data: BufferLease,
    ) -> Self {
        Self {
            timestamp,
            format,
            width,
            height,
            data,
        }
    }

    /// Sensor timestamp; the key shared with the frame's metadata.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn width(&self) -> NonZeroU32 {
        self.width
    }

    pub fn height(&self) -> NonZeroU32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        self.data.as_slice()
    }

    /// Release the image memory back to its pool.
    pub fn close(self) {
        drop(self);
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("timestamp", &self.timestamp)
            .field("format", &self.format)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("len", &self.data.len())
            .finish()
    }
}

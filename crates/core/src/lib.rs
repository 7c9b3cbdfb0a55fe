#![doc = include_str!("../README.md")]

pub mod buffer;
pub mod cell;
pub mod conjunction;
pub mod executor;
pub mod metadata;
pub mod metrics;
pub mod ring;

pub mod prelude {
    pub use crate::{
        buffer::{BufferLease, BufferPool, Image, ImageFormat},
        cell::ResultCell,
        conjunction::{ConjunctionInput, ConjunctionMux, ListenerId},
        executor::{DEFAULT_QUEUE_DEPTH, ExecutorHandle, SendOutcome, TaskExecutor},
        metadata::{
            AeMode, AeState, AfMode, AfState, AfTrigger, AwbState, CaptureMetadata, FlashMode,
            FlashState, LensState, MetadataKey, MetadataValue, RequestTag,
        },
        metrics::{PoolMetrics, RingMetrics},
        ring::{PinGuard, PinStateListener, SharedRingBuffer, SwapTask},
    };
}

#![doc = include_str!("../README.md")]

pub use focus_capture as capture;
pub use focus_core as core;

pub mod camera;
pub mod config;
pub mod error;
mod metrics;

pub use metrics::{CaptureMetrics, LatencyWindow};

pub mod prelude {
    pub use crate::{
        camera::{
            Flash, PhotoCaptureParameters, PictureCallback, ReadyRequirement, ZslCamera,
            ZslConstraint,
        },
        config::{CameraConfig, DEFAULT_FOCUS_HOLD_MS, DEFAULT_MAX_IMAGES, PIPELINE_HEADROOM},
        error::CameraError,
        metrics::{CaptureMetrics, LatencyWindow},
    };
    pub use focus_capture::prelude::*;
}

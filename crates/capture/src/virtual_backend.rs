//! Virtual capture source that emits synthetic frames with simulated 3A.
use std::{
    collections::VecDeque,
    io,
    num::NonZeroU32,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use focus_core::prelude::*;
use parking_lot::{Mutex, RwLock};

use crate::{CaptureCallbacks, CaptureError, CaptureRequest, CaptureSource, RequestTemplate};

/// Settings for [`VirtualCapture`].
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct VirtualConfig {
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    /// Time between frames.
    pub frame_interval_ms: u64,
    /// Frames spent in the precapture state after a trigger.
    pub precapture_frames: u32,
    /// Frames spent actively scanning after an auto-focus trigger.
    pub focus_frames: u32,
    /// Deliver each frame's metadata before its image.
    pub metadata_first: bool,
    pub pool_buffers: usize,
}

impl Default for VirtualConfig {
    fn default() -> Self {
        Self {
            width: 64,
            height: 48,
            format: ImageFormat::Jpeg,
            frame_interval_ms: 5,
            precapture_frames: 3,
            focus_frames: 3,
            metadata_first: false,
            pool_buffers: 8,
        }
    }
}

impl VirtualConfig {
    pub fn frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval_ms = interval.as_millis().min(u64::MAX as u128) as u64;
        self
    }

    pub fn precapture_frames(mut self, frames: u32) -> Self {
        self.precapture_frames = frames;
        self
    }

    pub fn focus_frames(mut self, frames: u32) -> Self {
        self.focus_frames = frames;
        self
    }

    pub fn metadata_first(mut self, enabled: bool) -> Self {
        self.metadata_first = enabled;
        self
    }

    pub fn resolution(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    fn payload_len(&self) -> usize {
        let pixels = self.width as usize * self.height as usize;
        match self.format {
            ImageFormat::Jpeg => (pixels / 4).max(1),
            ImageFormat::Yuv420 => (pixels * 3 / 2).max(1),
        }
    }
}

enum Command {
    SetRepeating(CaptureRequest),
    StopRepeating,
    Submit(CaptureRequest),
    Stop,
}

type SharedCallbacks = Arc<RwLock<Option<Arc<dyn CaptureCallbacks>>>>;

/// Synthetic capture source running on its own callback thread.
///
/// Single requests are served ahead of the repeating request, one per frame.
/// A request carrying `AE_PRECAPTURE_TRIGGER = 1` drives auto-exposure into
/// `Precapture` for [`VirtualConfig::precapture_frames`] frames before it
/// converges; a still capture with `FLASH_MODE = Single` reports the flash as
/// fired. `AF_TRIGGER = Start` scans for [`VirtualConfig::focus_frames`] frames
/// and then locks focus until a request asks for continuous focus again.
///
/// # Example
/// ```rust
/// use std::sync::{Arc, mpsc};
/// use std::time::Duration;
/// use focus_capture::prelude::*;
///
/// struct Count(parking_lot::Mutex<mpsc::Sender<i64>>);
/// impl CaptureCallbacks for Count {
///     fn on_image(&self, image: Image) {
///         let _ = self.0.lock().send(image.timestamp());
///     }
///     fn on_metadata(&self, _metadata: Arc<CaptureMetadata>) {}
/// }
///
/// let source = VirtualCapture::new(VirtualConfig::default()).unwrap();
/// let (tx, rx) = mpsc::channel();
/// source.set_callbacks(Arc::new(Count(parking_lot::Mutex::new(tx))));
/// source.set_repeating(CaptureRequest::new(RequestTemplate::Preview)).unwrap();
/// assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
/// source.close();
/// ```
pub struct VirtualCapture {
    tx: Mutex<Option<mpsc::Sender<Command>>>,
    callbacks: SharedCallbacks,
    worker: Mutex<Option<JoinHandle<()>>>,
    reject: AtomicBool,
    fail_still: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
    pool: BufferPool,
}

impl VirtualCapture {
    pub fn new(config: VirtualConfig) -> io::Result<Self> {
        let pool = BufferPool::with_capacity(config.pool_buffers, config.payload_len());
        let callbacks: SharedCallbacks = Arc::new(RwLock::new(None));
        let frames = Arc::new(AtomicU64::new(0));
        let fail_still = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();

        let sim = Simulator {
            interval: Duration::from_millis(config.frame_interval_ms.max(1)),
            config,
            pool: pool.clone(),
            callbacks: callbacks.clone(),
            frames: frames.clone(),
            fail_still: fail_still.clone(),
            repeating: None,
            singles: VecDeque::new(),
            frame_number: 0,
            timestamp: 0,
            ae: AeState::Searching,
            precapture_left: 0,
            af: AfState::PassiveScan,
            focus_left: 0,
        };
        let worker = thread::Builder::new()
            .name("virtual-capture".into())
            .spawn(move || sim.run(rx))?;

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            callbacks,
            worker: Mutex::new(Some(worker)),
            reject: AtomicBool::new(false),
            fail_still,
            frames,
            pool,
        })
    }

    /// Make every subsequent request fail with [`CaptureError::Rejected`].
    pub fn set_reject_requests(&self, reject: bool) {
        self.reject.store(reject, Ordering::Release);
    }

    /// Fail the next still capture through
    /// [`CaptureCallbacks::on_capture_failed`] instead of producing a frame.
    pub fn fail_next_still(&self) {
        self.fail_still.store(true, Ordering::Release);
    }

    /// Frames emitted so far.
    pub fn frames_emitted(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Pool backing emitted images; `outstanding` counts images not yet closed.
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    fn send(&self, command: Command) -> Result<(), CaptureError> {
        let tx = self.tx.lock();
        let Some(tx) = tx.as_ref() else {
            return Err(CaptureError::Closed);
        };
        tx.send(command).map_err(|_| CaptureError::Closed)
    }

    fn check_rejected(&self) -> Result<(), CaptureError> {
        if self.reject.load(Ordering::Acquire) {
            return Err(CaptureError::Rejected("virtual source rejecting requests".into()));
        }
        Ok(())
    }
}

impl CaptureSource for VirtualCapture {
    fn set_callbacks(&self, callbacks: Arc<dyn CaptureCallbacks>) {
        *self.callbacks.write() = Some(callbacks);
    }

    fn set_repeating(&self, request: CaptureRequest) -> Result<(), CaptureError> {
        self.check_rejected()?;
        self.send(Command::SetRepeating(request))
    }

    fn stop_repeating(&self) -> Result<(), CaptureError> {
        self.send(Command::StopRepeating)
    }

    fn submit(&self, request: CaptureRequest) -> Result<(), CaptureError> {
        self.check_rejected()?;
        self.send(Command::Submit(request))
    }

    fn close(&self) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(Command::Stop);
        }
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.thread().id() == thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                tracing::warn!("virtual capture worker panicked");
            }
        }
        self.callbacks.write().take();
    }
}

impl Drop for VirtualCapture {
    fn drop(&mut self) {
        self.close();
    }
}

struct Simulator {
    config: VirtualConfig,
    interval: Duration,
    pool: BufferPool,
    callbacks: SharedCallbacks,
    frames: Arc<AtomicU64>,
    fail_still: Arc<AtomicBool>,
    repeating: Option<CaptureRequest>,
    singles: VecDeque<CaptureRequest>,
    frame_number: i64,
    timestamp: i64,
    ae: AeState,
    precapture_left: u32,
    af: AfState,
    focus_left: u32,
}

impl Simulator {
    fn run(mut self, rx: mpsc::Receiver<Command>) {
        let mut next_frame = Instant::now() + self.interval;
        loop {
            let command = if self.repeating.is_some() || !self.singles.is_empty() {
                let wait = next_frame.saturating_duration_since(Instant::now());
                match rx.recv_timeout(wait) {
                    Ok(command) => Some(command),
                    Err(mpsc::RecvTimeoutError::Timeout) => None,
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            } else {
                match rx.recv() {
                    Ok(command) => {
                        next_frame = Instant::now() + self.interval;
                        Some(command)
                    }
                    Err(_) => break,
                }
            };

            match command {
                Some(Command::Stop) => break,
                Some(Command::SetRepeating(request)) => self.repeating = Some(request),
                Some(Command::StopRepeating) => self.repeating = None,
                Some(Command::Submit(request)) => self.singles.push_back(request),
                None => {
                    next_frame += self.interval;
                    self.emit_frame();
                }
            }
        }
        tracing::debug!(frames = self.frame_number, "virtual capture stopped");
    }

    fn emit_frame(&mut self) {
        let Some(request) = self.singles.pop_front().or_else(|| self.repeating.clone()) else {
            return;
        };

        self.frame_number += 1;
        self.timestamp += self.interval.as_nanos().min(i64::MAX as u128) as i64;

        if request.template() == RequestTemplate::StillCapture
            && self.fail_still.swap(false, Ordering::AcqRel)
        {
            if let Some(callbacks) = self.callbacks.read().clone() {
                callbacks.on_capture_failed(
                    request.tag_value(),
                    CaptureError::Backend("injected still failure".into()),
                );
            }
            return;
        }
        self.advance_exposure(&request);
        self.advance_focus(&request);

        let metadata = Arc::new(self.metadata_for(&request));
        let image = self.image_for(self.timestamp);
        self.frames.fetch_add(1, Ordering::Relaxed);

        let Some(callbacks) = self.callbacks.read().clone() else {
            return;
        };
        let mut partial = CaptureMetadata::new(self.frame_number, self.timestamp)
            .with(MetadataKey::AE_STATE, self.ae);
        if let Some(af) = metadata.get(MetadataKey::AF_STATE) {
            partial.set(MetadataKey::AF_STATE, af.clone());
        }
        callbacks.on_partial_metadata(Arc::new(partial));
        if self.config.metadata_first {
            callbacks.on_metadata(metadata);
            callbacks.on_image(image);
        } else {
            callbacks.on_image(image);
            callbacks.on_metadata(metadata);
        }
    }

    fn advance_exposure(&mut self, request: &CaptureRequest) {
        let trigger = request
            .control_value(MetadataKey::AE_PRECAPTURE_TRIGGER)
            .and_then(MetadataValue::as_uint);
        if trigger == Some(1) {
            self.ae = AeState::Precapture;
            self.precapture_left = self.config.precapture_frames;
            return;
        }
        match self.ae {
            AeState::Precapture if self.precapture_left > 0 => self.precapture_left -= 1,
            AeState::Precapture | AeState::Searching | AeState::Inactive => {
                self.ae = AeState::Converged
            }
            _ => {}
        }
    }

    fn advance_focus(&mut self, request: &CaptureRequest) {
        let trigger = request
            .control_value(MetadataKey::AF_TRIGGER)
            .and_then(MetadataValue::as_uint)
            .and_then(AfTrigger::from_raw);
        match trigger {
            Some(AfTrigger::Start) => {
                self.af = AfState::ActiveScan;
                self.focus_left = self.config.focus_frames;
                return;
            }
            Some(AfTrigger::Cancel) => {
                self.af = AfState::Inactive;
                return;
            }
            Some(AfTrigger::Idle) | None => {}
        }
        let mode = request
            .control_value(MetadataKey::AF_MODE)
            .and_then(MetadataValue::as_uint)
            .and_then(AfMode::from_raw);
        self.af = match self.af {
            AfState::ActiveScan if self.focus_left > 0 => {
                self.focus_left -= 1;
                AfState::ActiveScan
            }
            AfState::ActiveScan => AfState::FocusedLocked,
            locked @ (AfState::FocusedLocked | AfState::NotFocusedLocked | AfState::Inactive)
                if mode != Some(AfMode::ContinuousPicture) =>
            {
                locked
            }
            _ if self.frame_number <= 2 => AfState::PassiveScan,
            _ => AfState::PassiveFocused,
        };
    }

    fn metadata_for(&self, request: &CaptureRequest) -> CaptureMetadata {
        let flash_mode = request
            .control_value(MetadataKey::FLASH_MODE)
            .and_then(MetadataValue::as_uint)
            .and_then(FlashMode::from_raw)
            .unwrap_or(FlashMode::Off);
        let flash_state = if request.template() == RequestTemplate::StillCapture
            && flash_mode == FlashMode::Single
        {
            FlashState::Fired
        } else {
            FlashState::Ready
        };
        let mut metadata = CaptureMetadata::new(self.frame_number, self.timestamp)
            .with(MetadataKey::AE_STATE, self.ae)
            .with(MetadataKey::AF_STATE, self.af)
            .with(MetadataKey::AWB_STATE, AwbState::Converged)
            .with(MetadataKey::LENS_STATE, LensState::Stationary)
            .with(MetadataKey::FLASH_MODE, flash_mode)
            .with(MetadataKey::FLASH_STATE, flash_state);
        for (key, value) in request.controls() {
            if metadata.get(key).is_none() {
                metadata.set(key, value.clone());
            }
        }
        if let Some(tag) = request.tag_value() {
            metadata = metadata.with_tag(tag);
        }
        metadata
    }

    fn image_for(&self, timestamp: i64) -> Image {
        let mut lease = self.pool.lease();
        lease.resize(self.config.payload_len());
        lease.as_mut_slice().fill((self.frame_number % 256) as u8);
        let width = NonZeroU32::new(self.config.width).unwrap_or(NonZeroU32::MIN);
        let height = NonZeroU32::new(self.config.height).unwrap_or(NonZeroU32::MIN);
        Image::new(timestamp, self.config.format, width, height, lease)
    }
}

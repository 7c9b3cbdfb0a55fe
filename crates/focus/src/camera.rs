//! Zero-shutter-lag camera orchestration.
use std::{
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
        mpsc,
    },
    thread::{self, JoinHandle},
    time::Instant,
};

use focus_capture::prelude::*;
use parking_lot::Mutex;
use smallvec::smallvec;

use crate::{config::CameraConfig, error::CameraError, metrics::CaptureMetrics};

/// Flash policy for a single picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Flash {
    #[default]
    Off,
    On,
    Auto,
}

impl Flash {
    fn ae_mode(self) -> AeMode {
        match self {
            Flash::Off => AeMode::On,
            Flash::On => AeMode::OnAlwaysFlash,
            Flash::Auto => AeMode::OnAutoFlash,
        }
    }

    fn needs_precapture(self) -> bool {
        !matches!(self, Flash::Off)
    }
}

/// Receives the outcome of one [`ZslCamera::take_picture`] call.
///
/// Exactly one of `on_picture_taken` or `on_picture_failed` is invoked per
/// request, unless a newer request supersedes it before its frame is
/// delivered. A superseded request gets no further callbacks.
///
/// `on_quick_expose` runs on the camera thread and `on_picture_taken` on the
/// save pool, so the two are not ordered relative to each other. A picture
/// saved from the buffer may be delivered before its quick expose.
pub trait PictureCallback: Send + Sync {
    /// The shutter has effectively fired; the picture will follow.
    fn on_quick_expose(&self) {}

    /// `image` is only valid for the duration of the call.
    fn on_picture_taken(&self, image: &Image, metadata: &CaptureMetadata);

    fn on_picture_failed(&self, error: CameraError);
}

/// Parameters of one picture request.
#[derive(Clone)]
pub struct PhotoCaptureParameters {
    pub flash: Flash,
    pub callback: Arc<dyn PictureCallback>,
}

impl PhotoCaptureParameters {
    pub fn new(flash: Flash, callback: Arc<dyn PictureCallback>) -> Self {
        Self { flash, callback }
    }
}

impl fmt::Debug for PhotoCaptureParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhotoCaptureParameters")
            .field("flash", &self.flash)
            .finish_non_exhaustive()
    }
}

/// Inputs whose conjunction is the "ready to take a picture" signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReadyRequirement {
    /// The ring buffer can pin another frame.
    CaptureManagerReady,
    /// No picture request is waiting for its frame.
    CaptureNotInProgress,
}

impl ConjunctionInput for ReadyRequirement {
    fn all() -> &'static [Self] {
        &[
            ReadyRequirement::CaptureManagerReady,
            ReadyRequirement::CaptureNotInProgress,
        ]
    }
}

/// Frame freshness and 3A stability requirements for a picture.
///
/// Frames must be newer than the last captured picture, taken with the lens
/// still, with exposure, focus and white balance out of their search states.
/// `Flash::On` additionally requires a fired single flash; `Flash::Auto`
/// requires a fired flash only when exposure asked for one.
///
/// # Example
/// ```rust
/// use std::sync::{Arc, atomic::AtomicI64};
/// use focus::prelude::*;
///
/// let constraint = ZslConstraint::new(Arc::new(AtomicI64::new(100)), Flash::Off);
/// let fresh = CaptureMetadata::new(2, 200).with(MetadataKey::AE_STATE, AeState::Converged);
/// let stale = CaptureMetadata::new(1, 100);
/// assert!(constraint.satisfied_by(&fresh));
/// assert!(!constraint.satisfied_by(&stale));
/// ```
#[derive(Debug, Clone)]
pub struct ZslConstraint {
    last_captured: Arc<AtomicI64>,
    flash: Flash,
}

impl ZslConstraint {
    pub fn new(last_captured: Arc<AtomicI64>, flash: Flash) -> Self {
        Self {
            last_captured,
            flash,
        }
    }
}

impl CaptureConstraint for ZslConstraint {
    fn satisfied_by(&self, metadata: &CaptureMetadata) -> bool {
        if metadata.timestamp() <= self.last_captured.load(Ordering::Acquire) {
            return false;
        }
        if metadata.lens_state() == Some(LensState::Moving) {
            return false;
        }
        let ae = metadata.ae_state();
        if matches!(ae, Some(AeState::Searching | AeState::Precapture)) {
            return false;
        }
        match self.flash {
            Flash::Off => {}
            Flash::On => {
                if metadata.flash_state() != Some(FlashState::Fired)
                    || metadata.flash_mode() != Some(FlashMode::Single)
                {
                    return false;
                }
            }
            Flash::Auto => {
                if ae == Some(AeState::FlashRequired)
                    && metadata.flash_state() != Some(FlashState::Fired)
                {
                    return false;
                }
            }
        }
        if matches!(
            metadata.af_state(),
            Some(AfState::ActiveScan | AfState::PassiveScan)
        ) {
            return false;
        }
        metadata.awb_state() != Some(AwbState::Searching)
    }
}

/// Matches only frames produced by the request carrying `tag`.
#[derive(Debug, Clone, Copy)]
struct TagConstraint(RequestTag);

impl CaptureConstraint for TagConstraint {
    fn satisfied_by(&self, metadata: &CaptureMetadata) -> bool {
        metadata.tag() == Some(self.0)
    }
}

struct Shared {
    config: CameraConfig,
    source: Arc<dyn CaptureSource>,
    manager: Arc<ImageCaptureManager>,
    ready: ConjunctionMux<ReadyRequirement>,
    last_captured: Arc<AtomicI64>,
    next_capture_id: AtomicU64,
    /// Id of the newest picture request; only it may clear the in-progress flag.
    generation: Mutex<u64>,
    closed: AtomicBool,
    metrics: CaptureMetrics,
}

impl Shared {
    fn next_explicit_tag(&self) -> RequestTag {
        RequestTag::ExplicitCapture(self.next_capture_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Mark a picture as in progress and return its generation.
    fn begin_capture(&self) -> u64 {
        let mut generation = self.generation.lock();
        *generation += 1;
        self.ready
            .set_input(ReadyRequirement::CaptureNotInProgress, false);
        *generation
    }

    /// Clear the in-progress flag unless a newer picture has started.
    fn end_capture(&self, generation: u64) {
        let current = self.generation.lock();
        if *current == generation {
            self.ready
                .set_input(ReadyRequirement::CaptureNotInProgress, true);
        }
    }
}

/// One picture request waiting for its frame.
struct ImageCaptureTask {
    shared: Weak<Shared>,
    callback: Arc<dyn PictureCallback>,
    generation: u64,
    requested_at: Instant,
    done: AtomicBool,
}

impl ImageCaptureTask {
    fn new(shared: &Arc<Shared>, callback: Arc<dyn PictureCallback>, generation: u64) -> Self {
        Self {
            shared: Arc::downgrade(shared),
            callback,
            generation,
            requested_at: Instant::now(),
            done: AtomicBool::new(false),
        }
    }

    /// Settle the task without a callback; false if it already settled.
    fn retire(&self) -> bool {
        !self.done.swap(true, Ordering::AcqRel)
    }

    fn fail(&self, shared: &Shared, error: CameraError) {
        if !self.retire() {
            return;
        }
        shared.metrics.record_failure();
        shared.end_capture(self.generation);
        self.callback.on_picture_failed(error);
    }
}

impl ImageCaptureListener for ImageCaptureTask {
    fn on_image_captured(&self, image: &Image, metadata: &CaptureMetadata) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        if !self.retire() {
            return;
        }
        let timestamp = metadata.timestamp();
        let previous = shared.last_captured.fetch_max(timestamp, Ordering::AcqRel);
        shared.end_capture(self.generation);
        if timestamp <= previous {
            tracing::debug!(timestamp, previous, "dropping frame older than last picture");
            return;
        }
        shared.metrics.shutter_lag.record(self.requested_at.elapsed());
        shared.metrics.record_delivery();

        let start = Instant::now();
        self.callback.on_picture_taken(image, metadata);
        shared.metrics.handoff.record(start.elapsed());
        tracing::debug!(
            frame = metadata.frame_number(),
            timestamp,
            "picture delivered"
        );
    }
}

enum Command {
    StartPreview(ResultCell<Result<(), CameraError>>),
    TriggerFocus(ResultCell<Result<(), CameraError>>),
    TakePicture(PhotoCaptureParameters),
    PrecaptureFinished(RequestTag),
    CaptureFailed {
        tag: Option<RequestTag>,
        error: CaptureError,
    },
    Shutdown,
}

/// Forwards capture source events to the correlator and failures to the worker.
struct SourceEvents {
    manager: Arc<ImageCaptureManager>,
    commands: mpsc::Sender<Command>,
}

impl CaptureCallbacks for SourceEvents {
    fn on_image(&self, image: Image) {
        self.manager.on_image(image);
    }

    fn on_partial_metadata(&self, metadata: Arc<CaptureMetadata>) {
        self.manager.on_partial_metadata(metadata);
    }

    fn on_metadata(&self, metadata: Arc<CaptureMetadata>) {
        self.manager.on_metadata(metadata);
    }

    fn on_capture_failed(&self, tag: Option<RequestTag>, error: CaptureError) {
        tracing::warn!(?tag, code = error.code(), "capture source failed a request: {error}");
        let _ = self.commands.send(Command::CaptureFailed { tag, error });
    }
}

struct InFlight {
    task: Arc<ImageCaptureTask>,
    tag: Option<RequestTag>,
    precapture: Option<PrecaptureWait>,
}

/// Still request held back until auto-exposure leaves precapture.
struct PrecaptureWait {
    listener: ListenerId,
    flash: Flash,
}

/// Owns all orchestration state; runs on the camera thread.
struct Worker {
    shared: Arc<Shared>,
    commands: mpsc::Sender<Command>,
    in_flight: Option<InFlight>,
    /// When the focus hold ends and continuous focus resumes.
    focus_resume: Option<Instant>,
}

impl Worker {
    fn run(mut self, rx: mpsc::Receiver<Command>) {
        loop {
            let command = match self.focus_resume {
                Some(deadline) => {
                    match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                        Ok(command) => command,
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            self.resume_focus();
                            continue;
                        }
                        Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match rx.recv() {
                    Ok(command) => command,
                    Err(_) => break,
                },
            };
            match command {
                Command::StartPreview(reply) => {
                    reply.set(self.start_preview());
                }
                Command::TriggerFocus(reply) => {
                    reply.set(self.trigger_focus());
                }
                Command::TakePicture(params) => self.take_picture(params),
                Command::PrecaptureFinished(tag) => self.precapture_finished(tag),
                Command::CaptureFailed { tag, error } => self.capture_failed(tag, error),
                Command::Shutdown => break,
            }
        }
        self.abandon_in_flight();
        tracing::debug!("camera worker stopped");
    }

    fn stream_template(&self) -> RequestTemplate {
        if self.shared.config.zsl_enabled() {
            RequestTemplate::ZeroShutterLag
        } else {
            RequestTemplate::Preview
        }
    }

    /// Repeating request with continuous focus.
    fn send_repeating(&self) -> Result<(), CameraError> {
        let request = CaptureRequest::new(self.stream_template())
            .tag(RequestTag::Repeating)
            .control(MetadataKey::AF_MODE, AfMode::ContinuousPicture)
            .control(MetadataKey::AE_MODE, AeMode::On)
            .control(MetadataKey::FLASH_MODE, FlashMode::Off);
        self.shared.source.set_repeating(request).map_err(|err| {
            tracing::error!(code = err.code(), "repeating request rejected: {err}");
            CameraError::from(err)
        })
    }

    fn start_preview(&mut self) -> Result<(), CameraError> {
        self.focus_resume = None;
        self.send_repeating()?;
        let shared = &self.shared;
        shared
            .ready
            .set_input(ReadyRequirement::CaptureNotInProgress, true);
        shared.ready.notify_listeners();
        tracing::info!(template = ?self.stream_template(), "preview started");
        Ok(())
    }

    /// Start an auto-focus scan, then hold the lens until the focus hold
    /// elapses. A new trigger restarts the hold.
    fn trigger_focus(&mut self) -> Result<(), CameraError> {
        let template = self.stream_template();
        let trigger = CaptureRequest::new(template)
            .tag(RequestTag::FocusTrigger)
            .control(MetadataKey::AF_MODE, AfMode::Auto)
            .control(MetadataKey::AF_TRIGGER, AfTrigger::Start);
        if let Err(err) = self.shared.source.submit(trigger) {
            tracing::warn!(code = err.code(), "focus trigger rejected: {err}");
            return Err(err.into());
        }
        let hold = CaptureRequest::new(template)
            .tag(RequestTag::Repeating)
            .control(MetadataKey::AF_MODE, AfMode::Auto)
            .control(MetadataKey::AF_TRIGGER, AfTrigger::Idle)
            .control(MetadataKey::AE_MODE, AeMode::On)
            .control(MetadataKey::FLASH_MODE, FlashMode::Off);
        if let Err(err) = self.shared.source.set_repeating(hold) {
            tracing::warn!(code = err.code(), "focus hold rejected: {err}");
            return Err(err.into());
        }
        let hold_for = self.shared.config.focus_hold();
        self.focus_resume = Some(Instant::now() + hold_for);
        tracing::debug!(?hold_for, "focus triggered");
        Ok(())
    }

    fn resume_focus(&mut self) {
        self.focus_resume = None;
        if self.send_repeating().is_ok() {
            tracing::debug!("continuous focus resumed");
        }
    }

    fn take_picture(&mut self, params: PhotoCaptureParameters) {
        let shared = self.shared.clone();
        shared.metrics.record_request();
        let generation = shared.begin_capture();
        self.supersede_in_flight();

        let task = Arc::new(ImageCaptureTask::new(
            &shared,
            params.callback.clone(),
            generation,
        ));
        let zsl: Arc<dyn CaptureConstraint> = Arc::new(ZslConstraint::new(
            shared.last_captured.clone(),
            params.flash,
        ));

        if shared.config.zsl_enabled() {
            if shared
                .manager
                .try_capture_existing(task.clone(), std::slice::from_ref(&zsl))
            {
                tracing::debug!(flash = ?params.flash, "saving buffered frame");
                shared.metrics.record_retroactive();
                params.callback.on_quick_expose();
                return;
            }
            if !params.flash.needs_precapture() {
                tracing::debug!("waiting for next qualifying frame");
                shared.manager.capture_next(task.clone(), smallvec![zsl]);
                self.in_flight = Some(InFlight {
                    task,
                    tag: None,
                    precapture: None,
                });
                return;
            }
        }

        let tag = shared.next_explicit_tag();
        let tagged: Arc<dyn CaptureConstraint> = Arc::new(TagConstraint(tag));
        shared.manager.capture_next(task.clone(), smallvec![tagged]);
        self.in_flight = Some(InFlight {
            task,
            tag: Some(tag),
            precapture: None,
        });

        if params.flash.needs_precapture() {
            tracing::debug!(?tag, flash = ?params.flash, "running precapture before still");
            self.start_precapture(tag, params.flash);
        } else {
            tracing::debug!(?tag, "issuing still capture");
            self.submit_still(tag, params.flash, &params.callback);
        }
    }

    fn start_precapture(&mut self, tag: RequestTag, flash: Flash) {
        let commands = self.commands.clone();
        let fired = AtomicBool::new(false);
        let listener = self.shared.manager.add_metadata_change_listener(
            MetadataKey::AE_STATE,
            Arc::new(
                move |_key: MetadataKey,
                      old: Option<&MetadataValue>,
                      _new: &MetadataValue,
                      _metadata: &CaptureMetadata| {
                    let left_precapture = old.and_then(MetadataValue::as_uint)
                        == Some(AeState::Precapture.raw());
                    if left_precapture && !fired.swap(true, Ordering::AcqRel) {
                        let _ = commands.send(Command::PrecaptureFinished(tag));
                    }
                },
            ),
        );
        if let Some(in_flight) = self.in_flight.as_mut() {
            in_flight.precapture = Some(PrecaptureWait { listener, flash });
        }

        let trigger = CaptureRequest::new(RequestTemplate::Preview)
            .tag(RequestTag::Precapture)
            .control(MetadataKey::AE_MODE, flash.ae_mode())
            .control(MetadataKey::AE_PRECAPTURE_TRIGGER, 1u32);
        if let Err(err) = self.shared.source.submit(trigger) {
            tracing::error!(code = err.code(), "precapture trigger rejected: {err}");
            self.fail_in_flight(err.into());
        }
    }

    fn precapture_finished(&mut self, tag: RequestTag) {
        let Some(in_flight) = self.in_flight.as_mut() else {
            return;
        };
        if in_flight.tag != Some(tag) {
            return;
        }
        let Some(wait) = in_flight.precapture.take() else {
            return;
        };
        let callback = in_flight.task.callback.clone();
        self.shared
            .manager
            .remove_metadata_change_listener(MetadataKey::AE_STATE, wait.listener);
        tracing::debug!(?tag, "precapture finished; issuing still capture");
        if self.submit_still(tag, wait.flash, &callback) {
            callback.on_quick_expose();
        }
    }

    fn submit_still(
        &mut self,
        tag: RequestTag,
        flash: Flash,
        callback: &Arc<dyn PictureCallback>,
    ) -> bool {
        let flash_mode = match flash {
            Flash::On => FlashMode::Single,
            Flash::Off | Flash::Auto => FlashMode::Off,
        };
        let mut request = CaptureRequest::new(RequestTemplate::StillCapture)
            .tag(tag)
            .control(MetadataKey::AF_MODE, AfMode::ContinuousPicture)
            .control(MetadataKey::AE_MODE, flash.ae_mode());
        if flash != Flash::Auto {
            request = request.control(MetadataKey::FLASH_MODE, flash_mode);
        }
        match self.shared.source.submit(request) {
            Ok(()) => {
                if flash == Flash::Off {
                    callback.on_quick_expose();
                }
                true
            }
            Err(err) => {
                tracing::error!(?tag, code = err.code(), "still capture rejected: {err}");
                self.fail_in_flight(err.into());
                false
            }
        }
    }

    fn capture_failed(&mut self, tag: Option<RequestTag>, error: CaptureError) {
        let matches = match (&self.in_flight, tag) {
            (Some(in_flight), Some(tag)) => in_flight.tag == Some(tag),
            _ => false,
        };
        if matches {
            self.fail_in_flight(error.into());
        }
    }

    fn fail_in_flight(&mut self, error: CameraError) {
        let Some(in_flight) = self.in_flight.take() else {
            return;
        };
        if let Some(wait) = in_flight.precapture {
            self.shared
                .manager
                .remove_metadata_change_listener(MetadataKey::AE_STATE, wait.listener);
        }
        self.shared.manager.cancel_pending_capture();
        in_flight.task.fail(&self.shared, error);
    }

    /// Retire the previous request. Its callback is not invoked again unless
    /// delivery of its frame has already begun.
    fn supersede_in_flight(&mut self) {
        let Some(in_flight) = self.in_flight.take() else {
            return;
        };
        if let Some(wait) = in_flight.precapture {
            self.shared
                .manager
                .remove_metadata_change_listener(MetadataKey::AE_STATE, wait.listener);
        }
        let was_pending = self.shared.manager.cancel_pending_capture();
        if in_flight.task.retire() {
            tracing::debug!(tag = ?in_flight.tag, was_pending, "previous picture request superseded");
        }
    }

    fn abandon_in_flight(&mut self) {
        let Some(in_flight) = self.in_flight.as_ref() else {
            return;
        };
        // A request already handed to the save pool still completes.
        if in_flight.precapture.is_some() || self.shared.manager.has_pending_capture() {
            self.fail_in_flight(CameraError::Closed);
        }
    }
}

/// Zero-shutter-lag camera over a [`CaptureSource`].
///
/// All orchestration runs on a dedicated camera thread; public methods post
/// commands to it. Picture callbacks run on the save pool, readiness and
/// focus listeners on the listener thread.
///
/// `close` must not be called from inside a [`PictureCallback`]: it waits for
/// in-flight pictures to finish.
///
/// # Example
/// ```rust,no_run
/// use std::sync::Arc;
/// use focus::prelude::*;
///
/// let source = Arc::new(VirtualCapture::new(VirtualConfig::default())?);
/// let camera = ZslCamera::open(source, CameraConfig::default())?;
/// camera.set_ready_state_listener(|ready| println!("ready: {ready}"));
/// camera.start_preview().wait()?;
/// camera.close();
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct ZslCamera {
    shared: Arc<Shared>,
    commands: Mutex<Option<mpsc::Sender<Command>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    listener_executor: TaskExecutor,
    capture_executor: TaskExecutor,
}

impl ZslCamera {
    /// Wire a camera to `source` and start its worker threads.
    pub fn open(source: Arc<dyn CaptureSource>, config: CameraConfig) -> Result<Self, CameraError> {
        config.validate()?;
        let setup = |err: std::io::Error| CameraError::SetupFailed(err.to_string());
        let listener_executor =
            TaskExecutor::serial("focus-listener", config.executor_queue_depth()).map_err(setup)?;
        let capture_executor = TaskExecutor::pool(
            "focus-capture",
            config.worker_threads(),
            config.executor_queue_depth(),
        )
        .map_err(setup)?;

        let manager = Arc::new(
            ImageCaptureManager::new(
                config.ring_capacity(),
                listener_executor.handle(),
                capture_executor.handle(),
            )
            .with_callback_budget(config.callback_budget()),
        );
        let shared = Arc::new(Shared {
            ready: ConjunctionMux::new(listener_executor.handle()),
            config,
            source,
            manager,
            last_captured: Arc::new(AtomicI64::new(i64::MIN)),
            next_capture_id: AtomicU64::new(0),
            generation: Mutex::new(0),
            closed: AtomicBool::new(false),
            metrics: CaptureMetrics::default(),
        });

        let weak = Arc::downgrade(&shared);
        shared.manager.set_capture_ready_listener(move |ready| {
            if let Some(shared) = weak.upgrade() {
                shared
                    .ready
                    .set_input(ReadyRequirement::CaptureManagerReady, ready);
            }
        });

        let (tx, rx) = mpsc::channel();
        shared.source.set_callbacks(Arc::new(SourceEvents {
            manager: shared.manager.clone(),
            commands: tx.clone(),
        }));
        let worker = Worker {
            shared: shared.clone(),
            commands: tx.clone(),
            in_flight: None,
            focus_resume: None,
        };
        let handle = thread::Builder::new()
            .name("focus-camera".into())
            .spawn(move || worker.run(rx))
            .map_err(setup)?;

        tracing::debug!(
            ring_capacity = shared.config.ring_capacity(),
            zsl = shared.config.zsl_enabled(),
            "camera opened"
        );
        Ok(Self {
            shared,
            commands: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(handle)),
            listener_executor,
            capture_executor,
        })
    }

    fn send(&self, command: Command) -> bool {
        match self.commands.lock().as_ref() {
            Some(tx) => tx.send(command).is_ok(),
            None => false,
        }
    }

    /// Start the repeating request; the cell resolves once the source accepted it.
    pub fn start_preview(&self) -> ResultCell<Result<(), CameraError>> {
        let reply = ResultCell::new();
        if !self.send(Command::StartPreview(reply.clone())) {
            reply.set(Err(CameraError::Closed));
        }
        reply
    }

    /// Run one auto-focus scan and hold focus for
    /// [`CameraConfig::focus_hold`] before continuous focus resumes.
    ///
    /// The cell resolves once the source accepted the trigger and hold
    /// requests. Frames taken while the scan runs do not qualify for a picture.
    pub fn trigger_focus(&self) -> ResultCell<Result<(), CameraError>> {
        let reply = ResultCell::new();
        if !self.send(Command::TriggerFocus(reply.clone())) {
            reply.set(Err(CameraError::Closed));
        }
        reply
    }

    /// Take a picture, from the buffer when a qualifying frame is available.
    pub fn take_picture(&self, params: PhotoCaptureParameters) {
        let callback = params.callback.clone();
        if !self.send(Command::TakePicture(params)) {
            callback.on_picture_failed(CameraError::Closed);
        }
    }

    /// Register a readiness listener and deliver the current state to it.
    pub fn set_ready_state_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let id = self.shared.ready.add_listener(listener);
        self.shared.ready.notify_listeners();
        id
    }

    pub fn remove_ready_state_listener(&self, id: ListenerId) -> bool {
        self.shared.ready.remove_listener(id)
    }

    /// Report auto-focus state changes with the frame number they were seen on.
    pub fn set_focus_state_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(AfState, i64) + Send + Sync + 'static,
    {
        self.shared.manager.add_metadata_change_listener(
            MetadataKey::AF_STATE,
            Arc::new(
                move |_key: MetadataKey,
                      _old: Option<&MetadataValue>,
                      new: &MetadataValue,
                      metadata: &CaptureMetadata| {
                    if let Some(state) = new.as_uint().and_then(AfState::from_raw) {
                        listener(state, metadata.frame_number());
                    }
                },
            ),
        )
    }

    pub fn remove_focus_state_listener(&self, id: ListenerId) -> bool {
        self.shared
            .manager
            .remove_metadata_change_listener(MetadataKey::AF_STATE, id)
    }

    pub fn is_ready(&self) -> bool {
        self.shared.ready.output()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &CameraConfig {
        &self.shared.config
    }

    pub fn metrics(&self) -> &CaptureMetrics {
        &self.shared.metrics
    }

    pub fn ring_metrics(&self) -> &RingMetrics {
        self.shared.manager.ring_metrics()
    }

    /// Stop streaming, wait for in-flight pictures, and release every
    /// buffered image. Later calls only log.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            tracing::warn!("camera already closed");
            return;
        }
        if let Some(tx) = self.commands.lock().take() {
            let _ = tx.send(Command::Shutdown);
        }
        if let Some(worker) = self.worker.lock().take()
            && worker.join().is_err()
        {
            tracing::error!("camera worker panicked");
        }
        if let Err(err) = self.shared.source.stop_repeating() {
            tracing::debug!(code = err.code(), "stop repeating failed: {err}");
        }
        self.shared.source.close();
        self.shared.manager.close();
        self.capture_executor.shutdown();
        self.listener_executor.shutdown();
        tracing::info!(metrics = ?self.shared.metrics, "camera closed");
    }
}

impl Drop for ZslCamera {
    fn drop(&mut self) {
        if !self.is_closed() {
            self.close();
        }
    }
}

impl fmt::Debug for ZslCamera {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZslCamera")
            .field("config", &self.shared.config)
            .field("ready", &self.shared.ready.output())
            .field("closed", &self.is_closed())
            .finish()
    }
}

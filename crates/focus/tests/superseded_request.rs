use std::{
    num::NonZeroU32,
    sync::{Arc, mpsc},
    time::{Duration, Instant},
};

use focus::prelude::*;
use parking_lot::{Condvar, Mutex};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Capture source whose frames are emitted by the test itself.
struct ManualSource {
    callbacks: Mutex<Option<Arc<dyn CaptureCallbacks>>>,
    submitted: Mutex<Vec<CaptureRequest>>,
    changed: Condvar,
    pool: BufferPool,
}

impl ManualSource {
    fn new() -> Self {
        Self {
            callbacks: Mutex::new(None),
            submitted: Mutex::new(Vec::new()),
            changed: Condvar::new(),
            pool: BufferPool::with_capacity(16, 16),
        }
    }

    fn emit(&self, frame: i64, tag: RequestTag, ae: AeState) {
        let callbacks = self.callbacks.lock().clone().expect("camera attached");
        let timestamp = frame * 1_000;
        let one = NonZeroU32::new(1).unwrap();
        let metadata = CaptureMetadata::new(frame, timestamp)
            .with(MetadataKey::AE_STATE, ae)
            .with(MetadataKey::AF_STATE, AfState::PassiveFocused)
            .with(MetadataKey::AWB_STATE, AwbState::Converged)
            .with(MetadataKey::LENS_STATE, LensState::Stationary)
            .with_tag(tag);
        callbacks.on_image(Image::new(timestamp, ImageFormat::Jpeg, one, one, self.pool.lease()));
        callbacks.on_metadata(Arc::new(metadata));
    }

    /// Wait for a submitted single request matching `pred`.
    fn wait_submitted(&self, pred: impl Fn(&CaptureRequest) -> bool) -> CaptureRequest {
        let deadline = Instant::now() + TIMEOUT;
        let mut submitted = self.submitted.lock();
        loop {
            if let Some(request) = submitted.iter().find(|r| pred(r)) {
                return request.clone();
            }
            assert!(
                !self.changed.wait_until(&mut submitted, deadline).timed_out(),
                "request never submitted: {submitted:?}"
            );
        }
    }
}

impl CaptureSource for ManualSource {
    fn set_callbacks(&self, callbacks: Arc<dyn CaptureCallbacks>) {
        *self.callbacks.lock() = Some(callbacks);
    }

    fn set_repeating(&self, _request: CaptureRequest) -> Result<(), CaptureError> {
        Ok(())
    }

    fn stop_repeating(&self) -> Result<(), CaptureError> {
        Ok(())
    }

    fn submit(&self, request: CaptureRequest) -> Result<(), CaptureError> {
        self.submitted.lock().push(request);
        self.changed.notify_all();
        Ok(())
    }
}

#[derive(Default)]
struct Outcomes {
    taken: Mutex<Vec<i64>>,
    failed: Mutex<Vec<CameraError>>,
    changed: Condvar,
}

impl Outcomes {
    fn wait_taken(&self) -> Vec<i64> {
        let deadline = Instant::now() + TIMEOUT;
        let mut taken = self.taken.lock();
        while taken.is_empty() {
            if self.changed.wait_until(&mut taken, deadline).timed_out() {
                break;
            }
        }
        taken.clone()
    }
}

impl PictureCallback for Outcomes {
    fn on_picture_taken(&self, _image: &Image, metadata: &CaptureMetadata) {
        self.taken.lock().push(metadata.frame_number());
        self.changed.notify_all();
    }

    fn on_picture_failed(&self, error: CameraError) {
        self.failed.lock().push(error);
    }
}

#[test]
fn superseded_flash_request_never_receives_its_still() {
    let source = Arc::new(ManualSource::new());
    let camera = ZslCamera::open(
        source.clone(),
        CameraConfig::default().with_worker_threads(2),
    )
    .unwrap();
    camera.start_preview().wait().unwrap();
    for frame in 1..=3 {
        source.emit(frame, RequestTag::Repeating, AeState::Converged);
    }

    let first = Arc::new(Outcomes::default());
    camera.take_picture(PhotoCaptureParameters::new(Flash::On, first.clone()));
    source.wait_submitted(|r| r.tag_value() == Some(RequestTag::Precapture));
    source.emit(4, RequestTag::Repeating, AeState::Precapture);
    source.emit(5, RequestTag::Repeating, AeState::Converged);
    let still = source.wait_submitted(|r| r.template() == RequestTemplate::StillCapture);
    let still_tag = still.tag_value().unwrap();

    let second = Arc::new(Outcomes::default());
    camera.take_picture(PhotoCaptureParameters::new(Flash::Off, second.clone()));
    assert_eq!(second.wait_taken(), vec![5]);

    source.emit(6, still_tag, AeState::Converged);
    std::thread::sleep(Duration::from_millis(50));
    assert!(first.taken.lock().is_empty(), "superseded request was delivered");
    assert!(first.failed.lock().is_empty());

    let deadline = Instant::now() + TIMEOUT;
    while !camera.is_ready() {
        assert!(Instant::now() < deadline, "camera did not return to ready");
        std::thread::sleep(Duration::from_millis(1));
    }
    camera.close();
    assert_eq!(source.pool.metrics().outstanding(), 0);
}

/// Holds the save pool inside `on_picture_taken` until released.
struct Stall {
    entered: Mutex<mpsc::Sender<()>>,
    gate: Mutex<mpsc::Receiver<()>>,
}

impl PictureCallback for Stall {
    fn on_picture_taken(&self, _image: &Image, _metadata: &CaptureMetadata) {
        let _ = self.entered.lock().send(());
        let _ = self.gate.lock().recv_timeout(TIMEOUT);
    }

    fn on_picture_failed(&self, _error: CameraError) {}
}

#[test]
fn older_picture_finishing_late_keeps_newer_one_in_progress() {
    let source = Arc::new(ManualSource::new());
    let camera = ZslCamera::open(source.clone(), CameraConfig::default().with_worker_threads(1))
        .unwrap();
    camera.start_preview().wait().unwrap();
    for frame in 1..=3 {
        source.emit(frame, RequestTag::Repeating, AeState::Converged);
    }

    let (entered_tx, entered_rx) = mpsc::channel();
    let (gate_tx, gate_rx) = mpsc::channel();
    let stall = Arc::new(Stall {
        entered: Mutex::new(entered_tx),
        gate: Mutex::new(gate_rx),
    });
    camera.take_picture(PhotoCaptureParameters::new(Flash::Off, stall));
    entered_rx.recv_timeout(TIMEOUT).unwrap();

    // Queued behind the stalled save.
    source.emit(4, RequestTag::Repeating, AeState::Converged);
    let buffered = Arc::new(Outcomes::default());
    camera.take_picture(PhotoCaptureParameters::new(Flash::Off, buffered.clone()));

    let flash = Arc::new(Outcomes::default());
    camera.take_picture(PhotoCaptureParameters::new(Flash::On, flash.clone()));
    source.wait_submitted(|r| r.tag_value() == Some(RequestTag::Precapture));

    gate_tx.send(()).unwrap();
    assert_eq!(buffered.wait_taken(), vec![4]);
    std::thread::sleep(Duration::from_millis(30));
    assert!(!camera.is_ready(), "older picture cleared the in-progress flag");
    assert!(flash.taken.lock().is_empty());

    camera.close();
    assert_eq!(*flash.failed.lock(), vec![CameraError::Closed]);
}

//! Stream synthetic frames, take one buffered and one flash picture, run a
//! focus cycle, then close.
//!
//! Run with `RUST_LOG=focus=debug,focus_capture=debug` for pipeline detail.
use std::{
    sync::{Arc, mpsc},
    time::Duration,
};

use focus::prelude::*;
use tracing_subscriber::EnvFilter;

struct Report {
    name: &'static str,
    done: parking_lot::Mutex<mpsc::Sender<()>>,
}

impl PictureCallback for Report {
    fn on_quick_expose(&self) {
        tracing::info!(picture = self.name, "shutter");
    }

    fn on_picture_taken(&self, image: &Image, metadata: &CaptureMetadata) {
        tracing::info!(
            picture = self.name,
            frame = metadata.frame_number(),
            flash = ?metadata.flash_state(),
            bytes = image.data().len(),
            "picture taken"
        );
        let _ = self.done.lock().send(());
    }

    fn on_picture_failed(&self, error: CameraError) {
        tracing::error!(picture = self.name, code = error.code(), "picture failed: {error}");
        let _ = self.done.lock().send(());
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let source = Arc::new(VirtualCapture::new(
        VirtualConfig::default().frame_interval(Duration::from_millis(10)),
    )?);
    let config = CameraConfig::default().with_focus_hold(Duration::from_millis(200));
    let camera = ZslCamera::open(source.clone(), config)?;

    let (ready_tx, ready_rx) = mpsc::channel();
    let ready_tx = parking_lot::Mutex::new(ready_tx);
    camera.set_ready_state_listener(move |ready| {
        tracing::info!(ready, "ready state");
        if ready {
            let _ = ready_tx.lock().send(());
        }
    });
    camera.set_focus_state_listener(|state, frame| tracing::debug!(?state, frame, "focus"));
    camera.start_preview().wait()?;
    ready_rx.recv_timeout(Duration::from_secs(5))?;

    for (name, flash) in [("buffered", Flash::Off), ("flash", Flash::On)] {
        let (tx, rx) = mpsc::channel();
        camera.take_picture(PhotoCaptureParameters::new(
            flash,
            Arc::new(Report {
                name,
                done: parking_lot::Mutex::new(tx),
            }),
        ));
        rx.recv_timeout(Duration::from_secs(5))?;
    }

    camera.trigger_focus().wait()?;
    std::thread::sleep(Duration::from_millis(300));

    let metrics = camera.metrics();
    tracing::info!(
        requested = metrics.requested(),
        retroactive = metrics.retroactive(),
        shutter_lag_ms = ?metrics.shutter_lag.avg_millis(),
        "done"
    );
    camera.close();
    tracing::info!(outstanding = source.pool().metrics().outstanding(), "images still open");
    Ok(())
}

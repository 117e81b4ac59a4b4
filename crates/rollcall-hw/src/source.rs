//! Frame source: a capture thread that forwards every Nth frame.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::camera::{self, Camera, CameraError};
use crate::frame::Frame;

/// Delay between reads; caps capture at roughly 30 fps.
pub const FRAME_PACING: Duration = Duration::from_millis(33);

/// Anything frames can be read from.
pub trait FrameReader {
    fn read_frame(&mut self) -> Result<Frame, CameraError>;
}

/// An opened capture device. Streaming starts on the capture thread.
pub trait CaptureDevice: Send + 'static {
    /// Index the device was opened at.
    fn index(&self) -> usize;
    fn open_stream(&self) -> Result<Box<dyn FrameReader + '_>, CameraError>;
}

/// Opens the capture device at an index.
pub type DeviceOpener = dyn Fn(usize) -> Result<Box<dyn CaptureDevice>, CameraError> + Send + Sync;

/// Default [`DeviceOpener`]: a V4L2 [`Camera`].
pub fn open_camera(index: usize) -> Result<Box<dyn CaptureDevice>, CameraError> {
    Ok(Box::new(Camera::open(index)?))
}

/// Receiver of captured frames and camera notifications.
pub trait FrameSink: Send + 'static {
    fn frame(&mut self, frame: Frame);
    fn status(&mut self, message: String);
    fn error(&mut self, message: String);
}

/// Handle to a running capture thread. Dropping it stops the thread.
pub struct FrameSource {
    running: Arc<AtomicBool>,
    frame_skip: Arc<AtomicU32>,
    handle: Option<JoinHandle<()>>,
}

impl FrameSource {
    /// Open the camera (falling back to index 0) and start capturing.
    pub fn start(camera_index: usize, frame_skip: u32, sink: impl FrameSink) -> Result<Self, CameraError> {
        Self::start_with(&open_camera, camera_index, frame_skip, sink)
    }

    /// Like [`FrameSource::start`], opening devices through `open`.
    ///
    /// The device is opened before the thread starts, so an unusable camera
    /// fails here rather than inside the thread.
    pub fn start_with(
        open: &DeviceOpener,
        camera_index: usize,
        frame_skip: u32,
        sink: impl FrameSink,
    ) -> Result<Self, CameraError> {
        let device = camera::open_with_fallback(camera_index, open)?;
        let opened = device.index();

        Self::spawn(frame_skip, sink, move |running, skip, sink| {
            let mut stream = match device.open_stream() {
                Ok(stream) => stream,
                Err(e) => {
                    sink.error(format!("camera {opened}: {e}"));
                    return;
                }
            };
            sink.status(format!("camera {opened} started"));
            capture_loop(stream.as_mut(), running, skip, sink);
            sink.status(format!("camera {opened} stopped"));
        })
    }

    /// Capture from an arbitrary reader.
    pub fn with_reader<R>(reader: R, frame_skip: u32, sink: impl FrameSink) -> Result<Self, CameraError>
    where
        R: FrameReader + Send + 'static,
    {
        Self::spawn(frame_skip, sink, move |running, skip, sink| {
            let mut reader = reader;
            capture_loop(&mut reader, running, skip, sink);
        })
    }

    fn spawn<S, F>(frame_skip: u32, mut sink: S, body: F) -> Result<Self, CameraError>
    where
        S: FrameSink,
        F: FnOnce(&AtomicBool, &AtomicU32, &mut dyn FrameSink) + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let skip = Arc::new(AtomicU32::new(frame_skip.max(1)));

        let thread_running = Arc::clone(&running);
        let thread_skip = Arc::clone(&skip);
        let handle = thread::Builder::new()
            .name("frame-source".into())
            .spawn(move || body(&thread_running, &thread_skip, &mut sink))
            .map_err(|e| CameraError::CaptureFailed(format!("failed to spawn capture thread: {e}")))?;

        Ok(Self {
            running,
            frame_skip: skip,
            handle: Some(handle),
        })
    }

    /// Change how many frames are captured per forwarded frame. Clamped to ≥ 1.
    pub fn set_frame_skip(&self, frame_skip: u32) {
        self.frame_skip.store(frame_skip.max(1), Ordering::Relaxed);
    }

    pub fn frame_skip(&self) -> u32 {
        self.frame_skip.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal the thread to stop and wait for it to exit.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("frame source thread panicked");
            }
        }
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop(
    reader: &mut dyn FrameReader,
    running: &AtomicBool,
    skip: &AtomicU32,
    sink: &mut dyn FrameSink,
) {
    let mut frame_count: u64 = 0;

    while running.load(Ordering::SeqCst) {
        match reader.read_frame() {
            Ok(frame) => {
                let skip = skip.load(Ordering::Relaxed).max(1) as u64;
                if frame_count % skip == 0 {
                    sink.frame(frame);
                }
                frame_count += 1;
            }
            Err(e) => {
                tracing::warn!(error = %e, "frame read failed");
                sink.error(format!("failed to read frame: {e}"));
            }
        }
        thread::sleep(FRAME_PACING);
    }

    tracing::debug!(frame_count, "capture loop exited");
}

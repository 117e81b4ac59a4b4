//! Detection scheduler: a single-slot mailbox drained by a throttled worker.
//!
//! The frame source replaces whatever frame is pending; the worker thread
//! wakes every poll period and runs recognition on the pending frame once
//! the processing interval has elapsed since the last run finished.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rollcall_core::config::MIN_DETECTION_INTERVAL;
use rollcall_core::RecognitionEngine;
use rollcall_hw::Frame;

use crate::events::{EventSender, PipelineEvent};
use crate::lock;

pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Point-in-time view of the scheduler. Reading it has no side effects.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerStatus {
    pub processing_interval: Duration,
    pub time_since_last_processing: Option<Duration>,
    pub has_pending_frame: bool,
    pub frames_processed: u64,
}

impl SchedulerStatus {
    /// Time until a pending frame becomes eligible; zero if it already is.
    pub fn time_until_next(&self) -> Duration {
        match self.time_since_last_processing {
            Some(since) => self.processing_interval.saturating_sub(since),
            None => Duration::ZERO,
        }
    }
}

struct Shared {
    pending: Mutex<Option<Frame>>,
    interval_ms: AtomicU64,
    last_processed: Mutex<Option<Instant>>,
    frames_processed: AtomicU64,
    running: AtomicBool,
}

impl Shared {
    fn new(interval_secs: f64) -> Self {
        Self {
            pending: Mutex::new(None),
            interval_ms: AtomicU64::new(clamp_interval_ms(interval_secs)),
            last_processed: Mutex::new(None),
            frames_processed: AtomicU64::new(0),
            running: AtomicBool::new(true),
        }
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::Relaxed))
    }

    fn replace(&self, frame: Frame) {
        *lock(&self.pending) = Some(frame);
    }

    /// Take the pending frame if the interval has elapsed.
    fn take_if_due(&self) -> Option<Frame> {
        let due = match *lock(&self.last_processed) {
            Some(last) => last.elapsed() >= self.interval(),
            None => true,
        };
        if !due {
            return None;
        }
        lock(&self.pending).take()
    }

    fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            processing_interval: self.interval(),
            time_since_last_processing: lock(&self.last_processed).map(|t| t.elapsed()),
            has_pending_frame: lock(&self.pending).is_some(),
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
        }
    }
}

/// NaN and anything below the floor become the floor.
fn clamp_interval_ms(secs: f64) -> u64 {
    (secs.max(MIN_DETECTION_INTERVAL) * 1000.0).round() as u64
}

/// Cheap handle for producers; queueing never waits on processing.
#[derive(Clone)]
pub struct FrameQueue {
    shared: Arc<Shared>,
}

impl FrameQueue {
    /// Replace the pending frame, dropping any frame not yet processed.
    pub fn queue_frame(&self, frame: Frame) {
        self.shared.replace(frame);
    }
}

pub struct DetectionScheduler {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DetectionScheduler {
    pub fn start(
        engine: Arc<Mutex<RecognitionEngine>>,
        interval_secs: f64,
        events: EventSender,
    ) -> std::io::Result<Self> {
        Self::with_poll_interval(engine, interval_secs, events, POLL_INTERVAL)
    }

    pub fn with_poll_interval(
        engine: Arc<Mutex<RecognitionEngine>>,
        interval_secs: f64,
        events: EventSender,
        poll: Duration,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(Shared::new(interval_secs));
        let worker = Arc::clone(&shared);

        let handle = thread::Builder::new()
            .name("detection-scheduler".into())
            .spawn(move || {
                tracing::info!("detection scheduler started");
                run(&worker, &engine, &events, poll);
                tracing::info!("detection scheduler exiting");
            })?;

        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn queue(&self) -> FrameQueue {
        FrameQueue {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn queue_frame(&self, frame: Frame) {
        self.shared.replace(frame);
    }

    /// Takes effect for the next eligibility check. Clamped to 0.5 s.
    pub fn set_interval(&self, secs: f64) {
        let ms = clamp_interval_ms(secs);
        self.shared.interval_ms.store(ms, Ordering::Relaxed);
        tracing::info!(interval_ms = ms, "detection interval updated");
    }

    pub fn interval(&self) -> Duration {
        self.shared.interval()
    }

    pub fn status(&self) -> SchedulerStatus {
        self.shared.status()
    }

    /// Signal the worker and wait for any in-flight processing to finish.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = lock(&self.handle).take() {
            if handle.join().is_err() {
                tracing::error!("detection scheduler thread panicked");
            }
        }
    }
}

impl Drop for DetectionScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(shared: &Shared, engine: &Mutex<RecognitionEngine>, events: &EventSender, poll: Duration) {
    while shared.running.load(Ordering::SeqCst) {
        if let Some(frame) = shared.take_if_due() {
            process(shared, engine, events, &frame);
        }
        thread::sleep(poll);
    }
}

fn process(shared: &Shared, engine: &Mutex<RecognitionEngine>, events: &EventSender, frame: &Frame) {
    let started = Instant::now();
    let result = lock(engine).process_frame(&frame.image);
    *lock(&shared.last_processed) = Some(Instant::now());
    shared.frames_processed.fetch_add(1, Ordering::Relaxed);

    let event = match result {
        Ok(Some(batch)) => {
            tracing::debug!(
                sequence = frame.sequence,
                faces = batch.total_faces,
                new = batch.detections.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "frame produced detections"
            );
            PipelineEvent::Detection(batch)
        }
        Ok(None) => return,
        Err(e) => {
            tracing::warn!(sequence = frame.sequence, error = %e, "frame processing failed");
            PipelineEvent::DetectionError(e.to_string())
        }
    };

    if events.send(event).is_err() {
        tracing::debug!("event consumer gone, dropping detection event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{solid_frame, StubEmbedder};
    use tokio::sync::mpsc;

    fn engine(embedder: &StubEmbedder) -> Arc<Mutex<RecognitionEngine>> {
        Arc::new(Mutex::new(RecognitionEngine::new(Box::new(embedder.clone()), 0.6, 0.0)))
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..300 {
            if condition() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("condition not met in time");
    }

    #[test]
    fn test_slot_keeps_only_latest_frame() {
        let shared = Shared::new(1.0);
        shared.replace(solid_frame(10, 1));
        shared.replace(solid_frame(20, 2));
        shared.replace(solid_frame(30, 3));

        let taken = shared.take_if_due().unwrap();
        assert_eq!(taken.sequence, 3);
        assert!(shared.take_if_due().is_none());
    }

    #[test]
    fn test_interval_floor() {
        assert_eq!(clamp_interval_ms(0.1), 500);
        assert_eq!(clamp_interval_ms(-3.0), 500);
        assert_eq!(clamp_interval_ms(f64::NAN), 500);
        assert_eq!(clamp_interval_ms(1.5), 1500);
    }

    #[test]
    fn test_not_due_before_interval() {
        let shared = Shared::new(60.0);
        *lock(&shared.last_processed) = Some(Instant::now());
        shared.replace(solid_frame(10, 1));
        assert!(shared.take_if_due().is_none());

        let status = shared.status();
        assert!(status.has_pending_frame);
        assert!(status.time_until_next() > Duration::from_secs(59));
    }

    #[test]
    fn test_status_before_first_run() {
        let status = Shared::new(2.0).status();
        assert_eq!(status.time_since_last_processing, None);
        assert_eq!(status.time_until_next(), Duration::ZERO);
        assert!(!status.has_pending_frame);
    }

    #[test]
    fn test_consecutive_runs_respect_floor() {
        let embedder = StubEmbedder::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let scheduler =
            DetectionScheduler::with_poll_interval(engine(&embedder), 0.1, tx, Duration::from_millis(10)).unwrap();

        scheduler.queue_frame(solid_frame(40, 1));
        wait_until(|| scheduler.status().frames_processed == 1);
        scheduler.queue_frame(solid_frame(80, 2));
        wait_until(|| scheduler.status().frames_processed == 2);
        scheduler.stop();

        let calls = embedder.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].0.duration_since(calls[0].0) >= Duration::from_millis(500));
    }

    #[test]
    fn test_burst_processes_latest_once() {
        let embedder = StubEmbedder::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler =
            DetectionScheduler::with_poll_interval(engine(&embedder), 30.0, tx, Duration::from_millis(10)).unwrap();

        scheduler.queue_frame(solid_frame(40, 1));
        wait_until(|| scheduler.status().frames_processed == 1);

        let queue = scheduler.queue();
        queue.queue_frame(solid_frame(80, 2));
        queue.queue_frame(solid_frame(120, 3));
        queue.queue_frame(solid_frame(160, 4));
        assert!(scheduler.status().has_pending_frame);
        assert_eq!(scheduler.status().frames_processed, 1);

        scheduler.set_interval(0.5);
        wait_until(|| scheduler.status().frames_processed == 2);
        thread::sleep(Duration::from_millis(100));
        scheduler.stop();

        let status = scheduler.status();
        assert_eq!(status.frames_processed, 2);
        assert!(!status.has_pending_frame);

        let seen: Vec<u8> = embedder.calls().iter().map(|(_, v)| *v).collect();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].abs_diff(40) <= 1 && seen[1].abs_diff(160) <= 1, "{seen:?}");

        let mut batches = 0;
        while let Ok(event) = rx.try_recv() {
            assert!(matches!(event, PipelineEvent::Detection(_)));
            batches += 1;
        }
        assert_eq!(batches, 2);
    }

    #[test]
    fn test_processing_error_reported() {
        let embedder = StubEmbedder {
            fail: true,
            ..Default::default()
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler =
            DetectionScheduler::with_poll_interval(engine(&embedder), 0.5, tx, Duration::from_millis(10)).unwrap();

        scheduler.queue_frame(solid_frame(40, 1));
        wait_until(|| scheduler.status().frames_processed == 1);
        scheduler.stop();

        assert!(matches!(rx.try_recv(), Ok(PipelineEvent::DetectionError(_))));
    }
}

//! Owns every long-lived component of the daemon and the operations the
//! control interface exposes on them. All methods block; async callers go
//! through `spawn_blocking`.

use std::io::Cursor;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{Local, NaiveDate};
use image::ImageFormat;
use rollcall_core::{
    AttendanceLog, AttendanceRecord, AttendanceStats, AttendanceStatus, Config, EngineError,
    FaceRegistry, LogError, RecognitionEngine, RegistryError,
};
use rollcall_hw::{open_camera, CameraError, DeviceOpener, FrameSource};
use thiserror::Error;

use crate::attendance::Candidates;
use crate::events::{ChannelSink, EventSender, PipelineEvent};
use crate::lock;
use crate::scheduler::DetectionScheduler;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Camera(#[from] CameraError),
    #[error("no unknown face with hash {0} in this session")]
    UnknownCandidate(String),
    #[error("no unknown face seen in this session")]
    NoCandidate,
    #[error("no known face named {0}")]
    NotFound(String),
    #[error("image encoding failed: {0}")]
    Encode(#[from] image::ImageError),
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),
    #[error(transparent)]
    Log(#[from] LogError),
}

pub struct Pipeline {
    config: Config,
    registry: Arc<Mutex<FaceRegistry>>,
    engine: Arc<Mutex<RecognitionEngine>>,
    scheduler: DetectionScheduler,
    source: Mutex<Option<FrameSource>>,
    opener: Box<DeviceOpener>,
    frame_skip: AtomicU32,
    candidates: Mutex<Candidates>,
    /// Mirrors the engine's session id; batches from older sessions are stale.
    session: AtomicU64,
    attendance_log: AttendanceLog,
    events: EventSender,
}

impl Pipeline {
    /// Push the registry into the engine and start the scheduler. The camera
    /// is started separately.
    pub fn new(
        config: Config,
        registry: FaceRegistry,
        mut engine: RecognitionEngine,
        events: EventSender,
    ) -> Result<Self, PipelineError> {
        engine.update_known_faces(registry.encodings(), registry.names())?;
        let session = AtomicU64::new(engine.session_id());
        let engine = Arc::new(Mutex::new(engine));
        let scheduler = DetectionScheduler::start(
            Arc::clone(&engine),
            config.detection_interval,
            events.clone(),
        )?;

        Ok(Self {
            frame_skip: AtomicU32::new(config.frame_skip.max(1)),
            attendance_log: AttendanceLog::new(&config.attendance_log_path),
            config,
            registry: Arc::new(Mutex::new(registry)),
            engine,
            scheduler,
            source: Mutex::new(None),
            opener: Box::new(open_camera),
            candidates: Mutex::new(Candidates::default()),
            session,
            events,
        })
    }

    #[cfg(test)]
    pub fn with_opener(mut self, opener: Box<DeviceOpener>) -> Self {
        self.opener = opener;
        self
    }

    pub fn scheduler(&self) -> &DetectionScheduler {
        &self.scheduler
    }

    pub fn registry(&self) -> &Mutex<FaceRegistry> {
        &self.registry
    }

    pub fn candidates(&self) -> &Mutex<Candidates> {
        &self.candidates
    }

    pub fn attendance_log(&self) -> &AttendanceLog {
        &self.attendance_log
    }

    /// Id of the current detection session.
    pub fn session_id(&self) -> u64 {
        self.session.load(Ordering::SeqCst)
    }

    /// Start capturing. Starting a running camera is a no-op.
    pub fn start_camera(&self) -> Result<(), PipelineError> {
        let mut source = lock(&self.source);
        if source.as_ref().is_some_and(FrameSource::is_running) {
            return Ok(());
        }

        let sink = ChannelSink::new(self.scheduler.queue(), self.events.clone());
        match FrameSource::start_with(&*self.opener, self.config.camera_index, self.frame_skip(), sink) {
            Ok(started) => {
                *source = Some(started);
                Ok(())
            }
            Err(e) => {
                tracing::error!(index = self.config.camera_index, error = %e, "could not open camera");
                self.emit(PipelineEvent::CameraError(format!("could not open camera: {e}")));
                Err(e.into())
            }
        }
    }

    /// Stop capturing and forget this session's unknown candidates.
    pub fn stop_camera(&self) {
        let stopped = lock(&self.source).take();
        if let Some(mut source) = stopped {
            source.stop();
            self.emit(PipelineEvent::CameraStatus("camera stopped".into()));
        }
        lock(&self.candidates).clear();
    }

    pub fn camera_running(&self) -> bool {
        lock(&self.source)
            .as_ref()
            .is_some_and(FrameSource::is_running)
    }

    pub fn frame_skip(&self) -> u32 {
        self.frame_skip.load(Ordering::Relaxed)
    }

    /// Applies to the running camera and to later starts.
    pub fn set_frame_skip(&self, frame_skip: u32) {
        let frame_skip = frame_skip.max(1);
        self.frame_skip.store(frame_skip, Ordering::Relaxed);
        if let Some(source) = lock(&self.source).as_ref() {
            source.set_frame_skip(frame_skip);
        }
        tracing::info!(frame_skip, "frame skip updated");
    }

    pub fn set_detection_interval(&self, secs: f64) {
        self.scheduler.set_interval(secs);
    }

    /// Start a new session. The id is published before candidates are
    /// cleared, so a stale batch either lands before the clear or is dropped.
    pub fn reset_session(&self) {
        {
            let mut engine = lock(&self.engine);
            engine.reset_session();
            self.session.store(engine.session_id(), Ordering::SeqCst);
        }
        lock(&self.candidates).clear();
    }

    /// Reload the registry from disk and hand it to the engine.
    ///
    /// The registry lock is held until the engine has the new gallery, so
    /// concurrent enrollments install their galleries in registry order.
    pub fn refresh_faces(&self) -> Result<usize, PipelineError> {
        let mut registry = lock(&self.registry);
        registry.refresh();
        let count = registry.len();
        lock(&self.engine).update_known_faces(registry.encodings(), registry.names())?;
        Ok(count)
    }

    pub fn list_faces(&self) -> Vec<String> {
        lock(&self.registry).names()
    }

    /// Enroll the unknown face reported with `hash` under `name`.
    pub fn register_unknown(&self, hash: &str, name: &str) -> Result<PathBuf, PipelineError> {
        let crop = lock(&self.candidates)
            .get(hash)
            .ok_or_else(|| PipelineError::UnknownCandidate(hash.to_string()))?;
        self.register(&crop, hash, name)
    }

    /// Enroll the most recently reported unknown face under `name`.
    pub fn register_latest_unknown(&self, name: &str) -> Result<PathBuf, PipelineError> {
        let (hash, crop) = lock(&self.candidates)
            .latest()
            .ok_or(PipelineError::NoCandidate)?;
        self.register(&crop, hash.as_str(), name)
    }

    fn register(&self, crop: &image::RgbImage, hash: &str, name: &str) -> Result<PathBuf, PipelineError> {
        let path = {
            let mut registry = lock(&self.registry);
            let path = registry.register_face(crop, hash, name)?;
            lock(&self.engine).update_known_faces(registry.encodings(), registry.names())?;
            path
        };
        lock(&self.candidates).remove(hash);

        // The person was in the room; record them as present.
        let record = AttendanceRecord::new(name.trim(), AttendanceStatus::Present, Local::now());
        if let Err(e) = self.attendance_log.append(&[record]) {
            tracing::error!(error = %e, name, "failed to record attendance for registered face");
        }
        Ok(path)
    }

    /// Attendance totals from the log, optionally limited to a date range.
    pub fn attendance_stats(
        &self,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<AttendanceStats, PipelineError> {
        Ok(self.attendance_log.stats(from, to)?)
    }

    /// PNG thumbnail of a known face.
    pub fn thumbnail_png(&self, name: &str) -> Result<Vec<u8>, PipelineError> {
        let thumbnail = lock(&self.registry)
            .thumbnail(name, self.config.thumbnail_size)
            .ok_or_else(|| PipelineError::NotFound(name.to_string()))?;
        let mut png = Vec::new();
        thumbnail.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;
        Ok(png)
    }

    pub fn status(&self) -> serde_json::Value {
        let scheduler = self.scheduler.status();
        let session = lock(&self.engine).session_summary();
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "camera": {
                "running": self.camera_running(),
                "index": self.config.camera_index,
                "frame_skip": self.frame_skip(),
            },
            "known_faces": lock(&self.registry).len(),
            "session": session,
            "scheduler": {
                "interval_secs": scheduler.processing_interval.as_secs_f64(),
                "secs_since_last": scheduler.time_since_last_processing.map(|d| d.as_secs_f64()),
                "secs_until_next": scheduler.time_until_next().as_secs_f64(),
                "has_pending_frame": scheduler.has_pending_frame,
                "frames_processed": scheduler.frames_processed,
            },
            "unknown_candidates": lock(&self.candidates).len(),
            "attendance_log": self.attendance_log.path().display().to_string(),
        })
    }

    /// Stop the camera, then the scheduler. Both threads are joined.
    pub fn shutdown(&self) {
        self.stop_camera();
        self.scheduler.stop();
    }

    fn emit(&self, event: PipelineEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("event consumer gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{solid_frame, solid_image, StillCamera, StubEmbedder};
    use rollcall_core::{DetectionHash, RegistryPaths};
    use rollcall_hw::CaptureDevice;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn pipeline(dir: &TempDir) -> (Pipeline, crate::events::EventReceiver) {
        pipeline_at(dir, 0)
    }

    fn pipeline_at(dir: &TempDir, camera_index: usize) -> (Pipeline, crate::events::EventReceiver) {
        let config = Config {
            camera_index,
            faces_dir: dir.path().join("faces"),
            unknowns_dir: dir.path().join("unknowns"),
            snapshot_path: dir.path().join("encodings.json"),
            attendance_log_path: dir.path().join("attendance.jsonl"),
            detection_interval: 0.5,
            ..Config::default()
        };
        let paths: RegistryPaths = config.registry_paths();
        let registry = FaceRegistry::open(paths, Box::new(StubEmbedder::default())).unwrap();
        let engine = RecognitionEngine::new(Box::new(StubEmbedder::default()), 0.6, 0.0);
        let (tx, rx) = mpsc::unbounded_channel();
        (Pipeline::new(config, registry, engine, tx).unwrap(), rx)
    }

    fn remember(pipeline: &Pipeline, red: u8) -> DetectionHash {
        let hash = DetectionHash::from(format!("{red:0>16}"));
        lock(pipeline.candidates()).insert(hash.clone(), solid_image(red));
        hash
    }

    #[test]
    fn test_register_unknown_updates_engine() {
        let dir = TempDir::new().unwrap();
        let (pipeline, mut rx) = pipeline(&dir);
        let hash = remember(&pipeline, 90);

        pipeline.register_unknown(hash.as_str(), "Dana").unwrap();
        assert_eq!(pipeline.list_faces(), vec!["Dana".to_string()]);
        assert_eq!(lock(pipeline.candidates()).len(), 0);

        pipeline.scheduler().queue_frame(solid_frame(90, 1));
        let event = rx.blocking_recv().unwrap();
        match event {
            PipelineEvent::Detection(batch) => assert_eq!(batch.detections[0].name, "Dana"),
            other => panic!("unexpected event {other:?}"),
        }
        pipeline.shutdown();
    }

    #[test]
    fn test_concurrent_registrations_both_reach_engine() {
        let dir = TempDir::new().unwrap();
        let (pipeline, _rx) = pipeline(&dir);
        let ann = remember(&pipeline, 40);
        let bob = remember(&pipeline, 160);

        std::thread::scope(|scope| {
            // Both registrations queue up behind a recognition pass in flight.
            let busy = lock(&pipeline.engine);
            let first = scope.spawn(|| pipeline.register_unknown(ann.as_str(), "Ann"));
            let second = scope.spawn(|| pipeline.register_unknown(bob.as_str(), "Bob"));
            std::thread::sleep(Duration::from_millis(100));
            drop(busy);
            first.join().unwrap().unwrap();
            second.join().unwrap().unwrap();
        });

        assert_eq!(pipeline.list_faces().len(), 2);
        assert_eq!(lock(&pipeline.engine).known_count(), 2);
        pipeline.shutdown();
    }

    #[test]
    fn test_registration_recorded_as_present() {
        let dir = TempDir::new().unwrap();
        let (pipeline, _rx) = pipeline(&dir);
        let hash = remember(&pipeline, 70);
        pipeline.register_unknown(hash.as_str(), " Kim ").unwrap();

        let rows = pipeline.attendance_log().records().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "Kim");
        assert_eq!(rows[0].status, AttendanceStatus::Present);

        let stats = pipeline.attendance_stats(None, None).unwrap();
        assert_eq!(stats.per_person.get("Kim"), Some(&1));
        pipeline.shutdown();
    }

    #[test]
    fn test_camera_falls_back_to_default_index() {
        let dir = TempDir::new().unwrap();
        let (pipeline, _rx) = pipeline_at(&dir, 4);
        let pipeline = pipeline.with_opener(Box::new(|index: usize| match index {
            0 => Ok(Box::new(StillCamera { index, red: 90 }) as Box<dyn CaptureDevice>),
            _ => Err(CameraError::DeviceNotFound(format!("/dev/video{index}"))),
        }));

        pipeline.start_camera().unwrap();
        assert!(pipeline.camera_running());
        pipeline.stop_camera();
        assert!(!pipeline.camera_running());
        pipeline.shutdown();
    }

    #[test]
    fn test_camera_open_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let (pipeline, mut rx) = pipeline_at(&dir, 3);
        let tried = Arc::new(Mutex::new(Vec::new()));
        let attempts = Arc::clone(&tried);
        let pipeline = pipeline.with_opener(Box::new(move |index: usize| -> Result<Box<dyn CaptureDevice>, CameraError> {
            lock(&attempts).push(index);
            Err(CameraError::DeviceNotFound(format!("/dev/video{index}")))
        }));

        let err = pipeline.start_camera().unwrap_err();
        assert!(matches!(err, PipelineError::Camera(CameraError::DeviceNotFound(_))));
        assert_eq!(*lock(&tried), vec![3, 0]);
        assert!(!pipeline.camera_running());
        match rx.try_recv() {
            Ok(PipelineEvent::CameraError(message)) => assert!(message.contains("/dev/video0"), "{message}"),
            other => panic!("unexpected event {other:?}"),
        }
        pipeline.shutdown();
    }

    #[test]
    fn test_register_latest_unknown() {
        let dir = TempDir::new().unwrap();
        let (pipeline, _rx) = pipeline(&dir);
        assert!(matches!(
            pipeline.register_latest_unknown("Eli"),
            Err(PipelineError::NoCandidate)
        ));

        remember(&pipeline, 30);
        remember(&pipeline, 60);
        pipeline.register_latest_unknown("Eli").unwrap();
        assert_eq!(lock(pipeline.candidates()).len(), 1);
        pipeline.shutdown();
    }

    #[test]
    fn test_register_unknown_missing_hash() {
        let dir = TempDir::new().unwrap();
        let (pipeline, _rx) = pipeline(&dir);
        assert!(matches!(
            pipeline.register_unknown("deadbeef", "Fay"),
            Err(PipelineError::UnknownCandidate(_))
        ));
        pipeline.shutdown();
    }

    #[test]
    fn test_duplicate_registration_keeps_candidate() {
        let dir = TempDir::new().unwrap();
        let (pipeline, _rx) = pipeline(&dir);
        let first = remember(&pipeline, 30);
        let second = remember(&pipeline, 200);
        pipeline.register_unknown(first.as_str(), "Gus").unwrap();

        let err = pipeline.register_unknown(second.as_str(), "Gus").unwrap_err();
        assert!(matches!(err, PipelineError::Registry(RegistryError::DuplicateName(_))));
        assert_eq!(lock(pipeline.candidates()).len(), 1);
        assert_eq!(pipeline.list_faces().len(), 1);
        pipeline.shutdown();
    }

    #[test]
    fn test_refresh_and_thumbnail() {
        let dir = TempDir::new().unwrap();
        let (pipeline, _rx) = pipeline(&dir);
        let hash = remember(&pipeline, 120);
        pipeline.register_unknown(hash.as_str(), "Hal").unwrap();

        assert_eq!(pipeline.refresh_faces().unwrap(), 1);
        let png = pipeline.thumbnail_png("Hal").unwrap();
        let decoded = image::load_from_memory_with_format(&png, ImageFormat::Png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (80, 80));
        assert!(matches!(pipeline.thumbnail_png("nobody"), Err(PipelineError::NotFound(_))));
        pipeline.shutdown();
    }

    #[test]
    fn test_reset_clears_candidates_and_session() {
        let dir = TempDir::new().unwrap();
        let (pipeline, mut rx) = pipeline(&dir);
        pipeline.scheduler().queue_frame(solid_frame(50, 1));
        assert!(matches!(rx.blocking_recv(), Some(PipelineEvent::Detection(_))));
        remember(&pipeline, 50);

        pipeline.reset_session();
        assert_eq!(lock(pipeline.candidates()).len(), 0);
        assert_eq!(pipeline.status()["session"]["total_detections"], 0);
        pipeline.shutdown();
    }

    #[test]
    fn test_status_and_settings() {
        let dir = TempDir::new().unwrap();
        let (pipeline, _rx) = pipeline(&dir);
        pipeline.set_frame_skip(0);
        pipeline.set_detection_interval(2.0);

        let status = pipeline.status();
        assert_eq!(status["camera"]["running"], false);
        assert_eq!(status["camera"]["frame_skip"], 1);
        assert_eq!(status["scheduler"]["interval_secs"], 2.0);
        assert_eq!(status["known_faces"], 0);
        assert_eq!(
            pipeline.scheduler().interval(),
            Duration::from_secs(2)
        );
        pipeline.shutdown();
    }
}

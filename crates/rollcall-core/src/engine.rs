//! Recognition engine: one scheduled frame in, new detections out.

use chrono::Local;
use image::imageops::{self, FilterType};
use image::RgbImage;
use thiserror::Error;

use crate::embedder::{EmbedError, FaceEmbedder};
use crate::fingerprint::{DetectionHash, UNKNOWN_LABEL};
use crate::session::{SessionState, SessionSummary};
use crate::types::{
    AttendanceStatus, BoundingBox, DetectionBatch, DetectionEvent, DetectionKind, Embedding,
    EuclideanMatcher, GalleryEntry, Matcher,
};

/// Linear downscale applied before face location.
pub const LOCATE_SCALE: u32 = 4;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("face location failed: {0}")]
    Locate(#[source] EmbedError),
    #[error("frame too small to process: {0}x{1}")]
    FrameTooSmall(u32, u32),
    #[error("gallery mismatch: {encodings} encodings for {names} names")]
    GalleryMismatch { encodings: usize, names: usize },
}

#[derive(Debug, Error)]
enum FaceError {
    #[error("face box lies outside the frame")]
    OutOfFrame,
    #[error(transparent)]
    Embed(#[from] EmbedError),
}

pub struct RecognitionEngine {
    embedder: Box<dyn FaceEmbedder>,
    matcher: EuclideanMatcher,
    gallery: Vec<GalleryEntry>,
    threshold: f32,
    session: SessionState,
    generation: u64,
}

impl RecognitionEngine {
    pub fn new(embedder: Box<dyn FaceEmbedder>, threshold: f32, unknown_tolerance: f32) -> Self {
        Self {
            embedder,
            matcher: EuclideanMatcher,
            gallery: Vec::new(),
            threshold,
            session: SessionState::new(unknown_tolerance),
            generation: 0,
        }
    }

    /// Replace the matching set. Applies to every frame processed afterwards.
    pub fn update_known_faces(
        &mut self,
        encodings: Vec<Embedding>,
        names: Vec<String>,
    ) -> Result<(), EngineError> {
        if encodings.len() != names.len() {
            return Err(EngineError::GalleryMismatch {
                encodings: encodings.len(),
                names: names.len(),
            });
        }
        self.gallery = names
            .into_iter()
            .zip(encodings)
            .map(|(name, embedding)| GalleryEntry { name, embedding })
            .collect();
        tracing::info!(known = self.gallery.len(), "updated known faces");
        Ok(())
    }

    pub fn known_count(&self) -> usize {
        self.gallery.len()
    }

    pub fn reset_session(&mut self) {
        self.session.reset();
        self.generation += 1;
        tracing::info!(session = self.generation, "detection session reset");
    }

    /// Incremented by every reset; stamped on each batch.
    pub fn session_id(&self) -> u64 {
        self.generation
    }

    pub fn session_summary(&self) -> SessionSummary {
        self.session.summary()
    }

    /// Locate, embed, classify and deduplicate every face in `frame`.
    ///
    /// Returns `None` when no face produced a new detection. A failure of a
    /// single face is logged and that face skipped; a failure to locate faces
    /// fails the whole frame.
    pub fn process_frame(&mut self, frame: &RgbImage) -> Result<Option<DetectionBatch>, EngineError> {
        let (width, height) = frame.dimensions();
        if width < LOCATE_SCALE || height < LOCATE_SCALE {
            return Err(EngineError::FrameTooSmall(width, height));
        }

        let small = imageops::resize(
            frame,
            width / LOCATE_SCALE,
            height / LOCATE_SCALE,
            FilterType::Triangle,
        );
        let faces: Vec<BoundingBox> = self
            .embedder
            .locate(&small)
            .map_err(EngineError::Locate)?
            .iter()
            .map(|face| face.scaled(LOCATE_SCALE as f32))
            .collect();

        let total_faces = faces.len();
        let mut detections = Vec::new();
        for face in &faces {
            match self.process_face(frame, face) {
                Ok(Some(detection)) => detections.push(detection),
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "skipping face"),
            }
        }

        tracing::debug!(total_faces, new = detections.len(), "frame processed");

        if detections.is_empty() {
            return Ok(None);
        }
        Ok(Some(DetectionBatch {
            session: self.generation,
            timestamp: Local::now(),
            detections,
            total_faces,
        }))
    }

    fn process_face(
        &mut self,
        frame: &RgbImage,
        face: &BoundingBox,
    ) -> Result<Option<DetectionEvent>, FaceError> {
        let (x, y, w, h) = face
            .clip_to(frame.width(), frame.height())
            .ok_or(FaceError::OutOfFrame)?;
        let embedding = self.embedder.embed(frame, face)?;
        let face_crop = imageops::crop_imm(frame, x, y, w, h).to_image();

        let matched = if self.gallery.is_empty() {
            None
        } else {
            self.matcher
                .compare(&embedding, &self.gallery, self.threshold)
                .name
        };

        let (kind, name, status) = match matched {
            Some(name) => (DetectionKind::Known, name, AttendanceStatus::Present),
            None => (
                DetectionKind::Unknown,
                UNKNOWN_LABEL.to_string(),
                AttendanceStatus::Unknown,
            ),
        };

        let detection_hash = DetectionHash::compute(&name, &embedding);
        let is_new = match kind {
            DetectionKind::Known => self.session.mark_known(&name),
            DetectionKind::Unknown => self.session.mark_unknown(&detection_hash, &embedding),
        };
        if !is_new {
            return Ok(None);
        }

        Ok(Some(DetectionEvent {
            kind,
            name,
            face_crop,
            bounding_box: face.clone(),
            detection_hash,
            status,
            timestamp: Local::now(),
        }))
    }
}

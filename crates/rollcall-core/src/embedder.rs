//! The face-embedding capability used by the engine and the registry.
//!
//! Everything above this module treats embedding as opaque: locate faces in
//! an image, then turn one located face into a fixed-length vector.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{BoundingBox, Embedding};
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("{0}")]
    Backend(String),
}

pub trait FaceEmbedder: Send {
    /// Locate all faces in `image`, best first.
    fn locate(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, EmbedError>;

    /// Embed one located face. `image` must be the image `face` refers to.
    fn embed(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Embedding, EmbedError>;

    /// Embedding of the best face in `image`, or `None` if no face is found.
    fn embed_first(&mut self, image: &RgbImage) -> Result<Option<Embedding>, EmbedError> {
        let faces = self.locate(image)?;
        match faces.first() {
            Some(face) => self.embed(image, face).map(Some),
            None => Ok(None),
        }
    }
}

/// SCRFD detection + ArcFace recognition.
pub struct OnnxEmbedder {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxEmbedder {
    pub fn load(scrfd_path: &str, arcface_path: &str) -> Result<Self, EmbedError> {
        let detector = FaceDetector::load(scrfd_path)?;
        tracing::info!(path = scrfd_path, "SCRFD detector loaded");

        let recognizer = FaceRecognizer::load(arcface_path)?;
        tracing::info!(path = arcface_path, "ArcFace recognizer loaded");

        Ok(Self {
            detector,
            recognizer,
        })
    }
}

impl FaceEmbedder for OnnxEmbedder {
    fn locate(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, EmbedError> {
        Ok(self.detector.detect(image)?)
    }

    fn embed(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Embedding, EmbedError> {
        Ok(self.recognizer.extract(image, face)?)
    }
}

/// Deterministic embedder for tests: one face covering the whole image,
/// embedded as its mean RGB colour scaled to [0, 1]. All-black images have
/// no face.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    #[derive(Default, Clone)]
    pub struct MeanColorEmbedder {
        /// Instants at which `locate` was called.
        pub calls: Arc<Mutex<Vec<Instant>>>,
        pub fail_locate: bool,
    }

    impl FaceEmbedder for MeanColorEmbedder {
        fn locate(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, EmbedError> {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(Instant::now());
            }
            if self.fail_locate {
                return Err(EmbedError::Backend("locate failed".into()));
            }
            if image.pixels().all(|p| p.0 == [0, 0, 0]) {
                return Ok(Vec::new());
            }
            Ok(vec![BoundingBox {
                x: 0.0,
                y: 0.0,
                width: image.width() as f32,
                height: image.height() as f32,
                confidence: 1.0,
                landmarks: None,
            }])
        }

        fn embed(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Embedding, EmbedError> {
            let (x, y, w, h) = face
                .clip_to(image.width(), image.height())
                .ok_or_else(|| EmbedError::Backend("face outside image".into()))?;
            let mut sums = [0f64; 3];
            for yy in y..y + h {
                for xx in x..x + w {
                    let p = image.get_pixel(xx, yy).0;
                    for c in 0..3 {
                        sums[c] += p[c] as f64;
                    }
                }
            }
            let n = (w as f64) * (h as f64) * 255.0;
            Ok(Embedding::new(sums.iter().map(|s| (s / n) as f32).collect()))
        }
    }
}

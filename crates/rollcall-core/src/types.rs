use chrono::{DateTime, Local};
use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::fingerprint::DetectionHash;

/// Euclidean distance below which a sample is considered a known face.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Scale coordinates and landmarks by a linear factor.
    ///
    /// Used to map boxes found on a downscaled frame back onto the original.
    pub fn scaled(&self, factor: f32) -> Self {
        Self {
            x: self.x * factor,
            y: self.y * factor,
            width: self.width * factor,
            height: self.height * factor,
            confidence: self.confidence,
            landmarks: self
                .landmarks
                .map(|lms| lms.map(|(lx, ly)| (lx * factor, ly * factor))),
        }
    }

    /// Integer pixel rectangle `(x, y, width, height)` clipped to an image of
    /// the given size. `None` when nothing of the box lies inside the image.
    pub fn clip_to(&self, image_width: u32, image_height: u32) -> Option<(u32, u32, u32, u32)> {
        let left = self.x.floor().max(0.0) as u32;
        let top = self.y.floor().max(0.0) as u32;
        let right = ((self.x + self.width).ceil().max(0.0) as u32).min(image_width);
        let bottom = ((self.y + self.height).ceil().max(0.0) as u32).min(image_height);

        if left >= right || top >= bottom {
            return None;
        }
        Some((left, top, right - left, bottom - top))
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Raw little-endian bytes of the vector, in order.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }
}

/// A known identity held by the face registry.
#[derive(Debug, Clone)]
pub struct KnownFace {
    pub name: String,
    pub embedding: Embedding,
    /// Image the identity was loaded or enrolled from, kept for thumbnails.
    /// Snapshot entries without a matching file in the faces directory have none.
    pub source_image: Option<RgbImage>,
}

/// Matching-only view of a known identity, as held by the recognition engine.
#[derive(Debug, Clone, PartialEq)]
pub struct GalleryEntry {
    pub name: String,
    pub embedding: Embedding,
}

/// Result of matching a sample embedding against a gallery.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub matched: bool,
    /// Euclidean distance to the nearest gallery entry (infinite for an empty gallery).
    pub distance: f32,
    /// Name of the matched entry (if any).
    pub name: Option<String>,
}

/// Strategy for comparing a sample embedding against a gallery of known faces.
pub trait Matcher {
    fn compare(&self, sample: &Embedding, gallery: &[GalleryEntry], threshold: f32) -> MatchResult;
}

/// Nearest-neighbour matcher over Euclidean distance.
///
/// The first entry wins on equal distances. A match requires the minimum
/// distance to be strictly below the threshold.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, sample: &Embedding, gallery: &[GalleryEntry], threshold: f32) -> MatchResult {
        let mut best_dist = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, entry) in gallery.iter().enumerate() {
            let dist = sample.euclidean_distance(&entry.embedding);
            if dist < best_dist {
                best_dist = dist;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if best_dist < threshold => MatchResult {
                matched: true,
                distance: best_dist,
                name: Some(gallery[idx].name.clone()),
            },
            _ => MatchResult {
                matched: false,
                distance: best_dist,
                name: None,
            },
        }
    }
}

/// Classification outcome of a single detected face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionKind {
    Known,
    Unknown,
}

/// Attendance status recorded for a detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttendanceStatus {
    Present,
    Unknown,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "Present",
            AttendanceStatus::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A face reported for the first time in the current session.
#[derive(Debug, Clone)]
pub struct DetectionEvent {
    pub kind: DetectionKind,
    /// Matched name, or "Unknown".
    pub name: String,
    /// Face region cut from the full-resolution frame.
    pub face_crop: RgbImage,
    pub bounding_box: BoundingBox,
    pub detection_hash: DetectionHash,
    pub status: AttendanceStatus,
    pub timestamp: DateTime<Local>,
}

/// All new detections from one processed frame.
#[derive(Debug, Clone)]
pub struct DetectionBatch {
    /// Session the batch was produced in; see `RecognitionEngine::session_id`.
    pub session: u64,
    pub timestamp: DateTime<Local>,
    pub detections: Vec<DetectionEvent>,
    /// Number of faces located in the frame, including deduplicated ones.
    pub total_faces: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, values: Vec<f32>) -> GalleryEntry {
        GalleryEntry {
            name: name.into(),
            embedding: Embedding::new(values),
        }
    }

    #[test]
    fn test_euclidean_distance() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_matcher_picks_nearest_below_threshold() {
        let sample = Embedding::new(vec![0.4, 0.0]);
        let gallery = vec![
            entry("alice", vec![2.0, 0.0]),
            entry("bob", vec![0.0, 0.0]),
        ];

        let result = EuclideanMatcher.compare(&sample, &gallery, DEFAULT_MATCH_THRESHOLD);
        assert!(result.matched);
        assert_eq!(result.name.as_deref(), Some("bob"));
        assert!((result.distance - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_matcher_threshold_is_strict() {
        let sample = Embedding::new(vec![0.5, 0.0]);
        let gallery = vec![entry("bob", vec![0.0, 0.0])];

        let result = EuclideanMatcher.compare(&sample, &gallery, 0.5);
        assert!(!result.matched);
        assert!(result.name.is_none());
    }

    #[test]
    fn test_matcher_first_entry_wins_ties() {
        let sample = Embedding::new(vec![0.0, 0.0]);
        let gallery = vec![entry("first", vec![0.1, 0.0]), entry("second", vec![0.0, 0.1])];

        let result = EuclideanMatcher.compare(&sample, &gallery, DEFAULT_MATCH_THRESHOLD);
        assert_eq!(result.name.as_deref(), Some("first"));
    }

    #[test]
    fn test_matcher_empty_gallery() {
        let sample = Embedding::new(vec![1.0, 0.0]);
        let result = EuclideanMatcher.compare(&sample, &[], DEFAULT_MATCH_THRESHOLD);
        assert!(!result.matched);
        assert!(result.distance.is_infinite());
    }

    #[test]
    fn test_bbox_scaled_includes_landmarks() {
        let bbox = BoundingBox {
            x: 10.0,
            y: 20.0,
            width: 5.0,
            height: 6.0,
            confidence: 0.9,
            landmarks: Some([(1.0, 2.0); 5]),
        };
        let up = bbox.scaled(4.0);
        assert_eq!((up.x, up.y, up.width, up.height), (40.0, 80.0, 20.0, 24.0));
        assert_eq!(up.landmarks, Some([(4.0, 8.0); 5]));
        assert_eq!(up.confidence, 0.9);
    }

    #[test]
    fn test_bbox_clip_to_image() {
        let bbox = BoundingBox {
            x: -5.0,
            y: 90.0,
            width: 20.0,
            height: 20.0,
            confidence: 1.0,
            landmarks: None,
        };
        assert_eq!(bbox.clip_to(100, 100), Some((0, 90, 15, 10)));
    }

    #[test]
    fn test_bbox_clip_outside_image() {
        let bbox = BoundingBox {
            x: 150.0,
            y: 0.0,
            width: 20.0,
            height: 20.0,
            confidence: 1.0,
            landmarks: None,
        };
        assert_eq!(bbox.clip_to(100, 100), None);
    }
}

//! rollcall-core — Face recognition for attendance tracking.
//!
//! SCRFD locates faces and ArcFace embeds them, both via ONNX Runtime on the
//! CPU. On top of that sit the known-face registry, per-session dedup and the
//! recognition engine that turns a frame into attendance detections.

pub mod alignment;
pub mod attendance_log;
pub mod config;
pub mod detector;
pub mod embedder;
pub mod engine;
pub mod fingerprint;
pub mod recognizer;
pub mod registry;
pub mod session;
pub mod types;

pub use attendance_log::{AttendanceLog, AttendanceRecord, AttendanceStats, LogError};
pub use config::{Config, ConfigError};
pub use embedder::{EmbedError, FaceEmbedder, OnnxEmbedder};
pub use engine::{EngineError, RecognitionEngine};
pub use fingerprint::DetectionHash;
pub use registry::{FaceRegistry, RegistryError, RegistryPaths};
pub use session::SessionSummary;
pub use types::{
    AttendanceStatus, BoundingBox, DetectionBatch, DetectionEvent, DetectionKind, Embedding,
    KnownFace,
};

//! Known-face registry backed by an image directory and a JSON snapshot.
//!
//! The directory holds one image per identity (`<name>.<ext>` or
//! `<name>_<YYYYMMDD_HHMMSS>.<ext>`). The snapshot holds every enrolled
//! embedding and wins over scanned entries with the same name.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use image::imageops::{self, FilterType};
use image::{ImageReader, RgbImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::embedder::{EmbedError, FaceEmbedder};
use crate::fingerprint::DetectionHash;
use crate::types::{Embedding, KnownFace};

pub const SUPPORTED_EXTENSIONS: [&str; 8] =
    ["jpg", "jpeg", "png", "bmp", "gif", "webp", "tiff", "tif"];

const FILE_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("invalid name: {0:?}")]
    InvalidName(String),
    #[error("name may not contain {1:?}: {0:?}")]
    ReservedCharacter(String, char),
    #[error("name already registered: {0}")]
    DuplicateName(String),
    #[error("no face found in image")]
    NoFaceFound,
    #[error("embedding failed: {0}")]
    Embed(#[from] EmbedError),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),
}

/// On-disk locations used by the registry.
#[derive(Debug, Clone)]
pub struct RegistryPaths {
    pub faces_dir: PathBuf,
    pub unknowns_dir: PathBuf,
    pub snapshot_path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    encodings: Vec<Vec<f32>>,
    names: Vec<String>,
    timestamp: String,
}

pub struct FaceRegistry {
    paths: RegistryPaths,
    embedder: Box<dyn FaceEmbedder>,
    faces: Vec<KnownFace>,
}

impl FaceRegistry {
    /// Create the directories if needed and load all known faces.
    pub fn open(paths: RegistryPaths, embedder: Box<dyn FaceEmbedder>) -> Result<Self, RegistryError> {
        fs::create_dir_all(&paths.faces_dir)?;
        fs::create_dir_all(&paths.unknowns_dir)?;

        let mut registry = Self {
            paths,
            embedder,
            faces: Vec::new(),
        };
        registry.load();
        Ok(registry)
    }

    /// Scan the faces directory, then merge in the snapshot.
    ///
    /// Per-file failures are logged and skipped; a missing or unreadable
    /// snapshot leaves only the scanned entries.
    pub fn load(&mut self) {
        let (mut faces, images) = self.scan_directory();
        let scanned = faces.len();
        faces.extend(self.load_snapshot(&images));
        self.faces = dedup_last_wins(faces);

        tracing::info!(
            scanned,
            total = self.faces.len(),
            dir = %self.paths.faces_dir.display(),
            "known faces loaded"
        );
    }

    /// Drop everything in memory and load again from disk.
    pub fn refresh(&mut self) {
        self.faces.clear();
        self.load();
    }

    /// Enroll `image` under `name`.
    ///
    /// Returns the path the image was saved to. A failed snapshot write is
    /// logged and does not undo the in-memory enrollment.
    pub fn register_face(
        &mut self,
        image: &RgbImage,
        existing_hash: &str,
        name: &str,
    ) -> Result<PathBuf, RegistryError> {
        let name = validate_name(name)?;
        if self.contains(name) {
            tracing::warn!(name, "name already exists, refusing duplicate registration");
            return Err(RegistryError::DuplicateName(name.to_string()));
        }

        let embedding = self
            .embedder
            .embed_first(image)?
            .ok_or(RegistryError::NoFaceFound)?;

        let filename = format!("{name}_{}.jpg", Local::now().format(FILE_TIMESTAMP_FORMAT));
        let image_path = self.paths.faces_dir.join(&filename);
        image.save(&image_path)?;

        self.faces.push(KnownFace {
            name: name.to_string(),
            embedding,
            source_image: Some(image.clone()),
        });

        if let Err(e) = self.write_snapshot() {
            tracing::error!(
                error = %e,
                path = %self.paths.snapshot_path.display(),
                "failed to persist encodings; enrollment kept for this run"
            );
        }

        tracing::info!(name, hash = existing_hash, file = %filename, "registered face");
        Ok(image_path)
    }

    /// Save an unknown face crop as `unknown_<timestamp>_<hash8>.jpg`.
    pub fn save_unknown_face(&self, crop: &RgbImage, hash: &DetectionHash) -> Result<PathBuf, RegistryError> {
        let filename = format!(
            "unknown_{}_{}.jpg",
            Local::now().format(FILE_TIMESTAMP_FORMAT),
            hash.short()
        );
        let path = self.paths.unknowns_dir.join(&filename);
        crop.save(&path)?;
        tracing::info!(file = %filename, "saved unknown face");
        Ok(path)
    }

    pub fn encodings(&self) -> Vec<Embedding> {
        self.faces.iter().map(|f| f.embedding.clone()).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.faces.iter().map(|f| f.name.clone()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.faces.iter().any(|f| f.name == name)
    }

    pub fn len(&self) -> usize {
        self.faces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    /// Square thumbnail of an identity's source image.
    pub fn thumbnail(&self, name: &str, size: u32) -> Option<RgbImage> {
        let face = self.faces.iter().find(|f| f.name == name)?;
        let source = face.source_image.as_ref()?;
        let size = size.max(1);
        Some(imageops::resize(source, size, size, FilterType::Triangle))
    }

    pub fn paths(&self) -> &RegistryPaths {
        &self.paths
    }

    /// Embed every image in the faces directory. Also returns the first
    /// decodable image per name, whether or not a face was found in it.
    fn scan_directory(&mut self) -> (Vec<KnownFace>, HashMap<String, RgbImage>) {
        let mut files = match list_files(&self.paths.faces_dir) {
            Ok(files) => files,
            Err(e) => {
                tracing::warn!(error = %e, dir = %self.paths.faces_dir.display(), "cannot read faces directory");
                return (Vec::new(), HashMap::new());
            }
        };
        files.sort();

        let mut faces = Vec::new();
        let mut images = HashMap::new();
        for path in files {
            if !is_supported_image(&path) {
                tracing::warn!(file = %path.display(), "skipping unsupported format");
                continue;
            }
            let Some(name) = name_from_path(&path) else {
                continue;
            };

            let image = match decode_image(&path) {
                Ok(image) => image,
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "failed to decode image");
                    continue;
                }
            };

            match self.embedder.embed_first(&image) {
                Ok(Some(embedding)) => {
                    tracing::info!(file = %path.display(), name = %name, "loaded face");
                    faces.push(KnownFace {
                        name: name.clone(),
                        embedding,
                        source_image: Some(image.clone()),
                    });
                }
                Ok(None) => tracing::warn!(file = %path.display(), "no face found"),
                Err(e) => tracing::warn!(file = %path.display(), error = %e, "failed to embed face"),
            }
            images.entry(name).or_insert(image);
        }
        (faces, images)
    }

    /// Snapshot entries, paired with a scanned image of the same name.
    fn load_snapshot(&self, images: &HashMap<String, RgbImage>) -> Vec<KnownFace> {
        let path = &self.paths.snapshot_path;
        if !path.exists() {
            return Vec::new();
        }

        let snapshot: Snapshot = match fs::read(path)
            .map_err(RegistryError::from)
            .and_then(|bytes| Ok(serde_json::from_slice(&bytes)?))
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to load persisted encodings");
                return Vec::new();
            }
        };

        if snapshot.encodings.len() != snapshot.names.len() {
            tracing::warn!(
                encodings = snapshot.encodings.len(),
                names = snapshot.names.len(),
                "snapshot lengths differ; extra entries ignored"
            );
        }
        tracing::info!(count = snapshot.names.len(), saved_at = %snapshot.timestamp, "loaded persisted encodings");

        snapshot
            .names
            .into_iter()
            .zip(snapshot.encodings)
            .map(|(name, values)| {
                let source_image = images.get(&name).cloned();
                KnownFace {
                    name,
                    embedding: Embedding::new(values),
                    source_image,
                }
            })
            .collect()
    }

    fn write_snapshot(&self) -> Result<(), RegistryError> {
        let snapshot = Snapshot {
            encodings: self.faces.iter().map(|f| f.embedding.values.clone()).collect(),
            names: self.names(),
            timestamp: Local::now().to_rfc3339(),
        };
        let json = serde_json::to_vec_pretty(&snapshot)?;

        let path = &self.paths.snapshot_path;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;

        tracing::info!(count = snapshot.names.len(), "saved encodings to persistent storage");
        Ok(())
    }
}

/// Keep one entry per name, preferring the one loaded last, preserving the
/// relative order of the survivors.
fn dedup_last_wins(faces: Vec<KnownFace>) -> Vec<KnownFace> {
    let mut seen = HashSet::new();
    let mut kept: Vec<KnownFace> = faces
        .into_iter()
        .rev()
        .filter(|f| seen.insert(f.name.clone()))
        .collect();
    kept.reverse();
    kept
}

/// Characters that cannot round-trip through `<name>_<timestamp>.jpg`.
const RESERVED_NAME_CHARS: [char; 3] = ['_', '/', '\\'];

/// Trimmed name, rejected if empty or not representable in the file naming scheme.
fn validate_name(name: &str) -> Result<&str, RegistryError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(RegistryError::InvalidName(name.to_string()));
    }
    if let Some(reserved) = trimmed.chars().find(|c| RESERVED_NAME_CHARS.contains(c)) {
        return Err(RegistryError::ReservedCharacter(trimmed.to_string(), reserved));
    }
    Ok(trimmed)
}

/// Identity name from a file path: the stem up to the first `_`.
fn name_from_path(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let name = stem.split('_').next().unwrap_or(stem);
    (!name.is_empty()).then(|| name.to_string())
}

fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| SUPPORTED_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn list_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    Ok(files)
}

/// Decode by extension, falling back to content sniffing, normalized to RGB8.
fn decode_image(path: &Path) -> Result<RgbImage, image::ImageError> {
    let decoded = match image::open(path) {
        Ok(image) => image,
        Err(primary) => {
            tracing::debug!(file = %path.display(), error = %primary, "decode by extension failed, sniffing content");
            ImageReader::open(path)?.with_guessed_format()?.decode()?
        }
    };
    Ok(decoded.to_rgb8())
}

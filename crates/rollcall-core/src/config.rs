use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry::RegistryPaths;
use crate::types::DEFAULT_MATCH_THRESHOLD;

/// Shortest allowed gap between two processed frames, in seconds.
pub const MIN_DETECTION_INTERVAL: f64 = 0.5;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Pipeline configuration.
///
/// Layered as defaults, then an optional TOML file, then `ROLLCALL_*`
/// environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device index (`/dev/videoN`).
    pub camera_index: usize,
    /// Forward one of every N captured frames.
    pub frame_skip: u32,
    /// Seconds between processed frames.
    pub detection_interval: f64,
    /// Edge length of registry thumbnails, in pixels.
    pub thumbnail_size: u32,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    pub faces_dir: PathBuf,
    pub unknowns_dir: PathBuf,
    /// JSON file holding enrolled encodings.
    pub snapshot_path: PathBuf,
    /// Append-only attendance record (JSON lines).
    pub attendance_log_path: PathBuf,
    /// Euclidean distance below which a face matches.
    pub match_threshold: f32,
    /// Distance within which two unknowns count as the same person.
    /// Zero means exact hash equality only.
    pub unknown_dedup_distance: f32,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            camera_index: 0,
            frame_skip: 1,
            detection_interval: 1.5,
            thumbnail_size: 80,
            model_dir: default_model_dir(),
            faces_dir: data_dir.join("faces"),
            unknowns_dir: data_dir.join("unknown_faces"),
            snapshot_path: data_dir.join("encodings.json"),
            attendance_log_path: data_dir.join("attendance.jsonl"),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            unknown_dedup_distance: 0.0,
        }
    }
}

impl Config {
    /// Load the full layered configuration for this process.
    ///
    /// A missing config file is not an error; an unreadable or malformed
    /// one is.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("ROLLCALL_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_config_path());

        let mut config = if path.exists() {
            tracing::info!(path = %path.display(), "loading config file");
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config.normalized())
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Override fields from `ROLLCALL_*` variables. Unparseable values are
    /// logged and ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        override_parsed(&lookup, "ROLLCALL_CAMERA_INDEX", &mut self.camera_index);
        override_parsed(&lookup, "ROLLCALL_FRAME_SKIP", &mut self.frame_skip);
        override_parsed(&lookup, "ROLLCALL_DETECTION_INTERVAL", &mut self.detection_interval);
        override_parsed(&lookup, "ROLLCALL_THUMBNAIL_SIZE", &mut self.thumbnail_size);
        override_parsed(&lookup, "ROLLCALL_MATCH_THRESHOLD", &mut self.match_threshold);
        override_parsed(
            &lookup,
            "ROLLCALL_UNKNOWN_DEDUP_DISTANCE",
            &mut self.unknown_dedup_distance,
        );
        override_path(&lookup, "ROLLCALL_MODEL_DIR", &mut self.model_dir);
        override_path(&lookup, "ROLLCALL_FACES_DIR", &mut self.faces_dir);
        override_path(&lookup, "ROLLCALL_UNKNOWNS_DIR", &mut self.unknowns_dir);
        override_path(&lookup, "ROLLCALL_SNAPSHOT_PATH", &mut self.snapshot_path);
        override_path(&lookup, "ROLLCALL_ATTENDANCE_LOG", &mut self.attendance_log_path);
    }

    /// Clamp values into their valid ranges.
    pub fn normalized(mut self) -> Self {
        self.frame_skip = self.frame_skip.max(1);
        self.detection_interval = self.detection_interval.max(MIN_DETECTION_INTERVAL);
        self.thumbnail_size = self.thumbnail_size.max(1);
        self.unknown_dedup_distance = self.unknown_dedup_distance.max(0.0);
        self
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join("w600k_r50.onnx")
            .to_string_lossy()
            .into_owned()
    }

    pub fn registry_paths(&self) -> RegistryPaths {
        RegistryPaths {
            faces_dir: self.faces_dir.clone(),
            unknowns_dir: self.unknowns_dir.clone(),
            snapshot_path: self.snapshot_path.clone(),
        }
    }
}

/// `$XDG_DATA_HOME/rollcall`, falling back to `~/.local/share/rollcall`.
pub fn default_data_dir() -> PathBuf {
    xdg_dir("XDG_DATA_HOME", ".local/share").join("rollcall")
}

pub fn default_model_dir() -> PathBuf {
    default_data_dir().join("models")
}

pub fn default_config_path() -> PathBuf {
    xdg_dir("XDG_CONFIG_HOME", ".config")
        .join("rollcall")
        .join("config.toml")
}

fn xdg_dir(var: &str, home_relative: &str) -> PathBuf {
    std::env::var(var).map(PathBuf::from).unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        PathBuf::from(home).join(home_relative)
    })
}

fn override_parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    field: &mut T,
) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *field = value,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable override"),
    }
}

fn override_path(lookup: &impl Fn(&str) -> Option<String>, key: &str, field: &mut PathBuf) {
    if let Some(raw) = lookup(key).filter(|v| !v.is_empty()) {
        *field = PathBuf::from(raw);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.camera_index, 0);
        assert_eq!(config.frame_skip, 1);
        assert_eq!(config.detection_interval, 1.5);
        assert_eq!(config.thumbnail_size, 80);
        assert_eq!(config.match_threshold, 0.6);
        assert_eq!(config.unknown_dedup_distance, 0.0);
        assert!(config.snapshot_path.ends_with("encodings.json"));
        assert!(config.attendance_log_path.ends_with("attendance.jsonl"));
        assert!(config.scrfd_model_path().ends_with("det_10g.onnx"));
        assert!(config.arcface_model_path().ends_with("w600k_r50.onnx"));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "camera_index = 2\ndetection_interval = 3.0\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.camera_index, 2);
        assert_eq!(config.detection_interval, 3.0);
        assert_eq!(config.frame_skip, 1);
        assert_eq!(config.thumbnail_size, 80);
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "camera_index = \"two\"").unwrap();
        assert!(matches!(Config::from_file(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_env(env(&[
            ("ROLLCALL_FRAME_SKIP", "3"),
            ("ROLLCALL_MATCH_THRESHOLD", " 0.5 "),
            ("ROLLCALL_FACES_DIR", "/srv/faces"),
            ("ROLLCALL_CAMERA_INDEX", "not-a-number"),
        ]));
        assert_eq!(config.frame_skip, 3);
        assert_eq!(config.match_threshold, 0.5);
        assert_eq!(config.faces_dir, PathBuf::from("/srv/faces"));
        assert_eq!(config.camera_index, 0);
    }

    #[test]
    fn test_normalized_clamps() {
        let config = Config {
            frame_skip: 0,
            detection_interval: 0.1,
            unknown_dedup_distance: -1.0,
            ..Config::default()
        }
        .normalized();
        assert_eq!(config.frame_skip, 1);
        assert_eq!(config.detection_interval, MIN_DETECTION_INTERVAL);
        assert_eq!(config.unknown_dedup_distance, 0.0);
    }
}

//! Content fingerprints used as session deduplication keys.
//!
//! A [`DetectionHash`] is SHA-256 over `"<name>_"` followed by the raw
//! little-endian bytes of the embedding. Two sightings only share a hash when
//! their embeddings are byte-identical; tolerance for frame-to-frame noise is
//! handled by the session, not here.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::Embedding;

/// Label hashed for faces that did not match any known identity.
pub const UNKNOWN_LABEL: &str = "Unknown";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DetectionHash(String);

impl DetectionHash {
    pub fn compute(label: &str, embedding: &Embedding) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(label.as_bytes());
        hasher.update(b"_");
        hasher.update(embedding.to_le_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight hex characters, used in saved file names.
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl From<String> for DetectionHash {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for DetectionHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_input_same_hash() {
        let e = Embedding::new(vec![0.25, -1.5, 3.0]);
        assert_eq!(
            DetectionHash::compute(UNKNOWN_LABEL, &e),
            DetectionHash::compute(UNKNOWN_LABEL, &e.clone())
        );
    }

    #[test]
    fn test_label_changes_hash() {
        let e = Embedding::new(vec![0.25, -1.5, 3.0]);
        assert_ne!(
            DetectionHash::compute("alice", &e),
            DetectionHash::compute(UNKNOWN_LABEL, &e)
        );
    }

    #[test]
    fn test_tiny_noise_changes_hash() {
        let a = Embedding::new(vec![0.25, -1.5, 3.0]);
        let b = Embedding::new(vec![0.25, -1.5, 3.000_001]);
        assert_ne!(
            DetectionHash::compute(UNKNOWN_LABEL, &a),
            DetectionHash::compute(UNKNOWN_LABEL, &b)
        );
    }

    #[test]
    fn test_hex_shape() {
        let hash = DetectionHash::compute(UNKNOWN_LABEL, &Embedding::new(vec![1.0]));
        assert_eq!(hash.as_str().len(), 64);
        assert!(hash.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash.short(), &hash.as_str()[..8]);
    }
}

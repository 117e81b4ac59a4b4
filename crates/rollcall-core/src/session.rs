//! Per-run record of which faces have already been reported.

use std::collections::HashSet;

use serde::Serialize;

use crate::fingerprint::DetectionHash;
use crate::types::Embedding;

#[derive(Debug, Default)]
pub struct SessionState {
    seen_known_names: HashSet<String>,
    seen_unknown_hashes: HashSet<DetectionHash>,
    /// Embeddings of reported unknowns, consulted only with a non-zero tolerance.
    seen_unknown_embeddings: Vec<Embedding>,
    /// Euclidean radius within which a new unknown counts as already seen.
    /// Zero means exact hash equality only.
    unknown_tolerance: f32,
}

/// Counts reported to consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub known_faces: usize,
    pub unknown_faces: usize,
    pub known_names: Vec<String>,
    pub total_detections: usize,
}

impl SessionState {
    pub fn new(unknown_tolerance: f32) -> Self {
        Self {
            unknown_tolerance: unknown_tolerance.max(0.0),
            ..Self::default()
        }
    }

    /// Record a known name. Returns `false` if it was already reported.
    pub fn mark_known(&mut self, name: &str) -> bool {
        if self.seen_known_names.contains(name) {
            return false;
        }
        self.seen_known_names.insert(name.to_string());
        true
    }

    /// Record an unknown face. Returns `false` if it was already reported.
    pub fn mark_unknown(&mut self, hash: &DetectionHash, embedding: &Embedding) -> bool {
        if self.seen_unknown_hashes.contains(hash) {
            return false;
        }
        if self.unknown_tolerance > 0.0
            && self
                .seen_unknown_embeddings
                .iter()
                .any(|seen| seen.euclidean_distance(embedding) < self.unknown_tolerance)
        {
            return false;
        }

        self.seen_unknown_hashes.insert(hash.clone());
        if self.unknown_tolerance > 0.0 {
            self.seen_unknown_embeddings.push(embedding.clone());
        }
        true
    }

    pub fn reset(&mut self) {
        self.seen_known_names.clear();
        self.seen_unknown_hashes.clear();
        self.seen_unknown_embeddings.clear();
    }

    pub fn summary(&self) -> SessionSummary {
        let mut known_names: Vec<String> = self.seen_known_names.iter().cloned().collect();
        known_names.sort();
        SessionSummary {
            known_faces: self.seen_known_names.len(),
            unknown_faces: self.seen_unknown_hashes.len(),
            known_names,
            total_detections: self.seen_known_names.len() + self.seen_unknown_hashes.len(),
        }
    }
}

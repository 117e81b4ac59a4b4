//! Event consumer: writes the attendance log and keeps unknown faces
//! around so they can be enrolled by hash.

use std::collections::HashMap;
use std::sync::Arc;

use image::RgbImage;
use rollcall_core::{AttendanceRecord, DetectionBatch, DetectionHash, DetectionKind};

use crate::events::{EventReceiver, PipelineEvent};
use crate::lock;
use crate::pipeline::Pipeline;

/// Unknown face crops reported this session, keyed by detection hash.
#[derive(Default)]
pub struct Candidates {
    crops: HashMap<DetectionHash, RgbImage>,
    latest: Option<DetectionHash>,
}

impl Candidates {
    pub fn insert(&mut self, hash: DetectionHash, crop: RgbImage) {
        self.crops.insert(hash.clone(), crop);
        self.latest = Some(hash);
    }

    pub fn get(&self, hash: &str) -> Option<RgbImage> {
        self.crops.get(&DetectionHash::from(hash.to_string())).cloned()
    }

    /// Most recently inserted candidate still present.
    pub fn latest(&self) -> Option<(DetectionHash, RgbImage)> {
        let hash = self.latest.as_ref()?;
        let crop = self.crops.get(hash)?;
        Some((hash.clone(), crop.clone()))
    }

    pub fn remove(&mut self, hash: &str) {
        self.crops.remove(&DetectionHash::from(hash.to_string()));
        if self.latest.as_ref().is_some_and(|h| h.as_str() == hash) {
            self.latest = None;
        }
    }

    pub fn clear(&mut self) {
        self.crops.clear();
        self.latest = None;
    }

    pub fn len(&self) -> usize {
        self.crops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.crops.is_empty()
    }
}

/// Drain pipeline events until every sender is gone.
pub async fn run(mut events: EventReceiver, pipeline: Arc<Pipeline>) {
    while let Some(event) = events.recv().await {
        match event {
            PipelineEvent::Detection(batch) => {
                let pipeline = Arc::clone(&pipeline);
                let recorded = tokio::task::spawn_blocking(move || record_batch(&pipeline, &batch)).await;
                if let Err(e) = recorded {
                    tracing::error!(error = %e, "attendance recording task failed");
                }
            }
            PipelineEvent::DetectionError(message) => {
                tracing::warn!(%message, "detection error");
            }
            PipelineEvent::CameraStatus(message) => {
                tracing::info!(%message, "camera");
            }
            PipelineEvent::CameraError(message) => {
                tracing::warn!(%message, "camera error");
            }
        }
    }
    tracing::debug!("event stream closed");
}

/// Append each detection to the attendance log, save unknown crops to disk
/// and remember them as registration candidates.
///
/// Batches from a session that has since been reset are still logged, but
/// their unknowns are not offered for registration.
pub fn record_batch(pipeline: &Pipeline, batch: &DetectionBatch) {
    tracing::info!(
        target: "attendance",
        faces = batch.total_faces,
        new = batch.detections.len(),
        session = batch.session,
        time = %batch.timestamp.format("%H:%M:%S"),
        "detections"
    );

    let records: Vec<AttendanceRecord> = batch
        .detections
        .iter()
        .map(|d| AttendanceRecord::new(&d.name, d.status, d.timestamp))
        .collect();
    if let Err(e) = pipeline.attendance_log().append(&records) {
        tracing::error!(error = %e, "failed to append attendance records");
    }

    for detection in &batch.detections {
        tracing::info!(
            target: "attendance",
            name = %detection.name,
            status = %detection.status,
            hash = detection.detection_hash.short(),
            time = %detection.timestamp.format("%Y-%m-%d %H:%M:%S"),
            "attendance record"
        );

        if detection.kind != DetectionKind::Unknown {
            continue;
        }

        if let Err(e) = lock(pipeline.registry())
            .save_unknown_face(&detection.face_crop, &detection.detection_hash)
        {
            tracing::error!(error = %e, hash = detection.detection_hash.short(), "failed to save unknown face");
        }

        let mut candidates = lock(pipeline.candidates());
        if batch.session != pipeline.session_id() {
            tracing::debug!(
                session = batch.session,
                hash = detection.detection_hash.short(),
                "batch from a previous session; not a registration candidate"
            );
            continue;
        }
        candidates.insert(detection.detection_hash.clone(), detection.face_crop.clone());
    }
}

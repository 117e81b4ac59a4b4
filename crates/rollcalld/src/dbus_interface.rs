use std::sync::Arc;

use chrono::NaiveDate;
use zbus::interface;

use crate::pipeline::{Pipeline, PipelineError};

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// D-Bus interface for the attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceService {
    pipeline: Arc<Pipeline>,
}

impl AttendanceService {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }

    /// Run a blocking pipeline operation off the async executor.
    async fn blocking<T, F>(&self, op: F) -> zbus::fdo::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Pipeline) -> Result<T, PipelineError> + Send + 'static,
    {
        let pipeline = Arc::clone(&self.pipeline);
        tokio::task::spawn_blocking(move || op(&pipeline))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(format!("task failed: {e}")))?
            .map_err(to_fdo)
    }
}

fn to_fdo(e: PipelineError) -> zbus::fdo::Error {
    use rollcall_core::RegistryError;
    match e {
        PipelineError::Registry(RegistryError::InvalidName(_))
        | PipelineError::Registry(RegistryError::ReservedCharacter(..))
        | PipelineError::Registry(RegistryError::DuplicateName(_))
        | PipelineError::UnknownCandidate(_)
        | PipelineError::NoCandidate
        | PipelineError::NotFound(_) => zbus::fdo::Error::InvalidArgs(e.to_string()),
        other => zbus::fdo::Error::Failed(other.to_string()),
    }
}

/// Empty means unbounded.
fn parse_day(raw: &str) -> zbus::fdo::Result<Option<NaiveDate>> {
    if raw.trim().is_empty() {
        return Ok(None);
    }
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map(Some)
        .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("bad date {raw:?}: {e}")))
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Return daemon status information as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        self.blocking(|p| Ok(p.status().to_string())).await
    }

    /// Forget which faces have been reported; everyone can be logged again.
    async fn reset_session(&self) -> zbus::fdo::Result<()> {
        tracing::info!("reset_session requested");
        self.blocking(|p| {
            p.reset_session();
            Ok(())
        })
        .await
    }

    /// Reload known faces from disk. Returns the number loaded.
    async fn refresh_faces(&self) -> zbus::fdo::Result<u32> {
        tracing::info!("refresh_faces requested");
        self.blocking(|p| Ok(p.refresh_faces()? as u32)).await
    }

    /// Names of all known faces.
    async fn list_faces(&self) -> zbus::fdo::Result<Vec<String>> {
        self.blocking(|p| Ok(p.list_faces())).await
    }

    /// Enroll an unknown face from this session by its detection hash.
    async fn register_unknown(&self, hash: String, name: String) -> zbus::fdo::Result<String> {
        tracing::info!(%hash, %name, "register_unknown requested");
        self.blocking(move |p| {
            let path = p.register_unknown(&hash, &name)?;
            Ok(path.display().to_string())
        })
        .await
    }

    /// Enroll the most recent unknown face from this session.
    async fn register_latest_unknown(&self, name: String) -> zbus::fdo::Result<String> {
        tracing::info!(%name, "register_latest_unknown requested");
        self.blocking(move |p| {
            let path = p.register_latest_unknown(&name)?;
            Ok(path.display().to_string())
        })
        .await
    }

    /// Attendance totals as JSON. Dates are `YYYY-MM-DD`; empty for no bound.
    async fn attendance_stats(&self, from: String, to: String) -> zbus::fdo::Result<String> {
        let (from, to) = (parse_day(&from)?, parse_day(&to)?);
        let stats = self.blocking(move |p| p.attendance_stats(from, to)).await?;
        serde_json::to_string(&stats).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// PNG thumbnail of a known face.
    async fn thumbnail(&self, name: String) -> zbus::fdo::Result<Vec<u8>> {
        self.blocking(move |p| p.thumbnail_png(&name)).await
    }

    async fn set_detection_interval(&self, seconds: f64) -> zbus::fdo::Result<()> {
        self.pipeline.set_detection_interval(seconds);
        Ok(())
    }

    async fn set_frame_skip(&self, frame_skip: u32) -> zbus::fdo::Result<()> {
        self.pipeline.set_frame_skip(frame_skip);
        Ok(())
    }

    async fn start_camera(&self) -> zbus::fdo::Result<()> {
        tracing::info!("start_camera requested");
        self.blocking(|p| p.start_camera()).await
    }

    async fn stop_camera(&self) -> zbus::fdo::Result<()> {
        tracing::info!("stop_camera requested");
        self.blocking(|p| {
            p.stop_camera();
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::RegistryError;

    #[test]
    fn test_parse_day() {
        assert_eq!(parse_day("").unwrap(), None);
        assert_eq!(parse_day(" 2025-03-04 ").unwrap(), NaiveDate::from_ymd_opt(2025, 3, 4));
        assert!(matches!(parse_day("04/03/2025"), Err(zbus::fdo::Error::InvalidArgs(_))));
    }

    #[test]
    fn test_name_errors_are_invalid_args() {
        let reserved = PipelineError::Registry(RegistryError::ReservedCharacter("a_b".into(), '_'));
        match to_fdo(reserved) {
            zbus::fdo::Error::InvalidArgs(message) => assert!(message.contains("may not contain '_'")),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(matches!(
            to_fdo(PipelineError::Registry(RegistryError::InvalidName(" ".into()))),
            zbus::fdo::Error::InvalidArgs(_)
        ));
    }
}

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use rollcall_core::{Config, FaceRegistry, OnnxEmbedder, RecognitionEngine};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

mod attendance;
mod dbus_interface;
mod events;
mod pipeline;
mod scheduler;
#[cfg(test)]
mod testing;

use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};
use pipeline::Pipeline;

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn load_embedder(config: &Config) -> Result<OnnxEmbedder> {
    OnnxEmbedder::load(&config.scrfd_model_path(), &config.arcface_model_path())
        .with_context(|| format!("failed to load models from {}", config.model_dir.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::load()?;
    tracing::info!(
        camera_index = config.camera_index,
        frame_skip = config.frame_skip,
        detection_interval = config.detection_interval,
        faces_dir = %config.faces_dir.display(),
        "configuration loaded"
    );

    // The registry and the engine each own a model pair; loading fails fast.
    let registry = FaceRegistry::open(config.registry_paths(), Box::new(load_embedder(&config)?))
        .context("failed to open face registry")?;
    let engine = RecognitionEngine::new(
        Box::new(load_embedder(&config)?),
        config.match_threshold,
        config.unknown_dedup_distance,
    );

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let pipeline = Arc::new(Pipeline::new(config, registry, engine, events_tx)?);

    // Without a camera the daemon still serves registry operations.
    if let Err(e) = pipeline.start_camera() {
        tracing::warn!(error = %e, "continuing without camera");
    }

    let consumer = tokio::spawn(attendance::run(events_rx, Arc::clone(&pipeline)));

    let _connection = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, AttendanceService::new(Arc::clone(&pipeline)))?
        .build()
        .await
        .context("failed to register on the session bus")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    let stopping = Arc::clone(&pipeline);
    tokio::task::spawn_blocking(move || stopping.shutdown()).await?;
    consumer.abort();

    Ok(())
}

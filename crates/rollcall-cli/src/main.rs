use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::{Config, FaceRegistry, OnnxEmbedder};
use rollcall_hw::Camera;

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    fn status(&self) -> zbus::Result<String>;
    fn reset_session(&self) -> zbus::Result<()>;
    fn refresh_faces(&self) -> zbus::Result<u32>;
    fn list_faces(&self) -> zbus::Result<Vec<String>>;
    fn register_unknown(&self, hash: &str, name: &str) -> zbus::Result<String>;
    fn register_latest_unknown(&self, name: &str) -> zbus::Result<String>;
    fn thumbnail(&self, name: &str) -> zbus::Result<Vec<u8>>;
    fn attendance_stats(&self, from: &str, to: &str) -> zbus::Result<String>;
    fn set_detection_interval(&self, seconds: f64) -> zbus::Result<()>;
    fn set_frame_skip(&self, frame_skip: u32) -> zbus::Result<()>;
    fn start_camera(&self) -> zbus::Result<()>;
    fn stop_camera(&self) -> zbus::Result<()>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face-recognition attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status
    Status,
    /// Start a new attendance session
    Reset,
    /// Reload known faces from disk
    Refresh,
    /// List known faces
    List,
    /// Register an unknown face seen in this session
    Register {
        /// Name to register the face under
        #[arg(short, long)]
        name: String,
        /// Detection hash of the face (default: the most recent unknown)
        #[arg(long)]
        hash: Option<String>,
    },
    /// Set seconds between processed frames (minimum 0.5)
    Interval { seconds: f64 },
    /// Process one of every N captured frames
    Skip { frames: u32 },
    /// Save a known face's thumbnail as PNG
    Thumbnail {
        name: String,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Show attendance totals from the log
    Stats {
        /// First day to include (YYYY-MM-DD)
        #[arg(long)]
        from: Option<String>,
        /// Last day to include (YYYY-MM-DD)
        #[arg(long)]
        to: Option<String>,
    },
    /// Start the camera
    Start,
    /// Stop the camera
    Stop,
    /// Enroll a face from an image file without the daemon
    Enroll {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        image: PathBuf,
    },
    /// Run camera diagnostics
    Test {
        /// Save the captured frame here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

async fn proxy() -> Result<AttendanceProxy<'static>> {
    let connection = zbus::Connection::session()
        .await
        .context("failed to connect to the session bus")?;
    AttendanceProxy::new(&connection)
        .await
        .context("rollcalld is not reachable")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Status => {
            let raw = proxy().await?.status().await?;
            let status: serde_json::Value = serde_json::from_str(&raw)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Reset => {
            proxy().await?.reset_session().await?;
            println!("Session reset");
        }
        Commands::Refresh => {
            let count = proxy().await?.refresh_faces().await?;
            println!("Loaded {count} known face(s)");
        }
        Commands::List => {
            let names = proxy().await?.list_faces().await?;
            if names.is_empty() {
                println!("No known faces");
            }
            for name in names {
                println!("{name}");
            }
        }
        Commands::Register { name, hash } => {
            let proxy = proxy().await?;
            let path = match hash {
                Some(hash) => proxy.register_unknown(&hash, &name).await?,
                None => proxy.register_latest_unknown(&name).await?,
            };
            println!("Registered {name} ({path})");
        }
        Commands::Interval { seconds } => {
            proxy().await?.set_detection_interval(seconds).await?;
            println!("Detection interval set to {:.1}s", seconds.max(0.5));
        }
        Commands::Skip { frames } => {
            proxy().await?.set_frame_skip(frames).await?;
            println!("Processing one of every {} frame(s)", frames.max(1));
        }
        Commands::Thumbnail { name, output } => {
            let png = proxy().await?.thumbnail(&name).await?;
            std::fs::write(&output, png)
                .with_context(|| format!("failed to write {}", output.display()))?;
            println!("Saved {}", output.display());
        }
        Commands::Stats { from, to } => {
            let raw = proxy()
                .await?
                .attendance_stats(from.as_deref().unwrap_or(""), to.as_deref().unwrap_or(""))
                .await?;
            let stats: serde_json::Value = serde_json::from_str(&raw)?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Start => {
            proxy().await?.start_camera().await?;
            println!("Camera started");
        }
        Commands::Stop => {
            proxy().await?.stop_camera().await?;
            println!("Camera stopped");
        }
        Commands::Enroll { name, image } => {
            let name_for_task = name.clone();
            let saved = tokio::task::spawn_blocking(move || enroll_offline(&name_for_task, &image)).await??;
            println!("Enrolled {name} ({})", saved.display());

            // Best effort: a running daemon picks the new face up immediately.
            if let Ok(proxy) = proxy().await {
                if let Ok(count) = proxy.refresh_faces().await {
                    println!("rollcalld reloaded {count} known face(s)");
                }
            }
        }
        Commands::Test { output } => {
            tokio::task::spawn_blocking(move || camera_test(output)).await??;
        }
    }

    Ok(())
}

/// Enroll straight into the on-disk registry, loading the models locally.
fn enroll_offline(name: &str, image_path: &std::path::Path) -> Result<PathBuf> {
    let config = Config::load()?;
    tracing::info!(name, image = %image_path.display(), faces_dir = %config.faces_dir.display(), "enrolling offline");
    let embedder = OnnxEmbedder::load(&config.scrfd_model_path(), &config.arcface_model_path())
        .with_context(|| format!("failed to load models from {}", config.model_dir.display()))?;
    let mut registry = FaceRegistry::open(config.registry_paths(), Box::new(embedder))?;

    let image = image::open(image_path)
        .with_context(|| format!("failed to read {}", image_path.display()))?
        .to_rgb8();
    Ok(registry.register_face(&image, "", name)?)
}

fn camera_test(output: Option<PathBuf>) -> Result<()> {
    println!("Running camera diagnostics...");

    let devices = Camera::list_devices();
    tracing::debug!(count = devices.len(), "enumerated capture devices");
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for device in &devices {
        println!(
            "  [{}] {}: {} ({}, {})",
            device.index, device.path, device.name, device.driver, device.bus
        );
    }

    let config = Config::load()?;
    tracing::info!(index = config.camera_index, "opening camera");
    let camera = Camera::open_with_fallback(config.camera_index)?;
    println!(
        "Opened /dev/video{} at {}x{}",
        camera.index, camera.width, camera.height
    );

    let frame = camera.capture_frame()?;
    println!(
        "Captured frame #{}: {}x{}, brightness {:.1}",
        frame.sequence,
        frame.width(),
        frame.height(),
        frame.avg_brightness()
    );

    if let Some(path) = output {
        frame
            .image
            .save(&path)
            .with_context(|| format!("failed to save {}", path.display()))?;
        println!("Saved {}", path.display());
    }
    Ok(())
}

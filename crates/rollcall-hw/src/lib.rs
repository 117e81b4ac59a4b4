//! rollcall-hw — Camera capture for the attendance pipeline.
//!
//! Provides V4L2-based camera access, conversion of the common capture
//! formats to RGB, and the frame source thread that feeds the scheduler.

pub mod camera;
pub mod frame;
pub mod source;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::Frame;
pub use source::{open_camera, CaptureDevice, DeviceOpener, FrameReader, FrameSink, FrameSource};

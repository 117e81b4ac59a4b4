//! Test doubles shared by the daemon's unit tests.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use image::{Rgb, RgbImage};
use rollcall_core::{BoundingBox, EmbedError, Embedding, FaceEmbedder};
use rollcall_hw::{CameraError, CaptureDevice, Frame, FrameReader};

/// One face covering the whole image, embedded as its mean colour.
/// Records when `locate` ran and the red value it saw.
#[derive(Default, Clone)]
pub struct StubEmbedder {
    calls: Arc<Mutex<Vec<(Instant, u8)>>>,
    pub fail: bool,
}

impl StubEmbedder {
    pub fn calls(&self) -> Vec<(Instant, u8)> {
        self.calls.lock().unwrap().clone()
    }
}

impl FaceEmbedder for StubEmbedder {
    fn locate(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, EmbedError> {
        let red = image.get_pixel(0, 0).0[0];
        self.calls.lock().unwrap().push((Instant::now(), red));
        if self.fail {
            return Err(EmbedError::Backend("stub failure".into()));
        }
        if image.pixels().all(|p| p.0 == [0, 0, 0]) {
            return Ok(Vec::new());
        }
        Ok(vec![BoundingBox {
            x: 0.0,
            y: 0.0,
            width: image.width() as f32,
            height: image.height() as f32,
            confidence: 1.0,
            landmarks: None,
        }])
    }

    fn embed(&mut self, image: &RgbImage, _face: &BoundingBox) -> Result<Embedding, EmbedError> {
        let n = image.pixels().len() as f32 * 255.0;
        let mut sums = [0f32; 3];
        for p in image.pixels() {
            for (sum, &c) in sums.iter_mut().zip(p.0.iter()) {
                *sum += c as f32;
            }
        }
        Ok(Embedding::new(sums.iter().map(|s| s / n).collect()))
    }
}

pub fn solid_image(red: u8) -> RgbImage {
    RgbImage::from_pixel(64, 48, Rgb([red, 0, 0]))
}

pub fn solid_frame(red: u8, sequence: u32) -> Frame {
    Frame::new(solid_image(red), sequence)
}

/// Capture device that streams the same solid frame forever.
pub struct StillCamera {
    pub index: usize,
    pub red: u8,
}

struct StillStream {
    red: u8,
    sequence: u32,
}

impl FrameReader for StillStream {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        self.sequence += 1;
        Ok(solid_frame(self.red, self.sequence))
    }
}

impl CaptureDevice for StillCamera {
    fn index(&self) -> usize {
        self.index
    }

    fn open_stream(&self) -> Result<Box<dyn FrameReader + '_>, CameraError> {
        Ok(Box::new(StillStream {
            red: self.red,
            sequence: 0,
        }))
    }
}

//! Frame and detection data types shared by every pipeline stage.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Identifier of a camera, e.g. `"left"` or `"right"`.
pub type CameraId = String;

/// Frames travel between stages behind an `Arc` and are never mutated.
pub type SharedFrame = Arc<Frame>;

/// Pixel format of a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Single channel, 1 byte per pixel
    Gray8,
    /// 3 bytes per pixel
    Rgb8,
    /// 3 bytes per pixel, blue first
    Bgr8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Rgb8 | PixelFormat::Bgr8 => 3,
        }
    }
}

/// A captured camera frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Camera that produced the frame
    pub camera_id: CameraId,
    /// Monotonic capture timestamp
    pub timestamp: Instant,
    /// Per-camera frame counter
    pub index: u64,
    /// Raw pixel data
    pub data: Vec<u8>,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Pixel format
    pub format: PixelFormat,
}

impl Frame {
    /// Build a frame from its parts.
    pub fn new(
        camera_id: impl Into<CameraId>,
        index: u64,
        timestamp: Instant,
        width: u32,
        height: u32,
        format: PixelFormat,
        data: Vec<u8>,
    ) -> Self {
        Self {
            camera_id: camera_id.into(),
            timestamp,
            index,
            data,
            width,
            height,
            format,
        }
    }

    /// Expected buffer length for the frame's dimensions and format.
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }

    /// Wrap the frame for sharing between stages.
    pub fn shared(self) -> SharedFrame {
        Arc::new(self)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{} ({}x{} {:?})",
            self.camera_id, self.index, self.width, self.height, self.format
        )
    }
}

/// A ball candidate found in a single frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub camera_id: CameraId,
    pub frame_index: u64,
    pub timestamp: Instant,
    /// Centroid in pixel coordinates (x, y)
    pub centroid: (f32, f32),
    /// Radius in pixels
    pub radius: f32,
    /// Detector confidence in 0.0..=1.0
    pub confidence: f32,
}

impl Detection {
    /// Create a detection for `frame` at the given centroid.
    pub fn for_frame(frame: &Frame, centroid: (f32, f32), radius: f32, confidence: f32) -> Self {
        Self {
            camera_id: frame.camera_id.clone(),
            frame_index: frame.index,
            timestamp: frame.timestamp,
            centroid,
            radius,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

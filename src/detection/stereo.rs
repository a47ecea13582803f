//! Stereo-matching stage input: per-camera ring of recent detection results.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::error::BoxError;
use crate::frame::{CameraId, Detection, Frame, SharedFrame};

/// Detections produced for one frame.
#[derive(Debug, Clone)]
pub struct DetectionResult {
    pub camera_id: CameraId,
    pub frame: SharedFrame,
    pub detections: Vec<Detection>,
}

/// Receives each detection result as `(camera, frame, detections)`.
///
/// Pairing left and right results is the callback's concern.
pub type StereoCallback =
    Arc<dyn Fn(&str, &Frame, &[Detection]) -> Result<(), BoxError> + Send + Sync>;

/// Fixed-size ring of the most recent results per camera.
#[derive(Debug)]
pub struct StereoBuffer {
    capacity: usize,
    rings: HashMap<CameraId, VecDeque<Arc<DetectionResult>>>,
}

impl StereoBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            rings: HashMap::new(),
        }
    }

    pub fn push(&mut self, result: Arc<DetectionResult>) {
        let capacity = self.capacity;
        let ring = self
            .rings
            .entry(result.camera_id.clone())
            .or_insert_with(|| VecDeque::with_capacity(capacity));
        if ring.len() == capacity {
            ring.pop_front();
        }
        ring.push_back(result);
    }

    /// Buffered results for `camera`, oldest first.
    pub fn recent(&self, camera: &str) -> Vec<Arc<DetectionResult>> {
        self.rings
            .get(camera)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear(&mut self) {
        self.rings.clear();
    }
}

//! Synthetic stereo source and detector for running the pipeline without cameras.

use std::time::Instant;

use crate::detection::{DetectError, Detector};
use crate::frame::{Detection, Frame, PixelFormat, SharedFrame};

pub const WIDTH: u32 = 64;
pub const HEIGHT: u32 = 48;
/// Horizontal offset of the ball between the two views
const DISPARITY: i64 = 4;
const BALL_HALF: i64 = 1;

/// Renders a bright ball crossing a dark background.
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    cameras: Vec<String>,
    index: u64,
}

impl SyntheticSource {
    pub fn new(cameras: &[String]) -> Self {
        Self {
            cameras: cameras.to_vec(),
            index: 0,
        }
    }

    /// One frame per camera. `ball` is the flight progress in 0.0..=1.0.
    pub fn next_frames(&mut self, ball: Option<f32>) -> Vec<SharedFrame> {
        let timestamp = Instant::now();
        let index = self.index;
        self.index += 1;
        self.cameras
            .iter()
            .enumerate()
            .map(|(view, camera)| {
                let mut data = vec![0u8; (WIDTH * HEIGHT) as usize];
                if let Some(progress) = ball {
                    let x = (progress.clamp(0.0, 1.0) * (WIDTH - 1) as f32) as i64
                        - view as i64 * DISPARITY;
                    draw_ball(&mut data, x, HEIGHT as i64 / 2);
                }
                Frame::new(
                    camera.as_str(),
                    index,
                    timestamp,
                    WIDTH,
                    HEIGHT,
                    PixelFormat::Gray8,
                    data,
                )
                .shared()
            })
            .collect()
    }
}

fn draw_ball(data: &mut [u8], cx: i64, cy: i64) {
    for y in cy - BALL_HALF..=cy + BALL_HALF {
        for x in cx - BALL_HALF..=cx + BALL_HALF {
            if (0..WIDTH as i64).contains(&x) && (0..HEIGHT as i64).contains(&y) {
                data[(y * WIDTH as i64 + x) as usize] = 255;
            }
        }
    }
}

/// Thresholds a grayscale frame and reports the bright blob's centroid.
#[derive(Debug, Clone, Copy)]
pub struct BrightSpotDetector {
    pub threshold: u8,
}

impl Default for BrightSpotDetector {
    fn default() -> Self {
        Self { threshold: 200 }
    }
}

impl Detector for BrightSpotDetector {
    fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, DetectError> {
        if frame.format != PixelFormat::Gray8 {
            return Err(DetectError::InvalidFrame(format!(
                "expected Gray8, got {:?}",
                frame.format
            )));
        }
        if frame.data.len() != frame.expected_len() {
            return Err(DetectError::InvalidFrame(format!(
                "{} bytes for {}",
                frame.data.len(),
                frame
            )));
        }

        let width = frame.width as usize;
        let (mut sum_x, mut sum_y, mut count) = (0f32, 0f32, 0usize);
        for (i, _) in frame
            .data
            .iter()
            .enumerate()
            .filter(|(_, &v)| v >= self.threshold)
        {
            sum_x += (i % width) as f32;
            sum_y += (i / width) as f32;
            count += 1;
        }
        if count == 0 {
            return Ok(Vec::new());
        }

        let n = count as f32;
        let radius = (n / std::f32::consts::PI).sqrt();
        let confidence = n / ((2 * BALL_HALF + 1).pow(2) as f32);
        Ok(vec![Detection::for_frame(
            frame,
            (sum_x / n, sum_y / n),
            radius,
            confidence,
        )])
    }
}

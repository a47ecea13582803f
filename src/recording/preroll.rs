//! Time-windowed pre-roll buffer of recent frames per camera.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::frame::SharedFrame;

/// Time-windowed ring of recent frames for one camera.
///
/// Each insert trims frames captured more than `window` before the newest
/// frame, then enforces `max_frames`. Capture order is preserved.
#[derive(Debug)]
pub struct PreRollBuffer {
    window: Duration,
    max_frames: usize,
    frames: VecDeque<SharedFrame>,
}

impl PreRollBuffer {
    pub fn new(window: Duration, max_frames: usize) -> Self {
        Self {
            window,
            max_frames: max_frames.max(1),
            frames: VecDeque::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn push(&mut self, frame: SharedFrame) {
        let now = frame.timestamp;
        self.frames.push_back(frame);
        self.trim(now);
    }

    fn trim(&mut self, now: Instant) {
        if let Some(cutoff) = now.checked_sub(self.window) {
            while let Some(front) = self.frames.front() {
                if front.timestamp < cutoff {
                    self.frames.pop_front();
                } else {
                    break;
                }
            }
        }
        while self.frames.len() > self.max_frames {
            self.frames.pop_front();
        }
    }

    /// Copy of the buffered frames, oldest first. The buffer is left intact.
    pub fn snapshot(&self) -> Vec<SharedFrame> {
        self.frames.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Span between the oldest and newest buffered frame.
    pub fn duration(&self) -> Duration {
        match (self.frames.front(), self.frames.back()) {
            (Some(first), Some(last)) => last.timestamp.duration_since(first.timestamp),
            _ => Duration::ZERO,
        }
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

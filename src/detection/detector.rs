//! Detector collaborator interface.

use crate::frame::{Detection, Frame};

/// Errors a detector may return for a single frame.
#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("detector failed: {0}")]
    Failed(String),
}

/// Finds ball candidates in a frame.
///
/// Implementations are shared between worker threads and must be
/// callable concurrently for different cameras.
pub trait Detector: Send + Sync {
    fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, DetectError>;
}

impl<F> Detector for F
where
    F: Fn(&Frame) -> Result<Vec<Detection>, DetectError> + Send + Sync,
{
    fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, DetectError> {
        self(frame)
    }
}

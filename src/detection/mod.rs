//! Detection scheduling: per-camera queues, dispatch loops and the stereo stage.

mod detector;
mod dispatch;
mod pool;
mod queue;
mod stereo;

pub use detector::{DetectError, Detector};
pub use dispatch::DispatchMode;
pub use pool::{DetectionThreadPool, EscalationCallback, LaneStats, PoolSettings, PoolStats};
pub use queue::{DropOldestQueue, PushOutcome};
pub use stereo::{DetectionResult, StereoBuffer, StereoCallback};

//! Pre-roll aware recording of sessions and pitches.

mod coordinator;
mod disk;
mod preroll;
mod recorder;

pub use coordinator::{
    PitchStart, PitchSummary, RecordingCoordinator, RecordingSettings, SessionInfo,
    SessionSummary, StopSessionCallback,
};
pub use disk::{bytes_to_gb, DiskSpaceProbe, DiskStatus, SystemDiskProbe};
pub use preroll::PreRollBuffer;
pub use recorder::{
    FrameRecorder, ManifestRecorder, ManifestRecorderFactory, RecorderFactory, MANIFEST_FILE,
};

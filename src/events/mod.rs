//! Event buses connecting the pipeline components.
//!
//! - [`EventBus`] is a generic typed publish/subscribe dispatcher
//! - [`PipelineEvent`] is the event set carried on the orchestrator's bus
//! - [`ErrorEventBus`] carries categorized faults with bounded history

mod bus;
mod error_bus;

use std::path::PathBuf;

pub use bus::{BusEvent, EventBus, EventBusStats, Handler, SubscriptionId};
pub use error_bus::{
    ErrorCategory, ErrorEvent, ErrorEventBus, ErrorStats, RecoveryAction, RecoveryStrategy,
    Severity, DEFAULT_HISTORY_CAPACITY,
};

use crate::camera::CameraState;
use crate::frame::{CameraId, Detection, SharedFrame};

/// Tag of a [`PipelineEvent`], used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineEventKind {
    FrameCaptured,
    DetectionsReady,
    SessionStarted,
    SessionStopped,
    PitchStarted,
    PitchEnded,
    CameraStateChanged,
}

/// Events published by the orchestrator for UI and monitoring consumers.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    FrameCaptured {
        frame: SharedFrame,
    },
    DetectionsReady {
        camera_id: CameraId,
        frame_index: u64,
        detections: Vec<Detection>,
    },
    SessionStarted {
        name: String,
        directory: PathBuf,
    },
    SessionStopped {
        name: String,
        frames_written: u64,
        pitches: u32,
    },
    PitchStarted {
        pitch_id: u32,
        pre_roll_frames: usize,
    },
    PitchEnded {
        pitch_id: u32,
        frames_written: u64,
    },
    CameraStateChanged {
        camera_id: CameraId,
        from: CameraState,
        to: CameraState,
    },
}

impl BusEvent for PipelineEvent {
    type Kind = PipelineEventKind;

    fn kind(&self) -> PipelineEventKind {
        match self {
            PipelineEvent::FrameCaptured { .. } => PipelineEventKind::FrameCaptured,
            PipelineEvent::DetectionsReady { .. } => PipelineEventKind::DetectionsReady,
            PipelineEvent::SessionStarted { .. } => PipelineEventKind::SessionStarted,
            PipelineEvent::SessionStopped { .. } => PipelineEventKind::SessionStopped,
            PipelineEvent::PitchStarted { .. } => PipelineEventKind::PitchStarted,
            PipelineEvent::PitchEnded { .. } => PipelineEventKind::PitchEnded,
            PipelineEvent::CameraStateChanged { .. } => PipelineEventKind::CameraStateChanged,
        }
    }
}

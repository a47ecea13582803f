//! pitch-tracker library crate.
//!
//! Orchestration core for a stereo-camera pitch tracking pipeline:
//! bounded per-camera detection, camera reconnection, pre-roll aware
//! recording, resource monitoring and ordered shutdown.

pub mod backoff;
pub mod camera;
pub mod cleanup;
pub mod cli;
pub mod config;
pub mod detection;
pub mod error;
pub mod events;
pub mod frame;
pub mod join;
pub mod monitor;
pub mod orchestrator;
pub mod recording;
pub mod throttle;

pub use error::{BoxError, PipelineError, RecorderError};
pub use orchestrator::{Collaborators, Orchestrator};

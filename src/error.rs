//! Error types returned to callers of the pipeline core.
//!
//! Only contract violations surface here. Runtime faults inside the
//! background loops are reported on the error bus instead.

use std::path::PathBuf;

use crate::config::ConfigError;

/// Boxed error returned by collaborator callbacks and event handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised by the orchestration layer.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("{0} is already running")]
    AlreadyRunning(&'static str),

    #[error("{0} is not running")]
    NotRunning(&'static str),

    #[error("unknown camera '{0}'")]
    UnknownCamera(String),

    #[error("no detector configured for camera '{0}'")]
    MissingDetector(String),

    #[error("no recording session is active")]
    NoActiveSession,

    #[error("a recording session is already active")]
    SessionAlreadyActive,

    #[error("no pitch is being recorded")]
    NoActivePitch,

    #[error("insufficient disk space at {path}: {available_gb:.1} GB free (critical below {critical_gb:.1} GB)")]
    InsufficientDiskSpace {
        path: PathBuf,
        available_gb: f64,
        critical_gb: f64,
    },

    #[error("cleanup is already in progress")]
    CleanupInProgress,

    #[error("recorder error: {0}")]
    Recorder(#[from] RecorderError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors produced by a frame recorder.
#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("recorder is not started")]
    NotStarted,

    #[error("recorder is already closed")]
    Closed,

    #[error("failed to write to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

//! Frame recorder collaborators and the filesystem-backed manifest recorder.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::error::RecorderError;
use crate::frame::Frame;

/// File name of the per-recorder frame manifest.
pub const MANIFEST_FILE: &str = "frames.csv";

/// Write-only sink for one session or one pitch.
///
/// The coordinator calls every method with its lock held so frames reach
/// each recorder in capture order. Implementations must not call back into
/// the [`RecordingCoordinator`](super::RecordingCoordinator).
pub trait FrameRecorder: Send {
    fn start(&mut self) -> Result<(), RecorderError>;

    fn write_frame(&mut self, frame: &Frame) -> Result<(), RecorderError>;

    /// Finish writing. Returns the number of frames written.
    fn close(&mut self) -> Result<u64, RecorderError>;

    fn directory(&self) -> &Path;

    /// Whether the recorder wants to be closed before its owner would close it.
    fn should_close(&self) -> bool {
        false
    }
}

/// Creates recorders for sessions and the pitches inside them.
///
/// Called with the coordinator's lock held, under the same rule as
/// [`FrameRecorder`].
pub trait RecorderFactory: Send + Sync {
    fn session_recorder(&self, session: &str) -> Result<Box<dyn FrameRecorder>, RecorderError>;

    fn pitch_recorder(
        &self,
        session_dir: &Path,
        pitch_id: u32,
    ) -> Result<Box<dyn FrameRecorder>, RecorderError>;
}

/// Records frame metadata as CSV: `camera,index,timestamp_us,width,height`.
///
/// Timestamps are microseconds since the first frame written.
pub struct ManifestRecorder {
    directory: PathBuf,
    writer: Option<BufWriter<File>>,
    origin: Option<Instant>,
    frames_written: u64,
    closed: bool,
}

impl ManifestRecorder {
    /// Create a recorder for `directory`. Nothing touches disk until `start`.
    pub fn new(directory: PathBuf) -> Self {
        Self {
            directory,
            writer: None,
            origin: None,
            frames_written: 0,
            closed: false,
        }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.directory.join(MANIFEST_FILE)
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    fn write_err(&self, source: std::io::Error) -> RecorderError {
        RecorderError::Write {
            path: self.manifest_path(),
            source,
        }
    }
}

impl FrameRecorder for ManifestRecorder {
    fn start(&mut self) -> Result<(), RecorderError> {
        if self.closed {
            return Err(RecorderError::Closed);
        }
        if self.writer.is_some() {
            return Ok(());
        }
        fs::create_dir_all(&self.directory).map_err(|source| RecorderError::Create {
            path: self.directory.clone(),
            source,
        })?;
        let path = self.manifest_path();
        let file = File::create(&path).map_err(|source| RecorderError::Create {
            path: path.clone(),
            source,
        })?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "camera,index,timestamp_us,width,height")
            .map_err(|e| self.write_err(e))?;
        self.writer = Some(writer);
        log::debug!("Recorder started at {}", self.directory.display());
        Ok(())
    }

    fn write_frame(&mut self, frame: &Frame) -> Result<(), RecorderError> {
        if self.closed {
            return Err(RecorderError::Closed);
        }
        let origin = *self.origin.get_or_insert(frame.timestamp);
        let offset_us = frame.timestamp.saturating_duration_since(origin).as_micros();
        let path = self.manifest_path();
        let writer = self.writer.as_mut().ok_or(RecorderError::NotStarted)?;
        writeln!(
            writer,
            "{},{},{},{},{}",
            frame.camera_id, frame.index, offset_us, frame.width, frame.height
        )
        .map_err(|source| RecorderError::Write { path, source })?;
        self.frames_written += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<u64, RecorderError> {
        if self.closed {
            return Ok(self.frames_written);
        }
        self.closed = true;
        if let Some(mut writer) = self.writer.take() {
            writer.flush().map_err(|e| self.write_err(e))?;
        }
        log::debug!(
            "Recorder closed at {} ({} frames)",
            self.directory.display(),
            self.frames_written
        );
        Ok(self.frames_written)
    }

    fn directory(&self) -> &Path {
        &self.directory
    }
}

/// Lays out `<root>/<session>/` with one `pitch_NNN/` directory per pitch.
#[derive(Debug, Clone)]
pub struct ManifestRecorderFactory {
    root: PathBuf,
}

impl ManifestRecorderFactory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl RecorderFactory for ManifestRecorderFactory {
    fn session_recorder(&self, session: &str) -> Result<Box<dyn FrameRecorder>, RecorderError> {
        Ok(Box::new(ManifestRecorder::new(self.root.join(session))))
    }

    fn pitch_recorder(
        &self,
        session_dir: &Path,
        pitch_id: u32,
    ) -> Result<Box<dyn FrameRecorder>, RecorderError> {
        Ok(Box::new(ManifestRecorder::new(
            session_dir.join(format!("pitch_{:03}", pitch_id)),
        )))
    }
}

//! Session and pitch recording driven by captured frames.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use super::disk::{DiskSpaceProbe, DiskStatus};
use super::preroll::PreRollBuffer;
use super::recorder::{FrameRecorder, RecorderFactory};
use crate::error::{PipelineError, RecorderError};
use crate::events::{ErrorCategory, ErrorEvent, ErrorEventBus, Severity};
use crate::frame::{CameraId, Frame, SharedFrame};
use crate::throttle::{Throttle, DEFAULT_LOG_INTERVAL};

const SOURCE: &str = "recording";

/// Invoked with a reason when free disk space drops below the critical threshold mid-session.
pub type StopSessionCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RecordingSettings {
    /// Directory whose filesystem is checked for free space
    pub output_dir: PathBuf,
    pub pre_roll: Duration,
    pub post_roll: Duration,
    /// Hard cap on buffered frames per camera
    pub pre_roll_max_frames: usize,
    pub disk_warning_gb: f64,
    pub disk_critical_gb: f64,
    pub disk_check_interval: Duration,
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("recordings"),
            pre_roll: Duration::from_millis(500),
            post_roll: Duration::from_millis(500),
            pre_roll_max_frames: 120,
            disk_warning_gb: 20.0,
            disk_critical_gb: 5.0,
            disk_check_interval: Duration::from_secs(30),
        }
    }
}

/// Returned by [`RecordingCoordinator::start_session`].
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub name: String,
    pub directory: PathBuf,
    /// Set when free space is below the warning threshold
    pub disk_warning: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub name: String,
    pub directory: PathBuf,
    pub frames_written: u64,
    pub pitches: u32,
    pub duration: Duration,
    /// Pitch that was still open when the session stopped
    pub closed_pitch: Option<PitchSummary>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PitchStart {
    pub pitch_id: u32,
    pub directory: PathBuf,
    pub pre_roll_frames: usize,
    /// Previous pitch closed early because a new one started
    pub closed_previous: Option<PitchSummary>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PitchSummary {
    pub pitch_id: u32,
    pub directory: PathBuf,
    pub pre_roll_frames: usize,
    pub frames_written: u64,
}

struct Session {
    name: String,
    directory: PathBuf,
    recorder: Box<dyn FrameRecorder>,
    started: Instant,
    frames_written: u64,
    pitches: u32,
    next_disk_check: Instant,
}

struct PostRoll {
    deadline: Instant,
    /// Cameras whose latest frame reached the deadline
    done: HashSet<CameraId>,
}

struct Pitch {
    id: u32,
    directory: PathBuf,
    recorder: Box<dyn FrameRecorder>,
    pre_roll_frames: usize,
    frames_written: u64,
    post_roll: Option<PostRoll>,
}

struct State {
    pre_roll: HashMap<CameraId, PreRollBuffer>,
    session: Option<Session>,
    pitch: Option<Pitch>,
    next_pitch_id: u32,
}

/// Routes captured frames into pre-roll buffers and session/pitch recorders.
///
/// Recorder calls happen under the coordinator lock so writes keep capture
/// order. Error events and the stop-session callback are emitted after the
/// lock is released.
pub struct RecordingCoordinator {
    settings: RecordingSettings,
    cameras: Vec<CameraId>,
    factory: Arc<dyn RecorderFactory>,
    disk: Arc<dyn DiskSpaceProbe>,
    error_bus: Arc<ErrorEventBus>,
    state: Mutex<State>,
    stop_callback: RwLock<Option<StopSessionCallback>>,
    throttle: Throttle<&'static str>,
}

impl RecordingCoordinator {
    pub fn new(
        cameras: &[CameraId],
        settings: RecordingSettings,
        factory: Arc<dyn RecorderFactory>,
        disk: Arc<dyn DiskSpaceProbe>,
        error_bus: Arc<ErrorEventBus>,
    ) -> Self {
        let pre_roll = cameras
            .iter()
            .map(|id| {
                (
                    id.clone(),
                    PreRollBuffer::new(settings.pre_roll, settings.pre_roll_max_frames),
                )
            })
            .collect();
        Self {
            cameras: cameras.to_vec(),
            factory,
            disk,
            error_bus,
            state: Mutex::new(State {
                pre_roll,
                session: None,
                pitch: None,
                next_pitch_id: 1,
            }),
            stop_callback: RwLock::new(None),
            throttle: Throttle::new(DEFAULT_LOG_INTERVAL),
            settings,
        }
    }

    pub fn settings(&self) -> &RecordingSettings {
        &self.settings
    }

    /// Called when disk space turns critical during a session.
    ///
    /// Without a callback the coordinator stops the session itself.
    pub fn set_stop_session_callback<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.stop_callback.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(callback));
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, events: Vec<ErrorEvent>) {
        for event in events {
            self.error_bus.publish(event);
        }
    }

    fn disk_status(&self) -> DiskStatus {
        DiskStatus::classify(
            self.disk.available_bytes(&self.settings.output_dir),
            self.settings.disk_warning_gb,
            self.settings.disk_critical_gb,
        )
    }

    fn low_space_message(&self, available_gb: f64) -> String {
        format!(
            "Low disk space: {:.1} GB free at {} (warning below {:.1} GB)",
            available_gb,
            self.settings.output_dir.display(),
            self.settings.disk_warning_gb
        )
    }

    fn critical_space_event(&self, available_gb: f64) -> ErrorEvent {
        ErrorEvent::new(
            ErrorCategory::Disk,
            Severity::Critical,
            SOURCE,
            format!(
                "Disk space critical: {:.1} GB free at {}",
                available_gb,
                self.settings.output_dir.display()
            ),
        )
        .with_meta("available_gb", format!("{:.2}", available_gb))
        .with_meta("critical_gb", self.settings.disk_critical_gb)
    }

    fn write_failure(&self, target: &'static str, err: &RecorderError) -> Option<ErrorEvent> {
        if !self.throttle.ready(target) {
            return None;
        }
        Some(
            ErrorEvent::new(
                ErrorCategory::Recording,
                Severity::Error,
                SOURCE,
                format!("Failed to write frame to {} recorder", target),
            )
            .with_cause(err),
        )
    }

    /// Open a session recorder after checking free disk space.
    pub fn start_session(&self, name: &str) -> Result<SessionInfo, PipelineError> {
        if self.lock().session.is_some() {
            return Err(PipelineError::SessionAlreadyActive);
        }

        let disk_warning = match self.disk_status() {
            DiskStatus::Critical { available_gb } => {
                self.error_bus.publish(self.critical_space_event(available_gb));
                return Err(PipelineError::InsufficientDiskSpace {
                    path: self.settings.output_dir.clone(),
                    available_gb,
                    critical_gb: self.settings.disk_critical_gb,
                });
            }
            DiskStatus::Warning { available_gb } => {
                let message = self.low_space_message(available_gb);
                self.error_bus
                    .report(ErrorCategory::Disk, Severity::Warning, SOURCE, message.clone());
                Some(message)
            }
            DiskStatus::Unknown => {
                log::warn!(
                    "Could not determine free space for {}",
                    self.settings.output_dir.display()
                );
                None
            }
            DiskStatus::Ok { .. } => None,
        };

        let mut recorder = self.factory.session_recorder(name)?;
        recorder.start()?;
        let directory = recorder.directory().to_path_buf();

        let mut state = self.lock();
        if state.session.is_some() {
            drop(state);
            let _ = recorder.close();
            return Err(PipelineError::SessionAlreadyActive);
        }
        let now = Instant::now();
        state.session = Some(Session {
            name: name.to_string(),
            directory: directory.clone(),
            recorder,
            started: now,
            frames_written: 0,
            pitches: 0,
            next_disk_check: now + self.settings.disk_check_interval,
        });
        state.next_pitch_id = 1;
        drop(state);

        log::info!("Session '{}' started at {}", name, directory.display());
        Ok(SessionInfo {
            name: name.to_string(),
            directory,
            disk_warning,
        })
    }

    /// Close the session recorder and any pitch still open.
    pub fn stop_session(&self) -> Result<SessionSummary, PipelineError> {
        let (mut session, pitch) = {
            let mut state = self.lock();
            let session = state.session.take().ok_or(PipelineError::NoActiveSession)?;
            (session, state.pitch.take())
        };

        let mut events = Vec::new();
        let closed_pitch = pitch.map(|p| self.close_pitch(p, &mut events));
        let frames_written = match session.recorder.close() {
            Ok(n) => n,
            Err(e) => {
                events.push(
                    ErrorEvent::new(
                        ErrorCategory::Recording,
                        Severity::Error,
                        SOURCE,
                        format!("Failed to close session '{}'", session.name),
                    )
                    .with_cause(&e),
                );
                session.frames_written
            }
        };
        self.publish(events);

        let summary = SessionSummary {
            name: session.name,
            directory: session.directory,
            frames_written,
            pitches: session.pitches,
            duration: session.started.elapsed(),
            closed_pitch,
        };
        log::info!(
            "Session '{}' stopped: {} frames, {} pitch(es)",
            summary.name,
            summary.frames_written,
            summary.pitches
        );
        Ok(summary)
    }

    /// Open a pitch recorder seeded with the current pre-roll, oldest first.
    pub fn start_pitch(&self) -> Result<PitchStart, PipelineError> {
        let mut events = Vec::new();
        let result = {
            let mut state = self.lock();
            self.start_pitch_locked(&mut state, &mut events)
        };
        self.publish(events);
        result
    }

    fn start_pitch_locked(
        &self,
        state: &mut State,
        events: &mut Vec<ErrorEvent>,
    ) -> Result<PitchStart, PipelineError> {
        let session_dir = match &state.session {
            Some(session) => session.directory.clone(),
            None => return Err(PipelineError::NoActiveSession),
        };
        let closed_previous = state.pitch.take().map(|p| {
            log::warn!("Pitch {} still open, closing before starting a new one", p.id);
            self.close_pitch(p, events)
        });

        let pitch_id = state.next_pitch_id;
        let mut recorder = self.factory.pitch_recorder(&session_dir, pitch_id)?;
        recorder.start()?;
        state.next_pitch_id += 1;
        if let Some(session) = state.session.as_mut() {
            session.pitches += 1;
        }

        let mut pre_roll: Vec<SharedFrame> =
            state.pre_roll.values().flat_map(|b| b.snapshot()).collect();
        pre_roll.sort_by_key(|f| f.timestamp);

        let mut written = 0;
        for frame in &pre_roll {
            if let Err(e) = recorder.write_frame(frame) {
                events.extend(self.write_failure("pitch", &e));
                break;
            }
            written += 1;
        }

        let directory = recorder.directory().to_path_buf();
        state.pitch = Some(Pitch {
            id: pitch_id,
            directory: directory.clone(),
            recorder,
            pre_roll_frames: written,
            frames_written: written as u64,
            post_roll: None,
        });
        log::info!("Pitch {} started with {} pre-roll frame(s)", pitch_id, written);

        Ok(PitchStart {
            pitch_id,
            directory,
            pre_roll_frames: written,
            closed_previous,
        })
    }

    /// Mark the active pitch as ended now and start its post-roll.
    pub fn stop_pitch(&self) -> Result<Option<PitchSummary>, PipelineError> {
        self.stop_pitch_at(Instant::now())
    }

    /// Mark the active pitch as ended at `end`.
    ///
    /// Frames keep going to the pitch until every camera has delivered a
    /// frame at or past `end + post_roll`. With no post-roll the pitch is
    /// closed immediately and its summary returned.
    pub fn stop_pitch_at(&self, end: Instant) -> Result<Option<PitchSummary>, PipelineError> {
        let mut events = Vec::new();
        let result = {
            let mut state = self.lock();
            let open = state.pitch.as_ref().is_some_and(|p| p.post_roll.is_none());
            if !open {
                return Err(PipelineError::NoActivePitch);
            }
            if self.settings.post_roll.is_zero() {
                state.pitch.take().map(|p| self.close_pitch(p, &mut events))
            } else {
                if let Some(pitch) = state.pitch.as_mut() {
                    log::debug!("Pitch {} ended, post-roll running", pitch.id);
                    pitch.post_roll = Some(PostRoll {
                        deadline: end + self.settings.post_roll,
                        done: HashSet::new(),
                    });
                }
                None
            }
        };
        self.publish(events);
        Ok(result)
    }

    /// Buffer a captured frame and write it to the active recorders.
    ///
    /// Returns the pitch summary when this frame completed a post-roll.
    pub fn record_frame(&self, frame: SharedFrame) -> Result<Option<PitchSummary>, PipelineError> {
        let mut events = Vec::new();
        let (closed, disk_check_due) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            state
                .pre_roll
                .get_mut(&frame.camera_id)
                .ok_or_else(|| PipelineError::UnknownCamera(frame.camera_id.clone()))?
                .push(Arc::clone(&frame));

            let Some(session) = state.session.as_mut() else {
                return Ok(None);
            };
            match session.recorder.write_frame(&frame) {
                Ok(()) => session.frames_written += 1,
                Err(e) => events.extend(self.write_failure("session", &e)),
            }
            let now = Instant::now();
            let disk_check_due = now >= session.next_disk_check;
            if disk_check_due {
                session.next_disk_check = now + self.settings.disk_check_interval;
            }

            (self.write_pitch_frame(state, &frame, &mut events), disk_check_due)
        };
        self.publish(events);

        if disk_check_due {
            self.check_disk();
        }
        Ok(closed)
    }

    fn write_pitch_frame(
        &self,
        state: &mut State,
        frame: &Frame,
        events: &mut Vec<ErrorEvent>,
    ) -> Option<PitchSummary> {
        let pitch = state.pitch.as_mut()?;
        let in_window = match &mut pitch.post_roll {
            Some(post) => {
                if frame.timestamp >= post.deadline {
                    post.done.insert(frame.camera_id.clone());
                }
                frame.timestamp <= post.deadline
            }
            None => true,
        };
        if in_window {
            match pitch.recorder.write_frame(frame) {
                Ok(()) => pitch.frames_written += 1,
                Err(e) => events.extend(self.write_failure("pitch", &e)),
            }
        }

        let post_roll_done = pitch
            .post_roll
            .as_ref()
            .is_some_and(|post| self.cameras.iter().all(|c| post.done.contains(c)));
        if post_roll_done || pitch.recorder.should_close() {
            let pitch = state.pitch.take()?;
            return Some(self.close_pitch(pitch, events));
        }
        None
    }

    fn close_pitch(&self, mut pitch: Pitch, events: &mut Vec<ErrorEvent>) -> PitchSummary {
        if let Err(e) = pitch.recorder.close() {
            events.push(
                ErrorEvent::new(
                    ErrorCategory::Recording,
                    Severity::Error,
                    SOURCE,
                    format!("Failed to close pitch {}", pitch.id),
                )
                .with_cause(&e),
            );
        }
        log::info!(
            "Pitch {} closed: {} frames ({} pre-roll)",
            pitch.id,
            pitch.frames_written,
            pitch.pre_roll_frames
        );
        PitchSummary {
            pitch_id: pitch.id,
            directory: pitch.directory,
            pre_roll_frames: pitch.pre_roll_frames,
            frames_written: pitch.frames_written,
        }
    }

    /// Re-check free space during a session; critical space stops the session.
    pub fn check_disk(&self) -> DiskStatus {
        let status = self.disk_status();
        match status {
            DiskStatus::Critical { available_gb } => {
                self.error_bus.publish(self.critical_space_event(available_gb));
                let reason = format!("disk space critical ({:.1} GB free)", available_gb);
                let callback = self
                    .stop_callback
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone();
                match callback {
                    Some(callback) => callback(&reason),
                    None => {
                        if let Err(e) = self.stop_session() {
                            log::debug!("Stop on critical disk space skipped: {}", e);
                        }
                    }
                }
            }
            DiskStatus::Warning { available_gb } => {
                if self.throttle.ready_with("disk-warning", Duration::from_secs(300)) {
                    self.error_bus.report(
                        ErrorCategory::Disk,
                        Severity::Warning,
                        SOURCE,
                        self.low_space_message(available_gb),
                    );
                }
            }
            DiskStatus::Ok { .. } | DiskStatus::Unknown => {}
        }
        status
    }

    pub fn is_session_active(&self) -> bool {
        self.lock().session.is_some()
    }

    pub fn session_name(&self) -> Option<String> {
        self.lock().session.as_ref().map(|s| s.name.clone())
    }

    /// Id of the open pitch, including one in post-roll.
    pub fn active_pitch(&self) -> Option<u32> {
        self.lock().pitch.as_ref().map(|p| p.id)
    }

    pub fn is_post_roll(&self) -> bool {
        self.lock()
            .pitch
            .as_ref()
            .is_some_and(|p| p.post_roll.is_some())
    }

    pub fn pre_roll_len(&self, camera: &str) -> Option<usize> {
        self.lock().pre_roll.get(camera).map(|b| b.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;
    use std::path::Path;

    type Log = Arc<Mutex<Vec<(String, u64)>>>;

    struct MemoryRecorder {
        directory: PathBuf,
        frames: Log,
        closed: Arc<Mutex<bool>>,
    }

    impl FrameRecorder for MemoryRecorder {
        fn start(&mut self) -> Result<(), RecorderError> {
            Ok(())
        }

        fn write_frame(&mut self, frame: &Frame) -> Result<(), RecorderError> {
            self.frames
                .lock()
                .unwrap()
                .push((frame.camera_id.clone(), frame.index));
            Ok(())
        }

        fn close(&mut self) -> Result<u64, RecorderError> {
            *self.closed.lock().unwrap() = true;
            Ok(self.frames.lock().unwrap().len() as u64)
        }

        fn directory(&self) -> &Path {
            &self.directory
        }
    }

    #[derive(Default)]
    struct MemoryFactory {
        session: Log,
        pitches: Mutex<Vec<(Log, Arc<Mutex<bool>>)>>,
    }

    impl RecorderFactory for MemoryFactory {
        fn session_recorder(&self, session: &str) -> Result<Box<dyn FrameRecorder>, RecorderError> {
            Ok(Box::new(MemoryRecorder {
                directory: PathBuf::from(session),
                frames: Arc::clone(&self.session),
                closed: Arc::default(),
            }))
        }

        fn pitch_recorder(
            &self,
            session_dir: &Path,
            pitch_id: u32,
        ) -> Result<Box<dyn FrameRecorder>, RecorderError> {
            let frames = Log::default();
            let closed = Arc::new(Mutex::new(false));
            self.pitches
                .lock()
                .unwrap()
                .push((Arc::clone(&frames), Arc::clone(&closed)));
            Ok(Box::new(MemoryRecorder {
                directory: session_dir.join(format!("pitch_{}", pitch_id)),
                frames,
                closed,
            }))
        }
    }

    struct FixedDisk(Option<u64>);

    impl DiskSpaceProbe for FixedDisk {
        fn available_bytes(&self, _: &Path) -> Option<u64> {
            self.0
        }
    }

    const GB: u64 = 1024 * 1024 * 1024;

    fn coordinator(
        settings: RecordingSettings,
        free: Option<u64>,
    ) -> (RecordingCoordinator, Arc<MemoryFactory>, Arc<ErrorEventBus>) {
        let factory = Arc::new(MemoryFactory::default());
        let bus = Arc::new(ErrorEventBus::default());
        let coordinator = RecordingCoordinator::new(
            &["left".to_string(), "right".to_string()],
            settings,
            Arc::clone(&factory) as Arc<dyn RecorderFactory>,
            Arc::new(FixedDisk(free)),
            Arc::clone(&bus),
        );
        (coordinator, factory, bus)
    }

    fn frame(camera: &str, index: u64, at: Instant) -> SharedFrame {
        Frame::new(camera, index, at, 1, 1, PixelFormat::Gray8, vec![0]).shared()
    }

    #[test]
    fn test_session_lifecycle_errors() {
        let (coordinator, _, _) = coordinator(RecordingSettings::default(), Some(100 * GB));
        assert!(matches!(coordinator.stop_session(), Err(PipelineError::NoActiveSession)));
        assert!(matches!(coordinator.start_pitch(), Err(PipelineError::NoActiveSession)));

        coordinator.start_session("s1").unwrap();
        assert!(matches!(
            coordinator.start_session("s2"),
            Err(PipelineError::SessionAlreadyActive)
        ));
        assert!(matches!(coordinator.stop_pitch(), Err(PipelineError::NoActivePitch)));
        assert_eq!(coordinator.stop_session().unwrap().name, "s1");
    }

    #[test]
    fn test_unknown_camera_rejected() {
        let (coordinator, _, _) = coordinator(RecordingSettings::default(), Some(100 * GB));
        assert!(matches!(
            coordinator.record_frame(frame("top", 0, Instant::now())),
            Err(PipelineError::UnknownCamera(_))
        ));
    }

    #[test]
    fn test_disk_warning_and_critical_at_start() {
        let (coordinator, _, bus) = coordinator(RecordingSettings::default(), Some(10 * GB));
        let info = coordinator.start_session("s").unwrap();
        assert!(info.disk_warning.unwrap().contains("Low disk space"));
        assert_eq!(bus.count(ErrorCategory::Disk), 1);

        let (coordinator, _, bus) = self::coordinator(RecordingSettings::default(), Some(GB));
        assert!(matches!(
            coordinator.start_session("s"),
            Err(PipelineError::InsufficientDiskSpace { .. })
        ));
        assert!(!coordinator.is_session_active());
        assert_eq!(bus.get_history(None, 10)[0].severity, Severity::Critical);
    }

    #[test]
    fn test_frames_outside_session_only_fill_pre_roll() {
        let (coordinator, factory, _) = coordinator(RecordingSettings::default(), Some(100 * GB));
        let base = Instant::now();
        for i in 0..3 {
            coordinator.record_frame(frame("left", i, base)).unwrap();
        }
        assert_eq!(coordinator.pre_roll_len("left"), Some(3));
        assert!(factory.session.lock().unwrap().is_empty());
    }

    #[test]
    fn test_pitch_with_pre_roll_and_post_roll() {
        let (coordinator, factory, _) = coordinator(RecordingSettings::default(), Some(100 * GB));
        let base = Instant::now();
        let at = |i: u64| base + Duration::from_millis(i * 1000 / 30);

        coordinator.start_session("bullpen").unwrap();
        // 2 seconds at 30fps on both cameras
        for i in 0..60 {
            coordinator.record_frame(frame("left", i, at(i))).unwrap();
            coordinator.record_frame(frame("right", i, at(i))).unwrap();
        }

        let start = coordinator.start_pitch().unwrap();
        assert_eq!(start.pitch_id, 1);
        let per_camera = start.pre_roll_frames / 2;
        assert!((14..=16).contains(&per_camera), "pre-roll {}", per_camera);

        for i in 60..75 {
            coordinator.record_frame(frame("left", i, at(i))).unwrap();
            coordinator.record_frame(frame("right", i, at(i))).unwrap();
        }
        assert_eq!(coordinator.stop_pitch_at(at(75)).unwrap(), None);
        assert!(coordinator.is_post_roll());

        // Post-roll of 500ms is 15 frames; left runs ahead of right
        let mut closed = None;
        for i in 75..100 {
            assert!(coordinator.record_frame(frame("left", i, at(i))).unwrap().is_none());
        }
        assert_eq!(coordinator.active_pitch(), Some(1));
        for i in 75..100 {
            if let Some(summary) = coordinator.record_frame(frame("right", i, at(i))).unwrap() {
                closed = Some((i, summary));
                break;
            }
        }
        let (closed_at, summary) = closed.expect("post-roll should close the pitch");
        assert_eq!(closed_at, 90);
        assert_eq!(coordinator.active_pitch(), None);

        let pitches = factory.pitches.lock().unwrap();
        let (frames, closed_flag) = &pitches[0];
        assert!(*closed_flag.lock().unwrap());
        let frames = frames.lock().unwrap();
        assert_eq!(frames.len() as u64, summary.frames_written);

        // Pre-roll is written oldest first, before any live frame
        let pre_roll = &frames[..summary.pre_roll_frames];
        assert!(pre_roll.iter().all(|(_, i)| *i < 60));
        assert_eq!(pre_roll.last().map(|(_, i)| *i), Some(59));
        let live_left = frames[summary.pre_roll_frames..]
            .iter()
            .filter(|(c, _)| c == "left")
            .count();
        // 60..=90 inclusive
        assert_eq!(live_left, 31);
        drop(frames);
        drop(pitches);

        let session = coordinator.stop_session().unwrap();
        assert_eq!(session.pitches, 1);
        // left 0..100 and right 0..=90
        assert_eq!(session.frames_written, 191);
        assert!(session.closed_pitch.is_none());
    }

    #[test]
    fn test_zero_post_roll_closes_immediately() {
        let settings = RecordingSettings {
            post_roll: Duration::ZERO,
            ..RecordingSettings::default()
        };
        let (coordinator, _, _) = coordinator(settings, Some(100 * GB));
        coordinator.start_session("s").unwrap();
        coordinator.start_pitch().unwrap();
        let summary = coordinator.stop_pitch().unwrap().unwrap();
        assert_eq!(summary.pitch_id, 1);
        assert!(matches!(coordinator.stop_pitch(), Err(PipelineError::NoActivePitch)));
    }

    #[test]
    fn test_stop_session_closes_open_pitch() {
        let (coordinator, _, _) = coordinator(RecordingSettings::default(), Some(100 * GB));
        coordinator.start_session("s").unwrap();
        coordinator.start_pitch().unwrap();
        let second = coordinator.start_pitch().unwrap();
        assert_eq!(second.pitch_id, 2);
        assert_eq!(second.closed_previous.unwrap().pitch_id, 1);

        let summary = coordinator.stop_session().unwrap();
        assert_eq!(summary.pitches, 2);
        assert_eq!(summary.closed_pitch.unwrap().pitch_id, 2);
    }

    struct SwitchDisk(Mutex<u64>);

    impl DiskSpaceProbe for SwitchDisk {
        fn available_bytes(&self, _: &Path) -> Option<u64> {
            Some(*self.0.lock().unwrap())
        }
    }

    #[test]
    fn test_disk_drop_during_session_stops_via_callback() {
        let disk = Arc::new(SwitchDisk(Mutex::new(100 * GB)));
        let bus = Arc::new(ErrorEventBus::default());
        let coordinator = Arc::new(RecordingCoordinator::new(
            &["left".to_string()],
            RecordingSettings {
                disk_check_interval: Duration::ZERO,
                ..RecordingSettings::default()
            },
            Arc::new(MemoryFactory::default()),
            Arc::clone(&disk) as Arc<dyn DiskSpaceProbe>,
            Arc::clone(&bus),
        ));
        let reasons = Arc::new(Mutex::new(Vec::new()));
        {
            let reasons = Arc::clone(&reasons);
            let weak = Arc::downgrade(&coordinator);
            coordinator.set_stop_session_callback(move |reason| {
                reasons.lock().unwrap().push(reason.to_string());
                if let Some(c) = weak.upgrade() {
                    c.stop_session().unwrap();
                }
            });
        }

        coordinator.start_session("s").unwrap();
        coordinator.record_frame(frame("left", 0, Instant::now())).unwrap();
        assert!(coordinator.is_session_active());

        *disk.0.lock().unwrap() = GB;
        coordinator.record_frame(frame("left", 1, Instant::now())).unwrap();
        assert!(!coordinator.is_session_active());
        assert_eq!(reasons.lock().unwrap().len(), 1);
        assert!(reasons.lock().unwrap()[0].contains("critical"));
    }
}

//! Composition root wiring the pipeline components behind one facade.
//!
//! The orchestrator owns every long-lived component, registers the default
//! recovery strategies, and runs recovery actions on a dedicated thread so
//! no component is ever restarted from one of its own threads.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};

use crate::camera::{CameraReconnectionManager, CameraState};
use crate::cleanup::{CleanupDiagnostics, CleanupManager, CleanupReport, CleanupTask};
use crate::config::Config;
use crate::detection::{DetectionThreadPool, Detector, PoolStats, PushOutcome, StereoCallback};
use crate::error::{BoxError, PipelineError};
use crate::events::{
    ErrorCategory, ErrorEvent, ErrorEventBus, EventBus, PipelineEvent, RecoveryAction,
    RecoveryStrategy, Severity, SubscriptionId,
};
use crate::frame::{CameraId, Detection, Frame, SharedFrame};
use crate::join::join_with_timeout;
use crate::monitor::{MetricsSampler, ResourceMetrics, ResourceMonitor, SystemSampler};
use crate::recording::{
    DiskSpaceProbe, ManifestRecorderFactory, PitchStart, PitchSummary, RecorderFactory,
    RecordingCoordinator, SessionInfo, SessionSummary, SystemDiskProbe,
};

const RECOVERY_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Work handed to the recovery thread.
#[derive(Debug, Clone, PartialEq)]
enum RecoveryRequest {
    RestartDetection,
    StopSession(String),
}

/// Pluggable collaborators; the defaults touch the real filesystem and host.
pub struct Collaborators {
    pub recorder_factory: Arc<dyn RecorderFactory>,
    pub disk_probe: Arc<dyn DiskSpaceProbe>,
    pub sampler: Box<dyn MetricsSampler>,
}

impl Collaborators {
    pub fn system(config: &Config) -> Self {
        Self {
            recorder_factory: Arc::new(ManifestRecorderFactory::new(
                config.recording.output_dir.clone(),
            )),
            disk_probe: Arc::new(SystemDiskProbe),
            sampler: Box::new(SystemSampler::new()),
        }
    }
}

/// Components shared with the recovery thread and the cleanup tasks.
struct Shared {
    events: EventBus<PipelineEvent>,
    detection: DetectionThreadPool,
    recording: RecordingCoordinator,
    capturing: AtomicBool,
    /// Held across every detection pool start or stop
    lifecycle: Mutex<()>,
    detection_restarts: AtomicU64,
    shutdown_requested: AtomicBool,
}

impl Shared {
    fn stop_session(&self) -> Result<SessionSummary, PipelineError> {
        let summary = self.recording.stop_session()?;
        if let Some(pitch) = &summary.closed_pitch {
            self.publish_pitch_ended(pitch);
        }
        self.events.publish(&PipelineEvent::SessionStopped {
            name: summary.name.clone(),
            frames_written: summary.frames_written,
            pitches: summary.pitches,
        });
        Ok(summary)
    }

    fn publish_pitch_ended(&self, pitch: &PitchSummary) {
        self.events.publish(&PipelineEvent::PitchEnded {
            pitch_id: pitch.pitch_id,
            frames_written: pitch.frames_written,
        });
    }

    fn start_capture(&self) -> Result<(), PipelineError> {
        let _lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        if self.capturing.load(Ordering::SeqCst) {
            return Err(PipelineError::AlreadyRunning("capture"));
        }
        self.detection.start()?;
        self.capturing.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop_capture(&self) -> bool {
        let _lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        if !self.capturing.swap(false, Ordering::SeqCst) {
            return true;
        }
        self.detection.stop()
    }

    fn restart_detection(&self) {
        let _lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        if !self.capturing.load(Ordering::SeqCst) {
            log::debug!("Detection restart skipped, capture is stopped");
            return;
        }
        log::warn!("Restarting detection pool");
        if !self.detection.stop() {
            log::warn!("Detection threads lingered during restart");
        }
        if !self.capturing.load(Ordering::SeqCst) {
            return;
        }
        match self.detection.start() {
            Ok(()) => {
                self.detection_restarts.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => log::error!("Detection pool restart failed: {}", e),
        }
    }

    fn handle(&self, request: RecoveryRequest) {
        match request {
            RecoveryRequest::RestartDetection => self.restart_detection(),
            RecoveryRequest::StopSession(reason) => match self.stop_session() {
                Ok(summary) => log::warn!("Session '{}' stopped: {}", summary.name, reason),
                Err(PipelineError::NoActiveSession) => {
                    log::debug!("Stop-session recovery with no session ({})", reason)
                }
                Err(e) => log::error!("Stop-session recovery failed: {}", e),
            },
        }
    }
}

struct RecoveryWorker {
    _cancel: Sender<()>,
    handle: JoinHandle<()>,
}

fn spawn_recovery(shared: Arc<Shared>, requests: Receiver<RecoveryRequest>) -> RecoveryWorker {
    let (cancel, cancelled) = bounded::<()>(0);
    let handle = thread::spawn(move || loop {
        select! {
            recv(requests) -> request => match request {
                Ok(request) => shared.handle(request),
                Err(_) => break,
            },
            recv(cancelled) -> _ => break,
        }
    });
    RecoveryWorker {
        _cancel: cancel,
        handle,
    }
}

/// Map an error event to the request its recovery strategy calls for.
fn recovery_request(
    event: &ErrorEvent,
    strategy: RecoveryStrategy,
    shutdown: &AtomicBool,
) -> Option<RecoveryRequest> {
    match strategy.action {
        RecoveryAction::Ignore => None,
        RecoveryAction::Retry => {
            log::debug!(
                "{} handles its own retries ({} max)",
                event.source,
                strategy.max_retries
            );
            None
        }
        // Overload escalations carry no failure streak; a restart would not drain them
        RecoveryAction::Restart
            if event.category == ErrorCategory::Detection
                && event.metadata.contains_key("consecutive_failures") =>
        {
            Some(RecoveryRequest::RestartDetection)
        }
        RecoveryAction::Restart => {
            log::warn!("No restart available for {} faults", event.category);
            None
        }
        RecoveryAction::StopSession => Some(RecoveryRequest::StopSession(event.message.clone())),
        RecoveryAction::Shutdown => {
            log::error!("Shutdown requested: {}", event.message);
            shutdown.store(true, Ordering::SeqCst);
            None
        }
    }
}

/// Facade over the whole pipeline core.
pub struct Orchestrator {
    config: Config,
    error_bus: Arc<ErrorEventBus>,
    shared: Arc<Shared>,
    reconnection: Arc<CameraReconnectionManager>,
    monitor: Option<Arc<ResourceMonitor>>,
    cleanup: CleanupManager,
    user_stereo: Arc<RwLock<Option<StereoCallback>>>,
    recovery: Mutex<Option<RecoveryWorker>>,
    recovery_subscription: SubscriptionId,
}

impl Orchestrator {
    /// Build the pipeline with filesystem recorders and host sampling.
    pub fn new(config: Config) -> Result<Self, PipelineError> {
        let collaborators = Collaborators::system(&config);
        Self::with_collaborators(config, collaborators)
    }

    /// Build the pipeline. Fails fast on an invalid configuration.
    pub fn with_collaborators(
        config: Config,
        collaborators: Collaborators,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let cameras: Vec<CameraId> = config.cameras.ids.clone();
        let error_bus = Arc::new(ErrorEventBus::default());
        register_default_strategies(&error_bus);

        let shared = Arc::new(Shared {
            events: EventBus::new("pipeline"),
            detection: DetectionThreadPool::new(
                &cameras,
                config.pool_settings(),
                Arc::clone(&error_bus),
            ),
            recording: RecordingCoordinator::new(
                &cameras,
                config.recording_settings(),
                collaborators.recorder_factory,
                collaborators.disk_probe,
                Arc::clone(&error_bus),
            ),
            capturing: AtomicBool::new(false),
            lifecycle: Mutex::new(()),
            detection_restarts: AtomicU64::new(0),
            shutdown_requested: AtomicBool::new(false),
        });

        let reconnection = Arc::new(CameraReconnectionManager::new(
            config.reconnect_settings(),
            Arc::clone(&error_bus),
        ));
        for camera in &cameras {
            reconnection.register_camera(camera);
        }

        let monitor = config.monitor.enabled.then(|| {
            Arc::new(ResourceMonitor::new(
                config.monitor_settings(),
                collaborators.sampler,
                Arc::clone(&error_bus),
            ))
        });

        let (requests, request_rx) = unbounded::<RecoveryRequest>();
        let recovery = spawn_recovery(Arc::clone(&shared), request_rx);
        let recovery_subscription = {
            let requests = requests.clone();
            let bus = Arc::downgrade(&error_bus);
            let shared = Arc::downgrade(&shared);
            error_bus.subscribe_all(move |event| {
                let (Some(bus), Some(shared)) = (bus.upgrade(), shared.upgrade()) else {
                    return Ok(());
                };
                let Some(strategy) = bus.recovery_for(event) else {
                    return Ok(());
                };
                if let Some(request) = recovery_request(event, strategy, &shared.shutdown_requested)
                {
                    requests.send(request)?;
                }
                Ok(())
            })
        };

        let orchestrator = Self {
            cleanup: CleanupManager::new(config.cleanup_timeout(), Arc::clone(&error_bus)),
            config,
            error_bus,
            shared,
            reconnection,
            monitor,
            user_stereo: Arc::new(RwLock::new(None)),
            recovery: Mutex::new(Some(recovery)),
            recovery_subscription,
        };
        orchestrator.wire(requests)?;
        Ok(orchestrator)
    }

    /// Connect component callbacks and register the shutdown sequence.
    fn wire(&self, requests: Sender<RecoveryRequest>) -> Result<(), PipelineError> {
        {
            let shared = Arc::downgrade(&self.shared);
            let user = Arc::clone(&self.user_stereo);
            self.shared
                .detection
                .set_stereo_callback(move |camera, frame, detections| {
                    if let Some(shared) = shared.upgrade() {
                        shared.events.publish(&PipelineEvent::DetectionsReady {
                            camera_id: camera.to_string(),
                            frame_index: frame.index,
                            detections: detections.to_vec(),
                        });
                    }
                    let callback = user.read().unwrap_or_else(|e| e.into_inner()).clone();
                    match callback {
                        Some(callback) => callback(camera, frame, detections),
                        None => Ok(()),
                    }
                });
        }
        {
            let shared = Arc::downgrade(&self.shared);
            self.reconnection.add_state_observer(move |camera, from, to| {
                if let Some(shared) = shared.upgrade() {
                    shared.events.publish(&PipelineEvent::CameraStateChanged {
                        camera_id: camera.to_string(),
                        from,
                        to,
                    });
                }
            });
        }
        self.shared.recording.set_stop_session_callback(move |reason| {
            let _ = requests.send(RecoveryRequest::StopSession(reason.to_string()));
        });

        let shared = Arc::clone(&self.shared);
        self.cleanup.register_task(
            CleanupTask::new("capture", move || {
                if shared.stop_capture() {
                    Ok(())
                } else {
                    Err("detection threads did not stop in time".into())
                }
            })
            .critical(),
        )?;

        let reconnection = Arc::clone(&self.reconnection);
        self.cleanup.register_task(CleanupTask::new("reconnection", move || {
            reconnection.shutdown();
            Ok(())
        }))?;

        let shared = Arc::clone(&self.shared);
        self.cleanup.register_task(
            CleanupTask::new("recording", move || match shared.stop_session() {
                Ok(_) | Err(PipelineError::NoActiveSession) => Ok(()),
                Err(e) => Err(Box::new(e) as BoxError),
            })
            .critical(),
        )?;

        if let Some(monitor) = &self.monitor {
            let monitor = Arc::clone(monitor);
            self.cleanup.register_task(CleanupTask::new("monitor", move || {
                if monitor.stop() {
                    Ok(())
                } else {
                    Err("resource monitor did not stop in time".into())
                }
            }))?;
        }
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cameras(&self) -> &[CameraId] {
        &self.config.cameras.ids
    }

    /// Bus carrying [`PipelineEvent`]s for UI and monitoring consumers.
    pub fn events(&self) -> &EventBus<PipelineEvent> {
        &self.shared.events
    }

    pub fn error_bus(&self) -> &Arc<ErrorEventBus> {
        &self.error_bus
    }

    pub fn set_detector<D: Detector + 'static>(&self, detector: D) {
        self.shared.detection.set_detect_callback(detector);
    }

    pub fn set_camera_detector<D: Detector + 'static>(
        &self,
        camera: &str,
        detector: D,
    ) -> Result<(), PipelineError> {
        self.shared.detection.set_camera_detector(camera, detector)
    }

    /// Receives every detection result after it is published as an event.
    pub fn set_stereo_callback<F>(&self, callback: F)
    where
        F: Fn(&str, &Frame, &[Detection]) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        *self.user_stereo.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(callback));
    }

    pub fn set_detection_escalation_callback<F>(&self, callback: F)
    where
        F: Fn(&str, u32) + Send + Sync + 'static,
    {
        self.shared.detection.set_error_callback(callback);
    }

    pub fn set_reconnect_callback<F>(&self, callback: F)
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.reconnection.set_reconnect_callback(callback);
    }

    /// Start detection and resource monitoring.
    pub fn start_capture(&self) -> Result<(), PipelineError> {
        if self.cleanup.is_in_progress() {
            return Err(PipelineError::CleanupInProgress);
        }
        self.shared.start_capture()?;
        if let Some(monitor) = &self.monitor {
            if let Err(e) = monitor.start() {
                log::debug!("Resource monitor: {}", e);
            }
        }
        log::info!("Capture started for {}", self.cameras().join(", "));
        Ok(())
    }

    pub fn stop_capture(&self) -> Result<(), PipelineError> {
        if !self.is_capturing() {
            return Err(PipelineError::NotRunning("capture"));
        }
        self.shared.stop_capture();
        if let Some(monitor) = &self.monitor {
            monitor.stop();
        }
        log::info!("Capture stopped");
        Ok(())
    }

    pub fn is_capturing(&self) -> bool {
        self.shared.capturing.load(Ordering::SeqCst)
    }

    /// Feed one captured frame into recording and detection.
    pub fn submit_frame(&self, frame: SharedFrame) -> Result<PushOutcome, PipelineError> {
        if !self.is_capturing() {
            return Err(PipelineError::NotRunning("capture"));
        }
        if let Some(pitch) = self.shared.recording.record_frame(Arc::clone(&frame))? {
            self.shared.publish_pitch_ended(&pitch);
        }
        self.shared.events.publish(&PipelineEvent::FrameCaptured {
            frame: Arc::clone(&frame),
        });
        self.shared.detection.enqueue_frame(frame)
    }

    pub fn start_session(&self, name: &str) -> Result<SessionInfo, PipelineError> {
        let info = self.shared.recording.start_session(name)?;
        self.shared.events.publish(&PipelineEvent::SessionStarted {
            name: info.name.clone(),
            directory: info.directory.clone(),
        });
        Ok(info)
    }

    pub fn stop_session(&self) -> Result<SessionSummary, PipelineError> {
        self.shared.stop_session()
    }

    pub fn start_pitch(&self) -> Result<PitchStart, PipelineError> {
        let start = self.shared.recording.start_pitch()?;
        if let Some(previous) = &start.closed_previous {
            self.shared.publish_pitch_ended(previous);
        }
        self.shared.events.publish(&PipelineEvent::PitchStarted {
            pitch_id: start.pitch_id,
            pre_roll_frames: start.pre_roll_frames,
        });
        Ok(start)
    }

    /// End the active pitch; it closes once post-roll completes on every camera.
    pub fn stop_pitch(&self) -> Result<Option<PitchSummary>, PipelineError> {
        let closed = self.shared.recording.stop_pitch()?;
        if let Some(pitch) = &closed {
            self.shared.publish_pitch_ended(pitch);
        }
        Ok(closed)
    }

    pub fn report_camera_disconnected(&self, camera: &str) -> Result<(), PipelineError> {
        self.reconnection.report_disconnection(camera)
    }

    pub fn report_camera_connected(&self, camera: &str) -> Result<(), PipelineError> {
        self.reconnection.report_connection_success(camera)
    }

    /// Bring a failed camera back under reconnection management.
    pub fn revive_camera(&self, camera: &str) -> Result<(), PipelineError> {
        if self.reconnection.get_state(camera).is_none() {
            return Err(PipelineError::UnknownCamera(camera.to_string()));
        }
        self.reconnection.register_camera(camera);
        Ok(())
    }

    pub fn camera_state(&self, camera: &str) -> Option<CameraState> {
        self.reconnection.get_state(camera)
    }

    pub fn detection_stats(&self) -> PoolStats {
        self.shared.detection.stats()
    }

    /// Times recovery has restarted the detection pool.
    pub fn detection_restarts(&self) -> u64 {
        self.shared.detection_restarts.load(Ordering::SeqCst)
    }

    pub fn latest_metrics(&self) -> Option<ResourceMetrics> {
        self.monitor.as_ref().and_then(|m| m.latest())
    }

    pub fn is_session_active(&self) -> bool {
        self.shared.recording.is_session_active()
    }

    /// Set when a recovery strategy asks for the process to shut down.
    pub fn shutdown_requested(&self) -> bool {
        self.shared.shutdown_requested.load(Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.shared.shutdown_requested.store(true, Ordering::SeqCst);
    }

    /// Run the shutdown sequence: capture, reconnection, recording, monitor.
    pub fn shutdown(&self) -> Result<CleanupReport, PipelineError> {
        self.request_shutdown();
        let report = self.cleanup.cleanup()?;
        self.stop_recovery();
        Ok(report)
    }

    pub fn verify_cleanup(&self) -> CleanupDiagnostics {
        self.cleanup.verify_cleanup()
    }

    fn stop_recovery(&self) {
        let worker = self.recovery.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(RecoveryWorker { _cancel: cancel, handle }) = worker {
            drop(cancel);
            join_with_timeout(handle, RECOVERY_JOIN_TIMEOUT, "recovery worker");
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.error_bus.unsubscribe(self.recovery_subscription);
        self.stop_recovery();
        self.shared.stop_capture();
    }
}

/// Recovery policy for faults the components cannot absorb on their own.
fn register_default_strategies(bus: &ErrorEventBus) {
    use RecoveryAction::*;
    for (category, action) in [
        (ErrorCategory::Detection, Restart),
        (ErrorCategory::Recording, StopSession),
        (ErrorCategory::Disk, StopSession),
        // The reconnection manager has already exhausted its retries
        (ErrorCategory::Camera, Ignore),
        (ErrorCategory::System, Shutdown),
    ] {
        bus.register_strategy(category, Severity::Critical, RecoveryStrategy::new(action));
    }
}

/// Session name from the current UTC time.
pub fn default_session_name() -> String {
    chrono::Utc::now().format("session_%Y%m%d_%H%M%S").to_string()
}

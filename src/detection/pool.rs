//! Detection thread pool with per-camera queues and a stereo stage.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::detector::Detector;
use super::dispatch::{DispatchMode, DispatchStrategy};
use super::queue::{DropOldestQueue, PushOutcome};
use super::stereo::{DetectionResult, StereoBuffer, StereoCallback};
use crate::error::{BoxError, PipelineError};
use crate::events::{ErrorCategory, ErrorEvent, ErrorEventBus, Severity};
use crate::frame::{CameraId, Detection, Frame, SharedFrame};
use crate::join::join_with_timeout;
use crate::throttle::{Throttle, DEFAULT_LOG_INTERVAL};

const SOURCE: &str = "detection-pool";

/// Called once per failure streak when a camera's detector hits the threshold.
pub type EscalationCallback = Arc<dyn Fn(&str, u32) + Send + Sync>;

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub mode: DispatchMode,
    /// Capacity of each per-camera input queue
    pub queue_capacity: usize,
    /// Capacity of the shared result queue feeding the stereo stage
    pub result_capacity: usize,
    /// Consecutive detector failures before escalation
    pub failure_threshold: u32,
    /// Results kept per camera in the stereo ring
    pub stereo_buffer: usize,
    /// Bounded wait of each dequeue
    pub dequeue_timeout: Duration,
    /// Bounded wait for each loop thread in `stop`
    pub join_timeout: Duration,
    /// Publish a critical event every this many drops on a queue
    pub drop_escalation_every: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            mode: DispatchMode::PerCamera,
            queue_capacity: 6,
            result_capacity: 32,
            failure_threshold: 10,
            stereo_buffer: 10,
            dequeue_timeout: Duration::from_millis(100),
            join_timeout: Duration::from_secs(2),
            drop_escalation_every: 100,
        }
    }
}

/// Per-camera input queue and bookkeeping.
pub(crate) struct CameraLane {
    camera_id: CameraId,
    queue: DropOldestQueue<SharedFrame>,
    /// Claimed by a shared worker while it processes this camera
    busy: AtomicBool,
    consecutive_failures: AtomicU32,
    processed: AtomicU64,
    failures: AtomicU64,
    detector: RwLock<Option<Arc<dyn Detector>>>,
}

impl CameraLane {
    fn new(camera_id: CameraId, capacity: usize) -> Self {
        Self {
            camera_id,
            queue: DropOldestQueue::new(capacity),
            busy: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            processed: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            detector: RwLock::new(None),
        }
    }

    pub(crate) fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub(crate) fn queue(&self) -> &DropOldestQueue<SharedFrame> {
        &self.queue
    }

    pub(crate) fn try_claim(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn release(&self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// State shared between the pool handle and its loop threads.
pub(crate) struct PoolShared {
    settings: PoolSettings,
    running: AtomicBool,
    lanes: Vec<Arc<CameraLane>>,
    results: DropOldestQueue<DetectionResult>,
    stereo: Mutex<StereoBuffer>,
    default_detector: RwLock<Option<Arc<dyn Detector>>>,
    stereo_callback: RwLock<Option<StereoCallback>>,
    escalation_callback: RwLock<Option<EscalationCallback>>,
    error_bus: Arc<ErrorEventBus>,
    log_throttle: Throttle<(CameraId, &'static str)>,
}

impl PoolShared {
    pub(crate) fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn lanes(&self) -> &[Arc<CameraLane>] {
        &self.lanes
    }

    fn lane(&self, camera: &str) -> Option<&Arc<CameraLane>> {
        self.lanes.iter().find(|l| l.camera_id == camera)
    }

    fn detector_for(&self, lane: &CameraLane) -> Option<Arc<dyn Detector>> {
        let own = lane
            .detector
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        own.or_else(|| {
            self.default_detector
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
        })
    }

    /// Run detection on one frame and hand the result to the stereo stage.
    pub(crate) fn process(&self, lane: &CameraLane, frame: SharedFrame) {
        let detections = self.detect(lane, &frame);
        let outcome = self.results.push(DetectionResult {
            camera_id: lane.camera_id.clone(),
            frame,
            detections,
        });
        if outcome.dropped() && self.log_throttle.ready((lane.camera_id.clone(), "results")) {
            log::warn!(
                "Stereo stage falling behind, dropped {} result(s) so far",
                self.results.dropped()
            );
        }
    }

    /// Call the detector, absorbing failures.
    ///
    /// Always returns a list; a failed call yields no detections so the
    /// downstream stages keep running.
    fn detect(&self, lane: &CameraLane, frame: &Frame) -> Vec<Detection> {
        let Some(detector) = self.detector_for(lane) else {
            if self.log_throttle.ready((lane.camera_id.clone(), "no-detector")) {
                log::warn!("No detector for camera {}, skipping frame", lane.camera_id);
            }
            return Vec::new();
        };

        let outcome: Result<Vec<Detection>, BoxError> =
            match panic::catch_unwind(AssertUnwindSafe(|| detector.detect(frame))) {
                Ok(Ok(detections)) => Ok(detections),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err("detector panicked".into()),
            };

        match outcome {
            Ok(detections) => {
                lane.consecutive_failures.store(0, Ordering::SeqCst);
                lane.processed.fetch_add(1, Ordering::Relaxed);
                detections
            }
            Err(e) => {
                lane.failures.fetch_add(1, Ordering::Relaxed);
                let streak = lane.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if self.log_throttle.ready((lane.camera_id.clone(), "detect")) {
                    log::error!(
                        "Detection failed for {} frame {} ({} consecutive): {}",
                        lane.camera_id,
                        frame.index,
                        streak,
                        e
                    );
                }
                if streak == self.settings.failure_threshold {
                    self.escalate_failures(&lane.camera_id, streak, &e);
                }
                Vec::new()
            }
        }
    }

    fn escalate_failures(&self, camera: &str, streak: u32, cause: &BoxError) {
        self.error_bus.publish(
            ErrorEvent::new(
                ErrorCategory::Detection,
                Severity::Critical,
                SOURCE,
                format!("Detector for {} failed {} times in a row", camera, streak),
            )
            .with_cause(cause)
            .with_meta("camera", camera)
            .with_meta("consecutive_failures", streak),
        );
        let callback = self
            .escalation_callback
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(callback) = callback {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(camera, streak))).is_err() {
                log::error!("Detection escalation callback panicked for {}", camera);
            }
        }
    }

    fn on_drop(&self, lane: &CameraLane, outcome: PushOutcome, dropped_before: u64) {
        let dropped = lane.queue.dropped();
        if outcome == PushOutcome::Lost {
            log::warn!(
                "Frame lost for {}: queue still full after evicting oldest",
                lane.camera_id
            );
        }
        if self.log_throttle.ready((lane.camera_id.clone(), "drop")) {
            log::warn!(
                "Detection queue full for {}, dropped {} frame(s) so far",
                lane.camera_id,
                dropped
            );
        }
        let every = self.settings.drop_escalation_every.max(1);
        if dropped / every > dropped_before / every {
            self.error_bus.publish(
                ErrorEvent::new(
                    ErrorCategory::Detection,
                    Severity::Critical,
                    SOURCE,
                    format!(
                        "Detection for {} is falling behind: {} frames dropped",
                        lane.camera_id, dropped
                    ),
                )
                .with_meta("camera", &lane.camera_id)
                .with_meta("dropped", dropped),
            );
        }
    }

    fn stereo_loop(&self) {
        let timeout = self.settings.dequeue_timeout;
        while self.is_running() {
            let Some(result) = self.results.pop_timeout(timeout) else {
                continue;
            };
            let result = Arc::new(result);
            self.stereo
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(Arc::clone(&result));

            let callback = self
                .stereo_callback
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            let Some(callback) = callback else {
                continue;
            };
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                callback(&result.camera_id, &result.frame, &result.detections)
            }));
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some("stereo callback panicked".to_string()),
            };
            if let Some(reason) = failure {
                if self.log_throttle.ready((result.camera_id.clone(), "stereo")) {
                    self.error_bus.publish(
                        ErrorEvent::new(
                            ErrorCategory::Stereo,
                            Severity::Error,
                            SOURCE,
                            format!("Stereo callback failed for {}", result.camera_id),
                        )
                        .with_cause(reason)
                        .with_meta("frame_index", result.frame.index),
                    );
                }
            }
        }
    }
}

/// Snapshot of one camera's queue and detector counters.
#[derive(Debug, Clone, PartialEq)]
pub struct LaneStats {
    pub camera_id: CameraId,
    pub queued: usize,
    pub enqueued: u64,
    pub dropped: u64,
    pub lost: u64,
    pub processed: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
}

/// Snapshot of the whole pool.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolStats {
    pub running: bool,
    pub cameras: Vec<LaneStats>,
    pub results_queued: usize,
    pub results_dropped: u64,
}

/// Schedules detection over per-camera bounded queues.
///
/// Frames enter through [`DetectionThreadPool::enqueue_frame`], which never
/// blocks: a full queue evicts its oldest frame. Detection loops follow the
/// configured [`DispatchMode`]; a single stereo loop consumes results.
pub struct DetectionThreadPool {
    shared: Arc<PoolShared>,
    strategy: Box<dyn DispatchStrategy>,
    threads: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl DetectionThreadPool {
    pub fn new(cameras: &[CameraId], settings: PoolSettings, error_bus: Arc<ErrorEventBus>) -> Self {
        let lanes = cameras
            .iter()
            .map(|id| Arc::new(CameraLane::new(id.clone(), settings.queue_capacity)))
            .collect();
        let strategy = settings.mode.strategy();
        Self {
            shared: Arc::new(PoolShared {
                results: DropOldestQueue::new(settings.result_capacity),
                stereo: Mutex::new(StereoBuffer::new(settings.stereo_buffer)),
                settings,
                running: AtomicBool::new(false),
                lanes,
                default_detector: RwLock::new(None),
                stereo_callback: RwLock::new(None),
                escalation_callback: RwLock::new(None),
                error_bus,
                log_throttle: Throttle::new(DEFAULT_LOG_INTERVAL),
            }),
            strategy,
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.shared.settings
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Set the detector used for every camera without its own override.
    pub fn set_detect_callback<D: Detector + 'static>(&self, detector: D) {
        *self
            .shared
            .default_detector
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(detector));
    }

    /// Use a specific detector for one camera.
    pub fn set_camera_detector<D: Detector + 'static>(
        &self,
        camera: &str,
        detector: D,
    ) -> Result<(), PipelineError> {
        let lane = self
            .shared
            .lane(camera)
            .ok_or_else(|| PipelineError::UnknownCamera(camera.to_string()))?;
        *lane.detector.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(detector));
        Ok(())
    }

    pub fn set_stereo_callback<F>(&self, callback: F)
    where
        F: Fn(&str, &Frame, &[Detection]) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        *self
            .shared
            .stereo_callback
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(callback));
    }

    /// Set the callback fired when a camera reaches the failure threshold.
    pub fn set_error_callback<F>(&self, callback: F)
    where
        F: Fn(&str, u32) + Send + Sync + 'static,
    {
        *self
            .shared
            .escalation_callback
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(callback));
    }

    /// Spawn the detection loops and the stereo loop.
    pub fn start(&self) -> Result<(), PipelineError> {
        for lane in &self.shared.lanes {
            if self.shared.detector_for(lane).is_none() {
                return Err(PipelineError::MissingDetector(lane.camera_id.clone()));
            }
        }
        if self
            .shared
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(PipelineError::AlreadyRunning("detection pool"));
        }

        let mut threads = self.threads.lock().unwrap_or_else(|e| e.into_inner());
        threads.extend(self.strategy.spawn(&self.shared));
        let shared = Arc::clone(&self.shared);
        threads.push((
            "stereo-matcher".to_string(),
            thread::spawn(move || shared.stereo_loop()),
        ));

        log::info!(
            "Detection pool started ({} mode, {} camera(s))",
            self.strategy.name(),
            self.shared.lanes.len()
        );
        Ok(())
    }

    /// Signal every loop to stop and join each with a bounded timeout.
    ///
    /// Idempotent. Returns false if some thread did not stop in time.
    pub fn stop(&self) -> bool {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return true;
        }
        let threads: Vec<_> = self
            .threads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        let mut all_joined = true;
        for (name, handle) in threads {
            all_joined &= join_with_timeout(handle, self.shared.settings.join_timeout, &name);
        }
        for lane in &self.shared.lanes {
            lane.release();
        }
        log::info!("Detection pool stopped");
        all_joined
    }

    /// Queue a frame for detection without blocking.
    pub fn enqueue_frame(&self, frame: SharedFrame) -> Result<PushOutcome, PipelineError> {
        let lane = self
            .shared
            .lane(&frame.camera_id)
            .ok_or_else(|| PipelineError::UnknownCamera(frame.camera_id.clone()))?;
        let dropped_before = lane.queue.dropped();
        let outcome = lane.queue.push(frame);
        if outcome.dropped() {
            self.shared.on_drop(lane, outcome, dropped_before);
        }
        Ok(outcome)
    }

    /// Remove every frame still queued for `camera`, oldest first.
    pub fn drain_queue(&self, camera: &str) -> Result<Vec<SharedFrame>, PipelineError> {
        let lane = self
            .shared
            .lane(camera)
            .ok_or_else(|| PipelineError::UnknownCamera(camera.to_string()))?;
        Ok(lane.queue.drain())
    }

    /// Results buffered for the stereo stage, oldest first.
    pub fn recent_results(&self, camera: &str) -> Vec<Arc<DetectionResult>> {
        self.shared
            .stereo
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .recent(camera)
    }

    pub fn consecutive_failures(&self, camera: &str) -> Option<u32> {
        self.shared
            .lane(camera)
            .map(|l| l.consecutive_failures.load(Ordering::SeqCst))
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            running: self.is_running(),
            cameras: self
                .shared
                .lanes
                .iter()
                .map(|lane| LaneStats {
                    camera_id: lane.camera_id.clone(),
                    queued: lane.queue.len(),
                    enqueued: lane.queue.pushed(),
                    dropped: lane.queue.dropped(),
                    lost: lane.queue.lost(),
                    processed: lane.processed.load(Ordering::Relaxed),
                    failures: lane.failures.load(Ordering::Relaxed),
                    consecutive_failures: lane.consecutive_failures.load(Ordering::SeqCst),
                })
                .collect(),
            results_queued: self.shared.results.len(),
            results_dropped: self.shared.results.dropped(),
        }
    }
}

impl Drop for DetectionThreadPool {
    fn drop(&mut self) {
        self.stop();
    }
}

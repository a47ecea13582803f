//! Per-camera reconnection state machine.
//!
//! A disconnected camera gets one background thread that retries the
//! reconnect callback with exponential backoff until it succeeds, the
//! camera is unregistered, or the attempt budget runs out.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use super::types::{CameraState, ReconnectSettings};
use crate::backoff::calculate_backoff;
use crate::error::PipelineError;
use crate::events::{ErrorCategory, ErrorEvent, ErrorEventBus, Severity};
use crate::frame::CameraId;
use crate::join::join_with_timeout;

const SOURCE: &str = "camera-reconnection";

/// Tries to reopen a camera. Returns true on success.
pub type ReconnectCallback = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Notified with `(camera, old_state, new_state)` on every transition.
pub type StateObserver = Arc<dyn Fn(&str, CameraState, CameraState) + Send + Sync>;

/// A running reconnection loop.
struct Worker {
    /// Dropping the sender wakes the loop and cancels it
    _cancel: Sender<()>,
    handle: JoinHandle<()>,
}

struct CameraEntry {
    state: CameraState,
    attempts: u32,
    /// Bumped on every (re)registration so stale loops can tell they are orphaned
    generation: u64,
    worker: Option<Worker>,
}

struct Inner {
    settings: ReconnectSettings,
    cameras: Mutex<HashMap<CameraId, CameraEntry>>,
    error_bus: Arc<ErrorEventBus>,
    reconnect: RwLock<Option<ReconnectCallback>>,
    observers: RwLock<Vec<StateObserver>>,
    next_generation: AtomicU64,
    shutting_down: AtomicBool,
}

impl Inner {
    fn cameras(&self) -> MutexGuard<'_, HashMap<CameraId, CameraEntry>> {
        self.cameras.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Invoke observers. Must be called without holding the camera lock.
    fn notify(&self, camera: &str, from: CameraState, to: CameraState) {
        if from == to {
            return;
        }
        let observers: Vec<StateObserver> = self
            .observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for observer in observers {
            if panic::catch_unwind(AssertUnwindSafe(|| observer(camera, from, to))).is_err() {
                log::error!("Camera state observer panicked on {} {} -> {}", camera, from, to);
            }
        }
    }

    fn try_reconnect(&self, camera: &str) -> bool {
        let callback = self
            .reconnect
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let Some(callback) = callback else {
            log::warn!("No reconnect callback set, cannot reconnect {}", camera);
            return false;
        };
        match panic::catch_unwind(AssertUnwindSafe(|| callback(camera))) {
            Ok(ok) => ok,
            Err(_) => {
                log::error!("Reconnect callback panicked for {}", camera);
                false
            }
        }
    }
}

/// Tracks camera connection state and drives reconnection with backoff.
pub struct CameraReconnectionManager {
    inner: Arc<Inner>,
}

impl CameraReconnectionManager {
    pub fn new(settings: ReconnectSettings, error_bus: Arc<ErrorEventBus>) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                cameras: Mutex::new(HashMap::new()),
                error_bus,
                reconnect: RwLock::new(None),
                observers: RwLock::new(Vec::new()),
                next_generation: AtomicU64::new(1),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn settings(&self) -> &ReconnectSettings {
        &self.inner.settings
    }

    /// Set the callback used to reopen a camera.
    pub fn set_reconnect_callback<F>(&self, callback: F)
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        *self
            .inner
            .reconnect
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(callback));
    }

    /// Register an observer for state transitions.
    ///
    /// Observers run with the manager's lock released and may call back
    /// into the manager.
    pub fn add_state_observer<F>(&self, observer: F)
    where
        F: Fn(&str, CameraState, CameraState) + Send + Sync + 'static,
    {
        self.inner
            .observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(observer));
    }

    /// Start tracking a camera in the connected state.
    ///
    /// Registering a camera that is already known cancels any running
    /// loop and resets it to connected; this is how a failed camera is
    /// revived.
    pub fn register_camera(&self, camera: &str) {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let (previous, stale) = {
            let mut cameras = self.inner.cameras();
            match cameras.get_mut(camera) {
                Some(entry) => {
                    let previous = entry.state;
                    entry.state = CameraState::Connected;
                    entry.attempts = 0;
                    entry.generation = generation;
                    (Some(previous), entry.worker.take())
                }
                None => {
                    cameras.insert(
                        camera.to_string(),
                        CameraEntry {
                            state: CameraState::Connected,
                            attempts: 0,
                            generation,
                            worker: None,
                        },
                    );
                    (None, None)
                }
            }
        };

        log::info!("Registered camera {}", camera);
        if let Some(worker) = stale {
            self.stop_worker(camera, worker);
        }
        if let Some(previous) = previous {
            self.inner.notify(camera, previous, CameraState::Connected);
        }
    }

    /// Stop tracking a camera, cancelling its reconnection loop.
    ///
    /// Returns false if the camera was not registered.
    pub fn unregister_camera(&self, camera: &str) -> bool {
        let removed = self.inner.cameras().remove(camera);
        match removed {
            Some(entry) => {
                if let Some(worker) = entry.worker {
                    self.stop_worker(camera, worker);
                }
                log::info!("Unregistered camera {}", camera);
                true
            }
            None => false,
        }
    }

    fn stop_worker(&self, camera: &str, worker: Worker) {
        let Worker { _cancel, handle } = worker;
        drop(_cancel);
        join_with_timeout(
            handle,
            self.inner.settings.join_timeout,
            &format!("reconnection loop for {}", camera),
        );
    }

    /// Report that a camera stopped delivering frames.
    ///
    /// No-op if the camera is already disconnected or failed. Otherwise
    /// the camera moves to disconnected, its attempt counter resets, and a
    /// reconnection loop starts unless one is already running.
    pub fn report_disconnection(&self, camera: &str) -> Result<(), PipelineError> {
        let previous = {
            let mut cameras = self.inner.cameras();
            let entry = cameras
                .get_mut(camera)
                .ok_or_else(|| PipelineError::UnknownCamera(camera.to_string()))?;

            match entry.state {
                CameraState::Disconnected => return Ok(()),
                CameraState::Failed => {
                    log::debug!("Ignoring disconnection of failed camera {}", camera);
                    return Ok(());
                }
                CameraState::Connected | CameraState::Reconnecting => {}
            }

            let previous = entry.state;
            entry.state = CameraState::Disconnected;
            entry.attempts = 0;

            if entry.worker.is_none() && !self.inner.shutting_down.load(Ordering::SeqCst) {
                entry.worker = Some(spawn_loop(
                    Arc::clone(&self.inner),
                    camera.to_string(),
                    entry.generation,
                ));
            }
            previous
        };

        self.inner.error_bus.publish(
            ErrorEvent::new(
                ErrorCategory::Camera,
                Severity::Warning,
                SOURCE,
                format!("Camera {} disconnected", camera),
            )
            .with_meta("camera", camera),
        );
        self.inner
            .notify(camera, previous, CameraState::Disconnected);
        Ok(())
    }

    /// Report that a camera is delivering frames again.
    ///
    /// No-op for a failed camera, which only comes back through
    /// [`register_camera`](Self::register_camera). A running loop notices the state change and exits before its next
    /// attempt.
    pub fn report_connection_success(&self, camera: &str) -> Result<(), PipelineError> {
        let previous = {
            let mut cameras = self.inner.cameras();
            let entry = cameras
                .get_mut(camera)
                .ok_or_else(|| PipelineError::UnknownCamera(camera.to_string()))?;
            if entry.state == CameraState::Failed {
                log::debug!("Ignoring connection of failed camera {}, register it again", camera);
                return Ok(());
            }
            let previous = entry.state;
            entry.state = CameraState::Connected;
            entry.attempts = 0;
            previous
        };
        self.inner.notify(camera, previous, CameraState::Connected);
        Ok(())
    }

    pub fn get_state(&self, camera: &str) -> Option<CameraState> {
        self.inner.cameras().get(camera).map(|e| e.state)
    }

    /// Reconnection attempts made since the last disconnection.
    pub fn attempts(&self, camera: &str) -> Option<u32> {
        self.inner.cameras().get(camera).map(|e| e.attempts)
    }

    /// True while a reconnection loop is alive for `camera`.
    pub fn is_reconnecting(&self, camera: &str) -> bool {
        self.inner
            .cameras()
            .get(camera)
            .is_some_and(|e| e.worker.is_some())
    }

    /// All registered cameras and their states, sorted by id.
    pub fn cameras(&self) -> Vec<(CameraId, CameraState)> {
        let mut list: Vec<_> = self
            .inner
            .cameras()
            .iter()
            .map(|(id, e)| (id.clone(), e.state))
            .collect();
        list.sort_by(|a, b| a.0.cmp(&b.0));
        list
    }

    /// Number of reconnection loops currently alive.
    pub fn active_loops(&self) -> usize {
        self.inner
            .cameras()
            .values()
            .filter(|e| e.worker.is_some())
            .count()
    }

    /// Cancel every reconnection loop and refuse to start new ones.
    pub fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let workers: Vec<(CameraId, Worker)> = self
            .inner
            .cameras()
            .iter_mut()
            .filter_map(|(id, e)| e.worker.take().map(|w| (id.clone(), w)))
            .collect();
        for (camera, worker) in workers {
            self.stop_worker(&camera, worker);
        }
    }
}

impl Drop for CameraReconnectionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_loop(inner: Arc<Inner>, camera: CameraId, generation: u64) -> Worker {
    let (cancel_tx, cancel_rx) = crossbeam_channel::bounded::<()>(0);
    let handle = thread::spawn(move || run_reconnect_loop(inner, camera, generation, cancel_rx));
    Worker {
        _cancel: cancel_tx,
        handle,
    }
}

/// Outcome of inspecting the camera entry at the top of each iteration.
enum Step {
    Attempt(u32),
    /// Budget spent; the entry is already marked failed. Holds the prior state.
    Failed(CameraState),
    Exit,
}

fn run_reconnect_loop(
    inner: Arc<Inner>,
    camera: CameraId,
    generation: u64,
    cancel: Receiver<()>,
) {
    let settings = inner.settings.clone();
    log::info!("Starting reconnection loop for {}", camera);

    let previous = loop {
        let step = {
            let mut cameras = inner.cameras();
            match cameras.get_mut(&camera) {
                Some(entry) if entry.generation == generation => {
                    if entry.state == CameraState::Connected {
                        entry.worker = None;
                        Step::Exit
                    } else if entry.attempts >= settings.max_attempts {
                        entry.worker = None;
                        let previous = entry.state;
                        entry.state = CameraState::Failed;
                        Step::Failed(previous)
                    } else {
                        Step::Attempt(entry.attempts)
                    }
                }
                _ => Step::Exit,
            }
        };

        let attempt = match step {
            Step::Attempt(n) => n,
            Step::Failed(previous) => break previous,
            Step::Exit => {
                log::debug!("Reconnection loop for {} exiting", camera);
                return;
            }
        };

        let delay = calculate_backoff(attempt, settings.base_delay, settings.max_delay);
        match cancel.recv_timeout(delay) {
            Err(RecvTimeoutError::Timeout) => {}
            _ => {
                log::debug!("Reconnection loop for {} cancelled", camera);
                return;
            }
        }

        let (previous, attempt) = {
            let mut cameras = inner.cameras();
            match cameras.get_mut(&camera) {
                Some(entry) if entry.generation == generation => {
                    if entry.state == CameraState::Connected {
                        entry.worker = None;
                        return;
                    }
                    entry.attempts += 1;
                    let previous = entry.state;
                    entry.state = CameraState::Reconnecting;
                    (previous, entry.attempts)
                }
                _ => return,
            }
        };
        inner.notify(&camera, previous, CameraState::Reconnecting);

        log::info!(
            "Reconnecting {} (attempt {}/{}, waited {:?})",
            camera,
            attempt,
            settings.max_attempts,
            delay
        );

        if inner.try_reconnect(&camera) {
            let previous = {
                let mut cameras = inner.cameras();
                match cameras.get_mut(&camera) {
                    Some(entry) if entry.generation == generation => {
                        let previous = entry.state;
                        entry.state = CameraState::Connected;
                        entry.attempts = 0;
                        entry.worker = None;
                        previous
                    }
                    _ => return,
                }
            };
            inner.error_bus.publish(
                ErrorEvent::new(
                    ErrorCategory::Camera,
                    Severity::Info,
                    SOURCE,
                    format!("Camera {} reconnected after {} attempt(s)", camera, attempt),
                )
                .with_meta("camera", &camera)
                .with_meta("attempts", attempt),
            );
            inner.notify(&camera, previous, CameraState::Connected);
            return;
        }

        log::warn!(
            "Reconnect attempt {}/{} for {} failed",
            attempt,
            settings.max_attempts,
            camera
        );
    };

    inner.error_bus.publish(
        ErrorEvent::new(
            ErrorCategory::Camera,
            Severity::Critical,
            SOURCE,
            format!(
                "Camera {} failed to reconnect after {} attempts",
                camera, settings.max_attempts
            ),
        )
        .with_meta("camera", &camera)
        .with_meta("attempts", settings.max_attempts),
    );
    inner.notify(&camera, previous, CameraState::Failed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn settings(max_attempts: u32, base_ms: u64, max_ms: u64) -> ReconnectSettings {
        ReconnectSettings {
            max_attempts,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            join_timeout: Duration::from_secs(2),
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_register_starts_connected() {
        let manager =
            CameraReconnectionManager::new(settings(3, 10, 100), Arc::new(ErrorEventBus::default()));
        manager.register_camera("left");
        assert_eq!(manager.get_state("left"), Some(CameraState::Connected));
        assert_eq!(manager.get_state("right"), None);
    }

    #[test]
    fn test_unknown_camera_is_error() {
        let manager =
            CameraReconnectionManager::new(settings(3, 10, 100), Arc::new(ErrorEventBus::default()));
        assert!(matches!(
            manager.report_disconnection("nope"),
            Err(PipelineError::UnknownCamera(_))
        ));
    }

    #[test]
    fn test_successful_reconnect() {
        let bus = Arc::new(ErrorEventBus::default());
        let manager = CameraReconnectionManager::new(settings(3, 20, 200), Arc::clone(&bus));
        manager.set_reconnect_callback(|_| true);
        manager.register_camera("left");

        manager.report_disconnection("left").unwrap();
        assert!(wait_for(
            || manager.get_state("left") == Some(CameraState::Connected),
            Duration::from_secs(1)
        ));
        assert_eq!(manager.attempts("left"), Some(0));
        assert!(wait_for(|| manager.active_loops() == 0, Duration::from_secs(1)));
    }

    #[test]
    fn test_disconnection_is_idempotent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let manager =
            CameraReconnectionManager::new(settings(3, 50, 200), Arc::new(ErrorEventBus::default()));
        {
            let calls = Arc::clone(&calls);
            manager.set_reconnect_callback(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                true
            });
        }
        manager.register_camera("left");

        manager.report_disconnection("left").unwrap();
        manager.report_disconnection("left").unwrap();
        manager.report_disconnection("left").unwrap();
        assert_eq!(manager.active_loops(), 1);

        assert!(wait_for(
            || manager.get_state("left") == Some(CameraState::Connected),
            Duration::from_secs(1)
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_observer_can_reenter_manager() {
        let manager = Arc::new(CameraReconnectionManager::new(
            settings(3, 10, 100),
            Arc::new(ErrorEventBus::default()),
        ));
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let weak = Arc::downgrade(&manager);
            let seen = Arc::clone(&seen);
            manager.add_state_observer(move |camera, _from, to| {
                // Reading state from inside the observer must not deadlock
                let current = weak.upgrade().and_then(|m| m.get_state(camera));
                seen.lock().unwrap().push((to, current));
            });
        }
        manager.set_reconnect_callback(|_| true);
        manager.register_camera("left");
        manager.report_disconnection("left").unwrap();

        assert!(wait_for(
            || manager.get_state("left") == Some(CameraState::Connected),
            Duration::from_secs(1)
        ));
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], (CameraState::Disconnected, Some(CameraState::Disconnected)));
        assert!(seen.iter().any(|(to, _)| *to == CameraState::Reconnecting));
        assert_eq!(seen.last().map(|s| s.0), Some(CameraState::Connected));
    }

    #[test]
    fn test_unregister_cancels_loop() {
        let manager =
            CameraReconnectionManager::new(settings(3, 5_000, 10_000), Arc::new(ErrorEventBus::default()));
        manager.set_reconnect_callback(|_| false);
        manager.register_camera("left");
        manager.report_disconnection("left").unwrap();
        assert!(manager.is_reconnecting("left"));

        let start = Instant::now();
        assert!(manager.unregister_camera("left"));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(manager.get_state("left"), None);
        assert!(!manager.unregister_camera("left"));
    }

    #[test]
    fn test_external_success_stops_loop() {
        let manager =
            CameraReconnectionManager::new(settings(3, 100, 200), Arc::new(ErrorEventBus::default()));
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = Arc::clone(&calls);
            manager.set_reconnect_callback(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                false
            });
        }
        manager.register_camera("left");
        manager.report_disconnection("left").unwrap();
        manager.report_connection_success("left").unwrap();

        assert!(wait_for(|| manager.active_loops() == 0, Duration::from_secs(1)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(manager.get_state("left"), Some(CameraState::Connected));
    }

    #[test]
    fn test_reregistration_revives_failed_camera() {
        let bus = Arc::new(ErrorEventBus::default());
        let manager = CameraReconnectionManager::new(settings(1, 5, 10), Arc::clone(&bus));
        manager.set_reconnect_callback(|_| false);
        manager.register_camera("left");
        manager.report_disconnection("left").unwrap();
        assert!(wait_for(
            || manager.get_state("left") == Some(CameraState::Failed),
            Duration::from_secs(1)
        ));

        // Failed is terminal for disconnection reports
        manager.report_disconnection("left").unwrap();
        assert_eq!(manager.get_state("left"), Some(CameraState::Failed));

        manager.register_camera("left");
        assert_eq!(manager.get_state("left"), Some(CameraState::Connected));
    }

    #[test]
    fn test_connection_success_ignored_for_failed_camera() {
        let manager =
            CameraReconnectionManager::new(settings(1, 5, 10), Arc::new(ErrorEventBus::default()));
        let transitions = Arc::new(Mutex::new(Vec::new()));
        {
            let transitions = Arc::clone(&transitions);
            manager.add_state_observer(move |_, _, to| transitions.lock().unwrap().push(to));
        }
        manager.set_reconnect_callback(|_| false);
        manager.register_camera("left");
        manager.report_disconnection("left").unwrap();
        assert!(wait_for(
            || manager.get_state("left") == Some(CameraState::Failed),
            Duration::from_secs(1)
        ));

        manager.report_connection_success("left").unwrap();
        assert_eq!(manager.get_state("left"), Some(CameraState::Failed));
        assert_eq!(transitions.lock().unwrap().last(), Some(&CameraState::Failed));
    }

    #[test]
    fn test_disconnection_during_last_attempt_restarts_budget() {
        let manager = Arc::new(CameraReconnectionManager::new(
            settings(2, 5, 10),
            Arc::new(ErrorEventBus::default()),
        ));
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let weak = Arc::downgrade(&manager);
            let calls = Arc::clone(&calls);
            manager.set_reconnect_callback(move |camera| {
                // The camera drops again while the final attempt is in flight
                if calls.fetch_add(1, Ordering::SeqCst) == 1 {
                    if let Some(manager) = weak.upgrade() {
                        manager.report_disconnection(camera).unwrap();
                    }
                }
                false
            });
        }
        manager.register_camera("left");
        manager.report_disconnection("left").unwrap();

        assert!(wait_for(
            || manager.get_state("left") == Some(CameraState::Failed),
            Duration::from_secs(2)
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(manager.attempts("left"), Some(2));
        assert!(wait_for(|| manager.active_loops() == 0, Duration::from_secs(1)));
    }

    #[test]
    fn test_shutdown_prevents_new_loops() {
        let manager =
            CameraReconnectionManager::new(settings(3, 5_000, 10_000), Arc::new(ErrorEventBus::default()));
        manager.register_camera("left");
        manager.shutdown();
        manager.report_disconnection("left").unwrap();
        assert_eq!(manager.active_loops(), 0);
        assert_eq!(manager.get_state("left"), Some(CameraState::Disconnected));
    }
}

//! Ordered, timeout-bounded shutdown tasks.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, RecvTimeoutError};

use crate::error::{BoxError, PipelineError};
use crate::events::{ErrorCategory, ErrorEvent, ErrorEventBus, Severity};
use crate::monitor::count_entries;

const SOURCE: &str = "cleanup";

pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(5);

type CleanupFn = Arc<dyn Fn() -> Result<(), BoxError> + Send + Sync>;

/// A named shutdown step.
#[derive(Clone)]
pub struct CleanupTask {
    name: String,
    callback: CleanupFn,
    timeout: Option<Duration>,
    critical: bool,
}

impl CleanupTask {
    pub fn new<F>(name: impl Into<String>, callback: F) -> Self
    where
        F: Fn() -> Result<(), BoxError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            callback: Arc::new(callback),
            timeout: None,
            critical: false,
        }
    }

    /// Override the manager's default timeout for this task.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// A failed critical task makes the whole cleanup fail.
    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_critical(&self) -> bool {
        self.critical
    }
}

impl fmt::Debug for CleanupTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupTask")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("critical", &self.critical)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed,
    Failed(String),
    TimedOut(Duration),
}

impl TaskOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, TaskOutcome::Completed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskReport {
    pub name: String,
    pub critical: bool,
    pub outcome: TaskOutcome,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CleanupReport {
    /// Per-task outcomes in execution order
    pub tasks: Vec<TaskReport>,
    /// False if any critical task failed or timed out
    pub success: bool,
    pub elapsed: Duration,
}

impl CleanupReport {
    pub fn failed(&self) -> impl Iterator<Item = &TaskReport> {
        self.tasks.iter().filter(|t| !t.outcome.is_ok())
    }
}

/// Snapshot of what a cleanup run may have left behind.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanupDiagnostics {
    pub registered_tasks: usize,
    pub in_progress: bool,
    /// Tasks whose thread was still running after its timeout
    pub lingering_tasks: Vec<String>,
    /// Threads in this process, where the platform exposes it
    pub thread_count: Option<usize>,
    pub last_success: Option<bool>,
}

/// Runs registered shutdown tasks in order, each under its own timeout.
pub struct CleanupManager {
    default_timeout: Duration,
    tasks: Mutex<Vec<CleanupTask>>,
    in_progress: AtomicBool,
    lingering: Mutex<Vec<(String, JoinHandle<()>)>>,
    last_success: Mutex<Option<bool>>,
    error_bus: Arc<ErrorEventBus>,
}

impl CleanupManager {
    pub fn new(default_timeout: Duration, error_bus: Arc<ErrorEventBus>) -> Self {
        Self {
            default_timeout,
            tasks: Mutex::new(Vec::new()),
            in_progress: AtomicBool::new(false),
            lingering: Mutex::new(Vec::new()),
            last_success: Mutex::new(None),
            error_bus,
        }
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<CleanupTask>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a task. Tasks run in registration order.
    pub fn register_task(&self, task: CleanupTask) -> Result<(), PipelineError> {
        if self.in_progress.load(Ordering::SeqCst) {
            return Err(PipelineError::CleanupInProgress);
        }
        log::debug!("Registered cleanup task '{}'", task.name);
        self.tasks().push(task);
        Ok(())
    }

    /// Remove every task named `name`. Returns whether one was removed.
    pub fn unregister_task(&self, name: &str) -> Result<bool, PipelineError> {
        if self.in_progress.load(Ordering::SeqCst) {
            return Err(PipelineError::CleanupInProgress);
        }
        let mut tasks = self.tasks();
        let before = tasks.len();
        tasks.retain(|t| t.name != name);
        Ok(tasks.len() != before)
    }

    pub fn task_names(&self) -> Vec<String> {
        self.tasks().iter().map(|t| t.name.clone()).collect()
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Run every task once, in order.
    ///
    /// A concurrent call fails immediately with `CleanupInProgress` and
    /// leaves the running pass untouched.
    pub fn cleanup(&self) -> Result<CleanupReport, PipelineError> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::warn!("Cleanup already in progress");
            return Err(PipelineError::CleanupInProgress);
        }

        let tasks: Vec<CleanupTask> = self.tasks().clone();
        log::info!("Running {} cleanup task(s)", tasks.len());
        let started = Instant::now();

        let mut reports = Vec::with_capacity(tasks.len());
        for task in &tasks {
            let report = self.run_task(task);
            if !report.outcome.is_ok() {
                self.report_failure(&report);
            }
            reports.push(report);
        }

        let success = !reports.iter().any(|r| r.critical && !r.outcome.is_ok());
        *self.last_success.lock().unwrap_or_else(|e| e.into_inner()) = Some(success);
        self.in_progress.store(false, Ordering::SeqCst);

        let report = CleanupReport {
            tasks: reports,
            success,
            elapsed: started.elapsed(),
        };
        log::info!(
            "Cleanup finished in {:?}: {} failed, success={}",
            report.elapsed,
            report.failed().count(),
            report.success
        );
        Ok(report)
    }

    fn run_task(&self, task: &CleanupTask) -> TaskReport {
        let timeout = task.timeout.unwrap_or(self.default_timeout);
        let started = Instant::now();
        let (tx, rx) = bounded::<Result<(), String>>(1);
        let callback = Arc::clone(&task.callback);

        let spawned = thread::Builder::new()
            .name(format!("cleanup-{}", task.name))
            .spawn(move || {
                let result = callback().map_err(|e| e.to_string());
                let _ = tx.send(result);
            });

        let outcome = match spawned {
            Err(e) => TaskOutcome::Failed(format!("could not spawn task thread: {}", e)),
            Ok(handle) => match rx.recv_timeout(timeout) {
                Ok(Ok(())) => {
                    let _ = handle.join();
                    TaskOutcome::Completed
                }
                Ok(Err(e)) => {
                    let _ = handle.join();
                    TaskOutcome::Failed(e)
                }
                // Sender dropped without a result: the task panicked
                Err(RecvTimeoutError::Disconnected) => {
                    let _ = handle.join();
                    TaskOutcome::Failed("task panicked".to_string())
                }
                Err(RecvTimeoutError::Timeout) => {
                    self.lingering
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push((task.name.clone(), handle));
                    TaskOutcome::TimedOut(timeout)
                }
            },
        };

        let elapsed = started.elapsed();
        log::debug!("Cleanup task '{}' -> {:?} in {:?}", task.name, outcome, elapsed);
        TaskReport {
            name: task.name.clone(),
            critical: task.critical,
            outcome,
            elapsed,
        }
    }

    fn report_failure(&self, report: &TaskReport) {
        let severity = if report.critical {
            Severity::Error
        } else {
            Severity::Warning
        };
        let reason = match &report.outcome {
            TaskOutcome::Failed(e) => e.clone(),
            TaskOutcome::TimedOut(t) => format!("timed out after {:?}", t),
            TaskOutcome::Completed => return,
        };
        self.error_bus.publish(
            ErrorEvent::new(
                ErrorCategory::Cleanup,
                severity,
                SOURCE,
                format!("Cleanup task '{}' failed", report.name),
            )
            .with_cause(reason)
            .with_meta("critical", report.critical),
        );
    }

    /// Diagnostic snapshot. Reaps lingering task threads that have since finished.
    pub fn verify_cleanup(&self) -> CleanupDiagnostics {
        let lingering_tasks = {
            let mut lingering = self.lingering.lock().unwrap_or_else(|e| e.into_inner());
            let (finished, running): (Vec<_>, Vec<_>) =
                lingering.drain(..).partition(|(_, h)| h.is_finished());
            for (_, handle) in finished {
                let _ = handle.join();
            }
            *lingering = running;
            lingering.iter().map(|(name, _)| name.clone()).collect()
        };
        CleanupDiagnostics {
            registered_tasks: self.tasks().len(),
            in_progress: self.is_in_progress(),
            lingering_tasks,
            thread_count: count_entries("/proc/self/task"),
            last_success: *self.last_success.lock().unwrap_or_else(|e| e.into_inner()),
        }
    }
}

//! Background resource sampling with throttled threshold alerts.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use serde::Serialize;
use sysinfo::{Pid, System};

use crate::error::PipelineError;
use crate::events::{ErrorCategory, ErrorEvent, ErrorEventBus, Severity};
use crate::join::join_with_timeout;
use crate::throttle::Throttle;

const SOURCE: &str = "resource-monitor";

/// One resource snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceMetrics {
    pub timestamp: DateTime<Utc>,
    /// System-wide CPU usage averaged over all cores
    pub cpu_percent: f32,
    /// System memory in use
    pub memory_percent: f32,
    /// Resident memory of this process
    pub process_memory_mb: f64,
    pub thread_count: Option<usize>,
    pub open_files: Option<usize>,
}

impl ResourceMetrics {
    fn value(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::Cpu => Some(self.cpu_percent as f64),
            Metric::Memory => Some(self.memory_percent as f64),
            Metric::Threads => self.thread_count.map(|n| n as f64),
            Metric::OpenFiles => self.open_files.map(|n| n as f64),
        }
    }
}

/// Produces resource snapshots.
pub trait MetricsSampler: Send {
    fn sample(&mut self) -> ResourceMetrics;
}

/// Samples the host and current process via `sysinfo` and `/proc`.
pub struct SystemSampler {
    system: System,
    pid: Option<Pid>,
}

impl SystemSampler {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                log::warn!("Cannot resolve own pid, process memory unavailable: {}", e);
                None
            }
        };
        Self {
            system: System::new(),
            pid,
        }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSampler for SystemSampler {
    fn sample(&mut self) -> ResourceMetrics {
        self.system.refresh_cpu();
        self.system.refresh_memory();

        let cpus = self.system.cpus();
        let cpu_percent = if cpus.is_empty() {
            0.0
        } else {
            cpus.iter().map(|cpu| cpu.cpu_usage()).sum::<f32>() / cpus.len() as f32
        };
        let total = self.system.total_memory();
        let memory_percent = if total > 0 {
            self.system.used_memory() as f32 / total as f32 * 100.0
        } else {
            0.0
        };
        let process_memory_mb = self
            .pid
            .filter(|pid| self.system.refresh_process(*pid))
            .and_then(|pid| self.system.process(pid))
            .map(|p| p.memory() as f64 / (1024.0 * 1024.0))
            .unwrap_or(0.0);

        ResourceMetrics {
            timestamp: Utc::now(),
            cpu_percent,
            memory_percent,
            process_memory_mb,
            thread_count: count_entries("/proc/self/task"),
            open_files: count_entries("/proc/self/fd"),
        }
    }
}

/// Number of entries in a `/proc` directory; `None` where `/proc` is absent.
pub(crate) fn count_entries(dir: &str) -> Option<usize> {
    std::fs::read_dir(dir).ok().map(|entries| entries.count())
}

/// Monitored metric, used as the alert throttle key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    Cpu,
    Memory,
    Threads,
    OpenFiles,
}

impl Metric {
    const ALL: [Metric; 4] = [Metric::Cpu, Metric::Memory, Metric::Threads, Metric::OpenFiles];
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Metric::Cpu => "cpu_percent",
            Metric::Memory => "memory_percent",
            Metric::Threads => "thread_count",
            Metric::OpenFiles => "open_files",
        };
        f.write_str(name)
    }
}

/// Warning and critical level for one metric.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Threshold {
    pub warning: f64,
    pub critical: f64,
}

impl Threshold {
    pub const fn new(warning: f64, critical: f64) -> Self {
        Self { warning, critical }
    }

    fn classify(&self, value: f64) -> Option<Severity> {
        if value >= self.critical {
            Some(Severity::Critical)
        } else if value >= self.warning {
            Some(Severity::Warning)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub cpu: Threshold,
    pub memory: Threshold,
    pub threads: Threshold,
    pub open_files: Threshold,
}

impl Thresholds {
    pub fn get(&self, metric: Metric) -> Threshold {
        match metric {
            Metric::Cpu => self.cpu,
            Metric::Memory => self.memory,
            Metric::Threads => self.threads,
            Metric::OpenFiles => self.open_files,
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu: Threshold::new(80.0, 95.0),
            memory: Threshold::new(80.0, 95.0),
            threads: Threshold::new(200.0, 500.0),
            open_files: Threshold::new(512.0, 1000.0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub interval: Duration,
    /// Snapshots kept in history
    pub history: usize,
    pub thresholds: Thresholds,
    pub warning_cooldown: Duration,
    pub critical_cooldown: Duration,
    pub join_timeout: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            history: 120,
            thresholds: Thresholds::default(),
            warning_cooldown: Duration::from_secs(120),
            critical_cooldown: Duration::from_secs(60),
            join_timeout: Duration::from_secs(2),
        }
    }
}

struct Inner {
    settings: MonitorSettings,
    sampler: Mutex<Box<dyn MetricsSampler>>,
    history: Mutex<VecDeque<ResourceMetrics>>,
    alerts: Throttle<(Metric, Severity)>,
    error_bus: Arc<ErrorEventBus>,
}

impl Inner {
    fn sample(&self) -> Option<ResourceMetrics> {
        let mut sampler = self.sampler.lock().unwrap_or_else(|e| e.into_inner());
        match panic::catch_unwind(AssertUnwindSafe(|| sampler.sample())) {
            Ok(metrics) => Some(metrics),
            Err(_) => {
                log::error!("Resource sampler panicked");
                None
            }
        }
    }

    fn record(&self, metrics: ResourceMetrics) {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.push_back(metrics);
        while history.len() > self.settings.history.max(1) {
            history.pop_front();
        }
    }

    fn evaluate(&self, metrics: &ResourceMetrics) -> usize {
        let mut published = 0;
        for metric in Metric::ALL {
            let Some(value) = metrics.value(metric) else {
                continue;
            };
            let threshold = self.settings.thresholds.get(metric);
            let Some(severity) = threshold.classify(value) else {
                continue;
            };
            let (cooldown, limit) = if severity == Severity::Critical {
                (self.settings.critical_cooldown, threshold.critical)
            } else {
                (self.settings.warning_cooldown, threshold.warning)
            };
            if !self.alerts.ready_with((metric, severity), cooldown) {
                continue;
            }
            self.error_bus.publish(
                ErrorEvent::new(
                    ErrorCategory::Resource,
                    severity,
                    SOURCE,
                    format!("{} at {:.1} exceeds {:.1}", metric, value, limit),
                )
                .with_meta("metric", metric)
                .with_meta("value", format!("{:.1}", value))
                .with_meta("threshold", limit),
            );
            published += 1;
        }
        published
    }
}

struct Worker {
    _cancel: Sender<()>,
    handle: JoinHandle<()>,
}

/// Samples resources on a background thread and alerts on threshold breaches.
///
/// A sustained breach produces one event per cool-down window and severity.
pub struct ResourceMonitor {
    inner: Arc<Inner>,
    worker: Mutex<Option<Worker>>,
}

impl ResourceMonitor {
    pub fn new(
        settings: MonitorSettings,
        sampler: Box<dyn MetricsSampler>,
        error_bus: Arc<ErrorEventBus>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                sampler: Mutex::new(sampler),
                history: Mutex::new(VecDeque::new()),
                alerts: Throttle::new(Duration::from_secs(60)),
                error_bus,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Monitor backed by [`SystemSampler`].
    pub fn with_system_sampler(settings: MonitorSettings, error_bus: Arc<ErrorEventBus>) -> Self {
        Self::new(settings, Box::new(SystemSampler::new()), error_bus)
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.inner.settings
    }

    pub fn start(&self) -> Result<(), PipelineError> {
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if worker.is_some() {
            return Err(PipelineError::AlreadyRunning("resource monitor"));
        }
        let (cancel, cancelled) = bounded::<()>(0);
        let inner = Arc::clone(&self.inner);
        let handle = thread::spawn(move || loop {
            if let Some(metrics) = inner.sample() {
                inner.evaluate(&metrics);
                inner.record(metrics);
            }
            match cancelled.recv_timeout(inner.settings.interval) {
                Err(RecvTimeoutError::Timeout) => continue,
                _ => break,
            }
        });
        *worker = Some(Worker {
            _cancel: cancel,
            handle,
        });
        log::info!(
            "Resource monitor started (every {:?})",
            self.inner.settings.interval
        );
        Ok(())
    }

    /// Stop the sampling loop. Idempotent; returns false if the join timed out.
    pub fn stop(&self) -> bool {
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(Worker {
            _cancel: cancel,
            handle,
        }) = worker
        else {
            return true;
        };
        drop(cancel);
        let joined = join_with_timeout(handle, self.inner.settings.join_timeout, "resource-monitor");
        log::info!("Resource monitor stopped");
        joined
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Take one sample on the calling thread, record it and evaluate thresholds.
    pub fn sample_now(&self) -> Option<ResourceMetrics> {
        let metrics = self.inner.sample()?;
        self.inner.evaluate(&metrics);
        self.inner.record(metrics.clone());
        Some(metrics)
    }

    pub fn latest(&self) -> Option<ResourceMetrics> {
        self.inner
            .history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .back()
            .cloned()
    }

    /// Up to `limit` most recent snapshots, oldest first.
    pub fn history(&self, limit: usize) -> Vec<ResourceMetrics> {
        let history = self.inner.history.lock().unwrap_or_else(|e| e.into_inner());
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

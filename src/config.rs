//! Configuration file handling for pitch-tracker.
//!
//! Loads configuration from `~/.config/pitch-tracker/config.toml`, the path in
//! `PITCH_TRACKER_CONFIG`, or a custom path.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::camera::ReconnectSettings;
use crate::detection::{DispatchMode, PoolSettings};
use crate::frame::CameraId;
use crate::monitor::{MonitorSettings, Threshold, Thresholds};
use crate::recording::RecordingSettings;

/// Environment variable overriding the default config path.
pub const CONFIG_ENV_VAR: &str = "PITCH_TRACKER_CONFIG";

/// Configuration file structure for pitch-tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub cameras: CamerasConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CamerasConfig {
    pub ids: Vec<CameraId>,
}

impl Default for CamerasConfig {
    fn default() -> Self {
        Self {
            ids: vec!["left".to_string(), "right".to_string()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMode {
    #[default]
    PerCamera,
    WorkerPool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub mode: DetectionMode,
    /// Shared threads in worker_pool mode
    pub workers: usize,
    pub queue_capacity: usize,
    pub result_capacity: usize,
    pub failure_threshold: u32,
    pub stereo_buffer: usize,
    pub drop_escalation_every: u64,
    pub join_timeout_ms: u64,
    pub dequeue_timeout_ms: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            mode: DetectionMode::PerCamera,
            workers: 2,
            queue_capacity: 6,
            result_capacity: 32,
            failure_threshold: 10,
            stereo_buffer: 10,
            drop_escalation_every: 100,
            join_timeout_ms: 2000,
            dequeue_timeout_ms: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub join_timeout_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            join_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub output_dir: PathBuf,
    pub pre_roll_ms: u64,
    pub post_roll_ms: u64,
    pub pre_roll_max_frames: usize,
    pub disk_warning_gb: f64,
    pub disk_critical_gb: f64,
    pub disk_check_interval_ms: u64,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("recordings"),
            pre_roll_ms: 500,
            post_roll_ms: 500,
            pre_roll_max_frames: 120,
            disk_warning_gb: 20.0,
            disk_critical_gb: 5.0,
            disk_check_interval_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub history: usize,
    pub cpu_warning: f64,
    pub cpu_critical: f64,
    pub memory_warning: f64,
    pub memory_critical: f64,
    pub threads_warning: f64,
    pub threads_critical: f64,
    pub open_files_warning: f64,
    pub open_files_critical: f64,
    pub warning_cooldown_ms: u64,
    pub critical_cooldown_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 5000,
            history: 120,
            cpu_warning: 80.0,
            cpu_critical: 95.0,
            memory_warning: 80.0,
            memory_critical: 95.0,
            threads_warning: 200.0,
            threads_critical: 500.0,
            open_files_warning: 512.0,
            open_files_critical: 1000.0,
            warning_cooldown_ms: 120_000,
            critical_cooldown_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub default_timeout_ms: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5000,
        }
    }
}

impl Config {
    /// Load configuration from a file path, falling back to [`default_path`].
    /// Returns default config if the file doesn't exist.
    /// Returns an error if the file exists but cannot be parsed or is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map(PathBuf::from).unwrap_or_else(default_path);

        let config = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::IoError {
                path: path.clone(),
                source: e,
            })?;
            toml::from_str(&content).map_err(|e| ConfigError::ParseError {
                path: path.clone(),
                source: e,
            })?
        } else {
            log::debug!("No config at {}, using defaults", path.display());
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        let ids = &self.cameras.ids;
        if ids.is_empty() {
            problems.push("cameras.ids must not be empty".to_string());
        }
        if ids.iter().any(|id| id.trim().is_empty()) {
            problems.push("cameras.ids must not contain blank ids".to_string());
        }
        for (i, id) in ids.iter().enumerate() {
            if ids[..i].contains(id) {
                problems.push(format!("cameras.ids contains '{}' twice", id));
            }
        }

        let d = &self.detection;
        for (name, value) in [
            ("detection.queue_capacity", d.queue_capacity),
            ("detection.result_capacity", d.result_capacity),
            ("detection.stereo_buffer", d.stereo_buffer),
        ] {
            if value == 0 {
                problems.push(format!("{} must be greater than 0", name));
            }
        }
        if d.mode == DetectionMode::WorkerPool && d.workers == 0 {
            problems.push("detection.workers must be greater than 0 in worker_pool mode".to_string());
        }
        if d.failure_threshold == 0 {
            problems.push("detection.failure_threshold must be greater than 0".to_string());
        }
        if d.dequeue_timeout_ms == 0 {
            problems.push("detection.dequeue_timeout_ms must be greater than 0".to_string());
        }

        let r = &self.reconnect;
        if r.max_attempts == 0 {
            problems.push("reconnect.max_attempts must be greater than 0".to_string());
        }
        if r.base_delay_ms > r.max_delay_ms {
            problems.push("reconnect.base_delay_ms must not exceed max_delay_ms".to_string());
        }

        let rec = &self.recording;
        if rec.pre_roll_max_frames == 0 {
            problems.push("recording.pre_roll_max_frames must be greater than 0".to_string());
        }
        if rec.disk_critical_gb < 0.0 || rec.disk_warning_gb < rec.disk_critical_gb {
            problems.push(
                "recording.disk_warning_gb must be at least disk_critical_gb (and both non-negative)"
                    .to_string(),
            );
        }
        if rec.disk_check_interval_ms == 0 {
            problems.push("recording.disk_check_interval_ms must be greater than 0".to_string());
        }

        let m = &self.monitor;
        if m.interval_ms == 0 {
            problems.push("monitor.interval_ms must be greater than 0".to_string());
        }
        if m.history == 0 {
            problems.push("monitor.history must be greater than 0".to_string());
        }
        for (name, warning, critical) in [
            ("cpu", m.cpu_warning, m.cpu_critical),
            ("memory", m.memory_warning, m.memory_critical),
            ("threads", m.threads_warning, m.threads_critical),
            ("open_files", m.open_files_warning, m.open_files_critical),
        ] {
            if warning > critical {
                problems.push(format!(
                    "monitor.{}_warning must not exceed {}_critical",
                    name, name
                ));
            }
        }

        if self.cleanup.default_timeout_ms == 0 {
            problems.push("cleanup.default_timeout_ms must be greater than 0".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems.join("; ")))
        }
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::SerializeError)
    }

    pub fn pool_settings(&self) -> PoolSettings {
        let d = &self.detection;
        PoolSettings {
            mode: match d.mode {
                DetectionMode::PerCamera => DispatchMode::PerCamera,
                DetectionMode::WorkerPool => DispatchMode::WorkerPool { workers: d.workers },
            },
            queue_capacity: d.queue_capacity,
            result_capacity: d.result_capacity,
            failure_threshold: d.failure_threshold,
            stereo_buffer: d.stereo_buffer,
            dequeue_timeout: Duration::from_millis(d.dequeue_timeout_ms),
            join_timeout: Duration::from_millis(d.join_timeout_ms),
            drop_escalation_every: d.drop_escalation_every,
        }
    }

    pub fn reconnect_settings(&self) -> ReconnectSettings {
        let r = &self.reconnect;
        ReconnectSettings {
            max_attempts: r.max_attempts,
            base_delay: Duration::from_millis(r.base_delay_ms),
            max_delay: Duration::from_millis(r.max_delay_ms),
            join_timeout: Duration::from_millis(r.join_timeout_ms),
        }
    }

    pub fn recording_settings(&self) -> RecordingSettings {
        let r = &self.recording;
        RecordingSettings {
            output_dir: r.output_dir.clone(),
            pre_roll: Duration::from_millis(r.pre_roll_ms),
            post_roll: Duration::from_millis(r.post_roll_ms),
            pre_roll_max_frames: r.pre_roll_max_frames,
            disk_warning_gb: r.disk_warning_gb,
            disk_critical_gb: r.disk_critical_gb,
            disk_check_interval: Duration::from_millis(r.disk_check_interval_ms),
        }
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        let m = &self.monitor;
        MonitorSettings {
            interval: Duration::from_millis(m.interval_ms),
            history: m.history,
            thresholds: Thresholds {
                cpu: Threshold::new(m.cpu_warning, m.cpu_critical),
                memory: Threshold::new(m.memory_warning, m.memory_critical),
                threads: Threshold::new(m.threads_warning, m.threads_critical),
                open_files: Threshold::new(m.open_files_warning, m.open_files_critical),
            },
            warning_cooldown: Duration::from_millis(m.warning_cooldown_ms),
            critical_cooldown: Duration::from_millis(m.critical_cooldown_ms),
            ..MonitorSettings::default()
        }
    }

    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_millis(self.cleanup.default_timeout_ms)
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", path.display())]
    IoError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{}': {source}", path.display())]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Failed to render config: {0}")]
    SerializeError(toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Get the default config file path.
///
/// `PITCH_TRACKER_CONFIG` wins over `<config dir>/pitch-tracker/config.toml`.
pub fn default_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from(".config"))
        .join("pitch-tracker")
        .join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cameras.ids, vec!["left", "right"]);
        assert_eq!(config.detection.queue_capacity, 6);
        assert_eq!(config.detection.failure_threshold, 10);
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.recording.pre_roll_ms, 500);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
[detection]
mode = "worker_pool"
workers = 4

[reconnect]
max_attempts = 3
"#,
        )
        .unwrap();
        assert_eq!(config.detection.mode, DetectionMode::WorkerPool);
        assert_eq!(config.detection.queue_capacity, 6);
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(config.reconnect.base_delay_ms, 1000);
        assert_eq!(
            config.pool_settings().mode,
            DispatchMode::WorkerPool { workers: 4 }
        );
    }

    #[test]
    fn test_load_missing_file_returns_default() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(Some(dir.path().join("missing.toml").as_path())).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_unparseable_file_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[detection\nqueue_capacity = ").unwrap();
        let err = Config::load(Some(path.as_path())).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    fn test_load_invalid_values_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[cameras]\nids = []\n[detection]\nqueue_capacity = 0\n").unwrap();
        let err = Config::load(Some(path.as_path())).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("cameras.ids must not be empty"));
        assert!(msg.contains("detection.queue_capacity"));
    }

    #[test]
    fn test_validate_threshold_order() {
        let mut config = Config::default();
        config.monitor.cpu_warning = 99.0;
        config.recording.disk_warning_gb = 1.0;
        config.cameras.ids = vec!["left".to_string(), "left".to_string()];
        let Err(ConfigError::Invalid(msg)) = config.validate() else {
            panic!("expected invalid config");
        };
        assert!(msg.contains("monitor.cpu_warning"));
        assert!(msg.contains("disk_warning_gb"));
        assert!(msg.contains("'left' twice"));
    }

    #[test]
    fn test_to_toml_loads_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = Config::default();
        config.recording.output_dir = PathBuf::from("/data/pitches");
        std::fs::write(&path, config.to_toml().unwrap()).unwrap();
        assert_eq!(Config::load(Some(path.as_path())).unwrap(), config);
    }

    #[test]
    fn test_settings_conversion() {
        let config = Config::default();
        let recording = config.recording_settings();
        assert_eq!(recording.pre_roll, Duration::from_millis(500));
        let reconnect = config.reconnect_settings();
        assert_eq!(reconnect.max_delay, Duration::from_secs(30));
        assert_eq!(config.monitor_settings().critical_cooldown, Duration::from_secs(60));
        assert_eq!(config.cleanup_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_default_path_ends_with_config_toml() {
        let path = default_path();
        assert!(path.to_string_lossy().ends_with(".toml"));
    }
}

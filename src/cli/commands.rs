//! Subcommand handlers for run and config actions.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::args::ConfigAction;
use super::synthetic::{BrightSpotDetector, SyntheticSource};
use crate::config::{default_path as get_config_path, Config};
use crate::error::PipelineError;
use crate::orchestrator::{default_session_name, Orchestrator};

/// Global flag set by the Ctrl+C handler
static CTRLC_RECEIVED: AtomicBool = AtomicBool::new(false);

/// Install a Ctrl+C handler that asks the run loop to stop.
pub fn setup_ctrlc_handler() -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        CTRLC_RECEIVED.store(true, Ordering::SeqCst);
        eprintln!("\nReceived Ctrl+C, shutting down...");
    })
}

/// Options for the `run` subcommand.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub seconds: Option<f64>,
    pub fps: u32,
    pub pitch_every: f64,
    pub session: Option<String>,
}

/// What a run produced.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub frames_submitted: u64,
    pub frames_dropped: u64,
    pub detections: u64,
    pub pitches: u32,
    pub session_frames: u64,
    pub cleanup_ok: bool,
}

/// Flight of the synthetic ball within one pitch cycle.
fn ball_progress(elapsed: f64, pitch_every: f64) -> Option<f32> {
    let flight = (pitch_every / 2.0).min(1.0);
    let phase = elapsed % pitch_every;
    (phase < flight).then(|| (phase / flight) as f32)
}

/// Drive the pipeline with synthetic stereo frames until time runs out,
/// Ctrl+C is pressed, or a recovery strategy requests shutdown.
pub fn run_pipeline(config: Config, options: &RunOptions) -> Result<RunSummary, PipelineError> {
    let cameras = config.cameras.ids.clone();
    let orchestrator = Orchestrator::new(config)?;
    let detections = Arc::new(AtomicU64::new(0));
    {
        let detections = Arc::clone(&detections);
        orchestrator.set_stereo_callback(move |camera, frame, found| {
            if !found.is_empty() {
                detections.fetch_add(found.len() as u64, Ordering::Relaxed);
                log::trace!("{} frame {}: {} detections", camera, frame.index, found.len());
            }
            Ok(())
        });
    }
    orchestrator.set_detector(BrightSpotDetector::default());
    // Synthetic cameras come back as soon as they are asked to
    orchestrator.set_reconnect_callback(|_| true);

    orchestrator.start_capture()?;
    let name = options.session.clone().unwrap_or_else(default_session_name);
    let session = orchestrator.start_session(&name)?;
    if let Some(warning) = &session.disk_warning {
        eprintln!("Warning: {}", warning);
    }
    println!("Recording session '{}' to {}", session.name, session.directory.display());

    let mut summary = RunSummary::default();
    let mut source = SyntheticSource::new(&cameras);
    let frame_interval = Duration::from_secs_f64(1.0 / options.fps as f64);
    let started = Instant::now();
    let mut in_flight = false;

    loop {
        if CTRLC_RECEIVED.load(Ordering::SeqCst) || orchestrator.shutdown_requested() {
            break;
        }
        let elapsed = started.elapsed().as_secs_f64();
        if options.seconds.is_some_and(|limit| elapsed >= limit) {
            break;
        }

        let ball = ball_progress(elapsed, options.pitch_every);
        match (ball.is_some(), in_flight) {
            (true, false) => match orchestrator.start_pitch() {
                Ok(start) => {
                    summary.pitches += 1;
                    log::info!(
                        "Pitch {} started with {} pre-roll frames",
                        start.pitch_id,
                        start.pre_roll_frames
                    );
                }
                Err(e) => log::warn!("Could not start pitch: {}", e),
            },
            (false, true) => {
                if let Err(e) = orchestrator.stop_pitch() {
                    log::warn!("Could not stop pitch: {}", e);
                }
            }
            _ => {}
        }
        in_flight = ball.is_some();

        for frame in source.next_frames(ball) {
            match orchestrator.submit_frame(frame) {
                Ok(outcome) => {
                    summary.frames_submitted += 1;
                    if outcome.dropped() {
                        summary.frames_dropped += 1;
                    }
                }
                Err(e) => log::warn!("Frame rejected: {}", e),
            }
        }

        let next = started + frame_interval * (summary.frames_submitted / cameras.len() as u64) as u32;
        if let Some(wait) = next.checked_duration_since(Instant::now()) {
            thread::sleep(wait);
        }
    }

    match orchestrator.stop_session() {
        Ok(stopped) => summary.session_frames = stopped.frames_written,
        Err(PipelineError::NoActiveSession) => {}
        Err(e) => eprintln!("Error stopping session: {}", e),
    }
    let stats = orchestrator.detection_stats();
    let report = orchestrator.shutdown()?;
    for task in report.failed() {
        eprintln!("Cleanup task '{}' failed: {:?}", task.name, task.outcome);
    }
    summary.cleanup_ok = report.success;
    summary.detections = detections.load(Ordering::Relaxed);

    for lane in &stats.cameras {
        println!(
            "  {}: {} processed, {} dropped, {} failures",
            lane.camera_id, lane.processed, lane.dropped, lane.failures
        );
    }
    Ok(summary)
}

/// Handle the run subcommand.
pub fn handle_run(config_path: Option<&Path>, options: RunOptions) {
    let config = match Config::load(config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = setup_ctrlc_handler() {
        eprintln!("Warning: could not install Ctrl+C handler: {}", e);
    }

    match run_pipeline(config, &options) {
        Ok(summary) => {
            println!();
            println!("Frames submitted: {}", summary.frames_submitted);
            println!("Frames dropped:   {}", summary.frames_dropped);
            println!("Detections:       {}", summary.detections);
            println!("Pitches:          {}", summary.pitches);
            println!("Session frames:   {}", summary.session_frames);
            if !summary.cleanup_ok {
                eprintln!("Shutdown did not complete cleanly.");
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn resolve_path(config_path: Option<&Path>) -> PathBuf {
    config_path.map(PathBuf::from).unwrap_or_else(get_config_path)
}

/// Handle config subcommand actions.
pub fn handle_config_action(action: ConfigAction, config_path: Option<&Path>) {
    let path = resolve_path(config_path);
    match action {
        ConfigAction::Show => {
            let config = match Config::load(Some(path.as_path())) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            };
            match config.to_toml() {
                Ok(text) => {
                    println!("Current configuration:");
                    println!();
                    println!("{}", text);
                }
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            }

            if path.exists() {
                println!("Config file: {} (exists)", path.display());
            } else {
                println!("Config file: {} (not found)", path.display());
            }
        }
        ConfigAction::Init => {
            if let Err(e) = write_default_config(&path) {
                eprintln!("Error: {}", e);
                if path.exists() {
                    eprintln!("Use 'pitch-tracker config show' to view current settings.");
                }
                std::process::exit(1);
            }
            println!("Created config file: {}", path.display());
        }
    }
}

/// Write the default configuration, refusing to overwrite an existing file.
pub fn write_default_config(path: &Path) -> Result<(), String> {
    if path.exists() {
        return Err(format!("Config file already exists: {}", path.display()));
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Error creating config directory: {}", e))?;
    }
    let body = Config::default().to_toml().map_err(|e| e.to_string())?;
    let text = format!("# pitch-tracker configuration\n\n{}", body);
    std::fs::write(path, text).map_err(|e| format!("Error writing config file: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_ball_progress_cycle() {
        assert_eq!(ball_progress(0.0, 3.0), Some(0.0));
        assert_eq!(ball_progress(0.5, 3.0), Some(0.5));
        assert_eq!(ball_progress(1.5, 3.0), None);
        assert_eq!(ball_progress(3.25, 3.0), Some(0.25));
        // Short cycles fly for half the period
        assert_eq!(ball_progress(0.25, 1.0), Some(0.5));
        assert_eq!(ball_progress(0.75, 1.0), None);
    }

    #[test]
    fn test_write_default_config_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        write_default_config(&path).unwrap();

        let loaded = Config::load(Some(path.as_path())).unwrap();
        assert_eq!(loaded, Config::default());
    }

    #[test]
    fn test_write_default_config_refuses_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "# mine\n").unwrap();

        let err = write_default_config(&path).unwrap_err();
        assert!(err.contains("already exists"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "# mine\n");
    }

    #[test]
    fn test_run_pipeline_short() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.recording.output_dir = dir.path().to_path_buf();
        config.recording.disk_warning_gb = 0.0;
        config.recording.disk_critical_gb = 0.0;
        config.monitor.enabled = false;

        let options = RunOptions {
            seconds: Some(0.6),
            fps: 50,
            pitch_every: 0.4,
            session: Some("smoke".to_string()),
        };
        let summary = run_pipeline(config, &options).unwrap();
        assert!(summary.frames_submitted > 0);
        assert!(summary.pitches >= 1);
        assert!(summary.session_frames > 0);
        assert!(summary.cleanup_ok);
        assert!(dir.path().join("smoke").join("pitch_001").exists());
    }
}

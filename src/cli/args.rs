//! CLI argument parsing with clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Parse and validate a frame rate (1-240 fps)
fn parse_fps(s: &str) -> Result<u32, String> {
    let fps: u32 = s
        .parse()
        .map_err(|_| format!("'{}' is not a valid frame rate", s))?;
    if !(1..=240).contains(&fps) {
        return Err(format!("Frame rate must be between 1 and 240 fps, got {}", fps));
    }
    Ok(fps)
}

/// Parse a positive number of seconds
fn parse_seconds(s: &str) -> Result<f64, String> {
    let secs: f64 = s
        .parse()
        .map_err(|_| format!("'{}' is not a valid number of seconds", s))?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err(format!("Duration must be positive, got {}", s));
    }
    Ok(secs)
}

/// Stereo pitch tracking pipeline
#[derive(Parser, Debug)]
#[command(name = "pitch-tracker")]
#[command(version, about = "Stereo camera pitch tracking pipeline", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Config file path
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(long, short, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the pipeline against a synthetic stereo source
    Run {
        /// Stop after this many seconds (default: until Ctrl+C)
        #[arg(long, value_parser = parse_seconds)]
        seconds: Option<f64>,

        /// Synthetic capture rate per camera
        #[arg(long, default_value = "30", value_parser = parse_fps)]
        fps: u32,

        /// Record a pitch every N seconds
        #[arg(long, default_value = "3", value_parser = parse_seconds)]
        pitch_every: f64,

        /// Session name (default: session_<timestamp>)
        #[arg(long)]
        session: Option<String>,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum ConfigAction {
    /// Show current configuration
    Show,
    /// Create default config file
    Init,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["pitch-tracker"]);
        assert!(args.command.is_none());
        assert!(args.config.is_none());
        assert!(!args.verbose);
    }

    #[test]
    fn test_args_run_defaults() {
        let args = Args::parse_from(["pitch-tracker", "run"]);
        match args.command {
            Some(Command::Run {
                seconds,
                fps,
                pitch_every,
                session,
            }) => {
                assert!(seconds.is_none());
                assert_eq!(fps, 30);
                assert_eq!(pitch_every, 3.0);
                assert!(session.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_args_run_values() {
        let args = Args::parse_from([
            "pitch-tracker",
            "run",
            "--seconds",
            "2.5",
            "--fps",
            "60",
            "--session",
            "bullpen",
        ]);
        match args.command {
            Some(Command::Run {
                seconds,
                fps,
                session,
                ..
            }) => {
                assert_eq!(seconds, Some(2.5));
                assert_eq!(fps, 60);
                assert_eq!(session.as_deref(), Some("bullpen"));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_args_rejects_bad_fps() {
        assert!(Args::try_parse_from(["pitch-tracker", "run", "--fps", "0"]).is_err());
        assert!(Args::try_parse_from(["pitch-tracker", "run", "--fps", "fast"]).is_err());
        assert!(Args::try_parse_from(["pitch-tracker", "run", "--seconds", "-1"]).is_err());
    }

    #[test]
    fn test_args_global_config_flag() {
        let args = Args::parse_from(["pitch-tracker", "config", "show", "-c", "/tmp/p.toml"]);
        assert_eq!(args.config, Some(PathBuf::from("/tmp/p.toml")));
        assert!(matches!(
            args.command,
            Some(Command::Config {
                action: ConfigAction::Show
            })
        ));
    }

    #[test]
    fn test_args_config_init() {
        let args = Args::parse_from(["pitch-tracker", "-v", "config", "init"]);
        assert!(args.verbose);
        assert!(matches!(
            args.command,
            Some(Command::Config {
                action: ConfigAction::Init
            })
        ));
    }

    #[test]
    fn test_parse_fps() {
        assert_eq!(parse_fps("30"), Ok(30));
        assert!(parse_fps("241").is_err());
        assert!(parse_fps("abc").is_err());
    }
}

use clap::Parser;
use tracing_subscriber::EnvFilter;

use pitch_tracker::cli::{handle_config_action, handle_run, Args, Command, RunOptions};

/// Load .env file without overriding existing env vars
fn load_env() {
    // dotenv::dotenv() returns Err if .env doesn't exist, which is fine
    let _ = dotenv::dotenv();
}

/// Route `log` records through a fmt subscriber; RUST_LOG wins over --verbose.
fn init_logging(verbose: bool) {
    let default_level = if verbose { "pitch_tracker=debug" } else { "pitch_tracker=info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() {
    // Load .env file before anything else
    load_env();

    let args = Args::parse();
    init_logging(args.verbose);
    let config_path = args.config.as_deref();

    match args.command {
        Some(Command::Config { action }) => handle_config_action(action, config_path),
        Some(Command::Run {
            seconds,
            fps,
            pitch_every,
            session,
        }) => handle_run(
            config_path,
            RunOptions {
                seconds,
                fps,
                pitch_every,
                session,
            },
        ),
        None => handle_run(
            config_path,
            RunOptions {
                seconds: None,
                fps: 30,
                pitch_every: 3.0,
                session: None,
            },
        ),
    }
}

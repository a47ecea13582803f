//! Command-line interface definitions and helpers.
//!
//! This module contains CLI argument parsing, the synthetic stereo source
//! used by `run`, and subcommand handlers.

mod args;
mod commands;
mod synthetic;

pub use args::{Args, Command, ConfigAction};
pub use commands::{
    handle_config_action, handle_run, run_pipeline, setup_ctrlc_handler, write_default_config,
    RunOptions, RunSummary,
};
pub use synthetic::{BrightSpotDetector, SyntheticSource};

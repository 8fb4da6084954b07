//! Logging setup for flipper-video
//!
//! Everything logs through `tracing`. The subscriber installed here honours
//! `RUST_LOG` first and falls back to the configured level.

use crate::config::DebugConfig;
use std::fs::File;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// Returns `false` if a subscriber was already installed (tests, or a host
/// that set up its own), which is not an error.
pub fn init(debug: &DebugConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(debug.log_level.as_filter()));

    if debug.log_to_file {
        match File::create(&debug.log_path) {
            Ok(file) => {
                return tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .try_init()
                    .is_ok();
            }
            Err(e) => {
                eprintln!(
                    "Could not open log file {}: {}, logging to stderr",
                    debug.log_path.display(),
                    e
                );
            }
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
}

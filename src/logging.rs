use tracing_subscriber::{fmt, EnvFilter};

use crate::config::Config;

/// Initializes the global `tracing` subscriber per spec.md §7 "User-visible
/// behavior": ANSI `[INFO] [WARN] [ERROR]`-prefixed lines in TTY mode, or
/// single-line JSON objects (which also implies no spinner) when `--json`.
pub fn init(config: &Config) {
    let default_level = if config.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if config.json {
        fmt()
            .with_env_filter(filter)
            .json()
            .with_ansi(false)
            .with_current_span(false)
            .flatten_event(true)
            .init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_ansi(true)
            .with_target(false)
            .init();
    }
}

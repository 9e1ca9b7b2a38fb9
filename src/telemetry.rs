//! Telemetry initialization.
//!
//! Structured logging via `tracing`, filtered by `RUST_LOG` (default
//! `info`), written to stderr so stdout stays clean for command output.
//! Set `GITVAN_LOG_FORMAT=json` for machine-readable events.

use tracing_subscriber::EnvFilter;

/// Initialize the global subscriber. Call once, early in `main`.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("GITVAN_LOG_FORMAT").is_ok_and(|v| v == "json");

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

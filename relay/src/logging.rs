//! Diagnostics via `tracing`, written to stderr.
//!
//! Command results go to stdout; everything here is for the operator watching
//! an agent or debugging a controller.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`; falls back to `default_directive` when it is unset or
/// invalid. Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=relay=debug relay agent
/// ```
pub fn init(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}

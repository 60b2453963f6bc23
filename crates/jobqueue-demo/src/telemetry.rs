//! Logging setup shared by the parent and child modes
//!
//! Output always goes to stderr: in child mode stdout carries the worker protocol.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize the global subscriber
///
/// The filter comes from `RUST_LOG`, else `LOG_LEVEL` (applied to the queue
/// crates), else `info`.
pub fn init_logging() {
    let filter = std::env::var("RUST_LOG")
        .ok()
        .or_else(|| {
            std::env::var("LOG_LEVEL")
                .ok()
                .map(|level| format!("jobqueue={level},jobqueue_demo={level}"))
        })
        .and_then(|f| EnvFilter::try_new(f).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(filter);

    // A second init (tests) keeps the first subscriber
    let _ = tracing_subscriber::registry().with(console_layer).try_init();
}

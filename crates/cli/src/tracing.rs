//! Tracing setup for the binary.

use tracing_subscriber::EnvFilter;

/// Initialize the global subscriber. `RUST_LOG` wins; the default keeps the
/// runtime informative without drowning request logs. `log` macros from the
/// library crates are bridged by tracing-subscriber's compatibility layer.
pub fn setup_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,parley_agent=info,parley=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

//! Logging setup for the `ccpool` binary.
//!
//! Scheduler diagnostics go to stderr so stdout carries nothing but job
//! reports.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogConfig;

/// Install the global subscriber. `RUST_LOG`, when set, replaces the filter
/// built from `logging.level`.
pub fn init_tracing(logging: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(&logging.level)));
    let layer = fmt::layer().with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry().with(filter);

    if logging.json {
        registry.with(layer.json()).init();
    } else {
        registry.with(layer).init();
    }
}

/// Filter directive enabling `level` for the scheduler and its core library.
pub fn default_filter(level: &str) -> String {
    format!("ccpool={level},ccpool_core={level}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_covers_both_crates() {
        assert_eq!(default_filter("debug"), "ccpool=debug,ccpool_core=debug");
    }
}

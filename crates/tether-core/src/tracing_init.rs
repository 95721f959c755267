//! Shared tracing/logging initialization.
//!
//! Sets up `tracing_subscriber` with an env-filter and optional JSON output.
//! `RUST_LOG`, when set, replaces the configured filter entirely.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

/// Filter directive enabling `level` for the given crate targets.
pub fn default_filter(targets: &[&str], level: &str) -> String {
    targets
        .iter()
        .map(|t| format!("{t}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Initialise the global tracing subscriber.
///
/// * `targets` -- crate targets that log at `logging.level`
///   (e.g. `["tether_connector", "tether_core"]`).
/// * `logging.json` -- emit structured JSON log lines instead of the
///   human-readable format.
pub fn init_tracing(targets: &[&str], logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter(targets, &logging.level)),
    );
    if logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

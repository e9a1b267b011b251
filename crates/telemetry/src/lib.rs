//! Structured logging setup shared by the broker binaries.
//!
//! The core crates (`event-log`, `timeout-log`, `orchestrator`) only ever
//! call into `tracing`; wiring up a subscriber is left to whichever binary
//! embeds them, keeping instrumentation call sites separate from
//! subscriber setup.

#![deny(unsafe_code)]

use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

/// Errors from setting up a global subscriber.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// A global subscriber was already installed.
    #[error("tracing subscriber already set: {0}")]
    AlreadySet(String),
}

/// Initialize structured JSON logging with an env filter.
///
/// Set `RUST_LOG`, e.g. `"info,broker_cli=debug"`. Intended for the
/// `process`/`watch-requests` long-running commands, whose output is
/// consumed by log aggregation rather than a terminal.
pub fn init_json_logging() -> Result<(), TelemetryError> {
    let fmt_layer = fmt::layer().json().with_current_span(true).with_span_list(true);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = Registry::default().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).map_err(|e| TelemetryError::AlreadySet(e.to_string()))
}

/// Initialize human-readable logging with an env filter.
///
/// Used by the one-shot admin commands (`configure`, `insert`, `list`,
/// `resolve-external-uuid`), where a terminal operator is the consumer.
pub fn init_fmt_logging() -> Result<(), TelemetryError> {
    let fmt_layer = fmt::layer().with_target(false);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let subscriber = Registry::default().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).map_err(|e| TelemetryError::AlreadySet(e.to_string()))
}

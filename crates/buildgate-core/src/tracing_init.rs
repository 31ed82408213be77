//! Tracing/logging initialization for the gateway binary.
//!
//! `RUST_LOG` wins over the configured level so operators can raise verbosity
//! for a single module without touching the settings file.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Crates whose spans and events are enabled by the configured level.
const GATEWAY_TARGETS: [&str; 2] = ["buildgate_gateway", "buildgate_core"];

/// Build the default filter directive for `level` (e.g. `"info"`).
pub fn default_filter(level: &str) -> String {
    GATEWAY_TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Initialise the global tracing subscriber.
///
/// * `level` -- level applied to the gateway crates when `RUST_LOG` is unset.
/// * `log_json` -- emit structured JSON lines instead of the human-readable format.
///
/// Calling this twice is a no-op for the second call.
pub fn init_tracing(level: &str, log_json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(level)));
    let registry = tracing_subscriber::registry().with(env_filter);
    let _ = if log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
}

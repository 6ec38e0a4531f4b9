//! Shared tracing/logging initialization.
//!
//! The `tasklane` binary and the integration harnesses use the same pattern
//! for setting up `tracing_subscriber` with an env-filter and optional JSON
//! output.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"tasklane=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    let registry = tracing_subscriber::registry().with(env_filter);
    // try_init: a second initialisation (tests, embedded use) is not an error.
    let result = if log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()
    };
    if let Err(e) = result {
        tracing::debug!(error = %e, "Tracing subscriber already initialised");
    }
}

/// Build the default filter string for a crate at the given level.
pub fn default_filter(level: &str) -> String {
    format!("tasklane={level},tasklane_daemon={level},tasklane_core={level}")
}

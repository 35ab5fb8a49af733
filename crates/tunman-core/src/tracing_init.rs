//! Tracing/logging initialization for the daemon binary.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Crates whose events are enabled by the default filter.
const CRATES: [&str; 2] = ["tunman_daemon", "tunman_core"];

/// Build the directive string used when `RUST_LOG` is not set,
/// e.g. `"tunman_daemon=info,tunman_core=info"`.
pub fn default_filter(log_level: &str) -> String {
    CRATES
        .iter()
        .map(|krate| format!("{krate}={log_level}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Initialise the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `log_level`. With `log_json` set, each
/// event is emitted as one JSON object per line for log aggregation.
pub fn init_tracing(log_level: &str, log_json: bool) {
    let env_filter = EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter(log_level)),
    );
    let json_layer = log_json.then(|| fmt::layer().json());
    let text_layer = (!log_json).then(fmt::layer);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .init();
}

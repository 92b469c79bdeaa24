//! Tracing setup for the binary and for embedders that want our defaults.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub const LOG_ENV_VAR: &str = "WORLDLINE_LOG";

/// Resolve the active filter: `WORLDLINE_LOG` wins over `fallback`, and an
/// unparsable directive degrades to `info`.
pub fn filter_for(fallback: &str) -> EnvFilter {
    let directive = std::env::var(LOG_ENV_VAR).unwrap_or_else(|_| fallback.to_string());
    EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install a stderr subscriber. Returns false when one was already installed.
pub fn init(fallback_filter: &str) -> bool {
    tracing_subscriber::registry()
        .with(filter_for(fallback_filter))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init()
        .is_ok()
}

//! Logging setup.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs the global tracing subscriber.
///
/// Priority: `RUST_LOG` > `default_level`. Returns `false` if a subscriber
/// was already installed, which leaves the existing one in place.
pub fn init_tracing(default_level: &str) -> bool {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.to_string());

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_filter)))
        .try_init()
        .is_ok()
}

//! Tracing setup.
//!
//! Initialized once per process; safe to call again (tests share a process).

use std::sync::OnceLock;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize the global tracing subscriber with a filter built from the
/// configured log level (an `EnvFilter` directive, e.g. `info` or
/// `taskmill=debug,sqlx=warn`).
pub fn init(log_level: &str) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let filter =
            EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true));

        if subscriber.try_init().is_err() {
            tracing::debug!("global tracing subscriber already initialized");
        }
    });
}

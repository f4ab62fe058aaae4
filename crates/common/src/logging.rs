//! Logging setup and configuration

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Setup tracing subscriber for the application
///
/// `RUST_LOG` takes precedence over `default_level`. Endpoint lookups that
/// miss are reported at `warn`, transfer submissions at `debug`.
pub fn setup_logging(default_level: &str) -> crate::Result<()> {
    let filter = build_filter(default_level)?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_thread_names(true))
        .try_init()
        .map_err(|e| crate::Error::Config(format!("Logging already initialised: {}", e)))
}

/// Route tracing output through the test harness
///
/// Safe to call from every test; only the first call installs a subscriber.
pub fn setup_test_logging() {
    if let Ok(filter) = build_filter("debug") {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_test_writer())
            .try_init();
    }
}

fn build_filter(default_level: &str) -> crate::Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| crate::Error::Config(format!("Invalid log filter: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_filter_accepts_levels() {
        for level in ["trace", "debug", "info", "warn", "error", "usb_target=debug"] {
            assert!(build_filter(level).is_ok(), "{level}");
        }
    }

    #[test]
    fn test_setup_test_logging_is_idempotent() {
        setup_test_logging();
        setup_test_logging();
    }
}

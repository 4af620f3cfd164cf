//! Tracing subscriber installation.

use tracing_subscriber::EnvFilter;

use crate::config::ApplicationConfig;

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install the global subscriber.
///
/// `RUST_LOG` overrides `application.log_level` when set. Calling this again after a
/// subscriber is installed is a no-op, so tests and the binary can both call it.
pub fn init_from_config(application: &ApplicationConfig) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter(&application.log_level))
        .with_target(false);

    let installed = if application.log_json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if installed.is_ok() {
        tracing::debug!(level = %application.log_level, json = application.log_json, "Logging initialized");
    }
}

//! Tracing subscriber setup.
//!
//! `RUST_LOG` wins over the configured level when set.

use tracing_subscriber::EnvFilter;

use crate::config::ApplicationConfig;

/// Error returned when a global subscriber is already installed.
pub type InitError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Install the global subscriber at `level`, as JSON lines when `json` is set.
pub fn init_tracing(level: &str, json: bool) -> Result<(), InitError> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    }
}

/// Install the global subscriber from the `[application]` section.
pub fn init_from_config(app: &ApplicationConfig) -> Result<(), InitError> {
    init_tracing(&app.log_level, app.json_logs)
}

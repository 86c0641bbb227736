//! Tracing subscriber setup for applications embedding the controller.

use tracing_subscriber::EnvFilter;

use crate::config::GeneralConfig;

/// Install a `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `default_level` when the variable is unset or invalid.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init(default_level: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
}

/// [`init`] with the configured `log_level`.
pub fn init_from_config(general: &GeneralConfig) -> bool {
    init(&general.log_level)
}

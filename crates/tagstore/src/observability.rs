//! Log output for the tagstore services, driven by [`LoggingConfig`].
//!
//! `RUST_LOG`, when set and valid, takes precedence over the configured
//! level at startup. The level can be changed afterwards with
//! [`set_log_level`].

use std::sync::OnceLock;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

use crate::config::{ConfigError, LoggingConfig};

static FILTER_HANDLE: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();

/// Filter admitting everything at or above `level`.
fn level_filter(level: &str) -> Result<EnvFilter, ConfigError> {
    let max: LevelFilter = level
        .trim()
        .parse()
        .map_err(|_| ConfigError::Logging(format!("unknown log level '{level}'")))?;
    Ok(EnvFilter::default().add_directive(max.into()))
}

/// Install the global subscriber: an fmt layer behind a reloadable filter.
///
/// Returns `Ok(false)` when another global subscriber was installed first;
/// its level is then out of reach of [`set_log_level`].
pub fn init(logging: &LoggingConfig) -> Result<bool, ConfigError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(from_env) => from_env,
        Err(_) => level_filter(&logging.level)?,
    };

    let (filter, handle) = reload::Layer::new(filter);
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .is_ok();

    if installed {
        let _ = FILTER_HANDLE.set(handle);
    }
    Ok(installed)
}

/// Swap the active filter for one at `level`.
pub fn set_log_level(level: &str) -> Result<(), ConfigError> {
    let filter = level_filter(level)?;
    let handle = FILTER_HANDLE
        .get()
        .ok_or_else(|| ConfigError::Logging("tracing was not initialized by tagstore".into()))?;
    handle
        .reload(filter)
        .map_err(|e| ConfigError::Logging(format!("failed to reload log level: {e}")))
}

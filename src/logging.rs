//! Logging setup
//!
//! The library only emits `tracing` events. Binaries call [`init_logging`]
//! once to install a subscriber writing to stderr, so stdout stays free for
//! command output.

use crate::{Error, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Environment variable holding a filter directive, e.g. `chkmap=debug`
pub const LOG_ENV: &str = "CHKMAP_LOG";

/// Level used when neither the environment nor the caller sets one
pub const DEFAULT_LOG_LEVEL: &str = "warn";

/// Install the global subscriber.
///
/// Priority order (highest to lowest):
/// 1. The `CHKMAP_LOG` environment variable
/// 2. `level`, e.g. from a `--log-level` flag
/// 3. [`DEFAULT_LOG_LEVEL`]
pub fn init_logging(level: Option<&str>) -> Result<()> {
    let filter = build_env_filter(level)?;
    Registry::default()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .with_writer(std::io::stderr),
        )
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to install logger: {}", e)))
}

fn build_env_filter(level: Option<&str>) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_env(LOG_ENV) {
        return Ok(filter);
    }
    let level = level.unwrap_or(DEFAULT_LOG_LEVEL);
    EnvFilter::try_new(level)
        .map_err(|e| Error::Config(format!("Invalid log level {:?}: {}", level, e)))
}

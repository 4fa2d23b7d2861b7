//! Logging bootstrap for applications embedding the engine.

use tracing_subscriber::{fmt, EnvFilter};

use crate::types::{Result, SaplingError};

/// Installs a global `fmt` subscriber filtered by `filter` (e.g. `"sapling=debug"`).
pub fn init_logging(filter: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(filter)
                .map_err(|e| SaplingError::Config(format!("invalid log filter: {e}")))?,
        )
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|_| SaplingError::Config("logging already initialized".into()))
}

//! Tracing initialization

use tracing_subscriber::EnvFilter;

use crate::{config::Config, error::Result};

/// Initialize tracing with JSON output and an env-filter derived from the
/// configured log level.
///
/// Call once at silo boot, before any subsystem starts.
pub fn init_tracing(config: &Config) -> Result<()> {
    let log_level = config.silo.log_level.clone();

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_new(&log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!(
        silo = %config.silo.silo_name(),
        deployment = %config.silo.deployment_id,
        "Tracing initialized"
    );

    Ok(())
}

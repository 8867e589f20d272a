//! Logging bootstrap.

use crate::core::config::TelemetryConfig;
use anyhow::Result;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload};

pub type LogHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

/// Initialize tracing with a reloadable level filter. `log_format = "json"`
/// switches to structured output.
pub fn init_tracing(cfg: &TelemetryConfig) -> Result<LogHandle> {
    let level = cfg.log_level.as_deref().unwrap_or("info");
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, handle) = reload::Layer::new(filter);

    let json = cfg.log_format.as_deref() == Some("json");
    let result = if json {
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt::layer().json().with_target(true))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt::layer().with_target(true))
            .try_init()
    };
    result.map_err(|e| anyhow::anyhow!("failed to init tracing: {e}"))?;
    Ok(handle)
}

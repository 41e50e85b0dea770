//! tracing-subscriber setup.
//!
//! `json` emits one object per line with the current span's fields (so the
//! `request` span's `trace_id` rides along on every entry). `pretty` is the
//! colorized development format.

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};

fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = env_filter(config);
    let installed = match config.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(true)
            .with_target(false)
            .try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("Failed to initialise logging: {e}"))
}

//! Logging Setup
//!
//! Installs the global `tracing` subscriber. Output goes to stderr so that
//! command results on stdout stay machine readable.

use anyhow::{anyhow, Result};
use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Output format of the subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

impl LogFormat {
    pub fn parse(format: &str) -> Result<Self> {
        match format.to_lowercase().as_str() {
            "compact" => Ok(LogFormat::Compact),
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(anyhow!("Invalid log format: {}. Must be one of: json, pretty, compact", other)),
        }
    }
}

/// Build the filter: `RUST_LOG` wins, otherwise the configured level
///
/// `verbose` raises the default to debug.
pub fn env_filter(config: &LoggingConfig, verbose: bool) -> Result<EnvFilter> {
    let level: Level = if verbose {
        Level::DEBUG
    } else {
        config
            .level
            .to_lowercase()
            .parse()
            .map_err(|e| anyhow!("Failed to parse log level: {}", e))?
    };

    Ok(EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy())
}

/// Install the global subscriber
///
/// # Errors
///
/// Fails on an invalid level or format, or when a subscriber is already set.
pub fn init(config: &LoggingConfig, verbose: bool) -> Result<()> {
    let filter = env_filter(config, verbose)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let installed = match LogFormat::parse(&config.format)? {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| anyhow!("Failed to install log subscriber: {}", e))
}

//! Logging module for Keygate
//!
//! Provides structured logging with tracing, supporting JSON output for production
//! and pretty printing for development. Output goes to stderr so the CLI's
//! stdout stays machine-readable.

use std::io::IsTerminal;

use anyhow::{Context, Result};
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogFormat;

/// Parse a configured level name, falling back to `info`
pub fn parse_level(log_level: &str) -> Level {
    match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Default filter directives for the Keygate crates at `level`
fn default_directives(level: Level) -> String {
    format!(
        "keygate_engine={level},keygate_dispatcher={level},keygate={level}",
        level = level
    )
}

/// Initialize the logging/tracing system.
///
/// `RUST_LOG` takes precedence over `log_level`. Without an explicit
/// format, a terminal gets pretty output and anything else gets JSON.
pub fn init_logging(log_level: &str, format: Option<LogFormat>) -> Result<()> {
    let level = parse_level(log_level);

    // Build filter from level or RUST_LOG env var
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));

    let format = format.unwrap_or_else(|| {
        if std::io::stderr().is_terminal() {
            LogFormat::Pretty
        } else {
            LogFormat::Json
        }
    });

    match format {
        LogFormat::Pretty => {
            let layer = fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .compact()
                .with_writer(std::io::stderr);

            tracing_subscriber::registry()
                .with(filter)
                .with(layer)
                .try_init()
                .context("Failed to install tracing subscriber")?;
        }
        LogFormat::Json => {
            let layer = fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .json()
                .with_writer(std::io::stderr);

            tracing_subscriber::registry()
                .with(filter)
                .with(layer)
                .try_init()
                .context("Failed to install tracing subscriber")?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG"), Level::DEBUG);
        assert_eq!(parse_level("warning"), Level::WARN);
        assert_eq!(parse_level("verbose"), Level::INFO);
    }

    #[test]
    fn test_default_directives() {
        let directives = default_directives(Level::DEBUG);
        assert!(directives.contains("keygate_engine=DEBUG"));
        assert!(EnvFilter::try_new(directives).is_ok());
    }
}

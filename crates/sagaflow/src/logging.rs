//! Tracing subscriber bootstrap.

use std::io;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::{ConfigError, LogConfig, LogFormat};

/// Errors raised while installing the subscriber.
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("A global tracing subscriber is already installed: {0}")]
    AlreadyInitialized(#[from] TryInitError),
}

/// Installs a global fmt subscriber.
///
/// The configured level is the default directive; `RUST_LOG` overrides it.
/// Calling this twice returns [`LoggingError::AlreadyInitialized`].
pub fn init(config: &LogConfig) -> Result<(), LoggingError> {
    let level = parse_log_level(&config.level)?;
    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let layer = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(io::stdout)
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .pretty()
            .with_writer(io::stdout)
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_filter(env_filter)
            .boxed(),
    };

    tracing_subscriber::registry().with(layer).try_init()?;
    Ok(())
}

fn parse_log_level(level: &str) -> Result<LevelFilter, ConfigError> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(LevelFilter::TRACE),
        "debug" => Ok(LevelFilter::DEBUG),
        "info" => Ok(LevelFilter::INFO),
        "warn" => Ok(LevelFilter::WARN),
        "error" => Ok(LevelFilter::ERROR),
        _ => Err(ConfigError::InvalidLogLevel(level.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("DEBUG").ok(), Some(LevelFilter::DEBUG));
        assert!(matches!(
            parse_log_level("verbose"),
            Err(ConfigError::InvalidLogLevel(level)) if level == "verbose"
        ));
    }

    #[test]
    fn test_second_init_is_an_error() {
        let config = LogConfig {
            level: "error".to_string(),
            format: LogFormat::Json,
        };
        let first = init(&config);
        let second = init(&config);
        // Another test may have installed a subscriber first.
        assert!(first.is_ok() || matches!(first, Err(LoggingError::AlreadyInitialized(_))));
        assert!(matches!(second, Err(LoggingError::AlreadyInitialized(_))));
    }
}

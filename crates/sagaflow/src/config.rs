//! Engine configuration.

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default configuration file, relative to the working directory.
pub const CONFIG_FILE: &str = "sagaflow.yaml";

/// Prefix of environment overrides, e.g. `SAGAFLOW_LOGGING__LEVEL=debug`.
pub const ENV_PREFIX: &str = "SAGAFLOW_";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid default_step_timeout_ms: {0}. Must be positive")]
    InvalidStepTimeout(u64),

    #[error("Invalid default_workflow_timeout_ms: {0}. Must be positive")]
    InvalidWorkflowTimeout(u64),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable, multi-line.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter level; `RUST_LOG` takes precedence.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Engine-wide defaults.
///
/// # Examples
///
/// ```
/// use sagaflow::EngineConfig;
/// use std::time::Duration;
///
/// let config = EngineConfig::default();
/// assert_eq!(config.default_step_timeout(), Duration::from_secs(30));
/// assert!(config.compensate_on_failure);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Timeout for steps that do not configure one.
    pub default_step_timeout_ms: u64,
    /// Deadline for definitions that do not configure one.
    pub default_workflow_timeout_ms: Option<u64>,
    /// Run compensations after a confirmed failure.
    pub compensate_on_failure: bool,
    /// Resume an instance in the background once its signal is accepted.
    pub resume_on_signal: bool,
    /// Logging configuration.
    pub logging: LogConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_ms: 30_000,
            default_workflow_timeout_ms: None,
            compensate_on_failure: true,
            resume_on_signal: true,
            logging: LogConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults
    /// 2. `sagaflow.yaml` in the working directory, if present
    /// 3. Environment variables (`SAGAFLOW_*`, nested keys split on `__`)
    pub fn load() -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Yaml::file(CONFIG_FILE))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(Box::new)?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .map_err(Box::new)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_step_timeout_ms == 0 {
            return Err(ConfigError::InvalidStepTimeout(self.default_step_timeout_ms));
        }
        if let Some(0) = self.default_workflow_timeout_ms {
            return Err(ConfigError::InvalidWorkflowTimeout(0));
        }
        if !LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }
        Ok(())
    }

    /// Default step timeout as a duration.
    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_millis(self.default_step_timeout_ms)
    }

    /// Default workflow deadline as a duration.
    pub fn default_workflow_timeout(&self) -> Option<Duration> {
        self.default_workflow_timeout_ms.map(Duration::from_millis)
    }
}

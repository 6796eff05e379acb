//! Application configuration.
//!
//! Holds one connection config per transport side plus the demo binary's
//! settings. Loaded from YAML files and environment variables.

mod connection;

pub use connection::{
    ConnectionConfig, DEFAULT_BUFFER_BUDGET_KB, DEFAULT_FLUSH_TIMEOUT_MS,
    DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_QUEUE_DEPTH, DEFAULT_STATS_INTERVAL_MS,
    MAX_MESSAGE_SIZE_CEILING,
};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "ndstream.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "NDSTREAM_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "NDSTREAM";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "NDSTREAM_LOG";

use serde::Deserialize;

use crate::array::ElementType;

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),
}

/// Broker backend used by the demo binary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// In-process broker; publisher and subscriber run in one process.
    #[default]
    Memory,
    /// Kafka (requires the `kafka` feature).
    Kafka,
}

/// Settings for the synthetic frames produced by the demo binary.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    pub backend: Backend,
    /// Number of frames to publish. Zero runs until interrupted.
    pub frames: u64,
    pub frame_interval_ms: u64,
    pub width: usize,
    pub height: usize,
    pub element_type: ElementType,
    pub receive_timeout_ms: u64,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Memory,
            frames: 100,
            frame_interval_ms: 100,
            width: 64,
            height: 64,
            element_type: ElementType::UInt16,
            receive_timeout_ms: 500,
        }
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Publish side connection.
    pub publisher: ConnectionConfig,
    /// Subscribe side connection.
    pub subscriber: ConnectionConfig,
    pub demo: DemoConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `ndstream.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix, `__` separated
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.publisher.validate()?;
        config.subscriber.validate()?;
        Ok(config)
    }
}

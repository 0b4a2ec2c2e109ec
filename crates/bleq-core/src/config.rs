/*!
 * Configuration management for bleq.
 *
 * This module provides functionality to load, validate, and access
 * configuration settings for bleq components.
 */
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Core configuration for bleq
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Task queue configuration
    #[serde(default)]
    pub queue: QueueConfig,

    /// Scan configuration
    #[serde(default)]
    pub scan: ScanConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Task queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of queued operations; submissions beyond this are rejected
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,

    /// Default timeout for connect operations in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Default timeout for read/write operations in milliseconds
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
}

/// Scan configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Whether repeated advertisements from the same peripheral are dropped
    #[serde(default = "default_filter_duplicates")]
    pub filter_duplicates: bool,

    /// Scan timeout in milliseconds
    #[serde(default = "default_scan_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            queue: QueueConfig::default(),
            scan: ScanConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            connect_timeout_ms: default_connect_timeout_ms(),
            operation_timeout_ms: default_operation_timeout_ms(),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            filter_duplicates: default_filter_duplicates(),
            timeout_ms: default_scan_timeout_ms(),
        }
    }
}

impl QueueConfig {
    /// Get the default connect timeout as a [`Duration`]
    pub fn connect_timeout(&self) -> Duration {
        crate::utils::millis_to_duration(self.connect_timeout_ms)
    }

    /// Get the default read/write timeout as a [`Duration`]
    pub fn operation_timeout(&self) -> Duration {
        crate::utils::millis_to_duration(self.operation_timeout_ms)
    }
}

impl ScanConfig {
    /// Get the scan timeout as a [`Duration`]
    pub fn timeout(&self) -> Duration {
        crate::utils::millis_to_duration(self.timeout_ms)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_queue_capacity() -> usize {
    10
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_operation_timeout_ms() -> u64 {
    3_000
}

fn default_filter_duplicates() -> bool {
    true
}

fn default_scan_timeout_ms() -> u64 {
    10_000
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
    override_with: Option<Config>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Override with an existing config
    pub fn override_with(mut self, config: Config) -> Self {
        self.override_with = Some(config);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<Config> {
        let mut config_builder = ConfigLib::builder();

        // Start with default values
        let default_config = Config::default();
        config_builder = config_builder.add_source(
            config::Config::try_from(&default_config)
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        // Add configuration from file if specified
        if let Some(config_file) = self.config_file {
            let path = Path::new(&config_file);
            if path.exists() {
                debug!("Loading configuration from {}", config_file);
                config_builder = config_builder.add_source(File::with_name(&config_file));
            } else {
                debug!(
                    "Configuration file {} does not exist, using defaults",
                    config_file
                );
            }
        }

        // Add configuration from environment variables if prefix is specified
        if let Some(prefix) = self.environment_prefix {
            debug!(
                "Loading configuration from environment variables with prefix {}",
                prefix
            );
            config_builder = config_builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        // Build the config
        let config_lib = config_builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?;

        // Convert to our config type
        let mut config: Config = config_lib
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        // Override with provided config if specified
        if let Some(override_config) = self.override_with {
            config = override_config;
        }

        if config.queue.capacity == 0 {
            return Err(Error::config("queue.capacity must be at least 1"));
        }

        info!("Configuration loaded successfully");
        Ok(config)
    }
}

/// A thread-safe reference to a configuration
#[derive(Debug, Clone)]
pub struct SharedConfig(Arc<Config>);

impl SharedConfig {
    /// Create a new SharedConfig
    pub fn new(config: Config) -> Self {
        Self(Arc::new(config))
    }

    /// Get a reference to the config
    pub fn get(&self) -> &Config {
        &self.0
    }
}

impl From<Config> for SharedConfig {
    fn from(config: Config) -> Self {
        Self::new(config)
    }
}

impl AsRef<Config> for SharedConfig {
    fn as_ref(&self) -> &Config {
        self.get()
    }
}

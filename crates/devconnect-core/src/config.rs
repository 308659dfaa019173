/*!
 * Configuration management for Device Connect.
 *
 * Settings are layered: built-in defaults, then an optional TOML file, then
 * environment variables (`PREFIX__SECTION__KEY`).
 */
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Core configuration for Device Connect
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Response correlation configuration
    #[serde(default)]
    pub correlator: CorrelatorConfig,

    /// Event polling configuration
    #[serde(default)]
    pub polling: PollingConfig,

    /// Device connection configuration
    #[serde(default)]
    pub connection: ConnectionConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Domain appended to composite service ids
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Application environment (development, production, etc.)
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to use JSON format for logs
    #[serde(default)]
    pub json_format: bool,
}

/// Response correlation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelatorConfig {
    /// How long a pending request waits for its reply
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,

    /// Resends allowed after a NACK for ordinary commands
    #[serde(default = "default_nack_retries")]
    pub nack_retries: u32,

    /// Total attempts for parameter commands (thresholds, sizes)
    #[serde(default = "default_parameter_attempts")]
    pub parameter_attempts: u32,

    /// Pause after the recovery action before resending
    #[serde(default = "default_recovery_delay_ms")]
    pub recovery_delay_ms: u64,
}

/// Event polling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Poll interval when a subscription does not give one
    #[serde(default = "default_poll_interval_ms")]
    pub default_interval_ms: u64,

    /// Capacity of each plugin's inbound queue
    #[serde(default = "default_inbound_capacity")]
    pub inbound_capacity: usize,
}

/// Device connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Attempts made by a connect before giving up
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: usize,

    /// Timeout of a single connect attempt
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Upper bound for a discovery run
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            domain: default_domain(),
            environment: default_environment(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: default_response_timeout_ms(),
            nack_retries: default_nack_retries(),
            parameter_attempts: default_parameter_attempts(),
            recovery_delay_ms: default_recovery_delay_ms(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            default_interval_ms: default_poll_interval_ms(),
            inbound_capacity: default_inbound_capacity(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_attempts: default_connect_attempts(),
            connect_timeout_ms: default_connect_timeout_ms(),
            discovery_timeout_ms: default_discovery_timeout_ms(),
        }
    }
}

impl CorrelatorConfig {
    /// Response window as a duration
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Settle delay as a duration
    pub fn recovery_delay(&self) -> Duration {
        Duration::from_millis(self.recovery_delay_ms)
    }
}

impl PollingConfig {
    /// Default poll interval as a duration
    pub fn default_interval(&self) -> Duration {
        Duration::from_millis(self.default_interval_ms)
    }
}

impl ConnectionConfig {
    /// Connect timeout as a duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Discovery timeout as a duration
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }
}

impl Config {
    /// Check values that would make the system misbehave
    pub fn validate(&self) -> Result<()> {
        if self.correlator.response_timeout_ms == 0 {
            return Err(Error::config("correlator.response_timeout_ms must be positive"));
        }
        if self.correlator.parameter_attempts == 0 {
            return Err(Error::config("correlator.parameter_attempts must be at least 1"));
        }
        if self.polling.default_interval_ms == 0 {
            return Err(Error::config("polling.default_interval_ms must be positive"));
        }
        if self.polling.inbound_capacity == 0 {
            return Err(Error::config("polling.inbound_capacity must be positive"));
        }
        if self.connection.connect_attempts == 0 {
            return Err(Error::config("connection.connect_attempts must be at least 1"));
        }
        if self.general.domain.trim().is_empty() {
            return Err(Error::config("general.domain must not be empty"));
        }
        Ok(())
    }

    /// Render the effective configuration as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn default_app_name() -> String {
    "devconnect".to_string()
}

fn default_domain() -> String {
    "localhost.deviceconnect.org".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_response_timeout_ms() -> u64 {
    4000
}

fn default_nack_retries() -> u32 {
    1
}

fn default_parameter_attempts() -> u32 {
    3
}

fn default_recovery_delay_ms() -> u64 {
    2000
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_inbound_capacity() -> usize {
    256
}

fn default_connect_attempts() -> usize {
    3
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_discovery_timeout_ms() -> u64 {
    10000
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
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

    /// Build and validate the configuration
    pub fn build(self) -> Result<Config> {
        let defaults = ConfigLib::try_from(&Config::default())
            .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?;
        let mut builder = ConfigLib::builder().add_source(defaults);

        if let Some(config_file) = self.config_file {
            if Path::new(&config_file).exists() {
                debug!("Loading configuration from {}", config_file);
                builder = builder.add_source(File::with_name(&config_file));
            } else {
                debug!("Configuration file {} does not exist, using defaults", config_file);
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            builder = builder.add_source(
                Environment::with_prefix(&prefix)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config: Config = builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        config.validate()?;
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

impl Default for SharedConfig {
    fn default() -> Self {
        Self::new(Config::default())
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

//! Configuration loading and typed config structures for the world host.
//!
//! The canonical configuration lives in `worldhost-config.yaml`. This module
//! defines strongly-typed structs that mirror the YAML structure, and
//! provides a loader that reads and validates the file. Every field has a
//! default, so an empty file yields a usable configuration.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use worldhost_types::FidelityMode;

/// Environment variable that overrides `driver.fidelity`.
pub const FIDELITY_ENV_VAR: &str = "WORLDHOST_FIDELITY";

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// A value parsed but is outside its legal range.
    #[error("invalid configuration: {reason}")]
    Invalid {
        /// Explanation of what is wrong with the configuration.
        reason: String,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level host configuration.
///
/// Mirrors the structure of `worldhost-config.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HostConfig {
    /// Tick pacing, fidelity control, and persistence settings shared by
    /// every world driver.
    #[serde(default)]
    pub driver: DriverConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Settings for the host process itself.
    #[serde(default)]
    pub host: HostSettings,
}

impl HostConfig {
    /// Load configuration from a YAML file at the given path.
    ///
    /// The `WORLDHOST_FIDELITY` environment variable, when set, overrides
    /// `driver.fidelity`. The result is validated before it is returned.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::Yaml`] if the content is not valid YAML, or
    /// [`ConfigError::Invalid`] if a value is out of range.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&contents)?;
        config.driver.apply_env_overrides();
        config.driver.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    ///
    /// Environment overrides are not applied.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML, or
    /// [`ConfigError::Invalid`] if a value is out of range.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        // An empty document deserializes to unit, not to a mapping.
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yml::from_str(yaml)?;
        config.driver.validate()?;
        Ok(config)
    }
}

/// Settings consumed by each world driver.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DriverConfig {
    /// Target tick frequency in hertz.
    #[serde(default = "default_tick_rate_hz")]
    pub tick_rate_hz: f64,

    /// Length of the sliding window used to measure the achieved tick rate.
    #[serde(default = "default_update_measure_window_ms")]
    pub update_measure_window_ms: u64,

    /// Fidelity score at or below which the automatic level drops one step.
    /// Must be zero or negative.
    #[serde(default = "default_fidelity_decrement_score")]
    pub fidelity_decrement_score: f64,

    /// Fidelity score at or above which the automatic level rises one step.
    /// Must be zero or positive.
    #[serde(default = "default_fidelity_increment_score")]
    pub fidelity_increment_score: f64,

    /// Milliseconds between periodic syncs of world state to storage.
    #[serde(default = "default_storage_interval_ms")]
    pub storage_interval_ms: u64,

    /// `"automatic"` or a fixed level name (`minimum`, `low`, `medium`,
    /// `high`), case-insensitive.
    #[serde(default = "default_fidelity")]
    pub fidelity: String,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            tick_rate_hz: default_tick_rate_hz(),
            update_measure_window_ms: default_update_measure_window_ms(),
            fidelity_decrement_score: default_fidelity_decrement_score(),
            fidelity_increment_score: default_fidelity_increment_score(),
            storage_interval_ms: default_storage_interval_ms(),
            fidelity: default_fidelity(),
        }
    }
}

impl DriverConfig {
    /// Check every value against its legal range.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.tick_rate_hz.is_finite() || self.tick_rate_hz <= 0.0 {
            return Err(invalid(format!(
                "tick_rate_hz must be a positive number, got {}",
                self.tick_rate_hz
            )));
        }
        if self.update_measure_window_ms == 0 {
            return Err(invalid("update_measure_window_ms must be at least 1".to_owned()));
        }
        if !self.fidelity_decrement_score.is_finite() || self.fidelity_decrement_score > 0.0 {
            return Err(invalid(format!(
                "fidelity_decrement_score must be zero or negative, got {}",
                self.fidelity_decrement_score
            )));
        }
        if !self.fidelity_increment_score.is_finite() || self.fidelity_increment_score < 0.0 {
            return Err(invalid(format!(
                "fidelity_increment_score must be zero or positive, got {}",
                self.fidelity_increment_score
            )));
        }
        if self.storage_interval_ms == 0 {
            return Err(invalid("storage_interval_ms must be at least 1".to_owned()));
        }
        self.fidelity_mode().map(|_| ())
    }

    /// Parse the configured fidelity selector.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the name is not `automatic` or a
    /// known level.
    pub fn fidelity_mode(&self) -> Result<FidelityMode, ConfigError> {
        self.fidelity
            .parse()
            .map_err(|err| invalid(format!("fidelity: {err}")))
    }

    /// Duration of one tick at the target rate.
    pub fn target_period(&self) -> Duration {
        Duration::try_from_secs_f64(self.tick_rate_hz.recip())
            .unwrap_or_else(|_| Duration::from_secs_f64(default_tick_rate_hz().recip()))
    }

    /// Length of the tick-rate measurement window.
    pub const fn update_measure_window(&self) -> Duration {
        Duration::from_millis(self.update_measure_window_ms)
    }

    /// Interval between periodic syncs.
    pub const fn storage_interval(&self) -> Duration {
        Duration::from_millis(self.storage_interval_ms)
    }

    /// Apply environment variable overrides. Only `WORLDHOST_FIDELITY` is
    /// recognised.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(fidelity) = std::env::var(FIDELITY_ENV_VAR) {
            self.fidelity = fidelity;
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error). `RUST_LOG` takes
    /// precedence when set.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Settings for the host process that runs several worlds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HostSettings {
    /// Number of worlds to run side by side.
    #[serde(default = "default_worlds")]
    pub worlds: u32,

    /// Clients attached to each world at startup.
    #[serde(default = "default_clients_per_world")]
    pub clients_per_world: u16,

    /// Wall-clock seconds to run before shutting down (0 = until stopped).
    #[serde(default = "default_run_seconds")]
    pub run_seconds: u64,

    /// Milliseconds between supervision passes over the worlds.
    #[serde(default = "default_supervise_interval_ms")]
    pub supervise_interval_ms: u64,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            worlds: default_worlds(),
            clients_per_world: default_clients_per_world(),
            run_seconds: default_run_seconds(),
            supervise_interval_ms: default_supervise_interval_ms(),
        }
    }
}

const fn invalid(reason: String) -> ConfigError {
    ConfigError::Invalid { reason }
}

// ---------------------------------------------------------------------------
// Default value functions
// ---------------------------------------------------------------------------

const fn default_tick_rate_hz() -> f64 {
    60.0
}

const fn default_update_measure_window_ms() -> u64 {
    500
}

const fn default_fidelity_decrement_score() -> f64 {
    -2.0
}

const fn default_fidelity_increment_score() -> f64 {
    10.0
}

const fn default_storage_interval_ms() -> u64 {
    30_000
}

fn default_fidelity() -> String {
    "automatic".to_owned()
}

fn default_log_level() -> String {
    "info".to_owned()
}

const fn default_worlds() -> u32 {
    2
}

const fn default_clients_per_world() -> u16 {
    4
}

const fn default_run_seconds() -> u64 {
    10
}

const fn default_supervise_interval_ms() -> u64 {
    1_000
}

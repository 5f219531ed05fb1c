//! Driver configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `SMU_`, using `__` between nested
//!    keys (e.g. `SMU_PIPELINE__TRANSFERS_IN_FLIGHT=8`)
//!
//! Every field has a default, so an empty file (or no file) yields a usable
//! configuration.
//!
//! # Example
//! ```no_run
//! use daq_driver_smu::config::SmuConfig;
//!
//! # fn main() -> daq_driver_smu::Result<()> {
//! let config = SmuConfig::load_from("config/smu.toml")?;
//! config.validate()?;
//! println!("Sample rate: {}", config.session.sample_rate);
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SmuError};

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "SMU_";

/// Sample rate used when a session is started without `configure`.
pub const DEFAULT_SAMPLE_RATE: u64 = 10_000;

/// Top-level driver configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmuConfig {
    /// Session-level settings
    pub session: SessionConfig,
    /// Transfer pipeline settings, applied to every device
    pub pipeline: PipelineConfig,
    /// Logging settings
    pub logging: LoggingConfig,
}

/// Session settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Sample rate applied when starting without an explicit `configure`
    pub sample_rate: u64,
    /// Upper bound for one pass of the background event loop, in milliseconds
    pub poll_interval_ms: u64,
    /// Capacity of the session event channel
    pub event_capacity: usize,
    /// How long teardown waits for transfers to drain, in milliseconds
    pub shutdown_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            poll_interval_ms: 10,
            event_capacity: 1024,
            shutdown_timeout_ms: 2000,
        }
    }
}

impl SessionConfig {
    /// Poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Shutdown timeout as a [`Duration`].
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Transfer pipeline settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Transfers kept in flight per direction
    pub transfers_in_flight: usize,
    /// Amount of signal carried by one transfer, in milliseconds
    pub buffer_time_ms: u64,
    /// Timeout for bulk transfers, in milliseconds
    pub transfer_timeout_ms: u64,
    /// Timeout for control requests, in milliseconds
    pub control_timeout_ms: u64,
    /// Failed completions in a row before a device is given up on
    pub max_consecutive_errors: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            transfers_in_flight: 4,
            buffer_time_ms: 10,
            transfer_timeout_ms: 1000,
            control_timeout_ms: 100,
            max_consecutive_errors: 3,
        }
    }
}

impl PipelineConfig {
    /// Bulk transfer timeout as a [`Duration`].
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    /// Control request timeout as a [`Duration`].
    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }

    /// Buffer time in seconds.
    pub fn buffer_time_secs(&self) -> f64 {
        self.buffer_time_ms as f64 / 1000.0
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format (pretty, compact, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl SmuConfig {
    /// Load configuration from a TOML file plus `SMU_` environment overrides.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::figment()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?)
    }

    /// Load configuration from a TOML string (no environment overrides).
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        Ok(Self::figment().merge(Toml::string(toml)).extract()?)
    }

    /// Render the configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| SmuError::InvalidConfig {
            message: e.to_string(),
        })
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(SmuConfig::default()))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(invalid(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(invalid(format!(
                "Invalid log format '{}'. Must be one of: {}",
                self.logging.format,
                valid_formats.join(", ")
            )));
        }

        if self.session.sample_rate == 0 {
            return Err(invalid("session.sample_rate must be > 0"));
        }
        if self.session.poll_interval_ms == 0 {
            return Err(invalid("session.poll_interval_ms must be > 0"));
        }
        if self.session.event_capacity == 0 {
            return Err(invalid("session.event_capacity must be > 0"));
        }

        if self.pipeline.transfers_in_flight == 0 {
            return Err(invalid("pipeline.transfers_in_flight must be > 0"));
        }
        if self.pipeline.buffer_time_ms == 0 {
            return Err(invalid("pipeline.buffer_time_ms must be > 0"));
        }
        if self.pipeline.max_consecutive_errors == 0 {
            return Err(invalid("pipeline.max_consecutive_errors must be > 0"));
        }

        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> SmuError {
    SmuError::InvalidConfig {
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SmuConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.session.sample_rate, DEFAULT_SAMPLE_RATE);
        assert_eq!(config.pipeline.transfers_in_flight, 4);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = SmuConfig::from_toml_str(
            r#"
            [pipeline]
            transfers_in_flight = 8
            "#,
        )
        .unwrap();

        assert_eq!(config.pipeline.transfers_in_flight, 8);
        assert_eq!(config.pipeline.buffer_time_ms, 10);
        assert_eq!(config.session, SessionConfig::default());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = SmuConfig::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());

        let mut config = SmuConfig::default();
        config.pipeline.transfers_in_flight = 0;
        assert!(config.validate().is_err());

        let mut config = SmuConfig::default();
        config.session.sample_rate = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = SmuConfig::default();
        config.session.sample_rate = 50_000;
        let text = config.to_toml_string().unwrap();
        assert_eq!(SmuConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_type_mismatch_is_config_error() {
        let err = SmuConfig::from_toml_str("[session]\nsample_rate = \"fast\"").unwrap_err();
        assert!(matches!(err, SmuError::Config(_)));
    }
}

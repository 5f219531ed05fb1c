//! Tracing setup.
//!
//! The driver only emits `tracing` events; it never installs a subscriber on
//! its own. Applications either call [`init`] once, or build a
//! [`tracing::Dispatch`] with [`dispatch`] and hand it to
//! [`crate::session::Session::with_dispatch`] so that the session's background
//! thread logs into it without touching process-wide state.
//!
//! # Example
//! ```no_run
//! use daq_driver_smu::logging::{self, LogFormat, TracingConfig};
//! use tracing::Level;
//!
//! # fn main() -> daq_driver_smu::Result<()> {
//! let config = TracingConfig::new(Level::DEBUG).with_format(LogFormat::Json);
//! logging::init(&config)?;
//! # Ok(())
//! # }
//! ```

use std::str::FromStr;

use tracing::{Dispatch, Level};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::config::LoggingConfig;
use crate::error::{Result, SmuError};

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, colored (development)
    Pretty,
    /// Single-line, no colors
    Compact,
    /// One JSON object per line
    Json,
}

impl FromStr for LogFormat {
    type Err = SmuError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(SmuError::InvalidConfig {
                message: format!(
                    "Invalid log format '{s}'. Must be one of: pretty, compact, json"
                ),
            }),
        }
    }
}

/// Subscriber options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Default level when `RUST_LOG` is not set
    pub level: Level,
    /// Output format
    pub format: LogFormat,
    /// Emit span open/close events
    pub with_span_events: bool,
    /// Include thread names (the session thread is `smu-session`)
    pub with_thread_names: bool,
    /// Colors for the pretty format
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            with_span_events: false,
            with_thread_names: true,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    /// Config with the given default level.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Build from the `[logging]` section of [`crate::config::SmuConfig`].
    pub fn from_logging_config(config: &LoggingConfig) -> Result<Self> {
        Ok(Self {
            level: parse_log_level(&config.level)?,
            format: config.format.parse()?,
            ..Default::default()
        })
    }

    /// Set output format
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable span events
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Enable or disable ANSI colors
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

fn fmt_layer(config: &TracingConfig) -> Box<dyn Layer<Registry> + Send + Sync> {
    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    match config.format {
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_span_events(span_events)
            .with_thread_names(config.with_thread_names)
            .with_ansi(config.with_ansi)
            .with_filter(filter)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_span_events(span_events)
            .with_thread_names(config.with_thread_names)
            .with_ansi(false)
            .with_filter(filter)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_span_events(span_events)
            .with_thread_names(config.with_thread_names)
            .with_filter(filter)
            .boxed(),
    }
}

/// Build a dispatcher without installing it.
pub fn dispatch(config: &TracingConfig) -> Dispatch {
    Dispatch::new(tracing_subscriber::registry().with(fmt_layer(config)))
}

/// Install the subscriber as the global default.
///
/// Calling this again after a subscriber is installed is not an error.
pub fn init(config: &TracingConfig) -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt_layer(config))
        .try_init()
        .or_else(|e| {
            if e.to_string().contains("global default trace dispatcher has already been set") {
                Ok(())
            } else {
                Err(SmuError::InvalidConfig {
                    message: format!("Failed to initialize tracing: {e}"),
                })
            }
        })
}

fn parse_log_level(level: &str) -> Result<Level> {
    Level::from_str(level).map_err(|_| SmuError::InvalidConfig {
        message: format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("debug").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level("WARN").unwrap(), Level::WARN);
        assert!(parse_log_level("loud").is_err());
    }

    #[test]
    fn test_from_logging_config() {
        let config = TracingConfig::from_logging_config(&LoggingConfig {
            level: "trace".to_string(),
            format: "json".to_string(),
        })
        .unwrap();
        assert_eq!(config.level, Level::TRACE);
        assert_eq!(config.format, LogFormat::Json);

        let bad = LoggingConfig {
            level: "info".to_string(),
            format: "xml".to_string(),
        };
        assert!(TracingConfig::from_logging_config(&bad).is_err());
    }

    #[test]
    fn test_dispatch_is_scoped() {
        let dispatch = dispatch(&TracingConfig::new(Level::ERROR).with_ansi(false));
        tracing::dispatcher::with_default(&dispatch, || {
            tracing::error!(component = "test", "routed to the scoped dispatcher");
        });
    }
}

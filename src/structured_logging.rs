//! Global `tracing` subscriber setup.
//!
//! The routines, losses and metrics emit `tracing` events (`debug!` per
//! step, `info!` per epoch boundary, `warn!` on degenerate metric inputs).
//! This module installs a subscriber that renders them. Only available with
//! the `structured-logging` feature:
//!
//! ```toml
//! [dependencies]
//! tensorlogic-uncertainty = { version = "0.1", features = ["structured-logging"] }
//! ```
//!
//! ```no_run
//! use tensorlogic_uncertainty::structured_logging::{LogFormat, LogLevel, TracingLogger};
//!
//! let _logger = TracingLogger::builder()
//!     .with_format(LogFormat::Json)
//!     .with_level(LogLevel::Debug)
//!     .build()
//!     .expect("subscriber already installed");
//! ```

use crate::{TrainError, TrainResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing_subscriber::{
    fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, coloured output for interactive runs.
    #[default]
    Pretty,
    /// One line per event without colours.
    Compact,
    /// One JSON object per event.
    Json,
}

/// Minimum level rendered when no env filter is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Per-scalar sink traffic.
    Trace,
    /// Per-step losses and mixing details.
    Debug,
    /// Epoch boundaries and calibration results.
    #[default]
    Info,
    /// Degenerate metric inputs and configuration ambiguities.
    Warn,
    /// Errors only.
    Error,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = TrainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(TrainError::ConfigError(format!(
                "{} is not a valid log level.",
                other
            ))),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builder for the global subscriber.
#[derive(Debug, Clone)]
pub struct TracingLoggerBuilder {
    format: LogFormat,
    level: LogLevel,
    env_filter: Option<String>,
    with_targets: bool,
    with_file_location: bool,
    with_span_events: bool,
}

impl Default for TracingLoggerBuilder {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            level: LogLevel::Info,
            env_filter: None,
            with_targets: true,
            with_file_location: false,
            with_span_events: false,
        }
    }
}

impl TracingLoggerBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the output format.
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Set the log level filter.
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    /// Set a filter directive such as `tensorlogic_uncertainty::routine=debug`.
    /// Overrides the level.
    pub fn with_env_filter(mut self, filter: impl Into<String>) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    /// Include target names (module paths) in logs.
    pub fn with_targets(mut self, enabled: bool) -> Self {
        self.with_targets = enabled;
        self
    }

    /// Include `file:line` in logs.
    pub fn with_file_location(mut self, enabled: bool) -> Self {
        self.with_file_location = enabled;
        self
    }

    /// Emit span open/close events.
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    fn filter(&self) -> TrainResult<EnvFilter> {
        match &self.env_filter {
            Some(directives) => EnvFilter::try_new(directives)
                .map_err(|e| TrainError::ConfigError(format!("Invalid env filter: {}", e))),
            None => Ok(EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(self.level.as_str()))),
        }
    }

    /// Install the subscriber globally.
    ///
    /// Fails if a global subscriber is already set.
    pub fn build(self) -> TrainResult<TracingLogger> {
        let filter = self.filter()?;
        let span_events = if self.with_span_events {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let base = tracing_subscriber::fmt::layer()
            .with_target(self.with_targets)
            .with_file(self.with_file_location)
            .with_line_number(self.with_file_location)
            .with_span_events(span_events);
        let layer = match self.format {
            LogFormat::Pretty => base.pretty().boxed(),
            LogFormat::Compact => base.with_ansi(false).compact().boxed(),
            LogFormat::Json => base.json().boxed(),
        };

        tracing_subscriber::registry()
            .with(layer)
            .with(filter)
            .try_init()
            .map_err(|e| TrainError::Other(format!("Failed to initialize tracing: {}", e)))?;

        Ok(TracingLogger {
            format: self.format,
        })
    }
}

/// Handle to the installed subscriber.
#[derive(Debug)]
pub struct TracingLogger {
    format: LogFormat,
}

impl TracingLogger {
    /// Create a new logger builder.
    pub fn builder() -> TracingLoggerBuilder {
        TracingLoggerBuilder::new()
    }

    /// Pretty output at `info`.
    pub fn init() -> TrainResult<Self> {
        Self::builder().build()
    }

    /// JSON output at `info`, without targets.
    pub fn init_production() -> TrainResult<Self> {
        Self::builder()
            .with_format(LogFormat::Json)
            .with_targets(false)
            .build()
    }

    /// Pretty output at `debug` with file locations.
    pub fn init_development() -> TrainResult<Self> {
        Self::builder()
            .with_level(LogLevel::Debug)
            .with_file_location(true)
            .build()
    }

    /// Format the subscriber renders with.
    pub fn format(&self) -> LogFormat {
        self.format
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_configuration() {
        let builder = TracingLoggerBuilder::new()
            .with_format(LogFormat::Json)
            .with_level(LogLevel::Debug)
            .with_targets(false)
            .with_file_location(true)
            .with_span_events(true);

        assert_eq!(builder.format, LogFormat::Json);
        assert_eq!(builder.level, LogLevel::Debug);
        assert!(!builder.with_targets);
        assert!(builder.with_file_location);
        assert!(builder.with_span_events);
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!("WARN".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!(LogLevel::Trace.to_string(), "trace");
        assert!("verbose".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_invalid_env_filter() {
        let builder = TracingLoggerBuilder::new().with_env_filter("tensorlogic_uncertainty=notalevel");
        assert!(builder.filter().is_err());
    }
}

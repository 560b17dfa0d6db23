//! Tracing Infrastructure
//!
//! Structured logging for the runtime, built on `tracing` and `tracing-subscriber`:
//! - Structured events with machine, tag and user fields
//! - Multiple output formats (pretty, compact, JSON)
//! - Environment-based filtering (`RUST_LOG` overrides the configured level)
//!
//! # Example
//! ```no_run
//! use rust_automation::{config::RuntimeConfig, logging};
//! use tracing::info;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RuntimeConfig::load()?;
//! logging::init_from_config(&config)?;
//! info!(machine = "DAQ-1.0", "Worker started");
//! # Ok(())
//! # }
//! ```

use crate::config::RuntimeConfig;
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Output format for tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Pretty-printed format with colors (for development)
    Pretty,
    /// Compact format without colors (for production)
    Compact,
    /// JSON format for structured logging (for log aggregation)
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            other => Err(format!(
                "Invalid output format '{}'. Must be one of: pretty, compact, json",
                other
            )),
        }
    }
}

/// Logging configuration options
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// Whether to include file and line numbers
    pub with_file_and_line: bool,
    /// Whether to include thread names (the worker thread is named)
    pub with_thread_names: bool,
    /// Whether to enable ANSI colors (only for Pretty format)
    pub with_ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_file_and_line: false,
            with_thread_names: true,
            with_ansi: true,
        }
    }
}

impl LoggingConfig {
    /// Create logging config from runtime configuration
    pub fn from_runtime_config(config: &RuntimeConfig) -> Result<Self, String> {
        let level = parse_log_level(&config.application.log_level)?;

        Ok(Self {
            level,
            ..Default::default()
        })
    }

    /// Configuration at `level` with the default output format.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Set output format
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable ANSI colors
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Initialize tracing from runtime configuration
pub fn init_from_config(config: &RuntimeConfig) -> Result<(), String> {
    init(LoggingConfig::from_runtime_config(config)?)
}

/// Initialize tracing with custom configuration
///
/// This function is idempotent - if tracing is already initialized, it will
/// return Ok(()) without error. This makes it safe to call in tests and libraries.
pub fn init(config: LoggingConfig) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_to_filter_string(config.level)));

    let layer = match config.format {
        OutputFormat::Pretty => fmt::layer()
            .pretty()
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .with_ansi(config.with_ansi)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .with_ansi(false)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Json => fmt::layer()
            .json()
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .with_filter(env_filter)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .or_else(|e| {
            // Already initialized by another component or test
            if e
                .to_string()
                .contains("a global default trace dispatcher has already been set")
            {
                Ok(())
            } else {
                Err(format!("Failed to initialize tracing: {}", e))
            }
        })
}

/// Parse log level string into tracing Level
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        )),
    }
}

fn level_to_filter_string(level: Level) -> String {
    match level {
        Level::TRACE => "trace".to_string(),
        Level::DEBUG => "debug".to_string(),
        Level::INFO => "info".to_string(),
        Level::WARN => "warn".to_string(),
        Level::ERROR => "error".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert!(matches!(parse_log_level("trace"), Ok(Level::TRACE)));
        assert!(matches!(parse_log_level("INFO"), Ok(Level::INFO)));
        assert!(matches!(parse_log_level("Debug"), Ok(Level::DEBUG)));
        assert!(parse_log_level("invalid").is_err());
    }

    #[test]
    fn test_output_format_parsing() {
        assert_eq!("json".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert_eq!("Compact".parse::<OutputFormat>().unwrap(), OutputFormat::Compact);
        assert!("xml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_logging_config_builder() {
        let config = LoggingConfig::new(Level::WARN)
            .with_format(OutputFormat::Json)
            .with_ansi(false);

        assert!(matches!(config.level, Level::WARN));
        assert_eq!(config.format, OutputFormat::Json);
        assert!(!config.with_ansi);
    }

    // `test_init_is_idempotent` lives in tests/logging_init.rs: it installs the
    // global tracing subscriber, which would collide with `#[traced_test]` in
    // this test binary.
}

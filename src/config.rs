//! Runtime configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration, `config/automation.toml` by default)
//! 2. Environment variables (prefixed with `RUST_AUTOMATION_`, nested keys split on `__`)
//!
//! The `[[machines]]` tables hold the persisted machine settings restored by
//! the orchestrator on start; `[[tags]]` declares the tags the CLI creates and
//! subscribes for acquisition.
//!
//! # Example
//! ```no_run
//! use rust_automation::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::load()?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), rust_automation::error::AutomationError>(())
//! ```

use crate::error::{AppResult, AutomationError};
use crate::persistence::MachineSettings;
use crate::registry::ScheduleMode;
use crate::tags::Tag;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "config/automation.toml";

/// Top-level runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Scheduling worker settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Persisted machine settings
    #[serde(default)]
    pub machines: Vec<MachineSettings>,
    /// Tags polled by acquisition machines
    #[serde(default)]
    pub tags: Vec<TagDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Scheduling worker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Interval assigned to machines without persisted settings, in seconds
    #[serde(default = "default_interval")]
    pub default_interval_secs: f64,
    /// Mode assigned to machines registered without an explicit mode
    #[serde(default)]
    pub default_mode: ScheduleMode,
    /// Name of the dedicated worker thread
    #[serde(default = "default_thread_name")]
    pub worker_thread_name: String,
}

/// Tag declaration with its acquisition scan time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagDefinition {
    /// Tag name, units and remote node
    #[serde(flatten)]
    pub tag: Tag,
    /// Polling period in milliseconds
    pub scan_time_ms: f64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_interval() -> f64 {
    1.0
}

fn default_thread_name() -> String {
    "state-machine-worker".to_string()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_interval_secs: default_interval(),
            default_mode: ScheduleMode::default(),
            worker_thread_name: default_thread_name(),
        }
    }
}

impl SchedulerConfig {
    /// Default interval as a `Duration`.
    pub fn default_interval(&self) -> Duration {
        Duration::from_secs_f64(self.default_interval_secs)
    }
}

impl RuntimeConfig {
    /// Load configuration from the default file and environment variables
    ///
    /// Environment variables can override configuration with prefix `RUST_AUTOMATION_`
    /// Example: `RUST_AUTOMATION_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: RuntimeConfig = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("RUST_AUTOMATION_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(AutomationError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if !(self.scheduler.default_interval_secs > 0.0) {
            return Err(AutomationError::Configuration(format!(
                "Invalid default_interval_secs {}. Must be positive",
                self.scheduler.default_interval_secs
            )));
        }

        let mut names = HashSet::new();
        for machine in &self.machines {
            if !names.insert(&machine.name) {
                return Err(AutomationError::Configuration(format!(
                    "Duplicate machine name: {}",
                    machine.name
                )));
            }
            if !(machine.interval > 0.0) {
                return Err(AutomationError::Configuration(format!(
                    "Machine '{}' has a non-positive interval {}",
                    machine.name, machine.interval
                )));
            }
            if machine.buffer_size == 0 {
                return Err(AutomationError::Configuration(format!(
                    "Machine '{}' has a zero buffer_size",
                    machine.name
                )));
            }
        }

        let mut tags = HashSet::new();
        for definition in &self.tags {
            if !tags.insert(&definition.tag.name) {
                return Err(AutomationError::Configuration(format!(
                    "Duplicate tag name: {}",
                    definition.tag.name
                )));
            }
            if !(definition.scan_time_ms > 0.0) {
                return Err(AutomationError::Configuration(format!(
                    "Tag '{}' has a non-positive scan_time_ms {}",
                    definition.tag.name, definition.scan_time_ms
                )));
            }
        }

        Ok(())
    }
}

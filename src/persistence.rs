//! Machine configuration persistence contract.
//!
//! The orchestrator restores machine settings on start and records them
//! whenever a machine is registered or one of its attributes changes. The
//! durable backend (database, file, ...) is an external collaborator; this
//! module defines the contract and an in-memory implementation.

use crate::buffer::RollPolicy;
use crate::error::AppResult;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Persisted settings of one machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSettings {
    /// Unique machine name
    pub name: String,
    /// Execution interval in seconds
    #[serde(default = "default_interval")]
    pub interval: f64,
    /// Free-form description
    #[serde(default)]
    pub description: String,
    /// Machine category
    #[serde(default)]
    pub classification: String,
    /// Capacity of every buffer
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Buffer roll policy
    #[serde(default)]
    pub buffer_roll_policy: RollPolicy,
    /// Alarm severity
    #[serde(default = "default_criticity")]
    pub criticity: i64,
    /// Scheduling priority
    #[serde(default = "default_priority")]
    pub priority: i64,
}

fn default_interval() -> f64 {
    1.0
}

fn default_buffer_size() -> usize {
    10
}

fn default_criticity() -> i64 {
    2
}

fn default_priority() -> i64 {
    1
}

impl MachineSettings {
    /// Settings for `name` with every other field at its default.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            interval: default_interval(),
            description: String::new(),
            classification: String::new(),
            buffer_size: default_buffer_size(),
            buffer_roll_policy: RollPolicy::default(),
            criticity: default_criticity(),
            priority: default_priority(),
        }
    }
}

/// Durable store of machine settings.
pub trait MachineConfigStore: Send + Sync {
    /// Every persisted machine, keyed by name.
    fn read_machine_config(&self) -> AppResult<HashMap<String, MachineSettings>>;

    /// Insert or replace the settings of `settings.name`.
    fn record_machine(&self, settings: &MachineSettings) -> AppResult<()>;
}

/// Process-local [`MachineConfigStore`].
#[derive(Debug, Default)]
pub struct InMemoryMachineConfigStore {
    machines: RwLock<HashMap<String, MachineSettings>>,
}

impl InMemoryMachineConfigStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store, e.g. from the `[[machines]]` section of the runtime config.
    pub fn from_settings(settings: impl IntoIterator<Item = MachineSettings>) -> Self {
        let machines = settings
            .into_iter()
            .map(|s| (s.name.clone(), s))
            .collect();
        Self {
            machines: RwLock::new(machines),
        }
    }

    /// Settings recorded for `name`.
    pub fn get(&self, name: &str) -> Option<MachineSettings> {
        self.machines.read().get(name).cloned()
    }

    /// Number of recorded machines.
    pub fn len(&self) -> usize {
        self.machines.read().len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.machines.read().is_empty()
    }
}

impl MachineConfigStore for InMemoryMachineConfigStore {
    fn read_machine_config(&self) -> AppResult<HashMap<String, MachineSettings>> {
        Ok(self.machines.read().clone())
    }

    fn record_machine(&self, settings: &MachineSettings) -> AppResult<()> {
        self.machines
            .write()
            .insert(settings.name.clone(), settings.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_machine_upserts() {
        let store = InMemoryMachineConfigStore::new();
        let mut settings = MachineSettings::named("boiler");
        store.record_machine(&settings).unwrap();

        settings.priority = 4;
        store.record_machine(&settings).unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get("boiler").unwrap().priority, 4);
    }

    #[test]
    fn seeded_store_reads_back() {
        let store = InMemoryMachineConfigStore::from_settings(vec![
            MachineSettings::named("a"),
            MachineSettings::named("b"),
        ]);
        let config = store.read_machine_config().unwrap();
        assert_eq!(config.len(), 2);
        assert!(config.contains_key("a"));
    }

    #[test]
    fn settings_fill_defaults_when_deserialized() {
        let settings: MachineSettings = toml::from_str("name = \"pump\"").unwrap();
        assert_eq!(settings.interval, 1.0);
        assert_eq!(settings.buffer_size, 10);
        assert_eq!(settings.buffer_roll_policy, RollPolicy::Backward);
        assert_eq!(settings.criticity, 2);
        assert_eq!(settings.priority, 1);
    }
}

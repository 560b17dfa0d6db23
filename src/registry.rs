//! Machine Registry
//!
//! Name-keyed store of the machines driven by the scheduling worker. Each
//! entry pairs a machine with its schedule mode; the execution interval is
//! held by the machine itself.
//!
//! Acquisition machines are keyed by rate: their name is derived from the
//! interval they are registered at (`DAQ-1.0`, `DAQ-0.5`, ...), so every
//! polling rate has exactly one acquisition machine.
//!
//! # Example
//!
//! ```rust,ignore
//! let registry = MachineRegistry::new();
//! let daq = StateMachine::acquisition(store.clone(), protocol.clone())?;
//! let daq = registry.append(daq, 0.5, ScheduleMode::Async)?;
//! assert_eq!(daq.name(), "DAQ-0.5");
//! ```

use crate::error::{AppResult, AutomationError};
use crate::machine::{MachineAttribute, MachineKind, StateMachine};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// =============================================================================
// Schedule Mode
// =============================================================================

/// How the worker drives a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleMode {
    /// Ticked in sequence with the other sync machines
    Sync,
    /// Ticked by its own timer
    #[default]
    Async,
}

impl fmt::Display for ScheduleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleMode::Sync => f.write_str("sync"),
            ScheduleMode::Async => f.write_str("async"),
        }
    }
}

/// Registry name of the acquisition machine running every `interval` seconds.
pub fn acquisition_name(interval: f64) -> String {
    format!("DAQ-{:?}", interval)
}

// =============================================================================
// Registry
// =============================================================================

/// A registered machine.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    /// Registered machine
    pub machine: Arc<StateMachine>,
    /// How the worker drives it
    pub mode: ScheduleMode,
}

impl RegistryEntry {
    /// Execution interval of the machine.
    pub fn interval(&self) -> Duration {
        self.machine.interval()
    }
}

/// Central store of registered machines.
#[derive(Debug, Default)]
pub struct MachineRegistry {
    entries: RwLock<HashMap<String, RegistryEntry>>,
}

impl MachineRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `machine` to run every `interval` seconds.
    ///
    /// Acquisition machines are renamed after their interval; if one is
    /// already registered at that interval it is returned instead and
    /// `machine` is discarded. Any other name collision is an error.
    ///
    /// # Errors
    /// - `InvalidAttribute` if `interval` is not a positive number
    /// - `DuplicateMachine` if the name is taken
    pub fn append(
        &self,
        machine: Arc<StateMachine>,
        interval: f64,
        mode: ScheduleMode,
    ) -> AppResult<Arc<StateMachine>> {
        MachineAttribute::Interval(interval).validate()?;
        let is_acquisition = machine.kind() == MachineKind::Acquisition;
        let name = if is_acquisition {
            acquisition_name(interval)
        } else {
            machine.name()
        };

        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(&name) {
            if is_acquisition && existing.machine.kind() == MachineKind::Acquisition {
                debug!(machine = %name, "Reusing acquisition machine for interval");
                return Ok(existing.machine.clone());
            }
            return Err(AutomationError::DuplicateMachine(name));
        }

        if is_acquisition {
            machine.rename(name.clone());
        }
        machine.assign_interval(interval);
        entries.insert(
            name.clone(),
            RegistryEntry {
                machine: machine.clone(),
                mode,
            },
        );

        info!(machine = %name, interval, mode = %mode, "Machine registered");
        Ok(machine)
    }

    /// Machine registered as `name`.
    pub fn get(&self, name: &str) -> Option<Arc<StateMachine>> {
        self.entries.read().get(name).map(|e| e.machine.clone())
    }

    /// Entry registered as `name`.
    pub fn entry(&self, name: &str) -> Option<RegistryEntry> {
        self.entries.read().get(name).cloned()
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    /// Acquisition machine registered at `interval`, if any.
    pub fn acquisition_for(&self, interval: f64) -> Option<Arc<StateMachine>> {
        self.get(&acquisition_name(interval))
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Every entry, sorted by name.
    pub fn entries(&self) -> Vec<(String, RegistryEntry)> {
        let mut entries: Vec<(String, RegistryEntry)> = self
            .entries
            .read()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Remove a machine from the registry.
    ///
    /// Subscriptions are left untouched; see `Orchestrator::drop_machine`.
    pub fn drop_machine(&self, name: &str) -> Option<Arc<StateMachine>> {
        let removed = self.entries.write().remove(name).map(|e| e.machine);
        if removed.is_some() {
            info!(machine = %name, "Machine dropped");
        }
        removed
    }

    /// Whether any machine is registered.
    pub fn exists_any(&self) -> bool {
        !self.entries.read().is_empty()
    }

    /// Number of registered machines.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Unsubscribe every registered machine from `tag`.
    ///
    /// Returns the names of the machines that were subscribed. A failure on
    /// one machine is logged and does not stop the cascade.
    pub fn unsubscribe_tag(&self, tag: &str, user: Option<&str>) -> Vec<String> {
        let machines: Vec<(String, Arc<StateMachine>)> = self
            .entries()
            .into_iter()
            .map(|(name, entry)| (name, entry.machine))
            .collect();

        let mut unsubscribed = Vec::new();
        for (name, machine) in machines {
            match machine.unsubscribe_from(tag, user) {
                Ok(true) => unsubscribed.push(name),
                Ok(false) => {}
                Err(e) => warn!(machine = %name, tag = %tag, error = %e, "Unsubscribe failed"),
            }
        }
        unsubscribed
    }
}

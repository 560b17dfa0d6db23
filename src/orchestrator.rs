//! Orchestrator
//!
//! Top-level entry point of the runtime. The orchestrator owns the machine
//! registry and the scheduling worker and is handed its collaborators (value
//! store, machine configuration store, protocol client) at construction.
//!
//! Lifecycle:
//! 1. `start(machines)` restores persisted settings, registers every machine
//!    and spawns the worker if anything is registered.
//! 2. `subscribe_tag(tag, scan_time_ms)` binds a tag to the acquisition
//!    machine of that rate, creating it (and rebuilding the schedule) on first
//!    use.
//! 3. `stop()` halts the worker; no machine is ticked after it returns.
//!
//! Between `start()` and `stop()` the orchestrator is *started*: every change
//! to the set of registered machines rebuilds the schedule, including the
//! first machine added to an empty one.

use crate::config::SchedulerConfig;
use crate::error::{AppResult, AutomationError};
use crate::machine::{MachineKind, MachineSnapshot, StateMachine};
use crate::persistence::MachineConfigStore;
use crate::protocol::ProtocolClient;
use crate::registry::{MachineRegistry, ScheduleMode};
use crate::scheduler::SchedulerWorker;
use crate::tags::{Tag, ValueStore};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Runtime entry point owning the registry and the scheduling worker.
pub struct Orchestrator {
    registry: Arc<MachineRegistry>,
    value_store: Arc<dyn ValueStore>,
    config_store: Arc<dyn MachineConfigStore>,
    protocol: Arc<dyn ProtocolClient>,
    config: SchedulerConfig,
    worker: Mutex<Option<Arc<SchedulerWorker>>>,
    started: AtomicBool,
    /// Serializes `subscribe_tag` so one rate never gets two acquisition machines
    subscriptions: Mutex<()>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("machines", &self.registry.list())
            .field("started", &self.is_started())
            .field("running", &self.is_running())
            .field("config", &self.config)
            .finish()
    }
}

impl Orchestrator {
    /// Create a stopped orchestrator around its collaborators.
    pub fn new(
        registry: Arc<MachineRegistry>,
        value_store: Arc<dyn ValueStore>,
        config_store: Arc<dyn MachineConfigStore>,
        protocol: Arc<dyn ProtocolClient>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            registry,
            value_store,
            config_store,
            protocol,
            config,
            worker: Mutex::new(None),
            started: AtomicBool::new(false),
            subscriptions: Mutex::new(()),
        }
    }

    /// Registry of every machine driven by the worker.
    pub fn registry(&self) -> &Arc<MachineRegistry> {
        &self.registry
    }

    /// Value store machines observe.
    pub fn value_store(&self) -> &Arc<dyn ValueStore> {
        &self.value_store
    }

    /// Register machines and start the worker.
    ///
    /// Machines with persisted settings get them applied and run at their
    /// persisted interval; others run at the interval given to their builder,
    /// or at the configured default interval.
    /// Machines already registered are kept as they are. A running worker
    /// is replaced so the new schedule takes effect.
    pub fn start(&self, machines: Vec<Arc<StateMachine>>) -> AppResult<()> {
        let persisted = self.config_store.read_machine_config()?;

        for machine in machines {
            let name = machine.name();
            if let Some(existing) = self.registry.get(&name) {
                if Arc::ptr_eq(&existing, &machine) {
                    continue;
                }
            }

            let interval = match persisted.get(&name) {
                Some(settings) if machine.kind() != MachineKind::Acquisition => {
                    machine.apply_settings(settings)?;
                    info!(machine = %name, "Restored persisted settings");
                    settings.interval
                }
                _ => machine
                    .preferred_interval()
                    .unwrap_or(self.config.default_interval_secs),
            };
            self.append_machine(machine, interval, self.config.default_mode)?;
        }

        self.started.store(true, Ordering::SeqCst);
        self.restart()
    }

    /// Replace the worker with one built from the current registry.
    ///
    /// Leaves the worker stopped if no machine is registered.
    pub fn restart(&self) -> AppResult<()> {
        let mut worker = self.worker.lock();
        if let Some(previous) = worker.take() {
            previous.stop();
        }

        if !self.registry.exists_any() {
            info!("No machines registered, scheduling worker not started");
            return Ok(());
        }

        *worker = Some(Arc::new(SchedulerWorker::spawn(&self.registry, &self.config)?));
        Ok(())
    }

    /// Stop the worker. Logs a warning if it was not running.
    pub fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
        let worker = self.worker.lock().take();
        match worker {
            Some(worker) => worker.stop(),
            None => warn!("Scheduling worker is not running"),
        }
    }

    /// Whether `start()` was called and `stop()` was not called since.
    ///
    /// A started orchestrator with no registered machine has no worker.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Whether a worker thread is alive.
    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .map_or(false, |worker| worker.is_running())
    }

    fn current_worker(&self) -> AppResult<Arc<SchedulerWorker>> {
        self.worker
            .lock()
            .clone()
            .ok_or(AutomationError::WorkerNotRunning)
    }

    /// Block until the worker has run `name` at least once.
    pub fn join(&self, name: &str) -> AppResult<()> {
        self.current_worker()?.join(name)
    }

    /// [`Orchestrator::join`] giving up after `timeout`.
    pub fn join_timeout(&self, name: &str, timeout: Duration) -> AppResult<bool> {
        self.current_worker()?.join_timeout(name, timeout)
    }

    /// Register a machine and record its settings.
    ///
    /// The running schedule is not changed until the next `restart`.
    pub fn append_machine(
        &self,
        machine: Arc<StateMachine>,
        interval: f64,
        mode: ScheduleMode,
    ) -> AppResult<Arc<StateMachine>> {
        let machine = self.registry.append(machine, interval, mode)?;
        if let Err(e) = self.config_store.record_machine(&machine.settings()) {
            warn!(machine = %machine.name(), error = %e, "Failed to record machine settings");
        }
        Ok(machine)
    }

    /// Release every subscription of `name`, then remove it.
    ///
    /// A started orchestrator rebuilds its worker so the machine is no
    /// longer ticked.
    pub fn drop_machine(&self, name: &str, user: Option<&str>) -> AppResult<Arc<StateMachine>> {
        let machine = self
            .registry
            .get(name)
            .ok_or_else(|| AutomationError::MachineNotFound(name.to_string()))?;

        machine.unsubscribe_all(user)?;
        self.registry.drop_machine(name);

        if self.is_started() {
            self.restart()?;
        }
        Ok(machine)
    }

    /// Registered machine called `name`.
    pub fn get_machine(&self, name: &str) -> Option<Arc<StateMachine>> {
        self.registry.get(name)
    }

    /// Registered machine names, sorted.
    pub fn get_machines(&self) -> Vec<String> {
        self.registry.list()
    }

    /// Subscribe the acquisition machine polling every `scan_time_ms` to `tag`.
    ///
    /// The machine is created and registered on first use of that rate; a
    /// started orchestrator then rebuilds its worker so the new rate group is
    /// scheduled, even if nothing was scheduled before.
    pub fn subscribe_tag(
        &self,
        tag: &Tag,
        scan_time_ms: f64,
        user: Option<&str>,
    ) -> AppResult<Arc<StateMachine>> {
        if !(scan_time_ms > 0.0) || !scan_time_ms.is_finite() {
            return Err(AutomationError::InvalidAttribute(format!(
                "scan time must be a positive number of milliseconds, got {}",
                scan_time_ms
            )));
        }
        let interval = scan_time_ms / 1000.0;
        let _serial = self.subscriptions.lock();

        let (machine, created) = match self.registry.acquisition_for(interval) {
            Some(machine) => (machine, false),
            None => {
                let built = StateMachine::builder("DAQ", self.value_store.clone())
                    .kind(MachineKind::Acquisition)
                    .protocol_client(self.protocol.clone())
                    .config_store(self.config_store.clone())
                    .build()?;
                let registered =
                    self.append_machine(built.clone(), interval, ScheduleMode::Async)?;
                let created = Arc::ptr_eq(&built, &registered);
                (registered, created)
            }
        };

        if let Err(e) = machine.subscribe_to(tag, user) {
            if created {
                self.registry.drop_machine(&machine.name());
            }
            return Err(e);
        }
        info!(machine = %machine.name(), tag = %tag.name, scan_time_ms, "Tag subscribed");

        if created && self.is_started() {
            self.restart()?;
        }
        Ok(machine)
    }

    /// Unsubscribe every machine from `tag`. Returns the affected machines.
    pub fn unsubscribe_tag(&self, tag: &str, user: Option<&str>) -> Vec<String> {
        self.registry.unsubscribe_tag(tag, user)
    }

    /// Snapshot of every registered machine, sorted by name.
    pub fn serialize_machines(&self) -> Vec<MachineSnapshot> {
        self.registry
            .entries()
            .into_iter()
            .map(|(_, entry)| entry.machine.serialize())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{InMemoryMachineConfigStore, MachineSettings};
    use crate::protocol::MockProtocolClient;
    use crate::tags::InMemoryValueStore;

    fn orchestrator(config_store: Arc<InMemoryMachineConfigStore>) -> Orchestrator {
        Orchestrator::new(
            Arc::new(MachineRegistry::new()),
            Arc::new(InMemoryValueStore::new()),
            config_store,
            Arc::new(MockProtocolClient::new()),
            SchedulerConfig::default(),
        )
    }

    #[test]
    fn start_without_machines_does_not_spawn() {
        let orchestrator = orchestrator(Arc::new(InMemoryMachineConfigStore::new()));
        orchestrator.start(Vec::new()).unwrap();
        assert!(!orchestrator.is_running());
        assert!(matches!(
            orchestrator.join("anything"),
            Err(AutomationError::WorkerNotRunning)
        ));
        orchestrator.stop();
    }

    #[test]
    fn start_restores_persisted_settings() {
        let mut settings = MachineSettings::named("boiler");
        settings.interval = 0.05;
        settings.priority = 7;
        settings.description = "Steam boiler".to_string();
        let config_store = Arc::new(InMemoryMachineConfigStore::from_settings(vec![settings]));
        let orchestrator = orchestrator(config_store);

        let machine =
            StateMachine::generic("boiler", orchestrator.value_store().clone()).unwrap();
        orchestrator.start(vec![machine.clone()]).unwrap();

        assert!(orchestrator.is_running());
        assert_eq!(machine.get_interval(), 0.05);
        assert_eq!(machine.priority(), 7);
        assert_eq!(machine.serialize().description, "Steam boiler");
        orchestrator.join("boiler").unwrap();
        orchestrator.stop();
        assert!(!orchestrator.is_running());
    }

    #[test]
    fn unknown_machines_use_default_interval_and_get_recorded() {
        let config_store = Arc::new(InMemoryMachineConfigStore::new());
        let orchestrator = orchestrator(config_store.clone());
        let machine = StateMachine::generic("pump", orchestrator.value_store().clone()).unwrap();

        orchestrator.start(vec![machine]).unwrap();
        orchestrator.stop();

        let recorded = config_store.get("pump").unwrap();
        assert_eq!(recorded.interval, 1.0);
    }

    #[test]
    fn drop_machine_requires_registration() {
        let orchestrator = orchestrator(Arc::new(InMemoryMachineConfigStore::new()));
        assert!(matches!(
            orchestrator.drop_machine("ghost", None),
            Err(AutomationError::MachineNotFound(_))
        ));
    }

    #[test]
    fn subscribe_tag_rejects_non_positive_scan_time() {
        let orchestrator = orchestrator(Arc::new(InMemoryMachineConfigStore::new()));
        let tag = Tag::new("PT-1", crate::units::Unit::Bar);
        assert!(orchestrator.subscribe_tag(&tag, 0.0, None).is_err());
        assert!(orchestrator.get_machines().is_empty());
    }
}

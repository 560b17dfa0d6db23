//! Shared scheduling worker.
//!
//! One dedicated OS thread drives every registered machine. The thread owns
//! a current-thread tokio runtime:
//!
//! - each `async` machine gets its own timer task, re-armed at the machine's
//!   interval, so rate groups never wait for each other;
//! - all `sync` machines share one task ticking at the smallest sync
//!   interval and run in sequence when due.
//!
//! Ticks run on the blocking pool and are awaited before the next tick of
//! the same machine is issued; a slow machine only delays itself. The
//! schedule is fixed when the worker is spawned: adding a rate group means
//! stopping the worker and spawning a new one.
//!
//! `stop()` signals every task through a watch channel, waits for in-flight
//! ticks and joins the thread, so no machine is touched by the worker after
//! it returns.

use crate::config::SchedulerConfig;
use crate::error::{AppResult, AutomationError};
use crate::machine::StateMachine;
use crate::registry::{MachineRegistry, ScheduleMode};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Machines ticked together at one interval.
#[derive(Debug, Clone, PartialEq)]
pub struct RateGroup {
    /// Tick period
    pub interval: Duration,
    /// Whether members share one task
    pub mode: ScheduleMode,
    /// Machine names, sorted
    pub machines: Vec<String>,
}

#[derive(Debug, Default)]
struct IncorporationState {
    incorporated: HashSet<String>,
    stopped: bool,
}

/// Machines whose first scheduled tick has completed.
#[derive(Debug, Default)]
struct Incorporation {
    state: Mutex<IncorporationState>,
    changed: Condvar,
}

impl Incorporation {
    fn mark(&self, name: &str) {
        let mut state = self.state.lock();
        if state.incorporated.insert(name.to_string()) {
            debug!(machine = %name, "Machine incorporated into schedule");
            self.changed.notify_all();
        }
    }

    fn mark_stopped(&self) {
        self.state.lock().stopped = true;
        self.changed.notify_all();
    }
}

type Scheduled = (String, Arc<StateMachine>);

/// Handle to the running worker thread.
#[derive(Debug)]
pub struct SchedulerWorker {
    thread_name: String,
    groups: Vec<RateGroup>,
    scheduled: HashSet<String>,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    incorporation: Arc<Incorporation>,
}

impl SchedulerWorker {
    /// Spawn a worker driving every machine currently in `registry`.
    ///
    /// # Errors
    /// Returns `WorkerSpawn` if the OS thread could not be created.
    pub fn spawn(registry: &MachineRegistry, config: &SchedulerConfig) -> AppResult<Self> {
        let mut async_machines: Vec<(Scheduled, Duration)> = Vec::new();
        let mut sync_machines: Vec<(Scheduled, Duration)> = Vec::new();
        for (name, entry) in registry.entries() {
            let interval = entry.interval();
            let scheduled = (name, entry.machine);
            match entry.mode {
                ScheduleMode::Async => async_machines.push((scheduled, interval)),
                ScheduleMode::Sync => sync_machines.push((scheduled, interval)),
            }
        }

        let groups = rate_groups(&async_machines, &sync_machines);
        let scheduled: HashSet<String> = async_machines
            .iter()
            .chain(sync_machines.iter())
            .map(|((name, _), _)| name.clone())
            .collect();

        let (shutdown, shutdown_rx) = watch::channel(false);
        let incorporation = Arc::new(Incorporation::default());
        let worker_incorporation = incorporation.clone();
        let handle = thread::Builder::new()
            .name(config.worker_thread_name.clone())
            .spawn(move || {
                run_worker(async_machines, sync_machines, shutdown_rx, worker_incorporation)
            })
            .map_err(|e| AutomationError::WorkerSpawn(e.to_string()))?;

        info!(
            thread = %config.worker_thread_name,
            machines = scheduled.len(),
            groups = groups.len(),
            "Scheduling worker started"
        );

        Ok(Self {
            thread_name: config.worker_thread_name.clone(),
            groups,
            scheduled,
            shutdown,
            handle: Mutex::new(Some(handle)),
            incorporation,
        })
    }

    /// Rate groups of the running schedule.
    pub fn rate_groups(&self) -> &[RateGroup] {
        &self.groups
    }

    /// Whether `name` is part of this schedule.
    pub fn is_scheduled(&self, name: &str) -> bool {
        self.scheduled.contains(name)
    }

    /// Whether the worker thread is alive.
    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Block until the first tick of `name` has completed.
    ///
    /// # Errors
    /// - `MachineNotScheduled` if `name` is not part of this worker's schedule
    /// - `WorkerStopped` if the worker stopped first
    pub fn join(&self, name: &str) -> AppResult<()> {
        self.ensure_scheduled(name)?;
        let mut state = self.incorporation.state.lock();
        loop {
            if state.incorporated.contains(name) {
                return Ok(());
            }
            if state.stopped {
                return Err(AutomationError::WorkerStopped(name.to_string()));
            }
            self.incorporation.changed.wait(&mut state);
        }
    }

    /// [`SchedulerWorker::join`] giving up after `timeout`.
    ///
    /// Returns `Ok(false)` on timeout.
    pub fn join_timeout(&self, name: &str, timeout: Duration) -> AppResult<bool> {
        self.ensure_scheduled(name)?;
        let deadline = Instant::now() + timeout;
        let mut state = self.incorporation.state.lock();
        loop {
            if state.incorporated.contains(name) {
                return Ok(true);
            }
            if state.stopped {
                return Err(AutomationError::WorkerStopped(name.to_string()));
            }
            if self
                .incorporation
                .changed
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return Ok(state.incorporated.contains(name));
            }
        }
    }

    fn ensure_scheduled(&self, name: &str) -> AppResult<()> {
        if self.scheduled.contains(name) {
            Ok(())
        } else {
            Err(AutomationError::MachineNotScheduled(name.to_string()))
        }
    }

    /// Stop the worker and wait for it to finish.
    ///
    /// Idempotent: stopping a stopped worker only logs a warning.
    pub fn stop(&self) {
        let Some(handle) = self.handle.lock().take() else {
            warn!(thread = %self.thread_name, "Scheduling worker is not running");
            return;
        };

        // Receivers may already be gone if the runtime failed to start.
        let _ = self.shutdown.send(true);
        if handle.join().is_err() {
            error!(thread = %self.thread_name, "Scheduling worker panicked");
        }
        self.incorporation.mark_stopped();
        info!(thread = %self.thread_name, "Scheduling worker stopped");
    }
}

impl Drop for SchedulerWorker {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            let _ = self.shutdown.send(true);
            let _ = handle.join();
            self.incorporation.mark_stopped();
        }
    }
}

fn rate_groups(
    async_machines: &[(Scheduled, Duration)],
    sync_machines: &[(Scheduled, Duration)],
) -> Vec<RateGroup> {
    let mut by_interval: BTreeMap<Duration, Vec<String>> = BTreeMap::new();
    for ((name, _), interval) in async_machines {
        by_interval.entry(*interval).or_default().push(name.clone());
    }

    let mut groups: Vec<RateGroup> = by_interval
        .into_iter()
        .map(|(interval, mut machines)| {
            machines.sort();
            RateGroup {
                interval,
                mode: ScheduleMode::Async,
                machines,
            }
        })
        .collect();

    if let Some(interval) = sync_machines.iter().map(|(_, i)| *i).min() {
        let mut machines: Vec<String> = sync_machines
            .iter()
            .map(|((name, _), _)| name.clone())
            .collect();
        machines.sort();
        groups.push(RateGroup {
            interval,
            mode: ScheduleMode::Sync,
            machines,
        });
    }
    groups
}

fn run_worker(
    async_machines: Vec<(Scheduled, Duration)>,
    sync_machines: Vec<(Scheduled, Duration)>,
    shutdown: watch::Receiver<bool>,
    incorporation: Arc<Incorporation>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to build scheduling runtime");
            incorporation.mark_stopped();
            return;
        }
    };

    runtime.block_on(async move {
        let mut tasks = JoinSet::new();
        for ((name, machine), interval) in async_machines {
            tasks.spawn(drive_machine(
                name,
                machine,
                interval,
                shutdown.clone(),
                incorporation.clone(),
            ));
        }
        if !sync_machines.is_empty() {
            tasks.spawn(drive_sync_group(
                sync_machines,
                shutdown.clone(),
                incorporation.clone(),
            ));
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Scheduling task failed");
            }
        }
    });
}

async fn drive_machine(
    name: String,
    machine: Arc<StateMachine>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    incorporation: Arc<Incorporation>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {
                let target = machine.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || target.tick()).await {
                    error!(machine = %name, error = %e, "Machine tick failed");
                }
                incorporation.mark(&name);
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!(machine = %name, "Machine task finished");
}

async fn drive_sync_group(
    machines: Vec<(Scheduled, Duration)>,
    mut shutdown: watch::Receiver<bool>,
    incorporation: Arc<Incorporation>,
) {
    let Some(period) = machines.iter().map(|(_, interval)| *interval).min() else {
        return;
    };
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let start = tokio::time::Instant::now();
    let mut next_due = vec![start; machines.len()];
    // Ticks landing slightly early still count as due.
    let tolerance = Duration::from_millis(1);

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {
                let now = tokio::time::Instant::now();
                let mut due: Vec<Scheduled> = Vec::new();
                for (index, ((name, machine), interval)) in machines.iter().enumerate() {
                    if next_due[index] <= now + tolerance {
                        due.push((name.clone(), machine.clone()));
                        next_due[index] = (next_due[index] + *interval).max(now);
                    }
                }
                if due.is_empty() {
                    continue;
                }

                let names: Vec<String> = due.iter().map(|(name, _)| name.clone()).collect();
                let batch = tokio::task::spawn_blocking(move || {
                    for (_, machine) in due {
                        machine.tick();
                    }
                });
                if let Err(e) = batch.await {
                    error!(error = %e, "Synchronous tick failed");
                }
                for name in names {
                    incorporation.mark(&name);
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("Synchronous group finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::MachineState;
    use crate::tags::InMemoryValueStore;

    fn registry_with(machines: &[(&str, f64, ScheduleMode)]) -> MachineRegistry {
        let registry = MachineRegistry::new();
        let store = Arc::new(InMemoryValueStore::new());
        for (name, interval, mode) in machines {
            registry
                .append(
                    StateMachine::generic(*name, store.clone()).unwrap(),
                    *interval,
                    *mode,
                )
                .unwrap();
        }
        registry
    }

    #[test]
    fn rate_groups_split_by_mode_and_interval() {
        let registry = registry_with(&[
            ("a", 0.5, ScheduleMode::Async),
            ("b", 0.5, ScheduleMode::Async),
            ("c", 2.0, ScheduleMode::Async),
            ("d", 1.0, ScheduleMode::Sync),
            ("e", 3.0, ScheduleMode::Sync),
        ]);
        let worker = SchedulerWorker::spawn(&registry, &SchedulerConfig::default()).unwrap();

        let groups = worker.rate_groups().to_vec();
        worker.stop();

        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].machines, vec!["a", "b"]);
        assert_eq!(groups[0].interval, Duration::from_millis(500));
        assert_eq!(groups[1].machines, vec!["c"]);
        assert_eq!(groups[2].mode, ScheduleMode::Sync);
        assert_eq!(groups[2].interval, Duration::from_secs(1));
        assert_eq!(groups[2].machines, vec!["d", "e"]);
    }

    #[test]
    fn join_waits_for_first_tick() {
        let registry = registry_with(&[("m", 0.05, ScheduleMode::Async)]);
        let worker = SchedulerWorker::spawn(&registry, &SchedulerConfig::default()).unwrap();

        worker.join("m").unwrap();
        let machine = registry.get("m").unwrap();
        assert_ne!(machine.current_state(), MachineState::Starting);
        worker.stop();
    }

    #[test]
    fn join_rejects_unscheduled_machines() {
        let registry = registry_with(&[("m", 0.05, ScheduleMode::Async)]);
        let worker = SchedulerWorker::spawn(&registry, &SchedulerConfig::default()).unwrap();
        assert!(matches!(
            worker.join("other"),
            Err(AutomationError::MachineNotScheduled(_))
        ));
        worker.stop();
    }

    #[test]
    fn stop_is_idempotent() {
        let registry = registry_with(&[("m", 0.05, ScheduleMode::Sync)]);
        let worker = SchedulerWorker::spawn(&registry, &SchedulerConfig::default()).unwrap();
        assert!(worker.is_running());

        worker.stop();
        worker.stop();
        assert!(!worker.is_running());
    }

    #[test]
    fn stopped_worker_no_longer_ticks() {
        let registry = registry_with(&[("m", 0.02, ScheduleMode::Async)]);
        let worker = SchedulerWorker::spawn(&registry, &SchedulerConfig::default()).unwrap();
        worker.join("m").unwrap();
        worker.stop();

        let machine = registry.get("m").unwrap();
        let state = machine.current_state();
        let last = machine.last_state();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(machine.current_state(), state);
        assert_eq!(machine.last_state(), last);
    }

    #[test]
    fn join_after_stop_reports_stopped_worker() {
        let registry = registry_with(&[("m", 30.0, ScheduleMode::Async)]);
        let worker = SchedulerWorker::spawn(&registry, &SchedulerConfig::default()).unwrap();
        worker.join("m").unwrap();
        worker.stop();
        // Already incorporated before the stop
        assert!(worker.join("m").is_ok());
        assert!(worker.join_timeout("m", Duration::from_millis(10)).unwrap());
    }
}

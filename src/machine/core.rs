//! State machine engine.
//!
//! A [`StateMachine`] owns its mutable data in a [`MachineCore`] behind a
//! mutex, its declared transition table behind a read-write lock and an
//! immutable table of per-state hooks resolved when the machine is built.
//!
//! Locking rules:
//! - `loop_lock` serializes ticks, explicit transition requests and
//!   subscription changes for one machine.
//! - `transitions` is always taken before `core`.
//! - `notify` only takes `core`, so value-store callbacks never wait for a
//!   slow tick to finish.
//! - Hooks are called without `core` held and lock it through
//!   [`StateMachine::inspect`] / [`StateMachine::update`].

use super::attributes::{MachineAttribute, MachineSnapshot, ProcessVariable};
use super::behaviors::{self, StateHook};
use super::state::{transition_name, MachineKind, MachineState};
use super::transition::{Guard, Transition};
use crate::buffer::{RollPolicy, RollingBuffer};
use crate::error::{AppResult, AutomationError};
use crate::persistence::{MachineConfigStore, MachineSettings};
use crate::protocol::ProtocolClient;
use crate::tags::{Tag, TagObserver, ValueStore};
use crate::units::Reading;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Event classification attached to audit records.
const AUDIT_CLASSIFICATION: &str = "State Machine";
const AUDIT_PRIORITY: i64 = 2;
const AUDIT_CRITICITY: i64 = 3;

/// Subscription of one machine to one tag.
#[derive(Debug, Clone)]
pub struct TagBinding {
    tag: Tag,
    variable: ProcessVariable,
    values: RollingBuffer<f64>,
    timestamps: RollingBuffer<DateTime<Utc>>,
}

impl TagBinding {
    /// Subscribed tag.
    pub fn tag(&self) -> &Tag {
        &self.tag
    }

    /// Live mirror of the tag value.
    pub fn variable(&self) -> &ProcessVariable {
        &self.variable
    }

    /// Values in the tag's display unit, oldest first.
    pub fn values(&self) -> &RollingBuffer<f64> {
        &self.values
    }

    /// Timestamps parallel to [`TagBinding::values`].
    pub fn timestamps(&self) -> &RollingBuffer<DateTime<Utc>> {
        &self.timestamps
    }

    /// Whether the value buffer is full.
    pub fn is_ready(&self) -> bool {
        self.values.is_full()
    }
}

/// Mutable data of a machine.
///
/// Subscribed tags, their process-variable mirrors and their buffers live in
/// one [`TagBinding`] per tag, so a tag can never have a buffer without a
/// subscription or the other way round.
#[derive(Debug)]
pub struct MachineCore {
    name: String,
    kind: MachineKind,
    state: MachineState,
    last_state: Option<MachineState>,
    description: String,
    classification: String,
    interval: f64,
    buffer_size: usize,
    buffer_roll_policy: RollPolicy,
    criticity: i64,
    priority: i64,
    bindings: BTreeMap<String, TagBinding>,
}

impl MachineCore {
    fn from_settings(kind: MachineKind, settings: &MachineSettings) -> AppResult<Self> {
        MachineAttribute::BufferSize(settings.buffer_size).validate()?;
        MachineAttribute::Interval(settings.interval).validate()?;

        Ok(Self {
            name: settings.name.clone(),
            kind,
            state: MachineState::Starting,
            last_state: None,
            description: settings.description.clone(),
            classification: settings.classification.clone(),
            interval: settings.interval,
            buffer_size: settings.buffer_size,
            buffer_roll_policy: settings.buffer_roll_policy,
            criticity: settings.criticity,
            priority: settings.priority,
            bindings: BTreeMap::new(),
        })
    }

    /// Registry name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Machine kind.
    pub fn kind(&self) -> MachineKind {
        self.kind
    }

    /// Current state.
    pub fn state(&self) -> MachineState {
        self.state
    }

    /// State the machine was in before its last transition.
    pub fn last_state(&self) -> Option<MachineState> {
        self.last_state
    }

    /// Free-form description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Machine category.
    pub fn classification(&self) -> &str {
        &self.classification
    }

    /// Execution interval in seconds.
    pub fn interval(&self) -> f64 {
        self.interval
    }

    /// Capacity of every buffer.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Roll policy of every buffer.
    pub fn buffer_roll_policy(&self) -> RollPolicy {
        self.buffer_roll_policy
    }

    /// Alarm severity, 1 is nominal.
    pub fn criticity(&self) -> i64 {
        self.criticity
    }

    /// Overwrite the criticity.
    pub fn set_criticity(&mut self, criticity: i64) {
        self.criticity = criticity;
    }

    /// Scheduling priority.
    pub fn priority(&self) -> i64 {
        self.priority
    }

    /// Names of the subscribed tags, sorted.
    pub fn subscribed_tags(&self) -> Vec<String> {
        self.bindings.keys().cloned().collect()
    }

    /// Whether `tag` is subscribed.
    pub fn is_subscribed(&self, tag: &str) -> bool {
        self.bindings.contains_key(tag)
    }

    /// Subscription of `tag`, if any.
    pub fn binding(&self, tag: &str) -> Option<&TagBinding> {
        self.bindings.get(tag)
    }

    /// Every subscription, sorted by tag name.
    pub fn bindings(&self) -> impl Iterator<Item = &TagBinding> + '_ {
        self.bindings.values()
    }

    /// Every subscribed tag has a full buffer.
    ///
    /// A machine without subscriptions is ready.
    pub fn is_ready(&self) -> bool {
        self.bindings.values().all(TagBinding::is_ready)
    }

    /// Replace every buffer with an empty one sized to the current settings.
    pub fn restart_buffers(&mut self) -> AppResult<()> {
        let values = RollingBuffer::new(self.buffer_size, self.buffer_roll_policy)?;
        let timestamps = RollingBuffer::new(self.buffer_size, self.buffer_roll_policy)?;
        for binding in self.bindings.values_mut() {
            binding.values = values.clone();
            binding.timestamps = timestamps.clone();
        }
        Ok(())
    }

    /// Change buffer capacity and policy, recreating every buffer.
    pub fn reconfigure_buffers(&mut self, size: usize, policy: RollPolicy) -> AppResult<()> {
        MachineAttribute::BufferSize(size).validate()?;
        self.buffer_size = size;
        self.buffer_roll_policy = policy;
        self.restart_buffers()
    }

    /// Update the mirror of `tag` and append to both of its buffers.
    ///
    /// Returns `false` if the tag is not subscribed or a forward buffer is full.
    pub fn record_sample(&mut self, tag: &str, value: f64, timestamp: DateTime<Utc>) -> bool {
        let Some(binding) = self.bindings.get_mut(tag) else {
            return false;
        };
        binding.variable.value = value;
        binding.variable.timestamp = timestamp;
        let appended = binding.values.append(value);
        if appended {
            binding.timestamps.append(timestamp);
        }
        appended
    }

    fn update_variable(&mut self, tag: &str, value: f64, timestamp: DateTime<Utc>) -> bool {
        match self.bindings.get_mut(tag) {
            Some(binding) => {
                binding.variable.value = value;
                binding.variable.timestamp = timestamp;
                true
            }
            None => false,
        }
    }

    fn bind(&mut self, tag: Tag, initial: Reading, timestamp: DateTime<Utc>) -> AppResult<()> {
        let variable = ProcessVariable {
            tag: tag.name.clone(),
            value: initial.value,
            unit: initial.unit,
            timestamp,
            read_only: true,
        };
        let binding = TagBinding {
            tag,
            variable,
            values: RollingBuffer::new(self.buffer_size, self.buffer_roll_policy)?,
            timestamps: RollingBuffer::new(self.buffer_size, self.buffer_roll_policy)?,
        };
        self.bindings.insert(binding.tag.name.clone(), binding);
        self.restart_buffers()
    }

    fn unbind(&mut self, tag: &str) -> AppResult<Option<TagBinding>> {
        let removed = self.bindings.remove(tag);
        if removed.is_some() {
            self.restart_buffers()?;
        }
        Ok(removed)
    }

    fn enter(&mut self, state: MachineState) {
        self.last_state = Some(self.state);
        self.state = state;
    }

    /// Acquisition machines keep their interval, which names them in the registry.
    fn apply_settings(&mut self, settings: &MachineSettings) -> AppResult<()> {
        MachineAttribute::Interval(settings.interval).validate()?;
        self.reconfigure_buffers(settings.buffer_size, settings.buffer_roll_policy)?;
        self.description = settings.description.clone();
        self.classification = settings.classification.clone();
        self.criticity = settings.criticity;
        self.priority = settings.priority;
        if self.kind != MachineKind::Acquisition {
            self.interval = settings.interval;
        }
        Ok(())
    }

    /// Current settings in their persisted form.
    pub fn settings(&self) -> MachineSettings {
        MachineSettings {
            name: self.name.clone(),
            interval: self.interval,
            description: self.description.clone(),
            classification: self.classification.clone(),
            buffer_size: self.buffer_size,
            buffer_roll_policy: self.buffer_roll_policy,
            criticity: self.criticity,
            priority: self.priority,
        }
    }

    /// Process-variable mirrors keyed by tag name.
    pub fn process_variables(&self) -> BTreeMap<String, ProcessVariable> {
        self.bindings
            .iter()
            .map(|(name, binding)| (name.clone(), binding.variable.clone()))
            .collect()
    }

    /// Snapshot of the state and every attribute.
    pub fn snapshot(&self) -> MachineSnapshot {
        MachineSnapshot {
            state: self.state.as_str().to_string(),
            name: self.name.clone(),
            description: self.description.clone(),
            classification: self.classification.clone(),
            interval: self.interval,
            buffer_size: self.buffer_size,
            buffer_roll_type: self.buffer_roll_policy,
            criticity: self.criticity,
            priority: self.priority,
            process_variables: self.process_variables(),
        }
    }
}

/// Value-store observer forwarding updates to its machine.
///
/// Holds a weak reference so a store never keeps a dropped machine alive.
struct MachineObserver {
    id: Uuid,
    machine: Weak<StateMachine>,
}

impl TagObserver for MachineObserver {
    fn observer_id(&self) -> Uuid {
        self.id
    }

    fn notify(&self, tag: &str, reading: Reading, timestamp: DateTime<Utc>) {
        if let Some(machine) = self.machine.upgrade() {
            machine.notify(tag, reading, timestamp);
        }
    }
}

/// Periodically evaluated finite-state machine.
pub struct StateMachine {
    id: Uuid,
    kind: MachineKind,
    core: Mutex<MachineCore>,
    transitions: RwLock<Vec<Transition>>,
    hooks: HashMap<MachineState, StateHook>,
    loop_lock: Mutex<()>,
    value_store: Arc<dyn ValueStore>,
    config_store: Option<Arc<dyn MachineConfigStore>>,
    preferred_interval: Option<f64>,
}

impl fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core.lock();
        f.debug_struct("StateMachine")
            .field("id", &self.id)
            .field("name", &core.name)
            .field("kind", &self.kind)
            .field("state", &core.state)
            .field("tags", &core.bindings.len())
            .finish()
    }
}

impl StateMachine {
    /// Start building a machine.
    pub fn builder(name: impl Into<String>, value_store: Arc<dyn ValueStore>) -> MachineBuilder {
        MachineBuilder::new(name, value_store)
    }

    /// Five-state machine with the default behaviors.
    pub fn generic(
        name: impl Into<String>,
        value_store: Arc<dyn ValueStore>,
    ) -> AppResult<Arc<Self>> {
        Self::builder(name, value_store).build()
    }

    /// Acquisition machine polling `protocol` for its tags.
    ///
    /// The name is replaced by its rate-derived name once registered.
    pub fn acquisition(
        value_store: Arc<dyn ValueStore>,
        protocol: Arc<dyn ProtocolClient>,
    ) -> AppResult<Arc<Self>> {
        Self::builder("DAQ", value_store)
            .kind(MachineKind::Acquisition)
            .protocol_client(protocol)
            .build()
    }

    /// Generic machine with the `test` and `sleep` states.
    pub fn extended(
        name: impl Into<String>,
        value_store: Arc<dyn ValueStore>,
    ) -> AppResult<Arc<Self>> {
        Self::builder(name, value_store)
            .kind(MachineKind::Extended)
            .build()
    }

    /// Identity used for value-store observer registrations.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Machine kind.
    pub fn kind(&self) -> MachineKind {
        self.kind
    }

    /// Registry name; acquisition machines are renamed when registered.
    pub fn name(&self) -> String {
        self.core.lock().name.clone()
    }

    /// Current state.
    pub fn current_state(&self) -> MachineState {
        self.core.lock().state
    }

    /// State before the last transition.
    pub fn last_state(&self) -> Option<MachineState> {
        self.core.lock().last_state
    }

    /// Alarm severity, 1 is nominal.
    pub fn criticity(&self) -> i64 {
        self.core.lock().criticity
    }

    /// Scheduling priority.
    pub fn priority(&self) -> i64 {
        self.core.lock().priority
    }

    /// Declared state names in display order.
    pub fn get_states(&self) -> Vec<&'static str> {
        self.kind.states().iter().map(MachineState::as_str).collect()
    }

    /// Execution interval in seconds.
    pub fn get_interval(&self) -> f64 {
        self.core.lock().interval
    }

    /// Execution interval as a `Duration`.
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.get_interval())
    }

    /// Interval requested through [`MachineBuilder::interval`], if any.
    ///
    /// Used at registration when no persisted interval exists.
    pub fn preferred_interval(&self) -> Option<f64> {
        self.preferred_interval
    }

    /// Change the execution interval.
    ///
    /// Rejected for acquisition machines.
    pub fn set_interval(&self, seconds: f64, user: Option<&str>) -> AppResult<()> {
        self.set_attribute(MachineAttribute::Interval(seconds), user)
    }

    /// Resize every buffer, dropping buffered samples.
    pub fn set_buffer_size(&self, size: usize, user: Option<&str>) -> AppResult<()> {
        self.set_attribute(MachineAttribute::BufferSize(size), user)
    }

    /// Change the roll policy of every buffer, dropping buffered samples.
    pub fn set_buffer_roll_policy(&self, policy: RollPolicy, user: Option<&str>) -> AppResult<()> {
        self.set_attribute(MachineAttribute::BufferRollPolicy(policy), user)
    }

    /// Store the machine subscribes through.
    pub fn value_store(&self) -> &Arc<dyn ValueStore> {
        &self.value_store
    }

    /// Run `f` with the machine data locked.
    pub fn inspect<R>(&self, f: impl FnOnce(&MachineCore) -> R) -> R {
        f(&self.core.lock())
    }

    /// Run `f` with the machine data locked for writing.
    ///
    /// State changes must go through [`StateMachine::advance`].
    pub fn update<R>(&self, f: impl FnOnce(&mut MachineCore) -> R) -> R {
        f(&mut self.core.lock())
    }

    /// Every subscribed tag has a full buffer.
    pub fn is_ready(&self) -> bool {
        self.core.lock().is_ready()
    }

    /// Names of the transitions declared for this machine.
    pub fn transition_names(&self) -> Vec<String> {
        self.transitions.read().iter().map(Transition::name).collect()
    }

    /// Attach a guard to an already declared transition.
    pub fn set_trigger(&self, from: MachineState, to: MachineState, guard: Guard) -> AppResult<()> {
        let mut transitions = self.transitions.write();
        let transition = transitions
            .iter_mut()
            .find(|t| t.connects(from, to))
            .ok_or_else(|| AutomationError::UndeclaredTransition {
                from: from.to_string(),
                to: to.to_string(),
            })?;
        transition.guard = Some(guard);
        Ok(())
    }

    /// Remove the guard of a transition. Returns whether one was set.
    pub fn clear_trigger(&self, from: MachineState, to: MachineState) -> bool {
        self.transitions
            .write()
            .iter_mut()
            .find(|t| t.connects(from, to))
            .and_then(|t| t.guard.take())
            .is_some()
    }

    /// One scheduled invocation.
    ///
    /// Runs the hook of the current state (a state without hook does
    /// nothing), then evaluates the guards of the transitions leaving the
    /// state the sweep started in. Hook failures and guard faults are logged
    /// and never escape.
    pub fn tick(&self) {
        let _loop = self.loop_lock.lock();

        let state = self.current_state();
        if let Some(hook) = self.hooks.get(&state) {
            match panic::catch_unwind(AssertUnwindSafe(|| hook(self))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(machine = %self.name(), state = %state, error = %e, "State hook failed")
                }
                Err(_) => {
                    error!(machine = %self.name(), state = %state, "State hook panicked")
                }
            }
        }

        self.sweep_triggers();
    }

    fn sweep_triggers(&self) {
        let transitions = self.transitions.read();
        let mut core = self.core.lock();
        let source = core.state;

        for transition in transitions.iter().filter(|t| t.from == source) {
            let Some(guard) = &transition.guard else {
                continue;
            };
            if core.state != source {
                debug!(
                    machine = %core.name,
                    transition = %transition.name(),
                    "Skipping trigger, state already changed this tick"
                );
                continue;
            }

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| guard.check(&core)))
                .unwrap_or_else(|_| Err(anyhow::anyhow!("guard panicked")));
            match outcome {
                Ok(true) => {
                    Self::fire(&mut core, &transitions, transition.to);
                    info!(
                        machine = %core.name,
                        transition = %transition.name(),
                        "Trigger fired"
                    );
                }
                Ok(false) => {}
                Err(e) => error!(
                    machine = %core.name,
                    transition = %transition.name(),
                    error = %e,
                    "Trigger evaluation failed"
                ),
            }
        }
    }

    /// Perform a declared transition from the current state.
    ///
    /// Returns `false` and leaves the state untouched if none is declared.
    fn fire(core: &mut MachineCore, transitions: &[Transition], to: MachineState) -> bool {
        let from = core.state;
        let Some(transition) = transitions.iter().find(|t| t.connects(from, to)) else {
            return false;
        };
        if let Some(callback) = &transition.on_transition {
            callback(&mut *core);
        }
        core.enter(to);
        debug!(machine = %core.name, from = %from, to = %to, "State changed");
        true
    }

    fn not_allowed(core: &MachineCore, to: MachineState) -> AutomationError {
        AutomationError::TransitionNotAllowed {
            machine: core.name.clone(),
            from: core.state.to_string(),
            to: to.to_string(),
        }
    }

    /// Transition requested from inside a state hook.
    ///
    /// Does not take the loop lock, so hooks may call it while the tick
    /// that invoked them is still running.
    pub fn advance(&self, to: MachineState) -> AppResult<()> {
        let transitions = self.transitions.read();
        let mut core = self.core.lock();
        if Self::fire(&mut core, &transitions, to) {
            Ok(())
        } else {
            Err(Self::not_allowed(&core, to))
        }
    }

    /// Explicit transition request from a caller.
    ///
    /// Succeeds with a description of the transition when `current -> to`
    /// is declared; otherwise the state is left unchanged and
    /// `TransitionNotAllowed` is returned. Must not be called from a hook.
    pub fn transition(&self, to: MachineState, user: Option<&str>) -> AppResult<String> {
        let _loop = self.loop_lock.lock();
        let transitions = self.transitions.read();
        let mut core = self.core.lock();
        let from = core.state;

        if !Self::fire(&mut core, &transitions, to) {
            let err = Self::not_allowed(&core, to);
            warn!(machine = %core.name, user = ?user, error = %err, "Transition rejected");
            return Err(err);
        }

        let message = format!("from: {} to: {}", from, to);
        audit(
            &core.name,
            user,
            &format!(
                "Transition {} of machine {}",
                transition_name(from, to),
                core.name
            ),
        );
        Ok(message)
    }

    /// [`StateMachine::transition`] with the target given by name.
    pub fn transition_by_name(&self, to: &str, user: Option<&str>) -> AppResult<String> {
        let target: MachineState = to.parse()?;
        self.transition(target, user)
    }

    /// Subscribe to `tag`.
    ///
    /// Mirrors the current value, adds the tag's buffers, registers the
    /// machine as observer and recreates every buffer. Returns `false` if the
    /// tag was already subscribed.
    pub fn subscribe_to(self: &Arc<Self>, tag: &Tag, user: Option<&str>) -> AppResult<bool> {
        let _loop = self.loop_lock.lock();
        if self.core.lock().is_subscribed(&tag.name) {
            return Ok(false);
        }

        let (reading, timestamp) = self.value_store.get_current_value(&tag.name)?;
        let initial = reading.convert(tag.display_unit)?;
        self.core.lock().bind(tag.clone(), initial, timestamp)?;

        let observer = Arc::new(MachineObserver {
            id: self.id,
            machine: Arc::downgrade(self),
        });
        if let Err(e) = self.value_store.attach_observer(&tag.name, observer) {
            if let Err(rollback) = self.core.lock().unbind(&tag.name) {
                warn!(
                    machine = %self.name(),
                    tag = %tag.name,
                    error = %rollback,
                    "Failed to roll back subscription"
                );
            }
            return Err(e);
        }

        let name = self.name();
        audit(
            &name,
            user,
            &format!("Machine {} subscribed to tag {}", name, tag.name),
        );
        Ok(true)
    }

    /// Unsubscribe from `tag`. Unknown tags are a no-op returning `false`.
    pub fn unsubscribe_from(&self, tag: &str, user: Option<&str>) -> AppResult<bool> {
        let _loop = self.loop_lock.lock();
        if self.core.lock().unbind(tag)?.is_none() {
            return Ok(false);
        }

        if let Err(e) = self.value_store.detach_observer(tag, self.id) {
            warn!(machine = %self.name(), tag = %tag, error = %e, "Failed to detach observer");
        }

        let name = self.name();
        audit(
            &name,
            user,
            &format!("Machine {} unsubscribed from tag {}", name, tag),
        );
        Ok(true)
    }

    /// Release every subscription. Returns how many tags were released.
    pub fn unsubscribe_all(&self, user: Option<&str>) -> AppResult<usize> {
        let tags = self.subscribed_tags();
        let mut released = 0;
        for tag in &tags {
            if self.unsubscribe_from(tag, user)? {
                released += 1;
            }
        }
        Ok(released)
    }

    /// Names of the subscribed tags, sorted.
    pub fn subscribed_tags(&self) -> Vec<String> {
        self.core.lock().subscribed_tags()
    }

    /// Value-store delivery callback.
    ///
    /// Converts the reading to the tag's display unit, then updates the
    /// mirror and appends to the buffers in one critical section.
    /// Acquisition machines buffer from their own reads and only refresh the
    /// mirror here.
    pub fn notify(&self, tag: &str, reading: Reading, timestamp: DateTime<Utc>) {
        let mut core = self.core.lock();
        let Some(display_unit) = core.binding(tag).map(|b| b.tag.display_unit) else {
            debug!(machine = %core.name, tag = %tag, "Update for unsubscribed tag ignored");
            return;
        };

        let converted = match reading.convert(display_unit) {
            Ok(converted) => converted,
            Err(e) => {
                warn!(machine = %core.name, tag = %tag, error = %e, "Dropping sample");
                return;
            }
        };

        if self.kind == MachineKind::Acquisition {
            core.update_variable(tag, converted.value, timestamp);
        } else if !core.record_sample(tag, converted.value, timestamp) {
            debug!(machine = %core.name, tag = %tag, "Forward buffer full, sample rejected");
        }
    }

    /// Buffered values of `tag`, oldest first.
    pub fn buffer_contents(&self, tag: &str) -> Option<Vec<f64>> {
        self.core.lock().binding(tag).map(|b| b.values.to_vec())
    }

    /// Buffered timestamps of `tag`, oldest first.
    pub fn timestamp_contents(&self, tag: &str) -> Option<Vec<DateTime<Utc>>> {
        self.core.lock().binding(tag).map(|b| b.timestamps.to_vec())
    }

    /// Process-variable mirrors keyed by tag name.
    pub fn process_variables(&self) -> BTreeMap<String, ProcessVariable> {
        self.core.lock().process_variables()
    }

    /// Process-variable mirror of `tag`.
    pub fn process_variable(&self, tag: &str) -> Option<ProcessVariable> {
        self.core.lock().binding(tag).map(|b| b.variable.clone())
    }

    /// Change one attribute and record the new settings.
    ///
    /// # Errors
    /// - `InvalidAttribute` if the value is out of range
    /// - `InvalidAttribute` for an interval change on an acquisition machine,
    ///   whose interval is its registry identity
    pub fn set_attribute(&self, attribute: MachineAttribute, user: Option<&str>) -> AppResult<()> {
        attribute.validate()?;
        if self.kind == MachineKind::Acquisition {
            if let MachineAttribute::Interval(seconds) = &attribute {
                return Err(AutomationError::InvalidAttribute(format!(
                    "acquisition machine {} is keyed by its interval; subscribe at a scan time of {} ms instead",
                    self.name(),
                    *seconds * 1000.0
                )));
            }
        }

        let settings = {
            let mut core = self.core.lock();
            match &attribute {
                MachineAttribute::Criticity(value) => core.criticity = *value,
                MachineAttribute::Priority(value) => core.priority = *value,
                MachineAttribute::Description(value) => core.description = value.clone(),
                MachineAttribute::Classification(value) => core.classification = value.clone(),
                MachineAttribute::BufferSize(size) => {
                    let policy = core.buffer_roll_policy;
                    core.reconfigure_buffers(*size, policy)?;
                }
                MachineAttribute::BufferRollPolicy(policy) => {
                    let size = core.buffer_size;
                    core.reconfigure_buffers(size, *policy)?;
                }
                MachineAttribute::Interval(seconds) => core.interval = *seconds,
            }
            core.settings()
        };

        audit(
            &settings.name,
            user,
            &format!("Updated {} of machine {}", attribute.name(), settings.name),
        );
        self.persist(&settings);
        Ok(())
    }

    /// Apply persisted settings, keeping the machine name.
    pub fn apply_settings(&self, settings: &MachineSettings) -> AppResult<()> {
        self.core.lock().apply_settings(settings)
    }

    /// Current settings, as persisted.
    pub fn settings(&self) -> MachineSettings {
        self.core.lock().settings()
    }

    /// Record the current settings with the configuration store, if any.
    pub fn record(&self) {
        self.persist(&self.settings());
    }

    fn persist(&self, settings: &MachineSettings) {
        if let Some(store) = &self.config_store {
            if let Err(e) = store.record_machine(settings) {
                warn!(machine = %settings.name, error = %e, "Failed to record machine settings");
            }
        }
    }

    pub(crate) fn rename(&self, name: String) {
        self.core.lock().name = name;
    }

    pub(crate) fn assign_interval(&self, seconds: f64) {
        self.core.lock().interval = seconds;
    }

    /// Snapshot of the state and every attribute.
    pub fn serialize(&self) -> MachineSnapshot {
        self.core.lock().snapshot()
    }
}

fn audit(machine: &str, user: Option<&str>, message: &str) {
    info!(
        machine = %machine,
        user = user.unwrap_or("system"),
        classification = AUDIT_CLASSIFICATION,
        priority = AUDIT_PRIORITY,
        criticity = AUDIT_CRITICITY,
        "{}",
        message
    );
}

/// Builder for [`StateMachine`].
pub struct MachineBuilder {
    settings: MachineSettings,
    classification: Option<String>,
    preferred_interval: Option<f64>,
    kind: MachineKind,
    value_store: Arc<dyn ValueStore>,
    protocol: Option<Arc<dyn ProtocolClient>>,
    config_store: Option<Arc<dyn MachineConfigStore>>,
    triggers: Vec<(MachineState, MachineState, Guard)>,
    hooks: Vec<(MachineState, StateHook)>,
}

impl MachineBuilder {
    /// Builder for a generic machine named `name`.
    pub fn new(name: impl Into<String>, value_store: Arc<dyn ValueStore>) -> Self {
        Self {
            settings: MachineSettings::named(name),
            classification: None,
            preferred_interval: None,
            kind: MachineKind::default(),
            value_store,
            protocol: None,
            config_store: None,
            triggers: Vec::new(),
            hooks: Vec::new(),
        }
    }

    /// Free-form description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.settings.description = description.into();
        self
    }

    /// Overrides the default classification of the machine kind.
    pub fn classification(mut self, classification: impl Into<String>) -> Self {
        self.classification = Some(classification.into());
        self
    }

    /// Machine kind.
    pub fn kind(mut self, kind: MachineKind) -> Self {
        self.kind = kind;
        self
    }

    /// Required for acquisition machines.
    pub fn protocol_client(mut self, protocol: Arc<dyn ProtocolClient>) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Persist settings on every attribute change.
    pub fn config_store(mut self, store: Arc<dyn MachineConfigStore>) -> Self {
        self.config_store = Some(store);
        self
    }

    /// Capacity of every buffer.
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.settings.buffer_size = size;
        self
    }

    /// Roll policy of every buffer.
    pub fn buffer_roll_policy(mut self, policy: RollPolicy) -> Self {
        self.settings.buffer_roll_policy = policy;
        self
    }

    /// Interval in seconds to register at when no persisted interval exists.
    pub fn interval(mut self, seconds: f64) -> Self {
        self.settings.interval = seconds;
        self.preferred_interval = Some(seconds);
        self
    }

    /// Initial criticity.
    pub fn criticity(mut self, criticity: i64) -> Self {
        self.settings.criticity = criticity;
        self
    }

    /// Scheduling priority.
    pub fn priority(mut self, priority: i64) -> Self {
        self.settings.priority = priority;
        self
    }

    /// Guard a declared transition.
    pub fn trigger(mut self, from: MachineState, to: MachineState, guard: Guard) -> Self {
        self.triggers.push((from, to, guard));
        self
    }

    /// Replace the behavior of `state`.
    pub fn on_state<F>(mut self, state: MachineState, hook: F) -> Self
    where
        F: Fn(&StateMachine) -> AppResult<()> + Send + Sync + 'static,
    {
        self.hooks.push((state, Arc::new(hook)));
        self
    }

    /// Build the machine.
    ///
    /// # Errors
    /// - `InvalidAttribute` for invalid settings
    /// - `Configuration` for an acquisition machine without protocol client
    /// - `UndeclaredTransition` for a trigger on an undeclared transition
    /// - `UnknownState` for a hook on a state the kind does not have
    pub fn build(self) -> AppResult<Arc<StateMachine>> {
        let mut settings = self.settings;
        settings.classification = self
            .classification
            .unwrap_or_else(|| self.kind.default_classification().to_string());
        let core = MachineCore::from_settings(self.kind, &settings)?;

        let mut transitions: Vec<Transition> = self
            .kind
            .transitions()
            .into_iter()
            .map(|(from, to)| {
                let transition = Transition::new(from, to);
                match behaviors::transition_callback(from, to) {
                    Some(callback) => transition.with_callback(callback),
                    None => transition,
                }
            })
            .collect();

        for (from, to, guard) in self.triggers {
            let transition = transitions
                .iter_mut()
                .find(|t| t.connects(from, to))
                .ok_or_else(|| AutomationError::UndeclaredTransition {
                    from: from.to_string(),
                    to: to.to_string(),
                })?;
            transition.guard = Some(guard);
        }

        let mut hooks = behaviors::state_hooks(self.kind, self.protocol)?;
        for (state, hook) in self.hooks {
            if !self.kind.states().contains(&state) {
                return Err(AutomationError::UnknownState(state.to_string()));
            }
            hooks.insert(state, hook);
        }

        debug!(machine = %settings.name, kind = %self.kind, "Machine built");
        Ok(Arc::new(StateMachine {
            id: Uuid::new_v4(),
            kind: self.kind,
            core: Mutex::new(core),
            transitions: RwLock::new(transitions),
            hooks,
            loop_lock: Mutex::new(()),
            value_store: self.value_store,
            config_store: self.config_store,
            preferred_interval: self.preferred_interval,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::InMemoryValueStore;
    use crate::units::Unit;
    use tracing_test::traced_test;

    fn store_with_tag(name: &str) -> Arc<InMemoryValueStore> {
        let store = Arc::new(InMemoryValueStore::new());
        store.create_tag(Tag::new(name, Unit::Bar)).unwrap();
        store
    }

    #[test]
    fn new_machines_start_in_starting() {
        let machine = StateMachine::generic("boiler", Arc::new(InMemoryValueStore::new())).unwrap();
        assert_eq!(machine.current_state(), MachineState::Starting);
        assert_eq!(machine.last_state(), None);
        assert_eq!(machine.criticity(), 2);
        assert_eq!(machine.get_states(), vec!["start", "wait", "run", "restart", "reset"]);
    }

    #[test]
    fn zero_buffer_size_is_rejected_at_build() {
        let result = StateMachine::builder("bad", Arc::new(InMemoryValueStore::new()))
            .buffer_size(0)
            .build();
        assert!(matches!(result, Err(AutomationError::InvalidAttribute(_))));
    }

    #[test]
    fn acquisition_requires_protocol_client() {
        let result = StateMachine::builder("DAQ", Arc::new(InMemoryValueStore::new()))
            .kind(MachineKind::Acquisition)
            .build();
        assert!(matches!(result, Err(AutomationError::Configuration(_))));
    }

    #[test]
    fn triggers_must_be_declared() {
        let result = StateMachine::builder("m", Arc::new(InMemoryValueStore::new()))
            .trigger(MachineState::Running, MachineState::Starting, Guard::always())
            .build();
        assert!(matches!(
            result,
            Err(AutomationError::UndeclaredTransition { .. })
        ));
    }

    #[test]
    fn explicit_transition_follows_table() {
        let machine = StateMachine::generic("m", Arc::new(InMemoryValueStore::new())).unwrap();

        let message = machine.transition(MachineState::Waiting, Some("operator")).unwrap();
        assert_eq!(message, "from: start to: wait");
        assert_eq!(machine.current_state(), MachineState::Waiting);
        assert_eq!(machine.last_state(), Some(MachineState::Starting));
        assert_eq!(machine.criticity(), 1);

        let err = machine.transition(MachineState::Starting, None).unwrap_err();
        assert!(matches!(err, AutomationError::TransitionNotAllowed { .. }));
        assert_eq!(machine.current_state(), MachineState::Waiting);
    }

    #[test]
    fn transition_by_name_rejects_unknown_states() {
        let machine = StateMachine::generic("m", Arc::new(InMemoryValueStore::new())).unwrap();
        assert!(matches!(
            machine.transition_by_name("idle", None),
            Err(AutomationError::UnknownState(_))
        ));
        assert!(machine.transition_by_name("wait", None).is_ok());
    }

    #[test]
    fn generic_machines_cannot_enter_extended_states() {
        let machine = StateMachine::generic("m", Arc::new(InMemoryValueStore::new())).unwrap();
        machine.transition(MachineState::Waiting, None).unwrap();
        assert!(machine.transition(MachineState::Testing, None).is_err());
        assert_eq!(machine.current_state(), MachineState::Waiting);
    }

    #[test]
    fn subscribe_mirrors_current_value_in_display_unit() {
        let store = Arc::new(InMemoryValueStore::new());
        let tag = Tag::new("TT-1", Unit::Celsius).with_display_unit(Unit::Kelvin);
        store.create_tag(tag.clone()).unwrap();
        store.set_value("TT-1", 20.0, Utc::now()).unwrap();

        let machine = StateMachine::generic("m", store.clone()).unwrap();
        assert!(machine.subscribe_to(&tag, None).unwrap());
        assert!(!machine.subscribe_to(&tag, None).unwrap());

        let variable = machine.process_variable("TT-1").unwrap();
        assert!((variable.value - 293.15).abs() < 1e-9);
        assert_eq!(variable.unit, Unit::Kelvin);
        assert_eq!(machine.buffer_contents("TT-1"), Some(vec![]));
        assert_eq!(store.observer_count("TT-1"), 1);
    }

    #[test]
    fn subscribe_to_missing_tag_leaves_machine_untouched() {
        let machine = StateMachine::generic("m", Arc::new(InMemoryValueStore::new())).unwrap();
        let result = machine.subscribe_to(&Tag::new("ghost", Unit::Bar), None);
        assert!(matches!(result, Err(AutomationError::TagNotFound(_))));
        assert!(machine.subscribed_tags().is_empty());
    }

    #[test]
    fn notify_appends_to_value_and_timestamp_buffers() {
        let store = store_with_tag("PT-1");
        let machine = StateMachine::generic("m", store.clone()).unwrap();
        machine.subscribe_to(&Tag::new("PT-1", Unit::Bar), None).unwrap();

        store.set_value("PT-1", 1.0, Utc::now()).unwrap();
        store.set_value("PT-1", 2.0, Utc::now()).unwrap();

        assert_eq!(machine.buffer_contents("PT-1"), Some(vec![1.0, 2.0]));
        assert_eq!(machine.timestamp_contents("PT-1").map(|t| t.len()), Some(2));
        assert_eq!(machine.process_variable("PT-1").unwrap().value, 2.0);
    }

    #[test]
    fn unsubscribe_is_a_noop_for_unknown_tags() {
        let machine = StateMachine::generic("m", Arc::new(InMemoryValueStore::new())).unwrap();
        assert!(!machine.unsubscribe_from("never", None).unwrap());
        assert_eq!(machine.current_state(), MachineState::Starting);
    }

    #[test]
    fn unsubscribe_removes_binding_and_observer() {
        let store = store_with_tag("PT-1");
        let machine = StateMachine::generic("m", store.clone()).unwrap();
        machine.subscribe_to(&Tag::new("PT-1", Unit::Bar), None).unwrap();

        assert!(machine.unsubscribe_from("PT-1", None).unwrap());
        assert!(machine.buffer_contents("PT-1").is_none());
        assert!(machine.process_variable("PT-1").is_none());
        assert_eq!(store.observer_count("PT-1"), 0);
    }

    #[test]
    fn resizing_recreates_all_buffers() {
        let store = store_with_tag("PT-1");
        let machine = StateMachine::generic("m", store.clone()).unwrap();
        machine.subscribe_to(&Tag::new("PT-1", Unit::Bar), None).unwrap();
        store.set_value("PT-1", 1.0, Utc::now()).unwrap();

        machine.set_buffer_size(3, Some("admin")).unwrap();
        machine.inspect(|core| {
            let binding = core.binding("PT-1").unwrap();
            assert_eq!(binding.values().capacity(), 3);
            assert_eq!(binding.timestamps().capacity(), 3);
            assert!(binding.values().is_empty());
        });
    }

    #[test]
    fn set_attribute_rejects_invalid_values() {
        let machine = StateMachine::generic("m", Arc::new(InMemoryValueStore::new())).unwrap();
        assert!(machine.set_buffer_size(0, None).is_err());
        assert!(machine.set_interval(-1.0, None).is_err());
        assert_eq!(machine.serialize().buffer_size, 10);
        assert_eq!(machine.get_interval(), 1.0);
    }

    #[test]
    fn clear_trigger_reports_removal() {
        let machine = StateMachine::generic("m", Arc::new(InMemoryValueStore::new())).unwrap();
        machine
            .set_trigger(MachineState::Running, MachineState::Resetting, Guard::always())
            .unwrap();
        assert!(machine.clear_trigger(MachineState::Running, MachineState::Resetting));
        assert!(!machine.clear_trigger(MachineState::Running, MachineState::Resetting));
    }

    /// Value store refusing every observer registration.
    struct ClosedStore(InMemoryValueStore);

    impl ValueStore for ClosedStore {
        fn get_current_value(&self, tag: &str) -> AppResult<(Reading, DateTime<Utc>)> {
            self.0.get_current_value(tag)
        }

        fn set_value(&self, tag: &str, value: f64, timestamp: DateTime<Utc>) -> AppResult<()> {
            self.0.set_value(tag, value, timestamp)
        }

        fn attach_observer(&self, tag: &str, _observer: Arc<dyn TagObserver>) -> AppResult<()> {
            Err(AutomationError::ValueStore(format!("{} is read-only", tag)))
        }

        fn detach_observer(&self, tag: &str, observer_id: Uuid) -> AppResult<()> {
            self.0.detach_observer(tag, observer_id)
        }
    }

    #[test]
    fn failed_observer_registration_rolls_back_binding() {
        let inner = InMemoryValueStore::new();
        inner.create_tag(Tag::new("PT-1", Unit::Bar)).unwrap();
        let machine = StateMachine::generic("m", Arc::new(ClosedStore(inner))).unwrap();

        let result = machine.subscribe_to(&Tag::new("PT-1", Unit::Bar), None);
        assert!(matches!(result, Err(AutomationError::ValueStore(_))));
        assert!(machine.subscribed_tags().is_empty());
        assert!(machine.buffer_contents("PT-1").is_none());
        assert!(machine.process_variable("PT-1").is_none());
    }

    #[test]
    fn acquisition_interval_cannot_be_changed() {
        let machine = StateMachine::acquisition(
            Arc::new(InMemoryValueStore::new()),
            Arc::new(crate::protocol::MockProtocolClient::new()),
        )
        .unwrap();

        let result = machine.set_interval(2.0, Some("admin"));
        assert!(matches!(result, Err(AutomationError::InvalidAttribute(_))));
        assert_eq!(machine.get_interval(), 1.0);

        let mut settings = MachineSettings::named("DAQ");
        settings.interval = 5.0;
        settings.priority = 4;
        machine.apply_settings(&settings).unwrap();
        assert_eq!(machine.get_interval(), 1.0);
        assert_eq!(machine.priority(), 4);

        // Other attributes stay editable
        machine.set_buffer_size(4, None).unwrap();
    }

    #[test]
    fn builder_interval_is_the_preferred_interval() {
        let store: Arc<InMemoryValueStore> = Arc::new(InMemoryValueStore::new());
        let plain = StateMachine::generic("a", store.clone()).unwrap();
        assert_eq!(plain.preferred_interval(), None);

        let paced = StateMachine::builder("b", store).interval(0.25).build().unwrap();
        assert_eq!(paced.preferred_interval(), Some(0.25));
        assert_eq!(paced.get_interval(), 0.25);
    }

    #[test]
    #[traced_test]
    fn guard_faults_are_isolated() {
        let machine = StateMachine::builder("m", Arc::new(InMemoryValueStore::new()))
            .trigger(
                MachineState::Running,
                MachineState::Resetting,
                Guard::new(|_| Err(anyhow::anyhow!("sensor offline"))),
            )
            .trigger(MachineState::Running, MachineState::Restarting, Guard::always())
            .build()
            .unwrap();
        machine.transition(MachineState::Waiting, None).unwrap();
        machine.transition(MachineState::Running, None).unwrap();

        machine.tick();

        assert_eq!(machine.current_state(), MachineState::Restarting);
        assert!(logs_contain("Trigger evaluation failed"));
        assert!(logs_contain("sensor offline"));
    }

    #[test]
    fn panicking_guard_is_contained() {
        let machine = StateMachine::builder("m", Arc::new(InMemoryValueStore::new()))
            .trigger(
                MachineState::Starting,
                MachineState::Waiting,
                Guard::new(|_| panic!("boom")),
            )
            .on_state(MachineState::Starting, |_| Ok(()))
            .build()
            .unwrap();

        machine.tick();
        assert_eq!(machine.current_state(), MachineState::Starting);
    }
}

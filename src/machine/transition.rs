//! Structural transitions with optional guards.
//!
//! A [`Transition`] is identified by its `(from, to)` pair. Its guard is
//! evaluated once per tick while the machine sits in `from`; its
//! on-transition callback runs right before the state changes.

use super::core::MachineCore;
use super::state::{transition_name, MachineState};
use std::fmt;
use std::sync::Arc;

/// Condition checked by the guard sweep.
///
/// Guards receive a read-only view of the machine. Returning an error is a
/// guard fault: it is logged and the sweep moves on to the next transition.
#[derive(Clone)]
pub struct Guard(Arc<dyn Fn(&MachineCore) -> anyhow::Result<bool> + Send + Sync>);

impl Guard {
    /// Guard from a closure.
    pub fn new<F>(check: F) -> Self
    where
        F: Fn(&MachineCore) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        Self(Arc::new(check))
    }

    /// Guard that is always satisfied.
    pub fn always() -> Self {
        Self::new(|_| Ok(true))
    }

    /// Evaluate the guard against `core`.
    pub fn check(&self, core: &MachineCore) -> anyhow::Result<bool> {
        (self.0)(core)
    }
}

impl fmt::Debug for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Guard(..)")
    }
}

/// Callback run when a transition fires, with the state still at the source.
pub type TransitionCallback = Arc<dyn Fn(&mut MachineCore) + Send + Sync>;

/// Declared transition.
#[derive(Clone)]
pub struct Transition {
    /// Source state
    pub from: MachineState,
    /// Target state
    pub to: MachineState,
    /// Condition checked by the guard sweep
    pub guard: Option<Guard>,
    /// Callback run when the transition fires
    pub on_transition: Option<TransitionCallback>,
}

impl Transition {
    /// Unguarded transition without callback.
    pub fn new(from: MachineState, to: MachineState) -> Self {
        Self {
            from,
            to,
            guard: None,
            on_transition: None,
        }
    }

    /// Attach a guard.
    pub fn with_guard(mut self, guard: Guard) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Run `callback` when the transition fires.
    pub fn with_callback(mut self, callback: TransitionCallback) -> Self {
        self.on_transition = Some(callback);
        self
    }

    /// `"<from>_to_<to>"`
    pub fn name(&self) -> String {
        transition_name(self.from, self.to)
    }

    /// Whether this is the `from` to `to` transition.
    pub fn connects(&self, from: MachineState, to: MachineState) -> bool {
        self.from == from && self.to == to
    }
}

impl fmt::Debug for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transition")
            .field("name", &self.name())
            .field("guarded", &self.guard.is_some())
            .field("has_callback", &self.on_transition.is_some())
            .finish()
    }
}

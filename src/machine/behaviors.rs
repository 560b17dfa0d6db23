//! Per-state behaviors and on-transition callbacks.
//!
//! Hooks are resolved into a table keyed by [`MachineState`] when a machine
//! is built. A state missing from the table does nothing on its ticks.

use super::core::{MachineCore, StateMachine};
use super::state::{MachineKind, MachineState};
use super::transition::TransitionCallback;
use crate::error::{AppResult, AutomationError};
use crate::protocol::ProtocolClient;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Behavior run on every tick spent in one state.
pub type StateHook = Arc<dyn Fn(&StateMachine) -> AppResult<()> + Send + Sync>;

/// Normal operation.
pub const CRITICITY_NOMINAL: i64 = 1;
/// Machine (re)initialising.
pub const CRITICITY_STARTING: i64 = 2;
/// Under test.
pub const CRITICITY_TESTING: i64 = 3;
/// Leaving test or sleep for a restart or reset.
pub const CRITICITY_RECOVERING: i64 = 4;
/// Restart, reset or sleep requested.
pub const CRITICITY_FAULT: i64 = 5;

/// Allocate buffers for the configured size and policy, then wait.
pub fn while_starting(machine: &StateMachine) -> AppResult<()> {
    machine.update(|core| core.restart_buffers())?;
    machine.advance(MachineState::Waiting)
}

/// Run once every subscribed tag has a full buffer.
pub fn while_waiting(machine: &StateMachine) -> AppResult<()> {
    if machine.is_ready() {
        machine.advance(MachineState::Running)?;
    }
    Ok(())
}

/// Back to nominal criticity while operating.
pub fn while_running(machine: &StateMachine) -> AppResult<()> {
    machine.update(|core| core.set_criticity(CRITICITY_NOMINAL));
    Ok(())
}

/// Go straight back to `start`.
pub fn while_resetting(machine: &StateMachine) -> AppResult<()> {
    machine.advance(MachineState::Starting)
}

/// Empty every buffer, then wait for them to fill again.
pub fn while_restarting(machine: &StateMachine) -> AppResult<()> {
    machine.update(|core| core.restart_buffers())?;
    machine.advance(MachineState::Waiting)
}

/// Hold the testing criticity.
pub fn while_testing(machine: &StateMachine) -> AppResult<()> {
    machine.update(|core| core.set_criticity(CRITICITY_TESTING));
    Ok(())
}

/// Hold the fault criticity until an operator wakes the machine.
pub fn while_sleeping(machine: &StateMachine) -> AppResult<()> {
    machine.update(|core| core.set_criticity(CRITICITY_FAULT));
    Ok(())
}

/// Acquisition starts without waiting for full buffers.
pub fn acquisition_waiting(machine: &StateMachine) -> AppResult<()> {
    machine.advance(MachineState::Running)
}

/// Poll the remote node of every subscribed tag.
///
/// Each value read is written to the value store, then appended in the
/// tag's display unit to its value and timestamp buffers. Tags without a
/// remote address or whose read returned nothing are skipped for this tick.
pub fn acquisition_running(
    machine: &StateMachine,
    protocol: &dyn ProtocolClient,
) -> AppResult<()> {
    let tags: Vec<_> = machine.inspect(|core| core.bindings().map(|b| b.tag().clone()).collect());

    for tag in tags {
        let Some(remote) = &tag.remote else {
            debug!(tag = %tag.name, "Tag has no remote address");
            continue;
        };
        let Some(read) = protocol.read_value(&remote.address, &remote.namespace) else {
            debug!(
                tag = %tag.name,
                address = %remote.address,
                namespace = %remote.namespace,
                "No value returned"
            );
            continue;
        };

        if let Err(e) = machine
            .value_store()
            .set_value(&tag.name, read.value, read.timestamp)
        {
            warn!(tag = %tag.name, error = %e, "Failed to store acquired value");
            continue;
        }

        let value = match tag.unit.convert(read.value, tag.display_unit) {
            Ok(value) => value,
            Err(e) => {
                warn!(tag = %tag.name, error = %e, "Dropping acquired value");
                continue;
            }
        };
        machine.update(|core| core.record_sample(&tag.name, value, read.timestamp));
    }

    while_running(machine)
}

/// Hook table for a machine kind.
///
/// # Errors
/// Returns `Configuration` for an acquisition machine without a protocol client.
pub fn state_hooks(
    kind: MachineKind,
    protocol: Option<Arc<dyn ProtocolClient>>,
) -> AppResult<HashMap<MachineState, StateHook>> {
    let mut hooks: HashMap<MachineState, StateHook> = HashMap::new();
    hooks.insert(MachineState::Starting, Arc::new(while_starting));
    hooks.insert(MachineState::Waiting, Arc::new(while_waiting));
    hooks.insert(MachineState::Running, Arc::new(while_running));
    hooks.insert(MachineState::Resetting, Arc::new(while_resetting));
    hooks.insert(MachineState::Restarting, Arc::new(while_restarting));

    match kind {
        MachineKind::Generic => {}
        MachineKind::Extended => {
            hooks.insert(MachineState::Testing, Arc::new(while_testing));
            hooks.insert(MachineState::Sleeping, Arc::new(while_sleeping));
        }
        MachineKind::Acquisition => {
            let protocol = protocol.ok_or_else(|| {
                AutomationError::Configuration(
                    "acquisition machines require a protocol client".to_string(),
                )
            })?;
            hooks.insert(MachineState::Waiting, Arc::new(acquisition_waiting));
            hooks.insert(
                MachineState::Running,
                Arc::new(move |machine: &StateMachine| {
                    acquisition_running(machine, protocol.as_ref())
                }),
            );
        }
    }

    Ok(hooks)
}

/// Criticity set when `from -> to` fires, if any.
pub fn transition_criticity(from: MachineState, to: MachineState) -> Option<i64> {
    use MachineState::*;

    let level = match (from, to) {
        (Starting, Waiting) | (Waiting, Running) => CRITICITY_NOMINAL,
        (Testing | Sleeping, Running | Waiting) => CRITICITY_NOMINAL,
        (Resetting, Starting) | (Restarting, Waiting) => CRITICITY_STARTING,
        (Waiting, Restarting) | (Waiting, Resetting) => CRITICITY_FAULT,
        (Running, Restarting) | (Running, Resetting) => CRITICITY_FAULT,
        (Testing | Sleeping, Restarting | Resetting) => CRITICITY_RECOVERING,
        (Running | Waiting, Testing) => CRITICITY_TESTING,
        (Running | Waiting, Sleeping) => CRITICITY_FAULT,
        _ => return None,
    };
    Some(level)
}

/// On-transition callback for `from -> to`.
pub fn transition_callback(from: MachineState, to: MachineState) -> Option<TransitionCallback> {
    let level = transition_criticity(from, to)?;
    Some(Arc::new(move |core: &mut MachineCore| {
        core.set_criticity(level)
    }))
}

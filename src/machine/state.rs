//! Machine states, machine kinds and their declared transition tables.

use crate::error::AutomationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// State of a machine.
///
/// The serialized form is the short name used in transition names
/// (`start`, `wait`, `run`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MachineState {
    /// Initial state
    #[serde(rename = "start")]
    Starting,
    /// Waiting for every buffer to fill
    #[serde(rename = "wait")]
    Waiting,
    /// Operating
    #[serde(rename = "run")]
    Running,
    /// Emptying buffers
    #[serde(rename = "restart")]
    Restarting,
    /// Returning to `start`
    #[serde(rename = "reset")]
    Resetting,
    /// Extended machines only
    #[serde(rename = "test")]
    Testing,
    /// Extended machines only
    #[serde(rename = "sleep")]
    Sleeping,
}

impl MachineState {
    /// Short name, as used in snapshots and transition names.
    pub fn as_str(&self) -> &'static str {
        match self {
            MachineState::Starting => "start",
            MachineState::Waiting => "wait",
            MachineState::Running => "run",
            MachineState::Restarting => "restart",
            MachineState::Resetting => "reset",
            MachineState::Testing => "test",
            MachineState::Sleeping => "sleep",
        }
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MachineState {
    type Err = AutomationError;

    /// Accepts both the short name and the gerund (`run` / `running`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "start" | "starting" => Ok(MachineState::Starting),
            "wait" | "waiting" => Ok(MachineState::Waiting),
            "run" | "running" => Ok(MachineState::Running),
            "restart" | "restarting" => Ok(MachineState::Restarting),
            "reset" | "resetting" => Ok(MachineState::Resetting),
            "test" | "testing" => Ok(MachineState::Testing),
            "sleep" | "sleeping" => Ok(MachineState::Sleeping),
            _ => Err(AutomationError::UnknownState(s.to_string())),
        }
    }
}

/// Deterministic transition name, `"<source>_to_<target>"`.
pub fn transition_name(from: MachineState, to: MachineState) -> String {
    format!("{}_to_{}", from, to)
}

const CORE_STATES: [MachineState; 5] = [
    MachineState::Starting,
    MachineState::Waiting,
    MachineState::Running,
    MachineState::Restarting,
    MachineState::Resetting,
];

const EXTENDED_STATES: [MachineState; 7] = [
    MachineState::Starting,
    MachineState::Waiting,
    MachineState::Running,
    MachineState::Restarting,
    MachineState::Resetting,
    MachineState::Testing,
    MachineState::Sleeping,
];

const CORE_TRANSITIONS: [(MachineState, MachineState); 8] = [
    (MachineState::Starting, MachineState::Waiting),
    (MachineState::Waiting, MachineState::Running),
    (MachineState::Running, MachineState::Resetting),
    (MachineState::Resetting, MachineState::Starting),
    (MachineState::Running, MachineState::Restarting),
    (MachineState::Restarting, MachineState::Waiting),
    (MachineState::Waiting, MachineState::Resetting),
    (MachineState::Waiting, MachineState::Restarting),
];

const EXTENDED_TRANSITIONS: [(MachineState, MachineState); 12] = [
    (MachineState::Testing, MachineState::Restarting),
    (MachineState::Sleeping, MachineState::Restarting),
    (MachineState::Testing, MachineState::Resetting),
    (MachineState::Sleeping, MachineState::Resetting),
    (MachineState::Running, MachineState::Testing),
    (MachineState::Waiting, MachineState::Testing),
    (MachineState::Running, MachineState::Sleeping),
    (MachineState::Waiting, MachineState::Sleeping),
    (MachineState::Testing, MachineState::Running),
    (MachineState::Testing, MachineState::Waiting),
    (MachineState::Sleeping, MachineState::Running),
    (MachineState::Sleeping, MachineState::Waiting),
];

/// Behavior family of a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineKind {
    /// Five-state engine with buffer-readiness gating
    #[default]
    Generic,
    /// Polls remote nodes for its subscribed tags every tick
    Acquisition,
    /// Generic machine with the `test` and `sleep` states
    Extended,
}

impl MachineKind {
    /// Declared states, in display order.
    pub fn states(&self) -> &'static [MachineState] {
        match self {
            MachineKind::Generic | MachineKind::Acquisition => &CORE_STATES,
            MachineKind::Extended => &EXTENDED_STATES,
        }
    }

    /// Declared `(source, target)` pairs.
    pub fn transitions(&self) -> Vec<(MachineState, MachineState)> {
        let mut pairs = CORE_TRANSITIONS.to_vec();
        if *self == MachineKind::Extended {
            pairs.extend_from_slice(&EXTENDED_TRANSITIONS);
        }
        pairs
    }

    /// Classification assigned when the builder is given none.
    pub fn default_classification(&self) -> &'static str {
        match self {
            MachineKind::Generic | MachineKind::Extended => "Generic",
            MachineKind::Acquisition => "Data Acquisition",
        }
    }

    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            MachineKind::Generic => "generic",
            MachineKind::Acquisition => "acquisition",
            MachineKind::Extended => "extended",
        }
    }
}

impl fmt::Display for MachineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_names_use_short_state_names() {
        assert_eq!(
            transition_name(MachineState::Running, MachineState::Restarting),
            "run_to_restart"
        );
        assert_eq!(
            transition_name(MachineState::Starting, MachineState::Waiting),
            "start_to_wait"
        );
    }

    #[test]
    fn states_parse_from_short_and_long_names() {
        assert_eq!("run".parse::<MachineState>().unwrap(), MachineState::Running);
        assert_eq!("Sleeping".parse::<MachineState>().unwrap(), MachineState::Sleeping);
        assert!(matches!(
            "idle".parse::<MachineState>(),
            Err(AutomationError::UnknownState(_))
        ));
    }

    #[test]
    fn extended_kind_adds_states_and_transitions() {
        assert_eq!(MachineKind::Generic.states().len(), 5);
        assert_eq!(MachineKind::Extended.states().len(), 7);
        assert_eq!(MachineKind::Generic.transitions().len(), 8);
        assert_eq!(MachineKind::Extended.transitions().len(), 20);
        assert!(MachineKind::Extended
            .transitions()
            .contains(&(MachineState::Waiting, MachineState::Sleeping)));
    }

    #[test]
    fn core_table_has_no_terminal_state() {
        for state in MachineKind::Generic.states() {
            assert!(MachineKind::Generic
                .transitions()
                .iter()
                .any(|(from, _)| from == state));
        }
    }

    #[test]
    fn state_serializes_to_short_name() {
        let json = serde_json::to_string(&MachineState::Waiting).unwrap();
        assert_eq!(json, "\"wait\"");
    }
}

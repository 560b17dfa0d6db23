//! Periodically evaluated state machines.
//!
//! - [`state`]: states, machine kinds and declared transition tables
//! - [`transition`]: structural transitions and guards
//! - [`attributes`]: typed attributes, process variables and snapshots
//! - [`core`]: the engine ([`StateMachine`]) and its builder
//! - [`behaviors`]: per-state hooks and on-transition callbacks

pub mod attributes;
pub mod behaviors;
pub mod core;
pub mod state;
pub mod transition;

pub use attributes::{MachineAttribute, MachineSnapshot, ProcessVariable};
pub use behaviors::StateHook;
pub use self::core::{MachineBuilder, MachineCore, StateMachine, TagBinding};
pub use state::{transition_name, MachineKind, MachineState};
pub use transition::{Guard, Transition, TransitionCallback};

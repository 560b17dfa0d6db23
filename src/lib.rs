//! # Rust Automation Core Library
//!
//! This crate is the state-machine scheduling engine of an industrial data-acquisition and
//! control runtime. It runs many independent, periodically evaluated state machines, couples
//! their process variables to live tag values, buffers recent history per tag and drives every
//! machine from one shared worker thread at its own rate.
//!
//! ## Crate Structure
//!
//! - **`buffer`**: `RollingBuffer<T>`, the fixed-capacity history container, and its `RollPolicy`.
//! - **`units`**: engineering units and conversion of readings to a tag's display unit.
//! - **`tags`**: tags, the `ValueStore` contract machines observe, and an in-memory store.
//! - **`protocol`**: the `ProtocolClient` contract used by acquisition machines, plus a mock.
//! - **`persistence`**: the `MachineConfigStore` contract for persisted machine settings.
//! - **`machine`**: the engine itself: states, guarded transitions, per-state hooks,
//!   typed attributes and the acquisition / extended variants.
//! - **`registry`**: name-keyed store of registered machines with per-rate acquisition machines.
//! - **`scheduler`**: the shared worker thread driving every registered machine.
//! - **`orchestrator`**: top-level entry point tying registry, worker and collaborators together.
//! - **`config`**: figment-based runtime configuration.
//! - **`logging`**: tracing-subscriber initialisation.
//! - **`error`**: the crate-wide `AutomationError`.

pub mod buffer;
pub mod config;
pub mod error;
pub mod logging;
pub mod machine;
pub mod orchestrator;
pub mod persistence;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod tags;
pub mod units;

pub use error::{AppResult, AutomationError};
pub use machine::{MachineKind, MachineState, StateMachine};
pub use orchestrator::Orchestrator;
pub use registry::{MachineRegistry, ScheduleMode};

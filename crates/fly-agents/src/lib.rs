//! Waypoint executor and journey coordinator.
//!
//! This crate drives the FLY phase: it turns a flight plan into executed,
//! receipt-backed waypoints by looping an LLM agent against the working
//! directory. Building blocks:
//! - [`markers`]: structured-marker parsing of agent output
//! - [`prompts`]: pure prompt construction (execution, kickoff, system)
//! - [`executor`]: the bounded iterative agent loop
//! - [`controller`]: waypoint selection and directive mapping
//! - [`coordinator`]: the FLY-phase facade owning shared state
//! - [`memory`]: per-waypoint memory folded into future prompts
//! - [`provider_cli`]: subprocess adapter for an agent CLI

pub mod controller;
pub mod coordinator;
pub mod executor;
pub mod markers;
pub mod memory;
pub mod prompts;
pub mod provider_cli;
pub mod state;

pub use controller::{ControllerStatus, ExecutionController, NextAction};
pub use coordinator::{
    CommitOutcome, CommitStatus, JourneyCoordinator, Notice, NoticeSeverity, RollbackResult,
};
pub use executor::WaypointExecutor;
pub use memory::{
    build_memory_context, load_waypoint_memory, save_waypoint_memory, WaypointMemoryRecord,
};
pub use prompts::{build_execution_prompt, build_kickoff_prompt, KickoffReason, SpecStaleness};
pub use provider_cli::CliAgentProvider;
pub use state::{ExecutorState, StateTracker};

//! Supervisor orchestrator for Switchboard.
//!
//! Implements the per-task state machine
//! `received -> context_compiled -> decomposed|single -> routed -> executing
//! -> handoff_validating -> synthesizing|direct_result -> done`, with
//! `failed` and `cancelled` reachable from any live state.
//!
//! # Main types
//!
//! - [`Supervisor`]: runs tasks end to end and never returns an error; every
//!   failure is folded into the [`SupervisorOutcome`]'s result.
//! - [`TaskState`] / [`TaskTrace`]: the state machine and its transition log.
//! - [`Synthesizer`]: merges several subtask results.
//! - [`SupervisorMonitor`]: per-worker activity and outcome metrics.

/// Worker activity and outcome counters.
pub mod monitor;
/// Task and subtask reports.
pub mod outcome;
/// The task state machine.
pub mod state;
/// The supervisor.
pub mod supervisor;
/// Merging subtask results.
pub mod synthesis;

pub use monitor::{SupervisorMonitor, TaskCounters, WorkerActivity, WorkerMetrics};
pub use outcome::{SubtaskReport, SupervisorOutcome};
pub use state::{TaskState, TaskTrace, Transition};
pub use supervisor::{Supervisor, UPSTREAM_PARAM};
pub use synthesis::{MergeInput, Synthesis, Synthesizer};
pub use tokio_util::sync::CancellationToken;

//! Hybrid task routing for Switchboard.
//!
//! [`HybridRouter::route`] tries an explicit target first, then the ordered
//! [`RoutingRule`]s, then asks the fast model tier to pick from the registry
//! catalog. It never guesses: when the model is unavailable the task fails
//! to route.
//!
//! [`HybridRouter::decompose`] splits multi-step work into a [`Decomposition`]
//! whose [`waves`](Decomposition::waves) give the execution order.

/// Routing decisions.
pub mod decision;
/// Task decomposition into dependency waves.
pub mod decompose;
/// The hybrid router.
pub mod router;
/// Deterministic routing rules.
pub mod rule;

pub use decision::{RoutingDecision, RoutingMethod};
pub use decompose::{Decomposer, Decomposition, PlannedStep, Subtask, SEQUENTIAL_PARAM, STEPS_PARAM};
pub use router::HybridRouter;
pub use rule::{RoutingRule, TaskPredicate};
